//! Read-only classification of the page reached after navigating to the
//! login URL. Kept outside the state machine so both the auth engine and
//! callers that only want a health check can share it.

use std::time::Duration;

use tracing::debug;

use crate::config::Selectors;
use crate::driver::PageDriver;
use crate::error::Result;

/// What the login navigation actually landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageProbe {
	/// Redirected away from the login URL: the session is already
	/// authenticated and no ritual is needed.
	DirectSuccess,
	/// Login page with a human-verification widget in front of the form.
	ChallengePresent,
	/// Plain login form, no challenge.
	LoginForm,
}

/// Probes the current page without mutating it.
pub async fn probe_login(driver: &dyn PageDriver, login_url: &str, selectors: &Selectors, wait: Duration) -> Result<PageProbe> {
	let url = driver.current_url().await?;
	if url != login_url {
		debug!(target = "bellhop.auth", %url, "probe: already past the login page");
		return Ok(PageProbe::DirectSuccess);
	}
	if driver.wait_for_selector(&selectors.challenge_frame, wait).await? {
		return Ok(PageProbe::ChallengePresent);
	}
	Ok(PageProbe::LoginForm)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::driver::fake::FakePage;

	const LOGIN: &str = "https://portal.example.com/login";

	#[tokio::test]
	async fn redirected_page_is_direct_success() {
		let (page, ctl) = FakePage::scripted();
		ctl.set_url("https://portal.example.com/dashboard");
		let probe = probe_login(&page, LOGIN, &Selectors::default(), Duration::from_millis(10)).await.unwrap();
		assert_eq!(probe, PageProbe::DirectSuccess);
	}

	#[tokio::test]
	async fn challenge_widget_is_detected() {
		let (page, ctl) = FakePage::scripted();
		ctl.set_url(LOGIN);
		ctl.selector_present(&Selectors::default().challenge_frame);
		let probe = probe_login(&page, LOGIN, &Selectors::default(), Duration::from_millis(10)).await.unwrap();
		assert_eq!(probe, PageProbe::ChallengePresent);
	}

	#[tokio::test]
	async fn bare_form_is_login_form() {
		let (page, ctl) = FakePage::scripted();
		ctl.set_url(LOGIN);
		let probe = probe_login(&page, LOGIN, &Selectors::default(), Duration::from_millis(10)).await.unwrap();
		assert_eq!(probe, PageProbe::LoginForm);
	}
}
