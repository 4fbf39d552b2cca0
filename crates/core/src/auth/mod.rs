//! Authentication state machine: drives one checked-out session through the
//! portal's login ritual of challenge widget, credentials, and out-of-band
//! one-time code.
//!
//! The ritual runs under a single deadline; whatever happens inside it, the
//! session always leaves the engine in headless mode.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, PortalConfig};
use crate::driver::{Cookie, PageDriver, VisibilityMode};
use crate::error::Result;
use crate::lifecycle::LifecycleController;
use crate::otp::{OtpSource, OtpValue};
use crate::registry::SessionLease;
use crate::solver::{ChallengePayload, ChallengeSolver};

pub mod probe;

pub use probe::{PageProbe, probe_login};

/// Why an authentication run failed without an infrastructure error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
	ChallengeUnsolvable,
	OtpRejected,
	OtpTimeout,
	DeadlineExceeded,
}

/// Terminal result of one authentication run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AuthOutcome {
	/// The session holds an authenticated cookie jar.
	Authenticated { cookies: Vec<Cookie> },
	Failed { reason: FailureReason },
}

impl AuthOutcome {
	pub fn is_authenticated(&self) -> bool {
		matches!(self, Self::Authenticated { .. })
	}
}

/// Where the ritual currently stands. Transitions only move forward; there is
/// no path back into an earlier phase within one run.
#[derive(Debug, Clone, PartialEq)]
enum Step {
	ChallengeCheck,
	ChallengeSolving,
	CredentialsEntry,
	OtpPolling,
	OtpSubmission(OtpValue),
}

/// Drives the login ritual against a checked-out session.
pub struct AuthEngine {
	solver: Arc<dyn ChallengeSolver>,
	otp: Arc<dyn OtpSource>,
	portal: PortalConfig,
	/// Mailbox identity whose inbox receives the one-time deliveries.
	identity: String,
	cfg: AuthConfig,
}

impl AuthEngine {
	pub fn new(solver: Arc<dyn ChallengeSolver>, otp: Arc<dyn OtpSource>, portal: PortalConfig, identity: String, cfg: AuthConfig) -> Self {
		Self {
			solver,
			otp,
			portal,
			identity,
			cfg,
		}
	}

	pub fn portal(&self) -> &PortalConfig {
		&self.portal
	}

	pub fn config(&self) -> &AuthConfig {
		&self.cfg
	}

	/// Runs the full ritual under the configured deadline.
	///
	/// Regardless of outcome the session finishes in headless mode; a failed
	/// mode reset is surfaced as an error so the caller can evict.
	pub async fn run(&self, lifecycle: &LifecycleController, lease: &mut SessionLease) -> Result<AuthOutcome> {
		let id = lease.id();
		let outcome = match tokio::time::timeout(self.cfg.auth_deadline, self.drive(lifecycle, lease)).await {
			Ok(result) => result,
			Err(_) => {
				warn!(target = "bellhop.auth", %id, deadline_secs = self.cfg.auth_deadline.as_secs(), "authentication deadline exceeded");
				Ok(AuthOutcome::Failed {
					reason: FailureReason::DeadlineExceeded,
				})
			}
		};

		if lease.mode() != VisibilityMode::Headless {
			let owner = lease.owner().map(str::to_string);
			let last_accessed = lease.last_accessed_at();
			lifecycle.switch_slot(id, owner.as_deref(), last_accessed, lease.slot_mut(), VisibilityMode::Headless).await?;
		}
		outcome
	}

	async fn drive(&self, lifecycle: &LifecycleController, lease: &mut SessionLease) -> Result<AuthOutcome> {
		let id = lease.id();
		lease.driver().navigate(&self.portal.login_url).await?;
		let mut step = Step::ChallengeCheck;

		loop {
			debug!(target = "bellhop.auth", %id, ?step, "ritual step");
			step = match step {
				Step::ChallengeCheck => match probe_login(lease.driver(), &self.portal.login_url, &self.cfg.selectors, self.cfg.selector_wait).await? {
					PageProbe::DirectSuccess => return self.authenticated(lease.driver()).await,
					PageProbe::LoginForm => Step::CredentialsEntry,
					PageProbe::ChallengePresent => {
						// The widget demands real rendering; solve it headful.
						if lease.mode() != VisibilityMode::Headful {
							let owner = lease.owner().map(str::to_string);
							let last_accessed = lease.last_accessed_at();
							lifecycle.switch_slot(id, owner.as_deref(), last_accessed, lease.slot_mut(), VisibilityMode::Headful).await?;
							lease.driver().navigate(&self.portal.login_url).await?;
						}
						Step::ChallengeSolving
					}
				},
				Step::ChallengeSolving => {
					if !self.solve_challenge(lease.driver()).await? {
						return Ok(AuthOutcome::Failed {
							reason: FailureReason::ChallengeUnsolvable,
						});
					}
					Step::CredentialsEntry
				}
				Step::CredentialsEntry => {
					let driver = lease.driver();
					driver.fill(&self.cfg.selectors.username_input, &self.portal.username).await?;
					driver.fill(&self.cfg.selectors.password_input, &self.portal.password).await?;
					driver.click(&self.cfg.selectors.login_button).await?;
					tokio::time::sleep(self.cfg.settle_wait).await;
					if driver.current_url().await? != self.portal.login_url {
						return self.authenticated(driver).await;
					}
					// Still on the login page: the portal wants the second factor.
					Step::OtpPolling
				}
				Step::OtpPolling => match self.poll_for_delivery().await? {
					Some(value) => Step::OtpSubmission(value),
					None => {
						return Ok(AuthOutcome::Failed {
							reason: FailureReason::OtpTimeout,
						});
					}
				},
				Step::OtpSubmission(value) => {
					let driver = lease.driver();
					match &value {
						OtpValue::Code(code) => {
							driver.fill(&self.cfg.selectors.otp_input, code).await?;
							driver.click(&self.cfg.selectors.otp_submit).await?;
						}
						OtpValue::Link(url) => driver.navigate(url).await?,
					}
					tokio::time::sleep(self.cfg.settle_wait).await;
					if driver.current_url().await? != self.portal.login_url {
						return self.authenticated(driver).await;
					}
					warn!(target = "bellhop.auth", %id, "one-time credential rejected by the portal");
					return Ok(AuthOutcome::Failed {
						reason: FailureReason::OtpRejected,
					});
				}
			};
		}
	}

	async fn authenticated(&self, driver: &dyn PageDriver) -> Result<AuthOutcome> {
		let cookies = driver.cookies().await?;
		info!(target = "bellhop.auth", cookies = cookies.len(), "authentication succeeded");
		Ok(AuthOutcome::Authenticated { cookies })
	}

	/// Attempts the challenge up to the configured retry bound. `Ok(false)`
	/// means every attempt failed; transient solver errors count as attempts.
	async fn solve_challenge(&self, driver: &dyn PageDriver) -> Result<bool> {
		for attempt in 1..=self.cfg.challenge_retries {
			match self.solve_challenge_once(driver).await {
				Ok(true) => {
					info!(target = "bellhop.auth", attempt, "challenge solved");
					return Ok(true);
				}
				Ok(false) => warn!(target = "bellhop.auth", attempt, "challenge attempt failed verification"),
				Err(err) if err.is_retryable() => warn!(target = "bellhop.auth", attempt, error = %err, "challenge attempt errored"),
				Err(err) => return Err(err),
			}
			if attempt < self.cfg.challenge_retries {
				tokio::time::sleep(self.cfg.challenge_retry_delay).await;
				// Reset the widget before the next attempt.
				driver.navigate(&self.portal.login_url).await?;
			}
		}
		warn!(target = "bellhop.auth", attempts = self.cfg.challenge_retries, "challenge retry budget exhausted");
		Ok(false)
	}

	async fn solve_challenge_once(&self, driver: &dyn PageDriver) -> Result<bool> {
		let selectors = &self.cfg.selectors;
		let frames = driver.frames().await?;

		if let Some(anchor) = frames.iter().find(|f| f.url.contains("api2/anchor")) {
			driver.click_in_frame(&anchor.id, &selectors.challenge_checkbox).await?;
			tokio::time::sleep(self.cfg.settle_wait).await;
		}

		// A checkbox click may already satisfy the widget.
		if self.challenge_token(driver).await?.is_some() {
			return Ok(true);
		}

		let frames = driver.frames().await?;
		if let Some(bframe) = frames.iter().find(|f| f.url.contains("api2/bframe")) {
			if driver.wait_for_selector_in_frame(&bframe.id, &selectors.audio_button, self.cfg.selector_wait).await? {
				return self.solve_audio(driver, &bframe.id).await;
			}
		}
		self.solve_by_site_key(driver).await
	}

	/// Audio sub-challenge: download, transcribe, type the answer back.
	async fn solve_audio(&self, driver: &dyn PageDriver, frame_id: &str) -> Result<bool> {
		let selectors = &self.cfg.selectors;
		driver.click_in_frame(frame_id, &selectors.audio_button).await?;
		if !driver.wait_for_selector_in_frame(frame_id, &selectors.audio_source, self.cfg.selector_wait).await? {
			return Ok(false);
		}
		let src = driver
			.evaluate_in_frame(frame_id, &format!("document.querySelector({}).src", serde_json::to_string(&selectors.audio_source)?))
			.await?;
		let Some(audio_url) = src.as_str().filter(|s| !s.is_empty()) else {
			return Ok(false);
		};
		let answer = self.solver.solve(&ChallengePayload::AudioUrl(audio_url.to_string())).await?;
		driver.fill_in_frame(frame_id, &selectors.audio_response, &answer).await?;
		driver.click_in_frame(frame_id, &selectors.verify_button).await?;
		tokio::time::sleep(self.cfg.settle_wait).await;
		Ok(self.challenge_token(driver).await?.is_some())
	}

	/// Fallback: solve by site key and inject the token directly.
	async fn solve_by_site_key(&self, driver: &dyn PageDriver) -> Result<bool> {
		let js = format!(
			"(() => {{ const f = document.querySelector({}); if (!f) return null; const m = f.src.match(/[?&]k=([^&]+)/); return m ? m[1] : null; }})()",
			serde_json::to_string(&self.cfg.selectors.challenge_frame)?
		);
		let Some(site_key) = driver.evaluate(&js).await?.as_str().map(str::to_string) else {
			return Ok(false);
		};
		let page_url = driver.current_url().await?;
		let token = self.solver.solve(&ChallengePayload::SiteKey { page_url, site_key }).await?;
		driver
			.evaluate(&format!("document.querySelector('#g-recaptcha-response').value = {}", serde_json::to_string(&token)?))
			.await?;
		Ok(self.challenge_token(driver).await?.is_some())
	}

	/// Reads the widget's response token; a non-empty value means solved.
	async fn challenge_token(&self, driver: &dyn PageDriver) -> Result<Option<String>> {
		let value = driver.evaluate("document.querySelector('#g-recaptcha-response')?.value").await?;
		match value {
			Value::String(token) if !token.is_empty() => Ok(Some(token)),
			_ => Ok(None),
		}
	}

	/// Polls the mailbox within the attempt budget. `Ok(None)` means the
	/// budget ran out without a fresh delivery.
	async fn poll_for_delivery(&self) -> Result<Option<OtpValue>> {
		for attempt in 1..=self.cfg.otp_poll_attempts {
			match self.otp.fetch_recent(&self.identity, self.cfg.otp_freshness).await {
				Ok(Some(delivery)) => {
					debug!(target = "bellhop.auth", attempt, "one-time delivery received");
					return Ok(Some(delivery.value));
				}
				Ok(None) => {}
				Err(err) => warn!(target = "bellhop.auth", attempt, error = %err, "mailbox poll failed"),
			}
			if attempt < self.cfg.otp_poll_attempts {
				tokio::time::sleep(self.cfg.otp_poll_interval).await;
			}
		}
		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn outcome_serializes_with_status_tag() {
		let outcome = AuthOutcome::Failed {
			reason: FailureReason::OtpTimeout,
		};
		assert_eq!(serde_json::to_value(&outcome).unwrap(), json!({"status": "failed", "reason": "otpTimeout"}));

		let outcome = AuthOutcome::Authenticated { cookies: vec![] };
		assert_eq!(serde_json::to_value(&outcome).unwrap(), json!({"status": "authenticated", "cookies": []}));
	}
}
