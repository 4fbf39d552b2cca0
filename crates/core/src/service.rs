//! High-level session operations composed from the registry, lifecycle
//! controller, and auth engine. This is the surface the HTTP layer calls.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::auth::{AuthEngine, AuthOutcome, FailureReason};
use crate::driver::{Cookie, VisibilityMode};
use crate::error::{BellhopError, Result};
use crate::lifecycle::LifecycleController;
use crate::registry::{SessionId, SessionRegistry};

/// How many fresh sessions one authenticated-create call may burn through.
const MAX_AUTH_ATTEMPTS: u32 = 5;

/// Point-in-time view of one live session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
	pub id: SessionId,
	pub owner: Option<String>,
	pub mode: VisibilityMode,
	pub current_url: String,
	pub cookies: Vec<Cookie>,
	pub last_accessed_at: u64,
}

/// Facade over the session subsystems, one instance per process.
pub struct SessionService {
	registry: Arc<SessionRegistry>,
	lifecycle: Arc<LifecycleController>,
	engine: Arc<AuthEngine>,
}

impl SessionService {
	pub fn new(registry: Arc<SessionRegistry>, lifecycle: Arc<LifecycleController>, engine: Arc<AuthEngine>) -> Self {
		Self { registry, lifecycle, engine }
	}

	pub fn lifecycle(&self) -> &Arc<LifecycleController> {
		&self.lifecycle
	}

	/// Creates a fresh headless session with no authentication.
	pub async fn create_session(&self, owner: Option<String>) -> Result<SessionId> {
		self.lifecycle.create(owner).await
	}

	/// Runs the login ritual against an existing session.
	///
	/// An infrastructure error evicts the session; a ritual failure leaves it
	/// alive for the caller to retry or close.
	pub async fn authenticate(&self, id: SessionId) -> Result<AuthOutcome> {
		let mut lease = self.registry.checkout(id)?;
		match self.engine.run(&self.lifecycle, &mut lease).await {
			Ok(outcome) => {
				if outcome.is_authenticated() {
					self.lifecycle.persist_lease(&lease).await;
				}
				Ok(outcome)
			}
			Err(err) => {
				warn!(target = "bellhop.auth", %id, error = %err, "authentication errored; evicting session");
				drop(lease);
				if let Err(evict_err) = self.lifecycle.evict(id).await {
					warn!(target = "bellhop.auth", %id, error = %evict_err, "eviction after auth error failed");
				}
				Err(err)
			}
		}
	}

	/// Creates a session and authenticates it, burning through at most
	/// [`MAX_AUTH_ATTEMPTS`] fresh sessions. Failed attempts are closed; the
	/// last attempt's session is kept either way so the caller can inspect it.
	pub async fn create_authenticated_session(&self, owner: Option<String>) -> Result<(SessionId, AuthOutcome)> {
		let mut last_err = None;
		for attempt in 1..=MAX_AUTH_ATTEMPTS {
			let id = self.create_session(owner.clone()).await?;
			match self.authenticate(id).await {
				Ok(outcome) if outcome.is_authenticated() => {
					info!(target = "bellhop.auth", %id, attempt, "authenticated session established");
					return Ok((id, outcome));
				}
				Ok(outcome) => {
					warn!(target = "bellhop.auth", %id, attempt, ?outcome, "authentication attempt failed");
					if attempt == MAX_AUTH_ATTEMPTS {
						return Ok((id, outcome));
					}
					if let Err(err) = self.lifecycle.close(id).await {
						warn!(target = "bellhop.auth", %id, error = %err, "failed to close unauthenticated session");
					}
				}
				Err(err) => {
					// The session was already evicted by `authenticate`.
					warn!(target = "bellhop.auth", attempt, error = %err, "authentication attempt errored");
					last_err = Some(err);
				}
			}
		}
		Err(last_err.unwrap_or(BellhopError::ChallengeUnsolvable { attempts: MAX_AUTH_ATTEMPTS }))
	}

	/// Switches an authenticated admin session to act as `account`.
	///
	/// Navigates the admin account list, answers a password re-check if the
	/// portal interposes one, and clicks the matching account row.
	pub async fn switch_user(&self, id: SessionId, account: &str) -> Result<()> {
		let lease = self.registry.checkout(id)?;
		let portal = self.engine.portal();
		let cfg = self.engine.config();
		let admin_url = portal
			.admin_url
			.as_deref()
			.ok_or_else(|| BellhopError::Config("no admin URL configured".into()))?;
		let driver = lease.driver();

		driver.navigate(admin_url).await?;
		if driver.current_url().await? == portal.login_url {
			return Err(BellhopError::Driver("session is not authenticated".into()));
		}

		// Sensitive admin pages sometimes ask for the password again.
		if driver.wait_for_selector(&cfg.selectors.recheck_password_input, cfg.settle_wait).await? {
			driver.fill(&cfg.selectors.recheck_password_input, &portal.password).await?;
			driver.click(&cfg.selectors.recheck_submit).await?;
			tokio::time::sleep(cfg.settle_wait).await;
		}

		if !driver.wait_for_selector(&cfg.selectors.account_table, cfg.selector_wait).await? {
			return Err(BellhopError::Driver("account list did not appear".into()));
		}

		let needle = serde_json::to_string(account)?;
		let table = serde_json::to_string(&cfg.selectors.account_table)?;
		let js = format!(
			"(() => {{ const rows = document.querySelectorAll({table} + ' tr'); for (const row of rows) {{ if (row.textContent.includes({needle})) {{ (row.querySelector('a, button') || row).click(); return true; }} }} return false; }})()"
		);
		let clicked = driver.evaluate(&js).await?;
		if clicked != serde_json::Value::Bool(true) {
			return Err(BellhopError::Driver(format!("account {account} not found in account list")));
		}
		tokio::time::sleep(cfg.settle_wait).await;
		info!(target = "bellhop.auth", %id, %account, "switched acting account");
		self.lifecycle.persist_lease(&lease).await;
		Ok(())
	}

	/// Probes whether a session can still reach the protected area.
	pub async fn test_authentication(&self, id: SessionId) -> Result<bool> {
		let lease = self.registry.checkout(id)?;
		let portal = self.engine.portal();
		let probe_url = portal
			.probe_url
			.as_deref()
			.ok_or_else(|| BellhopError::Config("no probe URL configured".into()))?;
		let driver = lease.driver();
		driver.navigate(probe_url).await?;
		tokio::time::sleep(self.engine.config().settle_wait).await;
		// An expired session bounces back to the login page.
		let authenticated = driver.current_url().await? != portal.login_url;
		self.lifecycle.persist_lease(&lease).await;
		Ok(authenticated)
	}

	/// Snapshot view of one session for callers.
	pub async fn session_info(&self, id: SessionId) -> Result<SessionInfo> {
		let lease = self.registry.checkout(id)?;
		Ok(SessionInfo {
			id,
			owner: lease.owner().map(str::to_string),
			mode: lease.mode(),
			current_url: lease.driver().current_url().await?,
			cookies: lease.driver().cookies().await?,
			last_accessed_at: lease.last_accessed_at(),
		})
	}

	/// Moves a session between headless and headful.
	pub async fn switch_visibility(&self, id: SessionId, mode: VisibilityMode) -> Result<()> {
		self.lifecycle.switch_visibility(id, mode).await
	}

	/// Closes a session and deletes its durable record.
	pub async fn close_session(&self, id: SessionId) -> Result<()> {
		self.lifecycle.close(id).await
	}

	/// Marks a `Failed` outcome's reason as a typed error for HTTP mapping.
	pub fn failure_error(&self, reason: FailureReason) -> BellhopError {
		match reason {
			FailureReason::ChallengeUnsolvable => BellhopError::ChallengeUnsolvable {
				attempts: self.engine.config().challenge_retries,
			},
			FailureReason::OtpRejected => BellhopError::OtpRejected,
			FailureReason::OtpTimeout | FailureReason::DeadlineExceeded => BellhopError::OtpTimeout,
		}
	}
}
