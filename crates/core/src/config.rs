//! Environment-driven configuration for the portal, mailbox, solver, and
//! lifecycle/auth tunables.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BellhopError, Result};

/// Portal endpoints and credentials for the login ritual.
#[derive(Debug, Clone)]
pub struct PortalConfig {
	/// Login entry point; a URL other than this one after navigation means
	/// the session is inside the authenticated area.
	pub login_url: String,
	/// Protected page used to probe whether a session is still authenticated.
	pub probe_url: Option<String>,
	/// Admin account-list page used by the switch-user operation.
	pub admin_url: Option<String>,
	pub username: String,
	pub password: String,
}

/// Mailbox queried for out-of-band one-time codes.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
	/// Recipient identity whose inbox receives the codes.
	pub identity: String,
	/// JSON mailbox API returning recent messages.
	pub endpoint: String,
	pub token: Option<String>,
	/// Sender address that delivers numeric codes.
	pub code_sender: String,
	/// Sender address that delivers single-use login links.
	pub link_sender: String,
}

/// Challenge-solving service endpoints.
#[derive(Debug, Clone, Default)]
pub struct SolverConfig {
	/// Audio transcription endpoint (audio bytes in, text out).
	pub transcribe_endpoint: Option<String>,
	/// Token-solving endpoint (site url + site key in, token out).
	pub token_endpoint: Option<String>,
	pub api_key: Option<String>,
}

/// CSS selectors for the portal's login, challenge, and admin widgets.
#[derive(Debug, Clone)]
pub struct Selectors {
	pub username_input: String,
	pub password_input: String,
	pub login_button: String,
	pub otp_input: String,
	pub otp_submit: String,
	pub challenge_frame: String,
	pub challenge_checkbox: String,
	pub audio_button: String,
	pub audio_source: String,
	pub audio_response: String,
	pub verify_button: String,
	pub account_table: String,
	pub recheck_password_input: String,
	pub recheck_submit: String,
}

impl Default for Selectors {
	fn default() -> Self {
		Self {
			username_input: "input[name='username']".into(),
			password_input: "input[name='password']".into(),
			login_button: "button[name='login']".into(),
			otp_input: "input[name='logincode']".into(),
			otp_submit: "button[type='submit']".into(),
			challenge_frame: "iframe[src*='recaptcha']".into(),
			challenge_checkbox: "div.recaptcha-checkbox-border".into(),
			audio_button: "#recaptcha-audio-button".into(),
			audio_source: "#audio-source".into(),
			audio_response: "#audio-response".into(),
			verify_button: "#recaptcha-verify-button".into(),
			account_table: "#account-list".into(),
			recheck_password_input: "input[name='passwordcheck']".into(),
			recheck_submit: "button[type='submit']".into(),
		}
	}
}

/// Retry bounds and timing contract for one authentication run.
#[derive(Debug, Clone)]
pub struct AuthConfig {
	pub challenge_retries: u32,
	pub challenge_retry_delay: Duration,
	pub otp_poll_interval: Duration,
	/// Explicit budget for OTP polling; exhausting it is a terminal timeout.
	pub otp_poll_attempts: u32,
	pub otp_freshness: Duration,
	/// Bounded wait for page content before concluding it is absent.
	pub selector_wait: Duration,
	/// Short wait after submits for the page to settle.
	pub settle_wait: Duration,
	/// Overall deadline for one authentication run.
	pub auth_deadline: Duration,
	pub selectors: Selectors,
}

impl Default for AuthConfig {
	fn default() -> Self {
		Self {
			challenge_retries: 5,
			challenge_retry_delay: Duration::from_secs(10),
			otp_poll_interval: Duration::from_secs(10),
			otp_poll_attempts: 30,
			otp_freshness: Duration::from_secs(300),
			selector_wait: Duration::from_secs(10),
			settle_wait: Duration::from_secs(3),
			auth_deadline: Duration::from_secs(600),
			selectors: Selectors::default(),
		}
	}
}

/// Idle-eviction tunables for the background sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
	pub idle_threshold: Duration,
	pub sweep_interval: Duration,
}

impl Default for SweepConfig {
	fn default() -> Self {
		Self {
			idle_threshold: Duration::from_secs(3600),
			sweep_interval: Duration::from_secs(3600),
		}
	}
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
	pub portal: PortalConfig,
	pub mailbox: MailboxConfig,
	pub solver: SolverConfig,
	pub auth: AuthConfig,
	pub sweep: SweepConfig,
	/// State directory for durable snapshots; `None` keeps state in memory.
	pub state_dir: Option<PathBuf>,
}

impl Config {
	/// Loads configuration from `BELLHOP_*` environment variables.
	pub fn from_env() -> Result<Self> {
		let portal = PortalConfig {
			login_url: required("BELLHOP_LOGIN_URL")?,
			probe_url: optional("BELLHOP_PROBE_URL"),
			admin_url: optional("BELLHOP_ADMIN_URL"),
			username: required("BELLHOP_PORTAL_USERNAME")?,
			password: required("BELLHOP_PORTAL_PASSWORD")?,
		};
		let mailbox = MailboxConfig {
			identity: required("BELLHOP_MAILBOX_IDENTITY")?,
			endpoint: required("BELLHOP_MAILBOX_ENDPOINT")?,
			token: optional("BELLHOP_MAILBOX_TOKEN"),
			code_sender: required("BELLHOP_OTP_CODE_SENDER")?,
			link_sender: required("BELLHOP_OTP_LINK_SENDER")?,
		};
		let solver = SolverConfig {
			transcribe_endpoint: optional("BELLHOP_SOLVER_TRANSCRIBE_URL"),
			token_endpoint: optional("BELLHOP_SOLVER_TOKEN_URL"),
			api_key: optional("BELLHOP_SOLVER_API_KEY"),
		};
		let defaults = AuthConfig::default();
		let auth = AuthConfig {
			challenge_retries: parsed("BELLHOP_CHALLENGE_RETRIES", defaults.challenge_retries)?,
			challenge_retry_delay: seconds("BELLHOP_CHALLENGE_RETRY_DELAY_SECS", defaults.challenge_retry_delay)?,
			otp_poll_interval: seconds("BELLHOP_OTP_POLL_INTERVAL_SECS", defaults.otp_poll_interval)?,
			otp_poll_attempts: parsed("BELLHOP_OTP_POLL_ATTEMPTS", defaults.otp_poll_attempts)?,
			otp_freshness: seconds("BELLHOP_OTP_FRESHNESS_SECS", defaults.otp_freshness)?,
			selector_wait: seconds("BELLHOP_SELECTOR_WAIT_SECS", defaults.selector_wait)?,
			settle_wait: seconds("BELLHOP_SETTLE_WAIT_SECS", defaults.settle_wait)?,
			auth_deadline: seconds("BELLHOP_AUTH_DEADLINE_SECS", defaults.auth_deadline)?,
			selectors: Selectors::default(),
		};
		let sweep_defaults = SweepConfig::default();
		let sweep = SweepConfig {
			idle_threshold: seconds("BELLHOP_IDLE_THRESHOLD_SECS", sweep_defaults.idle_threshold)?,
			sweep_interval: seconds("BELLHOP_SWEEP_INTERVAL_SECS", sweep_defaults.sweep_interval)?,
		};
		Ok(Self {
			portal,
			mailbox,
			solver,
			auth,
			sweep,
			state_dir: optional("BELLHOP_STATE_DIR").map(PathBuf::from),
		})
	}
}

fn optional(key: &str) -> Option<String> {
	std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn required(key: &str) -> Result<String> {
	optional(key).ok_or_else(|| BellhopError::Config(format!("{key} is not set")))
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
	match optional(key) {
		Some(raw) => raw.parse().map_err(|_| BellhopError::Config(format!("{key} is not a valid number: {raw}"))),
		None => Ok(default),
	}
}

fn seconds(key: &str, default: Duration) -> Result<Duration> {
	Ok(Duration::from_secs(parsed(key, default.as_secs())?))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn auth_defaults_match_documented_bounds() {
		let auth = AuthConfig::default();
		assert_eq!(auth.challenge_retries, 5);
		assert_eq!(auth.challenge_retry_delay, Duration::from_secs(10));
		assert_eq!(auth.otp_poll_interval, Duration::from_secs(10));
		assert_eq!(auth.otp_freshness, Duration::from_secs(300));
	}

	#[test]
	fn missing_required_key_is_a_config_error() {
		let err = required("BELLHOP_TEST_KEY_THAT_DOES_NOT_EXIST").unwrap_err();
		assert!(matches!(err, BellhopError::Config(_)));
	}
}
