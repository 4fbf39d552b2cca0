//! Error taxonomy shared across the session and authentication subsystems.

use crate::registry::SessionId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BellhopError>;

/// Errors surfaced by registry, lifecycle, and authentication operations.
///
/// `Persistence` never reaches callers; durability writes are advisory and
/// failures are logged at the call site instead.
#[derive(Debug, thiserror::Error)]
pub enum BellhopError {
	#[error("session not found: {0}")]
	NotFound(SessionId),

	#[error("failed to allocate driver resources: {0}")]
	ResourceAllocation(String),

	#[error("session {0} has a conflicting operation in flight")]
	SessionBusy(SessionId),

	#[error("challenge solver unavailable: {0}")]
	SolverUnavailable(String),

	#[error("challenge solver timed out")]
	SolverTimeout,

	#[error("challenge could not be solved after {attempts} attempts")]
	ChallengeUnsolvable { attempts: u32 },

	#[error("one-time code was rejected by the portal")]
	OtpRejected,

	#[error("no one-time code arrived within the polling budget")]
	OtpTimeout,

	#[error("mailbox query failed: {0}")]
	Mailbox(String),

	#[error("persistence failure: {0}")]
	Persistence(String),

	#[error("driver command failed: {0}")]
	Driver(String),

	#[error("configuration error: {0}")]
	Config(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

impl BellhopError {
	/// Returns `true` for failures a caller may resolve by retrying later.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::SessionBusy(_) | Self::ResourceAllocation(_) | Self::SolverUnavailable(_) | Self::SolverTimeout)
	}
}
