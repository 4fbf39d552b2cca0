//! Durable projection of a live session used for crash recovery.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::{Cookie, PageDriver, StorageEntry};
use crate::error::Result;
use crate::registry::SessionId;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Serialized projection of one session: enough state to rehydrate a
/// best-effort replacement after a restart or a visibility-mode switch.
///
/// Snapshots are eventually consistent with the live session; they are
/// rewritten after every state-changing operation but may lag momentarily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
	pub id: SessionId,
	#[serde(default)]
	pub owner: Option<String>,
	#[serde(default)]
	pub current_url: Option<String>,
	#[serde(default)]
	pub cookies: Vec<Cookie>,
	#[serde(default)]
	pub local_storage: Vec<StorageEntry>,
	pub last_accessed_at: u64,
	pub in_use: bool,
}

impl SessionSnapshot {
	/// Captures URL, cookies, and storage from a live driver.
	pub async fn capture(id: SessionId, owner: Option<&str>, driver: &dyn PageDriver, last_accessed_at: u64) -> Result<Self> {
		let url = driver.current_url().await?;
		let cookies = driver.cookies().await?;
		let local_storage = driver.local_storage().await?;
		Ok(Self {
			id,
			owner: owner.map(str::to_string),
			current_url: if url.is_empty() { None } else { Some(url) },
			cookies,
			local_storage,
			last_accessed_at,
			in_use: true,
		})
	}

	/// Replays cookies and storage into a fresh driver, then navigates to the
	/// captured URL.
	pub async fn restore_into(&self, driver: &dyn PageDriver) -> Result<()> {
		driver.add_cookies(&self.cookies).await?;
		if !self.local_storage.is_empty() {
			driver.seed_local_storage(&self.local_storage).await?;
		}
		if let Some(url) = &self.current_url {
			driver.navigate(url).await?;
		}
		debug!(
			target = "bellhop.registry",
			id = %self.id,
			cookies = self.cookies.len(),
			storage = self.local_storage.len(),
			"session state restored"
		);
		Ok(())
	}
}
