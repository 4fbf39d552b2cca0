//! Page driver capability surface consumed by the registry and auth engine.
//!
//! A driver owns one browser process, one browsing context, and one page.
//! Drivers never leave the registry; every consumer reaches them through a
//! checked-out session lease.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Raw CDP-backed driver implementation.
pub mod cdp;
/// Scriptable in-memory driver for tests.
pub mod fake;

/// Whether driver resources run with a visible window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityMode {
	#[default]
	Headless,
	Headful,
}

impl std::fmt::Display for VisibilityMode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Headless => write!(f, "headless"),
			Self::Headful => write!(f, "headful"),
		}
	}
}

/// One cookie record as captured from or replayed into a browsing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
	pub name: String,
	pub value: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub domain: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expires: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub http_only: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub secure: Option<bool>,
}

/// One ordered local-storage key/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
	pub key: String,
	pub value: String,
}

/// Metadata for a subframe of the driven page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
	pub id: String,
	pub url: String,
}

/// Opaque automation handle over one page.
///
/// The `*_in_frame` variants address a subframe by the id reported from
/// [`PageDriver::frames`]; otherwise they behave like their main-frame
/// counterparts.
#[async_trait]
pub trait PageDriver: Send + Sync {
	async fn navigate(&self, url: &str) -> Result<()>;
	async fn current_url(&self) -> Result<String>;
	async fn fill(&self, selector: &str, text: &str) -> Result<()>;
	async fn click(&self, selector: &str) -> Result<()>;
	/// Waits up to `timeout` for `selector` to appear; `Ok(false)` means the
	/// element never showed up, which callers treat as a definitive absence.
	async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool>;
	async fn evaluate(&self, js: &str) -> Result<Value>;
	async fn cookies(&self) -> Result<Vec<Cookie>>;
	async fn add_cookies(&self, cookies: &[Cookie]) -> Result<()>;
	async fn local_storage(&self) -> Result<Vec<StorageEntry>>;
	/// Replays a typed storage snapshot into the page, replacing existing keys.
	async fn seed_local_storage(&self, entries: &[StorageEntry]) -> Result<()>;
	async fn frames(&self) -> Result<Vec<FrameInfo>>;
	async fn fill_in_frame(&self, frame_id: &str, selector: &str, text: &str) -> Result<()>;
	async fn click_in_frame(&self, frame_id: &str, selector: &str) -> Result<()>;
	async fn evaluate_in_frame(&self, frame_id: &str, js: &str) -> Result<Value>;
	async fn wait_for_selector_in_frame(&self, frame_id: &str, selector: &str, timeout: Duration) -> Result<bool>;
	/// Tears down the process/context/page triple backing this driver.
	async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn PageDriver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("PageDriver")
	}
}

/// Allocates fresh driver resources in the requested visibility mode.
#[async_trait]
pub trait DriverFactory: Send + Sync {
	async fn launch(&self, mode: VisibilityMode) -> Result<Box<dyn PageDriver>>;
}
