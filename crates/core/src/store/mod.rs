//! Durable state store for session snapshots.
//!
//! Durability is advisory: callers log store failures and carry on, because
//! in-memory registry state stays authoritative while the process is alive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::SessionId;
use crate::snapshot::SessionSnapshot;

/// JSON-file-backed store, one document per session.
pub mod json_file;
/// In-memory store for tests and stateless deployments.
pub mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

/// Registry-wide record kept alongside per-session documents for fast bulk
/// recovery after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryRecord {
	#[serde(default)]
	pub sessions: Vec<DirectoryEntry>,
	pub saved_at: u64,
}

/// One live-session pointer inside the [`DirectoryRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
	pub id: SessionId,
	#[serde(default)]
	pub owner: Option<String>,
	pub last_accessed_at: u64,
}

/// Key-value document store for session snapshots, upsert semantics keyed by
/// session id. All errors are `BellhopError::Persistence`.
#[async_trait]
pub trait StateStore: Send + Sync {
	/// Upserts one session snapshot.
	async fn put(&self, snapshot: &SessionSnapshot) -> Result<()>;
	/// Fetches a snapshot by id, `None` when absent.
	async fn get(&self, id: SessionId) -> Result<Option<SessionSnapshot>>;
	/// Deletes a snapshot; absent ids are a no-op.
	async fn delete(&self, id: SessionId) -> Result<()>;
	/// Lists every stored snapshot.
	async fn list(&self) -> Result<Vec<SessionSnapshot>>;
	/// Flips `inUse` to false without touching the rest of the record.
	async fn mark_not_in_use(&self, id: SessionId) -> Result<()>;
	/// Upserts the registry-wide directory record.
	async fn put_directory(&self, directory: &DirectoryRecord) -> Result<()>;
	/// Loads the registry-wide directory record.
	async fn load_directory(&self) -> Result<Option<DirectoryRecord>>;
}
