//! JSON-file-backed state store: one document per session id under a state
//! directory, plus `directory.json` for the registry-wide record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use super::{DirectoryRecord, StateStore};
use crate::error::{BellhopError, Result};
use crate::registry::SessionId;
use crate::snapshot::SessionSnapshot;

const DIRECTORY_FILE: &str = "directory.json";

/// File-per-session [`StateStore`]; writes go through a temp file and rename
/// so readers never observe a torn document.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
	dir: PathBuf,
}

impl JsonFileStore {
	/// Opens (creating if needed) a store rooted at `dir`.
	pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
		let dir = dir.into();
		std::fs::create_dir_all(&dir).map_err(|e| BellhopError::Persistence(format!("create {}: {e}", dir.display())))?;
		Ok(Self { dir })
	}

	pub fn path(&self) -> &Path {
		&self.dir
	}

	fn session_path(&self, id: SessionId) -> PathBuf {
		self.dir.join(format!("{id}.json"))
	}

	fn write_document<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
		let payload = serde_json::to_vec_pretty(value).map_err(|e| BellhopError::Persistence(e.to_string()))?;
		let tmp = path.with_extension("json.tmp");
		std::fs::write(&tmp, payload).map_err(|e| BellhopError::Persistence(format!("write {}: {e}", tmp.display())))?;
		std::fs::rename(&tmp, path).map_err(|e| BellhopError::Persistence(format!("rename {}: {e}", path.display())))?;
		Ok(())
	}

	fn read_document<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
		let content = match std::fs::read_to_string(path) {
			Ok(content) => content,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(BellhopError::Persistence(format!("read {}: {e}", path.display(), e = err))),
		};
		serde_json::from_str(&content)
			.map(Some)
			.map_err(|e| BellhopError::Persistence(format!("parse {}: {e}", path.display())))
	}
}

#[async_trait]
impl StateStore for JsonFileStore {
	async fn put(&self, snapshot: &SessionSnapshot) -> Result<()> {
		self.write_document(&self.session_path(snapshot.id), snapshot)
	}

	async fn get(&self, id: SessionId) -> Result<Option<SessionSnapshot>> {
		self.read_document(&self.session_path(id))
	}

	async fn delete(&self, id: SessionId) -> Result<()> {
		match std::fs::remove_file(self.session_path(id)) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(BellhopError::Persistence(err.to_string())),
		}
	}

	async fn list(&self) -> Result<Vec<SessionSnapshot>> {
		let entries = std::fs::read_dir(&self.dir).map_err(|e| BellhopError::Persistence(e.to_string()))?;
		let mut snapshots = Vec::new();
		for entry in entries {
			let entry = entry.map_err(|e| BellhopError::Persistence(e.to_string()))?;
			let path = entry.path();
			if path.extension().is_none_or(|ext| ext != "json") || path.file_name().is_some_and(|name| name == DIRECTORY_FILE) {
				continue;
			}
			match self.read_document::<SessionSnapshot>(&path) {
				Ok(Some(snapshot)) => snapshots.push(snapshot),
				Ok(None) => {}
				Err(err) => {
					warn!(target = "bellhop.store", path = %path.display(), error = %err, "skipping unreadable snapshot");
				}
			}
		}
		Ok(snapshots)
	}

	async fn mark_not_in_use(&self, id: SessionId) -> Result<()> {
		let path = self.session_path(id);
		let Some(mut snapshot) = self.read_document::<SessionSnapshot>(&path)? else {
			return Ok(());
		};
		snapshot.in_use = false;
		self.write_document(&path, &snapshot)
	}

	async fn put_directory(&self, directory: &DirectoryRecord) -> Result<()> {
		self.write_document(&self.dir.join(DIRECTORY_FILE), directory)
	}

	async fn load_directory(&self) -> Result<Option<DirectoryRecord>> {
		self.read_document(&self.dir.join(DIRECTORY_FILE))
	}
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;
	use crate::driver::Cookie;
	use crate::snapshot::now_ms;

	fn snapshot(id: SessionId) -> SessionSnapshot {
		SessionSnapshot {
			id,
			owner: Some("owner@findahost.io".into()),
			current_url: Some("https://portal.example/home".into()),
			cookies: vec![Cookie {
				name: "sid".into(),
				value: "abc".into(),
				domain: Some(".portal.example".into()),
				path: Some("/".into()),
				expires: None,
				http_only: Some(true),
				secure: Some(true),
			}],
			local_storage: Vec::new(),
			last_accessed_at: now_ms(),
			in_use: true,
		}
	}

	#[tokio::test]
	async fn snapshot_survives_reopen() {
		let tmp = TempDir::new().unwrap();
		let id = SessionId::new();
		{
			let store = JsonFileStore::new(tmp.path()).unwrap();
			store.put(&snapshot(id)).await.unwrap();
		}
		let reopened = JsonFileStore::new(tmp.path()).unwrap();
		let loaded = reopened.get(id).await.unwrap().unwrap();
		assert_eq!(loaded.owner.as_deref(), Some("owner@findahost.io"));
		assert_eq!(loaded.cookies.len(), 1);
	}

	#[tokio::test]
	async fn list_skips_directory_record() {
		let tmp = TempDir::new().unwrap();
		let store = JsonFileStore::new(tmp.path()).unwrap();
		store.put(&snapshot(SessionId::new())).await.unwrap();
		store.put(&snapshot(SessionId::new())).await.unwrap();
		store
			.put_directory(&DirectoryRecord { sessions: Vec::new(), saved_at: now_ms() })
			.await
			.unwrap();
		assert_eq!(store.list().await.unwrap().len(), 2);
		assert!(store.load_directory().await.unwrap().is_some());
	}

	#[tokio::test]
	async fn mark_not_in_use_preserves_the_rest() {
		let tmp = TempDir::new().unwrap();
		let store = JsonFileStore::new(tmp.path()).unwrap();
		let id = SessionId::new();
		store.put(&snapshot(id)).await.unwrap();
		store.mark_not_in_use(id).await.unwrap();
		let loaded = store.get(id).await.unwrap().unwrap();
		assert!(!loaded.in_use);
		assert_eq!(loaded.current_url.as_deref(), Some("https://portal.example/home"));
	}

	#[tokio::test]
	async fn deleting_absent_id_is_a_noop() {
		let tmp = TempDir::new().unwrap();
		let store = JsonFileStore::new(tmp.path()).unwrap();
		store.delete(SessionId::new()).await.unwrap();
	}
}
