//! In-memory state store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DirectoryRecord, StateStore};
use crate::error::{BellhopError, Result};
use crate::registry::SessionId;
use crate::snapshot::SessionSnapshot;

#[derive(Default)]
struct Inner {
	sessions: HashMap<SessionId, SessionSnapshot>,
	directory: Option<DirectoryRecord>,
}

/// Process-local [`StateStore`]; shared clones see the same data, which makes
/// it usable as a stand-in for restart tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
	inner: Arc<Mutex<Inner>>,
	fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Makes every write fail, for exercising the advisory-durability path.
	pub fn set_fail_writes(&self, fail: bool) {
		self.fail_writes.store(fail, Ordering::Relaxed);
	}

	fn check_writable(&self) -> Result<()> {
		if self.fail_writes.load(Ordering::Relaxed) {
			return Err(BellhopError::Persistence("injected write failure".into()));
		}
		Ok(())
	}
}

#[async_trait]
impl StateStore for MemoryStore {
	async fn put(&self, snapshot: &SessionSnapshot) -> Result<()> {
		self.check_writable()?;
		self.inner.lock().sessions.insert(snapshot.id, snapshot.clone());
		Ok(())
	}

	async fn get(&self, id: SessionId) -> Result<Option<SessionSnapshot>> {
		Ok(self.inner.lock().sessions.get(&id).cloned())
	}

	async fn delete(&self, id: SessionId) -> Result<()> {
		self.check_writable()?;
		self.inner.lock().sessions.remove(&id);
		Ok(())
	}

	async fn list(&self) -> Result<Vec<SessionSnapshot>> {
		Ok(self.inner.lock().sessions.values().cloned().collect())
	}

	async fn mark_not_in_use(&self, id: SessionId) -> Result<()> {
		self.check_writable()?;
		if let Some(snapshot) = self.inner.lock().sessions.get_mut(&id) {
			snapshot.in_use = false;
		}
		Ok(())
	}

	async fn put_directory(&self, directory: &DirectoryRecord) -> Result<()> {
		self.check_writable()?;
		self.inner.lock().directory = Some(directory.clone());
		Ok(())
	}

	async fn load_directory(&self) -> Result<Option<DirectoryRecord>> {
		Ok(self.inner.lock().directory.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::snapshot::now_ms;

	fn snapshot(id: SessionId) -> SessionSnapshot {
		SessionSnapshot {
			id,
			owner: None,
			current_url: None,
			cookies: Vec::new(),
			local_storage: Vec::new(),
			last_accessed_at: now_ms(),
			in_use: true,
		}
	}

	#[tokio::test]
	async fn put_get_delete_round_trip() {
		let store = MemoryStore::new();
		let id = SessionId::new();
		store.put(&snapshot(id)).await.unwrap();
		assert!(store.get(id).await.unwrap().is_some());
		store.mark_not_in_use(id).await.unwrap();
		assert!(!store.get(id).await.unwrap().unwrap().in_use);
		store.delete(id).await.unwrap();
		assert!(store.get(id).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn injected_failures_surface_as_persistence_errors() {
		let store = MemoryStore::new();
		store.set_fail_writes(true);
		let err = store.put(&snapshot(SessionId::new())).await.unwrap_err();
		assert!(matches!(err, BellhopError::Persistence(_)));
	}
}
