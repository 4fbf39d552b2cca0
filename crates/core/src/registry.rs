//! In-memory session directory: the single source of truth for which
//! sessions are usable right now.
//!
//! Driver resources live inside registry entries and are only reachable by
//! checking out a [`SessionLease`]; at most one lease per session exists at a
//! time, which is what enforces the one-driver-per-id invariant and rejects
//! conflicting concurrent operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::{DriverFactory, PageDriver, VisibilityMode};
use crate::error::{BellhopError, Result};
use crate::snapshot::now_ms;
use crate::store::{DirectoryEntry, DirectoryRecord, StateStore};

/// Opaque session identifier, generated at creation and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for SessionId {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for SessionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

impl std::str::FromStr for SessionId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// Exclusively owned driver resources plus their current visibility mode.
///
/// Mode switches swap the boxed driver in place while the lease is held.
pub struct DriverSlot {
	pub driver: Box<dyn PageDriver>,
	pub mode: VisibilityMode,
}

/// One registry entry. The driver never leaves the slot; eviction and mode
/// switches replace or close it through a held lease.
pub struct SessionEntry {
	id: SessionId,
	owner: Option<String>,
	last_accessed_at: AtomicU64,
	pub(crate) slot: Arc<tokio::sync::Mutex<DriverSlot>>,
}

impl SessionEntry {
	pub fn id(&self) -> SessionId {
		self.id
	}

	pub fn owner(&self) -> Option<&str> {
		self.owner.as_deref()
	}

	pub fn last_accessed_at(&self) -> u64 {
		self.last_accessed_at.load(Ordering::Relaxed)
	}

	/// Refreshes the idle clock.
	pub fn touch(&self) {
		self.last_accessed_at.store(now_ms(), Ordering::Relaxed);
	}
}

/// Exclusive access to one session's driver for a single in-flight operation.
///
/// Dropping the lease touches the entry so the sweep never fires exactly at
/// the idle boundary of an operation that just finished.
pub struct SessionLease {
	entry: Arc<SessionEntry>,
	guard: tokio::sync::OwnedMutexGuard<DriverSlot>,
}

impl SessionLease {
	pub fn id(&self) -> SessionId {
		self.entry.id
	}

	pub fn owner(&self) -> Option<&str> {
		self.entry.owner()
	}

	pub fn last_accessed_at(&self) -> u64 {
		self.entry.last_accessed_at()
	}

	pub fn mode(&self) -> VisibilityMode {
		self.guard.mode
	}

	pub fn driver(&self) -> &dyn PageDriver {
		self.guard.driver.as_ref()
	}

	pub fn slot_mut(&mut self) -> &mut DriverSlot {
		&mut self.guard
	}
}

impl Drop for SessionLease {
	fn drop(&mut self) {
		self.entry.touch();
	}
}

/// Arena-style directory of live sessions keyed by [`SessionId`].
pub struct SessionRegistry {
	factory: Arc<dyn DriverFactory>,
	store: Arc<dyn StateStore>,
	entries: Mutex<HashMap<SessionId, Arc<SessionEntry>>>,
}

impl SessionRegistry {
	pub fn new(factory: Arc<dyn DriverFactory>, store: Arc<dyn StateStore>) -> Self {
		Self {
			factory,
			store,
			entries: Mutex::new(HashMap::new()),
		}
	}

	pub(crate) fn store(&self) -> &Arc<dyn StateStore> {
		&self.store
	}

	pub(crate) fn factory(&self) -> &Arc<dyn DriverFactory> {
		&self.factory
	}

	/// Allocates driver resources and registers a fresh session.
	///
	/// A factory failure propagates as `ResourceAllocation` and leaves no
	/// partial entry behind.
	pub async fn create(&self, owner: Option<String>, mode: VisibilityMode) -> Result<SessionId> {
		let driver = self.factory.launch(mode).await?;
		let id = SessionId::new();
		let entry = Arc::new(SessionEntry {
			id,
			owner,
			last_accessed_at: AtomicU64::new(now_ms()),
			slot: Arc::new(tokio::sync::Mutex::new(DriverSlot { driver, mode })),
		});
		self.entries.lock().insert(id, entry);
		info!(target = "bellhop.registry", %id, %mode, "session created");
		self.persist_directory();
		Ok(id)
	}

	/// Re-registers a session rehydrated from a durable snapshot, keeping its
	/// original id and idle clock.
	pub(crate) fn insert_recovered(&self, id: SessionId, owner: Option<String>, driver: Box<dyn PageDriver>, mode: VisibilityMode, last_accessed_at: u64) {
		let entry = Arc::new(SessionEntry {
			id,
			owner,
			last_accessed_at: AtomicU64::new(last_accessed_at),
			slot: Arc::new(tokio::sync::Mutex::new(DriverSlot { driver, mode })),
		});
		self.entries.lock().insert(id, entry);
		self.persist_directory();
	}

	/// Looks up a live entry; evicted or unknown ids are `NotFound`.
	pub fn get(&self, id: SessionId) -> Result<Arc<SessionEntry>> {
		self.entries.lock().get(&id).cloned().ok_or(BellhopError::NotFound(id))
	}

	/// Refreshes the idle clock for `id`.
	pub fn touch(&self, id: SessionId) -> Result<()> {
		self.get(id)?.touch();
		self.persist_directory();
		Ok(())
	}

	/// Detaches and returns an entry without tearing down its resources; the
	/// caller takes ownership of teardown. Removing an absent id is a no-op.
	pub fn remove(&self, id: SessionId) -> Option<Arc<SessionEntry>> {
		let removed = self.entries.lock().remove(&id);
		if removed.is_some() {
			debug!(target = "bellhop.registry", %id, "session removed from registry");
			self.persist_directory();
		}
		removed
	}

	/// Grants exclusive driver access for one operation, touching the entry.
	/// A session with another operation in flight yields `SessionBusy`.
	pub fn checkout(&self, id: SessionId) -> Result<SessionLease> {
		let entry = self.get(id)?;
		let guard = Arc::clone(&entry.slot).try_lock_owned().map_err(|_| BellhopError::SessionBusy(id))?;
		entry.touch();
		Ok(SessionLease { entry, guard })
	}

	/// Ids of every live session, in no particular order.
	pub fn ids(&self) -> Vec<SessionId> {
		self.entries.lock().keys().copied().collect()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	/// Fires an asynchronous, best-effort write of the directory record.
	/// Failures are logged and never surfaced; memory stays authoritative.
	fn persist_directory(&self) {
		let record = DirectoryRecord {
			sessions: self
				.entries
				.lock()
				.values()
				.map(|entry| DirectoryEntry {
					id: entry.id,
					owner: entry.owner.clone(),
					last_accessed_at: entry.last_accessed_at(),
				})
				.collect(),
			saved_at: now_ms(),
		};
		let store = Arc::clone(&self.store);
		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			debug!(target = "bellhop.registry", "no runtime; skipping directory persistence");
			return;
		};
		handle.spawn(async move {
			if let Err(err) = store.put_directory(&record).await {
				warn!(target = "bellhop.registry", error = %err, "failed to persist directory record");
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::driver::fake::FakeDriverFactory;
	use crate::store::MemoryStore;

	fn registry() -> (SessionRegistry, FakeDriverFactory) {
		let factory = FakeDriverFactory::new();
		let store = MemoryStore::new();
		(SessionRegistry::new(Arc::new(factory.clone()), Arc::new(store)), factory)
	}

	#[tokio::test]
	async fn create_get_touch_remove() {
		let (registry, _factory) = registry();
		let id = registry.create(Some("owner@findahost.io".into()), VisibilityMode::Headless).await.unwrap();
		let entry = registry.get(id).unwrap();
		assert_eq!(entry.owner(), Some("owner@findahost.io"));

		let before = entry.last_accessed_at();
		tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		registry.touch(id).unwrap();
		assert!(registry.get(id).unwrap().last_accessed_at() >= before);

		assert!(registry.remove(id).is_some());
		assert!(matches!(registry.get(id), Err(BellhopError::NotFound(_))));
		// Idempotent removal.
		assert!(registry.remove(id).is_none());
	}

	#[tokio::test]
	async fn failed_launch_leaves_no_partial_entry() {
		let (registry, factory) = registry();
		factory.fail_next_launch();
		let err = registry.create(None, VisibilityMode::Headless).await.unwrap_err();
		assert!(matches!(err, BellhopError::ResourceAllocation(_)));
		assert!(registry.is_empty());
	}

	#[tokio::test]
	async fn conflicting_checkout_is_rejected() {
		let (registry, _factory) = registry();
		let id = registry.create(None, VisibilityMode::Headless).await.unwrap();
		let lease = registry.checkout(id).unwrap();
		assert!(matches!(registry.checkout(id), Err(BellhopError::SessionBusy(_))));
		drop(lease);
		assert!(registry.checkout(id).is_ok());
	}

	#[tokio::test]
	async fn removal_while_a_lease_is_held_blocks_future_checkouts() {
		let (registry, _factory) = registry();
		let id = registry.create(None, VisibilityMode::Headless).await.unwrap();
		let lease = registry.checkout(id).unwrap();

		// Eviction removes the entry while still holding the slot; no new
		// checkout may observe the session from that point on.
		assert!(registry.remove(id).is_some());
		assert!(matches!(registry.checkout(id), Err(BellhopError::NotFound(_))));

		drop(lease);
		assert!(matches!(registry.checkout(id), Err(BellhopError::NotFound(_))));
	}

	#[tokio::test]
	async fn touch_on_unknown_id_is_not_found() {
		let (registry, _factory) = registry();
		assert!(matches!(registry.touch(SessionId::new()), Err(BellhopError::NotFound(_))));
	}
}
