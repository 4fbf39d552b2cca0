//! Session lifecycle control: creation, visibility-mode switches, idle
//! sweeping, startup recovery, and graceful drain.
//!
//! Per-session state machine: `Created -> Active -> (ModeSwitching ->
//! Active)* -> Evicted`; eviction is terminal and later operations on the id
//! fail with `NotFound`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SweepConfig;
use crate::driver::VisibilityMode;
use crate::error::Result;
use crate::registry::{DriverSlot, SessionId, SessionLease, SessionRegistry};
use crate::snapshot::{SessionSnapshot, now_ms};

/// Creates, evicts, and reshapes sessions owned by a [`SessionRegistry`].
pub struct LifecycleController {
	registry: Arc<SessionRegistry>,
	sweep: SweepConfig,
}

impl LifecycleController {
	pub fn new(registry: Arc<SessionRegistry>, sweep: SweepConfig) -> Self {
		Self { registry, sweep }
	}

	pub fn registry(&self) -> &Arc<SessionRegistry> {
		&self.registry
	}

	/// Creates a headless session and writes its first durable snapshot.
	pub async fn create(&self, owner: Option<String>) -> Result<SessionId> {
		let id = self.registry.create(owner, VisibilityMode::Headless).await?;
		// Freshly created; nothing else can hold the lease yet.
		if let Ok(lease) = self.registry.checkout(id) {
			self.persist_lease(&lease).await;
		}
		Ok(id)
	}

	/// Writes a best-effort snapshot of a checked-out session.
	pub async fn persist_lease(&self, lease: &SessionLease) {
		match SessionSnapshot::capture(lease.id(), lease.owner(), lease.driver(), lease.last_accessed_at()).await {
			Ok(snapshot) => {
				if let Err(err) = self.registry.store().put(&snapshot).await {
					warn!(target = "bellhop.lifecycle", id = %lease.id(), error = %err, "failed to persist snapshot");
				}
			}
			Err(err) => {
				warn!(target = "bellhop.lifecycle", id = %lease.id(), error = %err, "failed to capture snapshot");
			}
		}
	}

	/// Moves a session to the requested visibility mode, preserving cookies,
	/// storage, and URL across the teardown/recreate.
	///
	/// Atomic from the caller's point of view: on any failure the session is
	/// evicted rather than left half-restored.
	pub async fn switch_visibility(&self, id: SessionId, mode: VisibilityMode) -> Result<()> {
		let mut lease = self.registry.checkout(id)?;
		if lease.mode() == mode {
			return Ok(());
		}
		let owner = lease.owner().map(str::to_string);
		let last_accessed = lease.last_accessed_at();
		match self.switch_slot(id, owner.as_deref(), last_accessed, lease.slot_mut(), mode).await {
			Ok(()) => {
				self.persist_lease(&lease).await;
				Ok(())
			}
			Err(err) => {
				warn!(target = "bellhop.lifecycle", %id, %mode, error = %err, "mode switch failed; evicting session");
				let _ = lease.slot_mut().driver.close().await;
				// Remove while the slot is still held so no checkout can land
				// on the closed driver.
				self.registry.remove(id);
				drop(lease);
				if let Err(store_err) = self.registry.store().mark_not_in_use(id).await {
					warn!(target = "bellhop.lifecycle", %id, error = %store_err, "failed to mark evicted session");
				}
				Err(err)
			}
		}
	}

	/// Swaps the driver inside an already-held lease. Used by
	/// `switch_visibility` and by the auth engine's end-of-run mode reset.
	pub(crate) async fn switch_slot(&self, id: SessionId, owner: Option<&str>, last_accessed: u64, slot: &mut DriverSlot, mode: VisibilityMode) -> Result<()> {
		if slot.mode == mode {
			return Ok(());
		}
		let snapshot = SessionSnapshot::capture(id, owner, slot.driver.as_ref(), last_accessed).await?;
		if let Err(err) = slot.driver.close().await {
			warn!(target = "bellhop.lifecycle", %id, error = %err, "teardown during mode switch failed");
		}
		slot.driver = self.registry.factory().launch(mode).await?;
		slot.mode = mode;
		snapshot.restore_into(slot.driver.as_ref()).await?;
		info!(target = "bellhop.lifecycle", %id, %mode, "visibility mode switched");
		Ok(())
	}

	/// Evicts one session: teardown, durable `inUse = false`, registry removal.
	pub async fn evict(&self, id: SessionId) -> Result<()> {
		let mut lease = self.registry.checkout(id)?;
		if let Err(err) = lease.slot_mut().driver.close().await {
			warn!(target = "bellhop.lifecycle", %id, error = %err, "driver teardown failed during eviction");
		}
		// Remove before the slot is released; see switch_visibility.
		self.registry.remove(id);
		drop(lease);
		if let Err(err) = self.registry.store().mark_not_in_use(id).await {
			warn!(target = "bellhop.lifecycle", %id, error = %err, "failed to mark evicted session");
		}
		info!(target = "bellhop.lifecycle", %id, "session evicted");
		Ok(())
	}

	/// Closes a session on caller request and deletes its durable record.
	pub async fn close(&self, id: SessionId) -> Result<()> {
		let mut lease = self.registry.checkout(id)?;
		if let Err(err) = lease.slot_mut().driver.close().await {
			warn!(target = "bellhop.lifecycle", %id, error = %err, "driver teardown failed during close");
		}
		self.registry.remove(id);
		drop(lease);
		if let Err(err) = self.registry.store().delete(id).await {
			warn!(target = "bellhop.lifecycle", %id, error = %err, "failed to delete durable record");
		}
		Ok(())
	}

	/// One sweep pass: evicts sessions idle past `idle_threshold` and
	/// refreshes snapshots for the survivors. Per-entry failures never abort
	/// the rest of the pass.
	pub async fn sweep_once(&self, idle_threshold: Duration) -> usize {
		let threshold_ms = idle_threshold.as_millis() as u64;
		let now = now_ms();
		let mut evicted = 0;

		for id in self.registry.ids() {
			let Ok(entry) = self.registry.get(id) else { continue };
			let idle = now.saturating_sub(entry.last_accessed_at());

			// Busy sessions are never eviction candidates.
			let Ok(mut guard) = Arc::clone(&entry.slot).try_lock_owned() else {
				continue;
			};

			if idle <= threshold_ms {
				// Survivor: refresh its durable snapshot while we hold the slot.
				match SessionSnapshot::capture(id, entry.owner(), guard.driver.as_ref(), entry.last_accessed_at()).await {
					Ok(snapshot) => {
						if let Err(err) = self.registry.store().put(&snapshot).await {
							warn!(target = "bellhop.lifecycle", %id, error = %err, "sweep snapshot write failed");
						}
					}
					Err(err) => debug!(target = "bellhop.lifecycle", %id, error = %err, "sweep snapshot capture failed"),
				}
				continue;
			}

			// Re-check candidacy right before teardown; an operation may have
			// touched the entry between the idle check and the lock.
			if now.saturating_sub(entry.last_accessed_at()) <= threshold_ms {
				continue;
			}

			if let Err(err) = guard.driver.close().await {
				warn!(target = "bellhop.lifecycle", %id, error = %err, "driver teardown failed during sweep");
			}
			self.registry.remove(id);
			drop(guard);
			if let Err(err) = self.registry.store().mark_not_in_use(id).await {
				warn!(target = "bellhop.lifecycle", %id, error = %err, "failed to mark swept session");
			}
			info!(target = "bellhop.lifecycle", %id, idle_ms = idle, "idle session evicted");
			evicted += 1;
		}
		evicted
	}

	/// Spawns the periodic sweep task.
	pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
		let controller = Arc::clone(self);
		let interval = self.sweep.sweep_interval;
		let threshold = self.sweep.idle_threshold;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				let evicted = controller.sweep_once(threshold).await;
				if evicted > 0 {
					debug!(target = "bellhop.lifecycle", evicted, "sweep pass complete");
				}
			}
		})
	}

	/// Collects the snapshots considered for startup recovery.
	///
	/// The directory record names the sessions that were live at the last
	/// registry change, so it is consulted first; a missing or unreadable
	/// directory falls back to a full store scan.
	async fn recovery_candidates(&self) -> Vec<SessionSnapshot> {
		match self.registry.store().load_directory().await {
			Ok(Some(directory)) if !directory.sessions.is_empty() => {
				let mut candidates = Vec::with_capacity(directory.sessions.len());
				for entry in &directory.sessions {
					match self.registry.store().get(entry.id).await {
						Ok(Some(snapshot)) => candidates.push(snapshot),
						Ok(None) => debug!(target = "bellhop.lifecycle", id = %entry.id, "directory points at a missing record"),
						Err(err) => warn!(target = "bellhop.lifecycle", id = %entry.id, error = %err, "failed to read directory-listed record"),
					}
				}
				candidates
			}
			Ok(_) => self.scan_all_records().await,
			Err(err) => {
				warn!(target = "bellhop.lifecycle", error = %err, "directory record unreadable; scanning store");
				self.scan_all_records().await
			}
		}
	}

	async fn scan_all_records(&self) -> Vec<SessionSnapshot> {
		match self.registry.store().list().await {
			Ok(snapshots) => snapshots,
			Err(err) => {
				warn!(target = "bellhop.lifecycle", error = %err, "startup recovery could not list records");
				Vec::new()
			}
		}
	}

	/// Rehydrates sessions from durable records with `inUse = true`.
	///
	/// Best-effort: a record that fails to rehydrate is marked not-in-use and
	/// dropped. Returns the number of sessions recovered.
	pub async fn recover_on_startup(&self) -> usize {
		let snapshots = self.recovery_candidates().await;

		let mut recovered = 0;
		for snapshot in snapshots.into_iter().filter(|s| s.in_use) {
			if self.registry.get(snapshot.id).is_ok() {
				continue;
			}
			match self.rehydrate(&snapshot).await {
				Ok(()) => {
					info!(target = "bellhop.lifecycle", id = %snapshot.id, url = ?snapshot.current_url, "session recovered");
					recovered += 1;
				}
				Err(err) => {
					warn!(target = "bellhop.lifecycle", id = %snapshot.id, error = %err, "failed to rehydrate session; dropping");
					if let Err(store_err) = self.registry.store().mark_not_in_use(snapshot.id).await {
						warn!(target = "bellhop.lifecycle", id = %snapshot.id, error = %store_err, "failed to mark dropped record");
					}
				}
			}
		}
		recovered
	}

	async fn rehydrate(&self, snapshot: &SessionSnapshot) -> Result<()> {
		let driver = self.registry.factory().launch(VisibilityMode::Headless).await?;
		if let Err(err) = snapshot.restore_into(driver.as_ref()).await {
			let _ = driver.close().await;
			return Err(err);
		}
		self.registry
			.insert_recovered(snapshot.id, snapshot.owner.clone(), driver, VisibilityMode::Headless, snapshot.last_accessed_at);
		Ok(())
	}

	/// Persists a final snapshot of every live session and tears all driver
	/// resources down. Waits for in-flight operations to finish.
	pub async fn shutdown_drain(&self) {
		for id in self.registry.ids() {
			let Ok(entry) = self.registry.get(id) else { continue };
			let mut guard = Arc::clone(&entry.slot).lock_owned().await;
			match SessionSnapshot::capture(id, entry.owner(), guard.driver.as_ref(), entry.last_accessed_at()).await {
				Ok(snapshot) => {
					if let Err(err) = self.registry.store().put(&snapshot).await {
						warn!(target = "bellhop.lifecycle", %id, error = %err, "drain snapshot write failed");
					}
				}
				Err(err) => warn!(target = "bellhop.lifecycle", %id, error = %err, "drain snapshot capture failed"),
			}
			if let Err(err) = guard.driver.close().await {
				warn!(target = "bellhop.lifecycle", %id, error = %err, "driver teardown failed during drain");
			}
			self.registry.remove(id);
			drop(guard);
		}
		info!(target = "bellhop.lifecycle", "shutdown drain complete");
	}
}
