//! Behavioral tests for session creation, eviction, mode switching,
//! crash recovery, and graceful drain.

use std::sync::Arc;
use std::time::Duration;

use bellhop::driver::fake::FakeDriverFactory;
use bellhop::snapshot::now_ms;
use bellhop::store::{DirectoryEntry, DirectoryRecord};
use bellhop::{BellhopError, Cookie, LifecycleController, MemoryStore, SessionId, SessionRegistry, SessionSnapshot, StateStore, StorageEntry, SweepConfig, VisibilityMode};

fn harness() -> (Arc<SessionRegistry>, LifecycleController, FakeDriverFactory, MemoryStore) {
	let factory = FakeDriverFactory::new();
	let store = MemoryStore::new();
	let registry = Arc::new(SessionRegistry::new(Arc::new(factory.clone()), Arc::new(store.clone())));
	let lifecycle = LifecycleController::new(Arc::clone(&registry), SweepConfig::default());
	(registry, lifecycle, factory, store)
}

fn cookie(name: &str, value: &str) -> Cookie {
	Cookie {
		name: name.to_string(),
		value: value.to_string(),
		domain: Some(".portal.example".to_string()),
		path: Some("/".to_string()),
		expires: None,
		http_only: Some(true),
		secure: Some(true),
	}
}

#[tokio::test]
async fn concurrent_creates_yield_distinct_exclusive_sessions() {
	let (registry, lifecycle, _factory, _store) = harness();
	let lifecycle = Arc::new(lifecycle);

	let mut handles = Vec::new();
	for i in 0..4 {
		let lifecycle = Arc::clone(&lifecycle);
		handles.push(tokio::spawn(async move { lifecycle.create(Some(format!("tenant-{i}@findahost.io"))).await }));
	}
	let mut ids = Vec::new();
	for handle in handles {
		ids.push(handle.await.unwrap().unwrap());
	}

	ids.sort_by_key(|id| id.to_string());
	ids.dedup();
	assert_eq!(ids.len(), 4);
	assert_eq!(registry.len(), 4);
	for id in ids {
		let lease = registry.checkout(id).unwrap();
		assert_eq!(lease.mode(), VisibilityMode::Headless);
	}
}

#[tokio::test]
async fn sweep_evicts_idle_sessions_and_touch_protects() {
	let (registry, lifecycle, _factory, store) = harness();

	let idle = lifecycle.create(None).await.unwrap();
	let active = lifecycle.create(None).await.unwrap();

	tokio::time::sleep(Duration::from_millis(50)).await;
	registry.touch(active).unwrap();

	let evicted = lifecycle.sweep_once(Duration::from_millis(20)).await;
	assert_eq!(evicted, 1);

	assert!(matches!(registry.get(idle), Err(BellhopError::NotFound(_))));
	assert!(registry.get(active).is_ok());

	// Durable record survives eviction, flagged as no longer live.
	let record = store.get(idle).await.unwrap().unwrap();
	assert!(!record.in_use);
	assert!(store.get(active).await.unwrap().unwrap().in_use);
}

#[tokio::test]
async fn sweep_never_touches_busy_sessions() {
	let (registry, lifecycle, _factory, _store) = harness();

	let id = lifecycle.create(None).await.unwrap();
	let lease = registry.checkout(id).unwrap();

	tokio::time::sleep(Duration::from_millis(50)).await;
	let evicted = lifecycle.sweep_once(Duration::from_millis(10)).await;
	assert_eq!(evicted, 0);
	assert!(registry.get(id).is_ok());
	drop(lease);
}

#[tokio::test]
async fn sweep_continues_past_a_failing_eviction() {
	let (registry, lifecycle, factory, store) = harness();

	let broken = factory.push_scripted();
	broken.fail_close();
	let first = lifecycle.create(None).await.unwrap();
	let second = lifecycle.create(None).await.unwrap();

	tokio::time::sleep(Duration::from_millis(50)).await;
	let evicted = lifecycle.sweep_once(Duration::from_millis(20)).await;

	// The teardown failure on the first session must not spare the second.
	assert_eq!(evicted, 2);
	assert!(matches!(registry.get(first), Err(BellhopError::NotFound(_))));
	assert!(matches!(registry.get(second), Err(BellhopError::NotFound(_))));
	assert!(!store.get(first).await.unwrap().unwrap().in_use);
	assert!(!store.get(second).await.unwrap().unwrap().in_use);
}

#[tokio::test]
async fn recovery_prefers_the_directory_record() {
	let store = MemoryStore::new();

	let listed = SessionId::new();
	let orphan = SessionId::new();
	for id in [listed, orphan] {
		store
			.put(&SessionSnapshot {
				id,
				owner: None,
				current_url: Some("https://portal.example/dashboard".into()),
				cookies: Vec::new(),
				local_storage: Vec::new(),
				last_accessed_at: now_ms(),
				in_use: true,
			})
			.await
			.unwrap();
	}
	// The directory only knows about one of the two records; the orphan is a
	// leftover the last clean registry write already excluded.
	store
		.put_directory(&DirectoryRecord {
			sessions: vec![DirectoryEntry {
				id: listed,
				owner: None,
				last_accessed_at: now_ms(),
			}],
			saved_at: now_ms(),
		})
		.await
		.unwrap();

	let factory = FakeDriverFactory::new();
	let registry = Arc::new(SessionRegistry::new(Arc::new(factory.clone()), Arc::new(store.clone())));
	let lifecycle = LifecycleController::new(Arc::clone(&registry), SweepConfig::default());

	let recovered = lifecycle.recover_on_startup().await;
	assert_eq!(recovered, 1);
	assert!(registry.get(listed).is_ok());
	assert!(matches!(registry.get(orphan), Err(BellhopError::NotFound(_))));
}

#[tokio::test]
async fn recovery_rehydrates_only_in_use_records() {
	let (_registry, lifecycle, factory, store) = harness();

	let ctl = factory.push_scripted();
	ctl.set_url("https://portal.example/dashboard");
	ctl.set_cookies(vec![cookie("sid", "abc123")]);
	ctl.set_storage(vec![StorageEntry { key: "locale".into(), value: "en".into() }]);
	let survivor = lifecycle.create(Some("ops@findahost.io".into())).await.unwrap();

	let gone = lifecycle.create(None).await.unwrap();
	lifecycle.evict(gone).await.unwrap();

	// Fresh process: new registry and factory, same durable store.
	let factory2 = FakeDriverFactory::new();
	let registry2 = Arc::new(SessionRegistry::new(Arc::new(factory2.clone()), Arc::new(store.clone())));
	let lifecycle2 = LifecycleController::new(Arc::clone(&registry2), SweepConfig::default());

	let recovered = lifecycle2.recover_on_startup().await;
	assert_eq!(recovered, 1);
	assert_eq!(registry2.len(), 1);

	let entry = registry2.get(survivor).unwrap();
	assert_eq!(entry.owner(), Some("ops@findahost.io"));
	// Idle clock carries over from the durable record.
	assert_eq!(entry.last_accessed_at(), store.get(survivor).await.unwrap().unwrap().last_accessed_at);

	let commands = factory2.controllers()[0].take_commands();
	assert!(commands.iter().any(|c| c == "add_cookies x1"));
	assert!(commands.iter().any(|c| c == "seed_storage x1"));
	assert!(commands.iter().any(|c| c == "navigate https://portal.example/dashboard"));
}

#[tokio::test]
async fn mode_switch_round_trips_cookies_storage_and_url() {
	let (registry, lifecycle, factory, _store) = harness();

	let ctl_headless = factory.push_scripted();
	ctl_headless.set_url("https://portal.example/dashboard");
	ctl_headless.set_cookies(vec![cookie("sid", "abc123"), cookie("theme", "dark")]);
	ctl_headless.set_storage(vec![StorageEntry { key: "locale".into(), value: "en".into() }]);

	let id = lifecycle.create(None).await.unwrap();
	lifecycle.switch_visibility(id, VisibilityMode::Headful).await.unwrap();

	assert!(ctl_headless.is_closed());
	let lease = registry.checkout(id).unwrap();
	assert_eq!(lease.mode(), VisibilityMode::Headful);
	assert_eq!(lease.driver().current_url().await.unwrap(), "https://portal.example/dashboard");
	let mut names: Vec<String> = lease.driver().cookies().await.unwrap().into_iter().map(|c| c.name).collect();
	names.sort();
	assert_eq!(names, ["sid", "theme"]);
	assert_eq!(lease.driver().local_storage().await.unwrap()[0].key, "locale");
	drop(lease);

	// Switching to the mode already in effect is a no-op.
	let launched = factory.launched();
	lifecycle.switch_visibility(id, VisibilityMode::Headful).await.unwrap();
	assert_eq!(factory.launched(), launched);

	// And back again: the state survives the full round trip.
	lifecycle.switch_visibility(id, VisibilityMode::Headless).await.unwrap();
	let lease = registry.checkout(id).unwrap();
	assert_eq!(lease.mode(), VisibilityMode::Headless);
	assert_eq!(lease.driver().current_url().await.unwrap(), "https://portal.example/dashboard");
	let mut names: Vec<String> = lease.driver().cookies().await.unwrap().into_iter().map(|c| c.name).collect();
	names.sort();
	assert_eq!(names, ["sid", "theme"]);
	assert_eq!(lease.driver().local_storage().await.unwrap()[0].value, "en");
}

#[tokio::test]
async fn failed_mode_switch_evicts_instead_of_half_restoring() {
	let (registry, lifecycle, factory, store) = harness();

	let ctl = factory.push_scripted();
	let id = lifecycle.create(None).await.unwrap();

	factory.fail_next_launch();
	let err = lifecycle.switch_visibility(id, VisibilityMode::Headful).await.unwrap_err();
	assert!(matches!(err, BellhopError::ResourceAllocation(_)));

	assert!(ctl.is_closed());
	assert!(matches!(registry.get(id), Err(BellhopError::NotFound(_))));
	assert!(!store.get(id).await.unwrap().unwrap().in_use);
}

#[tokio::test]
async fn shutdown_drain_persists_and_releases_everything() {
	let (registry, lifecycle, factory, store) = harness();

	let ctl = factory.push_scripted();
	ctl.set_url("https://portal.example/dashboard");
	let id = lifecycle.create(None).await.unwrap();

	lifecycle.shutdown_drain().await;

	assert!(registry.is_empty());
	assert!(ctl.is_closed());
	let record = store.get(id).await.unwrap().unwrap();
	assert_eq!(record.current_url.as_deref(), Some("https://portal.example/dashboard"));
	assert!(record.in_use);
}

#[tokio::test]
async fn persistence_failures_never_break_session_operations() {
	let (registry, lifecycle, _factory, store) = harness();

	store.set_fail_writes(true);
	let id = lifecycle.create(None).await.unwrap();
	assert!(registry.get(id).is_ok());

	lifecycle.switch_visibility(id, VisibilityMode::Headful).await.unwrap();
	assert_eq!(registry.checkout(id).unwrap().mode(), VisibilityMode::Headful);
}
