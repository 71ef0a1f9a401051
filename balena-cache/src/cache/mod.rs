//! Freshness tracking and single-flight refresh of cached collections.
//!
//! Every [`CacheKey`] owns a slot holding its last refresh time and, while a
//! refresh runs, the [`Flight`] that callers wait on. The key map is locked
//! only long enough to find a slot, so refreshing one collection never
//! blocks reads or refreshes of another.

mod flight;
pub mod key;

pub use key::{CacheKey, CollectionKind, FleetScope};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::remote::{RemoteError, RemoteErrorKind, RemoteSource};
use crate::store::DocumentStore;
use crate::system_db::PartitionMeta;
use chrono::{DateTime, Utc};
use flight::Flight;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// What a caller got back from [`CacheManager::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub key: CacheKey,
    pub refreshed_at: DateTime<Utc>,
    pub document_count: usize,
    /// Served without waiting for a refresh.
    pub cache_hit: bool,
    /// A refresh was attempted and failed; this is the previous content.
    pub stale: bool,
}

#[derive(Debug, Clone)]
enum RefreshFailure {
    Remote(RemoteError),
    Storage(String),
}

impl RefreshFailure {
    fn into_error(self) -> CacheError {
        match self {
            RefreshFailure::Remote(e) => CacheError::Remote(e),
            RefreshFailure::Storage(msg) => CacheError::Storage(msg),
        }
    }
}

type Outcome = std::result::Result<PartitionMeta, RefreshFailure>;

#[derive(Default)]
struct SlotState {
    /// Metadata has been read from the store.
    loaded: bool,
    last_refreshed: Option<DateTime<Utc>>,
    document_count: usize,
    invalidated: bool,
    /// Bumped by every invalidation; a refresh that started under an older
    /// epoch does not clear the flag.
    epoch: u64,
    in_flight: Option<Arc<Flight<Outcome>>>,
}

impl SlotState {
    fn recover(&mut self, store: &DocumentStore, key: &CacheKey) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let meta = store.partition_meta(key.collection.as_str(), &key.partition())?;
        match meta {
            Some(meta) => {
                self.last_refreshed = Some(meta.last_refreshed);
                self.document_count = meta.document_count;
                self.invalidated = meta.invalidated;
            }
            None => {
                self.last_refreshed = None;
                self.document_count = 0;
                self.invalidated = false;
            }
        }
        self.loaded = true;
        Ok(())
    }

    fn bump_epoch(&mut self) {
        self.epoch += 1;
        self.loaded = false;
    }

    fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match self.last_refreshed {
            Some(at) if !self.invalidated => match chrono::Duration::from_std(max_age) {
                Ok(max_age) => now.signed_duration_since(at) <= max_age,
                // Too large to represent: never expires
                Err(_) => true,
            },
            _ => false,
        }
    }
}

type Slot = Arc<Mutex<SlotState>>;

/// Owns the document store and decides when collections are refreshed.
pub struct CacheManager {
    config: CacheConfig,
    store: Option<Arc<DocumentStore>>,
    source: Arc<dyn RemoteSource>,
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl CacheManager {
    /// Open the store in the configured directory. With the cache disabled
    /// nothing is opened and reads pass straight through to `source`.
    pub fn open(config: CacheConfig, source: Arc<dyn RemoteSource>) -> Result<Self> {
        let store = if config.enabled {
            let dir = config.resolve_cache_dir()?;
            Some(Arc::new(DocumentStore::open(&dir)?))
        } else {
            log::info!("Cache disabled; all reads go to the remote API");
            None
        };

        Ok(CacheManager {
            config,
            store,
            source,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// The backing store, `None` when the cache is disabled.
    pub fn store(&self) -> Option<&DocumentStore> {
        self.store.as_deref()
    }

    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    /// Make sure `key` is fresh enough and report the snapshot in the store.
    ///
    /// Waits at most `CacheConfig::wait_timeout` for a refresh.
    pub fn get(
        &self,
        key: &CacheKey,
        max_age: Option<Duration>,
        force_refresh: bool,
    ) -> Result<Snapshot> {
        self.get_with_timeout(key, max_age, force_refresh, self.config.wait_timeout)
    }

    /// Like [`get`](Self::get) with an explicit wait limit. Timing out
    /// returns [`CacheError::Timeout`]; the refresh keeps running and its
    /// result is still stored.
    pub fn get_with_timeout(
        &self,
        key: &CacheKey,
        max_age: Option<Duration>,
        force_refresh: bool,
        timeout: Option<Duration>,
    ) -> Result<Snapshot> {
        let store = self.require_store()?;
        let max_age = max_age.unwrap_or_else(|| self.config.max_age_for(key.collection));
        let slot = self.slot(key);

        let (flight, prior) = {
            let mut state = slot.lock();
            state.recover(store, key)?;
            let prior = state.last_refreshed.map(|at| (at, state.document_count));

            if !force_refresh && state.is_fresh(max_age, Utc::now()) {
                if let Some((at, count)) = prior {
                    log::debug!("Cache hit for {key} (refreshed {at})");
                    return Ok(Snapshot {
                        key: key.clone(),
                        refreshed_at: at,
                        document_count: count,
                        cache_hit: true,
                        stale: false,
                    });
                }
            }

            let flight = match &state.in_flight {
                Some(flight) => {
                    log::debug!("Joining refresh of {key} already in progress");
                    Arc::clone(flight)
                }
                None => {
                    let flight = Arc::new(Flight::new());
                    self.spawn_refresh(key, &slot, &flight, state.epoch)?;
                    state.in_flight = Some(Arc::clone(&flight));
                    flight
                }
            };
            (flight, prior)
        };

        let outcome = flight
            .wait(timeout)
            .ok_or_else(|| CacheError::Timeout(key.to_string()))?;

        match outcome {
            Ok(meta) => Ok(Snapshot {
                key: key.clone(),
                refreshed_at: meta.last_refreshed,
                document_count: meta.document_count,
                cache_hit: false,
                stale: false,
            }),
            Err(failure) => match (failure, prior) {
                // Only remote failures fall back; a store that cannot take
                // the new content is reported as is
                (RefreshFailure::Remote(e), Some((at, count))) if !force_refresh => {
                    log::warn!("Refresh of {key} failed, serving data from {at}: {e}");
                    Ok(Snapshot {
                        key: key.clone(),
                        refreshed_at: at,
                        document_count: count,
                        cache_hit: true,
                        stale: true,
                    })
                }
                (failure, _) => Err(failure.into_error()),
            },
        }
    }

    /// Forget the freshness of one key; the next `get` refreshes it. The
    /// stored content stays until that refresh succeeds.
    pub fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        let slot = self.slots.lock().get(key).cloned();
        let mut state = slot.as_ref().map(|slot| slot.lock());
        if let Some(state) = state.as_mut() {
            state.bump_epoch();
        }
        store.invalidate(key.collection.as_str(), Some(&key.partition()))?;
        drop(state);
        log::info!("Invalidated {key}");
        Ok(())
    }

    /// Invalidate every partition of a collection.
    pub fn invalidate_collection(&self, collection: CollectionKind) -> Result<()> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        let slots: Vec<Slot> = self
            .slots
            .lock()
            .iter()
            .filter(|(key, _)| key.collection == collection)
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        let mut states: Vec<_> = slots.iter().map(|slot| slot.lock()).collect();
        for state in states.iter_mut() {
            state.bump_epoch();
        }
        store.invalidate(collection.as_str(), None)?;
        drop(states);
        log::info!("Invalidated all of {collection}");
        Ok(())
    }

    /// Metadata of every partition in the store.
    pub fn status(&self) -> Result<Vec<PartitionMeta>> {
        match self.store() {
            Some(store) => store.all_partitions(),
            None => Ok(Vec::new()),
        }
    }

    /// Close the store. Refreshes still running keep their own handle and
    /// finish in the background.
    pub fn close(self) -> Result<()> {
        self.slots.lock().clear();
        match self.store.map(Arc::try_unwrap) {
            Some(Ok(store)) => store.close(),
            Some(Err(_)) => {
                log::debug!("Store still in use by a refresh; closing on drop");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn require_store(&self) -> Result<&DocumentStore> {
        self.store()
            .ok_or_else(|| CacheError::Config("cache is disabled".into()))
    }

    fn slot(&self, key: &CacheKey) -> Slot {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn spawn_refresh(
        &self,
        key: &CacheKey,
        slot: &Slot,
        flight: &Arc<Flight<Outcome>>,
        epoch: u64,
    ) -> Result<()> {
        let store = match &self.store {
            Some(store) => Arc::clone(store),
            None => return Err(CacheError::Config("cache is disabled".into())),
        };
        let source = Arc::clone(&self.source);
        let label = key.to_string();
        let key = key.clone();
        let slot = Arc::clone(slot);
        let flight = Arc::clone(flight);

        thread::Builder::new()
            .name(format!("refresh-{}", key.collection))
            .spawn(move || {
                let outcome = run_refresh(source.as_ref(), &store, &key);
                {
                    let mut state = slot.lock();
                    if let Ok(meta) = &outcome {
                        state.last_refreshed = Some(meta.last_refreshed);
                        state.document_count = meta.document_count;
                        state.loaded = true;
                        state.invalidated = state.epoch != epoch;
                        if state.invalidated {
                            // Invalidated while loading; the new content may predate it
                            let partition = key.partition();
                            if let Err(e) = store.invalidate(key.collection.as_str(), Some(&partition)) {
                                log::warn!("Cannot keep {key} invalidated: {e}");
                            }
                        }
                    }
                    state.in_flight = None;
                }
                flight.complete(outcome);
            })
            .map_err(|e| CacheError::Storage(format!("cannot start refresh of {label}: {e}")))?;
        Ok(())
    }
}

fn run_refresh(source: &dyn RemoteSource, store: &DocumentStore, key: &CacheKey) -> Outcome {
    log::info!("Refreshing {key}");
    let started = Instant::now();

    let loaded = panic::catch_unwind(AssertUnwindSafe(|| {
        source.load(key.collection, key.scope.as_ref())
    }));
    let documents = match loaded {
        Ok(Ok(documents)) => documents,
        Ok(Err(e)) => return Err(RefreshFailure::Remote(e)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("Loader for {key} panicked: {message}");
            return Err(RefreshFailure::Remote(RemoteError::new(
                RemoteErrorKind::Internal,
                format!("loader panicked: {message}"),
            )));
        }
    };

    let meta = store
        .replace_collection(key.collection.as_str(), &key.partition(), &documents)
        .map_err(|e| RefreshFailure::Storage(e.to_string()))?;
    log::info!(
        "Refreshed {key}: {} documents in {:.2}s",
        meta.document_count,
        started.elapsed().as_secs_f64()
    );
    Ok(meta)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FindOptions;
    use crate::testing::{devices, fleet_source, MockSource, TATER_ID};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn setup_manager(source: &Arc<MockSource>) -> (TempDir, CacheManager) {
        let tmp = TempDir::new().unwrap();
        let manager = open_manager(&tmp, source);
        (tmp, manager)
    }

    fn open_manager(tmp: &TempDir, source: &Arc<MockSource>) -> CacheManager {
        let config = CacheConfig::new().with_cache_dir(tmp.path());
        CacheManager::open(config, Arc::clone(source) as Arc<dyn RemoteSource>).unwrap()
    }

    fn devices_key() -> CacheKey {
        CacheKey::new(CollectionKind::Devices)
    }

    fn stored_devices(manager: &CacheManager) -> Vec<serde_json::Value> {
        manager
            .store()
            .unwrap()
            .query("devices", &FindOptions::default())
            .unwrap()
    }

    // Sleep past the microsecond resolution of stored timestamps so a zero
    // max-age is guaranteed to be exceeded.
    fn tick() {
        thread::sleep(Duration::from_millis(2));
    }

    #[test]
    fn test_first_get_populates_then_hits() {
        let source = Arc::new(fleet_source());
        let (_tmp, manager) = setup_manager(&source);

        let first = manager.get(&devices_key(), None, false).unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.document_count, 3);

        let second = manager.get(&devices_key(), None, false).unwrap();
        assert!(second.cache_hit);
        assert!(!second.stale);
        assert_eq!(second.refreshed_at, first.refreshed_at);
        assert_eq!(source.loads(), 1);
        assert_eq!(stored_devices(&manager), devices());
    }

    #[test]
    fn test_concurrent_gets_load_once() {
        let source = Arc::new(fleet_source());
        source.set_delay(Duration::from_millis(200));
        let (_tmp, manager) = setup_manager(&source);
        let manager = Arc::new(manager);

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.get(&devices_key(), None, false)
                })
            })
            .collect();

        for handle in handles {
            let snapshot = handle.join().unwrap().unwrap();
            assert_eq!(snapshot.document_count, 3);
        }
        assert_eq!(source.loads(), 1);
    }

    #[test]
    fn test_stale_snapshot_served_when_refresh_fails() {
        let source = Arc::new(fleet_source());
        let (_tmp, manager) = setup_manager(&source);
        let fresh = manager.get(&devices_key(), None, false).unwrap();

        source.set_failing(true);
        source.set(CollectionKind::Devices, Vec::new());
        tick();
        let stale = manager
            .get(&devices_key(), Some(Duration::ZERO), false)
            .unwrap();

        assert!(stale.stale);
        assert_eq!(stale.refreshed_at, fresh.refreshed_at);
        assert_eq!(source.loads(), 2);
        assert_eq!(stored_devices(&manager), devices());
    }

    #[test]
    fn test_store_failure_is_not_served_stale() {
        let source = Arc::new(fleet_source());
        let (_tmp, manager) = setup_manager(&source);
        manager.get(&devices_key(), None, false).unwrap();

        // Loads fine but cannot be stored
        source.set(CollectionKind::Devices, vec![json!({"id": 1}), json!({"id": 1})]);
        tick();
        let err = manager
            .get(&devices_key(), Some(Duration::ZERO), false)
            .unwrap_err();
        assert!(err.is_storage());
        assert_eq!(source.loads(), 2);
        assert_eq!(stored_devices(&manager), devices());
    }

    #[test]
    fn test_unrepresentable_wait_timeout_waits_normally() {
        let source = Arc::new(fleet_source());
        source.set_delay(Duration::from_millis(20));
        let tmp = TempDir::new().unwrap();
        let file = crate::config::parse_config_str("wait_timeout_secs: 18446744073709551615").unwrap();
        let config = CacheConfig::from_config_file(file)
            .unwrap()
            .with_cache_dir(tmp.path());
        let manager = CacheManager::open(config, Arc::clone(&source) as Arc<dyn RemoteSource>).unwrap();

        let snapshot = manager.get(&devices_key(), None, false).unwrap();
        assert_eq!(snapshot.document_count, 3);
    }

    #[test]
    fn test_forced_refresh_failure_is_raised() {
        let source = Arc::new(fleet_source());
        let (_tmp, manager) = setup_manager(&source);
        manager.get(&devices_key(), None, false).unwrap();

        source.set_failing(true);
        let err = manager.get(&devices_key(), None, true).unwrap_err();
        assert!(err.is_remote());
        assert_eq!(stored_devices(&manager), devices());
    }

    #[test]
    fn test_first_refresh_failure_persists_nothing() {
        let source = Arc::new(fleet_source());
        source.set_failing(true);
        let (_tmp, manager) = setup_manager(&source);

        let err = manager.get(&devices_key(), None, false).unwrap_err();
        assert!(err.is_remote());
        assert!(!manager.store().unwrap().collection_exists("devices").unwrap());

        // The failed flight is cleared, so the next call tries again
        source.set_failing(false);
        assert!(!manager.get(&devices_key(), None, false).unwrap().cache_hit);
        assert_eq!(source.loads(), 2);
    }

    #[test]
    fn test_panicking_loader_becomes_remote_error() {
        let source = Arc::new(fleet_source());
        source.set_panicking(true);
        let (_tmp, manager) = setup_manager(&source);

        match manager.get(&devices_key(), None, false) {
            Err(CacheError::Remote(e)) => {
                assert_eq!(e.kind, RemoteErrorKind::Internal);
                assert!(e.message.contains("mock loader exploded"));
            }
            other => panic!("expected a remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_wait_timeout_leaves_refresh_running() {
        let source = Arc::new(fleet_source());
        source.set_delay(Duration::from_millis(300));
        let (_tmp, manager) = setup_manager(&source);

        let err = manager
            .get_with_timeout(&devices_key(), None, false, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);

        // Joins the same flight instead of starting another load
        let snapshot = manager.get(&devices_key(), None, false).unwrap();
        assert_eq!(snapshot.document_count, 3);
        assert_eq!(source.loads(), 1);
    }

    #[test]
    fn test_slow_collection_does_not_block_others() {
        let source = Arc::new(fleet_source());
        source.set_delay_for(CollectionKind::Devices, Duration::from_millis(500));
        let (_tmp, manager) = setup_manager(&source);
        let manager = Arc::new(manager);

        let slow = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.get(&devices_key(), None, false))
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let apps = manager
            .get(&CacheKey::new(CollectionKind::Applications), None, false)
            .unwrap();
        assert_eq!(apps.document_count, 2);
        assert!(started.elapsed() < Duration::from_millis(400));

        slow.join().unwrap().unwrap();
    }

    #[test]
    fn test_release_partitions_are_separate_keys() {
        let source = Arc::new(fleet_source());
        let (_tmp, manager) = setup_manager(&source);
        let tater = CacheKey::scoped(CollectionKind::Releases, FleetScope::new(TATER_ID, "Tater_SAI"));

        assert_eq!(manager.get(&tater, None, false).unwrap().document_count, 3);
        assert!(manager.get(&tater, None, false).unwrap().cache_hit);
        assert_eq!(source.loads_of(CollectionKind::Releases), 1);

        let partitions = manager.store().unwrap().partitions("releases").unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].partition, TATER_ID.to_string());
    }

    #[test]
    fn test_reopened_directory_is_warm() {
        let source = Arc::new(fleet_source());
        let tmp = TempDir::new().unwrap();

        let manager = open_manager(&tmp, &source);
        let first = manager.get(&devices_key(), None, false).unwrap();
        manager.close().unwrap();

        let manager = open_manager(&tmp, &source);
        let again = manager.get(&devices_key(), None, false).unwrap();
        assert!(again.cache_hit);
        assert_eq!(again.refreshed_at, first.refreshed_at);
        assert_eq!(source.loads(), 1);
        assert_eq!(stored_devices(&manager), devices());
    }

    #[test]
    fn test_invalidate_forces_next_refresh() {
        let source = Arc::new(fleet_source());
        let (tmp, manager) = setup_manager(&source);
        manager.get(&devices_key(), None, false).unwrap();

        manager.invalidate(&devices_key()).unwrap();
        assert!(manager.status().unwrap()[0].invalidated);
        assert!(!manager.get(&devices_key(), None, false).unwrap().cache_hit);
        assert_eq!(source.loads(), 2);
        assert!(!manager.status().unwrap()[0].invalidated);

        // Invalidation is stored, so another manager on the same directory sees it
        manager.invalidate_collection(CollectionKind::Devices).unwrap();
        manager.close().unwrap();
        let reopened = open_manager(&tmp, &source);
        assert!(!reopened.get(&devices_key(), None, false).unwrap().cache_hit);
        assert_eq!(source.loads(), 3);
    }

    #[test]
    fn test_invalidate_during_refresh_is_kept() {
        let source = Arc::new(fleet_source());
        source.set_delay(Duration::from_millis(200));
        let (_tmp, manager) = setup_manager(&source);
        let manager = Arc::new(manager);

        let first = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.get(&devices_key(), None, false).unwrap())
        };
        while source.loads_of(CollectionKind::Devices) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        manager.invalidate(&devices_key()).unwrap();
        assert_eq!(first.join().unwrap().document_count, 3);

        // The load began before the invalidation, so it does not count as fresh
        assert!(manager.status().unwrap()[0].invalidated);
        let next = manager.get(&devices_key(), None, false).unwrap();
        assert!(!next.cache_hit);
        assert_eq!(source.loads_of(CollectionKind::Devices), 2);
    }

    #[test]
    fn test_invalidated_key_still_fails_soft() {
        let source = Arc::new(fleet_source());
        let (_tmp, manager) = setup_manager(&source);
        manager.get(&devices_key(), None, false).unwrap();
        manager.invalidate(&devices_key()).unwrap();

        source.set_failing(true);
        assert!(manager.get(&devices_key(), None, false).unwrap().stale);
    }

    #[test]
    fn test_disabled_cache_has_no_store() {
        let source = Arc::new(fleet_source());
        let config = CacheConfig::new().with_enabled(false);
        let manager = CacheManager::open(config, Arc::clone(&source) as Arc<dyn RemoteSource>).unwrap();

        assert!(!manager.is_enabled());
        assert!(manager.get(&devices_key(), None, false).is_err());
        assert!(manager.status().unwrap().is_empty());
        manager.invalidate(&devices_key()).unwrap();
        assert_eq!(source.loads(), 0);
    }
}
