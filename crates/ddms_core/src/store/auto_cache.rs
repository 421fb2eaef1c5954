//! Cache of open stores keyed by (token id, store id).

use super::general_store::GeneralStore;
use super::watcher::{Origin, Watcher};
use crate::concurrent_map::ConcurrentMap;
use crate::error::{GeneralError, StoreResult};
use crate::executor::{ExecutorPool, TaskId, INVALID_TASK_ID};
use crate::metadata::{StoreKind, StoreMetaData};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Opens a store for a descriptor.
pub type Creator = Arc<dyn Fn(&StoreMetaData) -> StoreResult<Arc<dyn GeneralStore>> + Send + Sync>;

/// Cache eviction settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Stores unused for longer are closed by the collector.
    pub idle_timeout: Duration,
    /// Period of the collector once bound to an executor.
    pub gc_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            gc_interval: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the collector period.
    #[must_use]
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }
}

struct CachedStore {
    store: Arc<dyn GeneralStore>,
    last_access: Instant,
}

type TokenStores = BTreeMap<String, CachedStore>;

/// Amortizes store opening across callers.
///
/// At most one live instance exists per (token id, store id). The cache
/// holds the initial reference of each store and releases it on eviction.
pub struct AutoCache {
    config: CacheConfig,
    creators: RwLock<HashMap<StoreKind, Creator>>,
    stores: ConcurrentMap<u32, TokenStores>,
    gc_task: Mutex<TaskId>,
}

impl AutoCache {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            creators: RwLock::new(HashMap::new()),
            stores: ConcurrentMap::new(),
            gc_task: Mutex::new(INVALID_TASK_ID),
        }
    }

    /// Registers the factory for an engine family.
    pub fn register_creator(&self, kind: StoreKind, creator: Creator) {
        self.creators.write().insert(kind, creator);
    }

    /// Returns the cached store for `meta`, opening it if needed.
    ///
    /// A newly opened store gets every watcher in `watchers`.
    pub fn get_store(
        &self,
        meta: &StoreMetaData,
        watchers: &[Arc<dyn Watcher>],
    ) -> StoreResult<Arc<dyn GeneralStore>> {
        let creator = self
            .creators
            .read()
            .get(&meta.store_kind())
            .cloned()
            .ok_or(GeneralError::NotSupport)?;
        let mut result = Err(GeneralError::Error);
        self.stores.compute(meta.token_id, |_, stores| {
            if let Some(cached) = stores.get_mut(&meta.store_id) {
                cached.last_access = Instant::now();
                result = Ok(Arc::clone(&cached.store));
                return true;
            }
            match creator(meta) {
                Ok(store) => {
                    for watcher in watchers {
                        if let Err(err) = store.watch(Origin::All, Arc::clone(watcher)) {
                            warn!(store = %meta.store_alias(), error = %err, "failed to attach watcher");
                        }
                    }
                    debug!(store = %meta.store_alias(), token = meta.token_id, "opened store");
                    stores.insert(
                        meta.store_id.clone(),
                        CachedStore {
                            store: Arc::clone(&store),
                            last_access: Instant::now(),
                        },
                    );
                    result = Ok(store);
                }
                Err(err) => {
                    warn!(store = %meta.store_alias(), error = %err, "failed to open store");
                    result = Err(err);
                }
            }
            !stores.is_empty()
        });
        result
    }

    /// Closes and evicts one store.
    ///
    /// A busy store stays cached and the error is returned.
    pub fn close_store(&self, token_id: u32, store_id: &str) -> StoreResult<()> {
        let mut result = Ok(());
        self.stores.compute_if_present(&token_id, |_, stores| {
            if let Some(cached) = stores.get(store_id) {
                match evict(store_id, cached) {
                    Ok(()) => {
                        stores.remove(store_id);
                    }
                    Err(err) => result = Err(err),
                }
            }
            !stores.is_empty()
        });
        result
    }

    /// Closes every store of `token_id` except those in `keep`.
    pub fn close_excluded(&self, token_id: u32, keep: &BTreeSet<String>) {
        self.stores.compute_if_present(&token_id, |_, stores| {
            stores.retain(|store_id, cached| keep.contains(store_id) || evict(store_id, cached).is_err());
            !stores.is_empty()
        });
    }

    /// Closes every cached store; busy stores stay.
    pub fn close_all(&self) -> usize {
        self.sweep(|_| true)
    }

    /// Closes stores idle longer than the configured timeout.
    ///
    /// Stores someone still holds a reference to through `add_ref` stay.
    /// Returns the number of stores evicted.
    pub fn garbage_collect(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.idle_timeout;
        let evicted = self.sweep(|cached| {
            now.saturating_duration_since(cached.last_access) >= idle && cached.store.ref_count() <= 1
        });
        if evicted > 0 {
            info!(evicted, "closed idle stores");
        }
        evicted
    }

    /// Number of cached stores.
    pub fn store_count(&self) -> usize {
        let mut count = 0;
        for token in self.stores.keys() {
            self.stores.compute_if_present(&token, |_, stores| {
                count += stores.len();
                true
            });
        }
        count
    }

    /// Schedules the idle collector on `executor`.
    pub fn bind(self: &Arc<Self>, executor: &ExecutorPool) {
        let mut task = self.gc_task.lock();
        if *task != INVALID_TASK_ID {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *task = executor.schedule_repeating(self.config.gc_interval, move || {
            if let Some(cache) = weak.upgrade() {
                cache.garbage_collect();
            }
        });
    }

    /// Stops the idle collector.
    pub fn unbind(&self, executor: &ExecutorPool) {
        let mut task = self.gc_task.lock();
        if *task != INVALID_TASK_ID {
            executor.remove(*task);
            *task = INVALID_TASK_ID;
        }
    }

    fn sweep<F>(&self, mut should_evict: F) -> usize
    where
        F: FnMut(&CachedStore) -> bool,
    {
        let mut evicted = 0;
        for token in self.stores.keys() {
            self.stores.compute_if_present(&token, |_, stores| {
                stores.retain(|store_id, cached| {
                    if should_evict(cached) && evict(store_id, cached).is_ok() {
                        evicted += 1;
                        return false;
                    }
                    true
                });
                !stores.is_empty()
            });
        }
        evicted
    }
}

impl std::fmt::Debug for AutoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoCache")
            .field("config", &self.config)
            .field("stores", &self.store_count())
            .finish()
    }
}

fn evict(store_id: &str, cached: &CachedStore) -> StoreResult<()> {
    if let Err(err) = cached.store.close() {
        debug!(store = %crate::anonymous::change(store_id), error = %err, "store refused to close");
        return Err(err);
    }
    cached.store.release();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{store_type, Database};
    use crate::ref_count::RefCounter;
    use crate::store::{BindInfo, CleanMode, CloudConfig, DetailAsync, GenQuery, SyncParam, TableKind};
    use crate::value::{VBuckets, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeStore {
        busy: AtomicBool,
        closed: AtomicBool,
        watchers: AtomicUsize,
        refs: RefCounter,
    }

    impl GeneralStore for FakeStore {
        fn bind(&self, _: &Database, _: BTreeMap<i32, BindInfo>, _: &CloudConfig) -> StoreResult<()> {
            Ok(())
        }
        fn is_bound(&self) -> bool {
            false
        }
        fn sync(&self, _: &[String], _: &GenQuery, _: Option<DetailAsync>, _: &SyncParam) -> StoreResult<()> {
            Ok(())
        }
        fn clean(&self, _: &[String], _: CleanMode, _: &str) -> StoreResult<()> {
            Ok(())
        }
        fn watch(&self, _: Origin, _: Arc<dyn Watcher>) -> StoreResult<()> {
            self.watchers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn unwatch(&self, _: Origin, _: &Arc<dyn Watcher>) -> StoreResult<()> {
            Ok(())
        }
        fn query(&self, _: &str, _: &str, _: &[Value]) -> StoreResult<VBuckets> {
            Ok(Vec::new())
        }
        fn set_distributed_tables(&self, _: &[String], _: TableKind) -> StoreResult<()> {
            Ok(())
        }
        fn set_equal_identifier(&self, _: &str, _: &str) -> StoreResult<()> {
            Ok(())
        }
        fn get_water_version(&self, _: &str) -> Vec<String> {
            Vec::new()
        }
        fn close(&self) -> StoreResult<()> {
            if self.busy.load(Ordering::SeqCst) {
                return Err(GeneralError::Busy);
            }
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn add_ref(&self) -> i32 {
            self.refs.add_ref()
        }
        fn release(&self) -> i32 {
            self.refs.release()
        }
        fn ref_count(&self) -> i32 {
            self.refs.count()
        }
    }

    struct NoopWatcher;

    impl Watcher for NoopWatcher {
        fn on_change(&self, _: &crate::store::ChangeInfo) -> StoreResult<()> {
            Ok(())
        }
    }

    fn cache_with(config: CacheConfig) -> (AutoCache, Arc<Mutex<Vec<Arc<FakeStore>>>>) {
        let cache = AutoCache::new(config);
        let created = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&created);
        cache.register_creator(
            StoreKind::Kv,
            Arc::new(move |_: &StoreMetaData| -> StoreResult<Arc<dyn GeneralStore>> {
                let store = Arc::new(FakeStore::default());
                sink.lock().push(Arc::clone(&store));
                Ok(store as Arc<dyn GeneralStore>)
            }),
        );
        (cache, created)
    }

    fn meta(token: u32, store: &str) -> StoreMetaData {
        let mut meta = StoreMetaData::new("dev", "100", "com.example", store);
        meta.token_id = token;
        meta.store_type = store_type::SINGLE_VERSION;
        meta
    }

    #[test]
    fn one_instance_per_key() {
        let (cache, created) = cache_with(CacheConfig::default());
        let watchers: Vec<Arc<dyn Watcher>> = vec![Arc::new(NoopWatcher)];
        let a = cache.get_store(&meta(1, "s"), &watchers).unwrap();
        let b = cache.get_store(&meta(1, "s"), &watchers).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        cache.get_store(&meta(2, "s"), &[]).unwrap();
        assert_eq!(created.lock().len(), 2);
        assert_eq!(created.lock()[0].watchers.load(Ordering::SeqCst), 1);
        assert_eq!(cache.store_count(), 2);
    }

    #[test]
    fn unknown_kind_is_not_supported() {
        let (cache, _) = cache_with(CacheConfig::default());
        let mut meta = meta(1, "s");
        meta.store_type = store_type::RELATIONAL;
        assert_eq!(cache.get_store(&meta, &[]).err(), Some(GeneralError::NotSupport));
    }

    #[test]
    fn busy_store_survives_close() {
        let (cache, created) = cache_with(CacheConfig::default());
        cache.get_store(&meta(1, "s"), &[]).unwrap();
        created.lock()[0].busy.store(true, Ordering::SeqCst);
        assert_eq!(cache.close_store(1, "s"), Err(GeneralError::Busy));
        assert_eq!(cache.store_count(), 1);

        created.lock()[0].busy.store(false, Ordering::SeqCst);
        cache.close_store(1, "s").unwrap();
        assert_eq!(cache.store_count(), 0);
        let created = created.lock();
        let store = &created[0];
        assert!(store.closed.load(Ordering::SeqCst));
        assert_eq!(store.add_ref(), 0);
    }

    #[test]
    fn close_excluded_keeps_listed() {
        let (cache, _) = cache_with(CacheConfig::default());
        for name in ["a", "b", "c"] {
            cache.get_store(&meta(1, name), &[]).unwrap();
        }
        let keep: BTreeSet<String> = ["b".to_string()].into_iter().collect();
        cache.close_excluded(1, &keep);
        assert_eq!(cache.store_count(), 1);
    }

    #[test]
    fn gc_evicts_idle_stores() {
        let (cache, _) = cache_with(CacheConfig::default().with_idle_timeout(Duration::ZERO));
        cache.get_store(&meta(1, "a"), &[]).unwrap();
        cache.get_store(&meta(1, "b"), &[]).unwrap();
        assert_eq!(cache.garbage_collect(), 2);
        assert_eq!(cache.store_count(), 0);

        let (cache, _) = cache_with(CacheConfig::default());
        cache.get_store(&meta(1, "a"), &[]).unwrap();
        assert_eq!(cache.garbage_collect(), 0);
    }

    #[test]
    fn gc_keeps_referenced_stores() {
        let (cache, created) = cache_with(CacheConfig::default().with_idle_timeout(Duration::ZERO));
        let held = cache.get_store(&meta(1, "held"), &[]).unwrap();
        cache.get_store(&meta(1, "idle"), &[]).unwrap();
        assert_eq!(held.add_ref(), 2);

        assert_eq!(cache.garbage_collect(), 1);
        assert_eq!(cache.store_count(), 1);
        assert!(!created.lock()[0].closed.load(Ordering::SeqCst));

        held.release();
        assert_eq!(cache.garbage_collect(), 1);
        assert_eq!(cache.store_count(), 0);
        assert!(created.lock()[0].closed.load(Ordering::SeqCst));
    }
}
