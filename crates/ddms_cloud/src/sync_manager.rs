//! Cloud sync coordination.
//!
//! A request ([`SyncInfo`]) becomes an executor task that checks the
//! account state, then posts one [`CloudEvent::Sync`] per selected
//! database. The manager handles those events itself: it opens and binds
//! the store, runs the sync and feeds failures to the request's
//! [`Retryer`].

use crate::config::RetryPolicy;
use crate::context::CloudContext;
use crate::event::{CloudEvent, SyncEvent};
use crate::retry::{RetryDecision, RetryScheduler, Retryer, SyncOutcome};
use crate::sync_info::{compare, generate_id, MergeKey, SyncInfo, DEFAULT_ID};
use ddms_core::metadata::{CloudInfo, SchemaMeta, StoreMetaData};
use ddms_core::store::{
    BindInfo, CloudConfig, DetailAsync, GenDetails, GeneralStore, Progress, ProgressDetail,
    StoreInfo, SyncParam,
};
use ddms_core::{
    anonymous, ConcurrentMap, EventGuard, ExecutorPool, GeneralError, StoreResult, TaskId,
    INVALID_TASK_ID,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Stage of the last sync of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// The sync is running.
    #[default]
    Running,
    /// The sync finished, see [`LastSyncInfo::code`].
    Finished,
}

/// Outcome of the last cloud sync of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastSyncInfo {
    /// Start time, epoch milliseconds.
    pub start: u64,
    /// Finish time, epoch milliseconds; 0 while running.
    pub finish: u64,
    /// Result of the finished sync.
    pub code: StoreResult<()>,
    /// Current stage.
    pub status: SyncStatus,
}

impl Default for LastSyncInfo {
    fn default() -> Self {
        Self {
            start: 0,
            finish: 0,
            code: Ok(()),
            status: SyncStatus::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct LastSyncKey {
    user: i32,
    id: String,
    bundle: String,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Coordinates cloud syncs with retry and backoff.
///
/// Construct it, then [`bind`](SyncManager::bind) an executor; requests
/// fail with [`GeneralError::NotInit`] before that.
pub struct SyncManager {
    inner: Arc<Inner>,
    _events: EventGuard<CloudEvent>,
}

struct Inner {
    context: Arc<CloudContext>,
    policy: RetryPolicy,
    executor: RwLock<Option<Arc<ExecutorPool>>>,
    actives: ConcurrentMap<u64, TaskId>,
    pending: ConcurrentMap<MergeKey, u64>,
    last_sync: ConcurrentMap<LastSyncKey, BTreeMap<String, LastSyncInfo>>,
}

impl SyncManager {
    /// Creates a manager and subscribes it to the cloud topic.
    pub fn new(context: Arc<CloudContext>, policy: RetryPolicy) -> Self {
        let inner = Arc::new(Inner {
            context,
            policy,
            executor: RwLock::new(None),
            actives: ConcurrentMap::new(),
            pending: ConcurrentMap::new(),
            last_sync: ConcurrentMap::new(),
        });
        let weak = Arc::downgrade(&inner);
        let events = inner.context.events.subscribe(move |event: &CloudEvent| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match event {
                CloudEvent::Sync(event) => inner.handle_sync(event),
                CloudEvent::LocalChange(event) => inner.handle_local_change(event),
                CloudEvent::GetSchema(_) | CloudEvent::CloudSyncFinished(_) => {}
            }
        });
        Self {
            inner,
            _events: events,
        }
    }

    /// Attaches the executor that runs sync tasks.
    pub fn bind(&self, executor: Arc<ExecutorPool>) {
        *self.inner.executor.write() = Some(executor);
    }

    /// Returns true once an executor is attached.
    pub fn is_bound(&self) -> bool {
        self.inner.executor.read().is_some()
    }

    /// Retry settings.
    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Queues a cloud sync.
    ///
    /// A request equivalent to one still waiting to start is merged into
    /// it and fails with [`GeneralError::SyncTaskMerged`].
    pub fn do_cloud_sync(&self, info: SyncInfo) -> StoreResult<()> {
        let executor = self.inner.executor().ok_or(GeneralError::NotInit)?;
        let sync_id = info.sync_id();
        if !self.inner.pending.compute_if_absent(info.merge_key(), |_| sync_id) {
            debug!(user = info.user, bundle = %info.bundle_name, "cloud sync merged");
            return Err(GeneralError::SyncTaskMerged);
        }
        info!(user = info.user, bundle = %info.bundle_name, mode = info.mode, "cloud sync requested");
        let active = generate_id(info.user);
        let task = self.inner.sync_task(0, true, Some(active), info);
        self.inner.actives.compute(active, |_, slot| {
            *slot = executor.execute(task);
            true
        });
        Ok(())
    }

    /// Cancels every queued or scheduled sync of `user`.
    ///
    /// A negative user id matches nothing.
    pub fn stop_cloud_sync(&self, user: i32) -> StoreResult<()> {
        let executor = self.inner.executor().ok_or(GeneralError::NotInit)?;
        if user < 0 {
            debug!(user, "stop cloud sync ignored");
            return Ok(());
        }
        let mut tasks = Vec::new();
        self.inner.actives.erase_if(|id, task| {
            let matched = compare(*id, user);
            if matched {
                tasks.push(*task);
            }
            matched
        });
        self.inner.pending.erase_if(|key, _| key.user() == user);
        // Removal may drop the task closure, which erases from `actives`.
        for task in &tasks {
            executor.remove(*task);
        }
        info!(user, stopped = tasks.len(), "cloud sync stopped");
        Ok(())
    }

    /// Last sync outcome of each store of `bundle`.
    ///
    /// An empty `stores` selects every store synced so far.
    pub fn query_last_sync_info(
        &self,
        user: i32,
        id: &str,
        bundle: &str,
        stores: &[String],
    ) -> BTreeMap<String, LastSyncInfo> {
        let key = LastSyncKey {
            user,
            id: id.to_string(),
            bundle: bundle.to_string(),
        };
        let all = self.inner.last_sync.get(&key).unwrap_or_default();
        if stores.is_empty() {
            return all;
        }
        all.into_iter()
            .filter(|(store, _)| stores.contains(store))
            .collect()
    }

    /// Opens the store of `meta` and binds it to its cloud database.
    ///
    /// With `must_bind`, a store whose cloud connectors are unavailable is
    /// an error; otherwise it is returned unbound.
    pub fn get_store(
        &self,
        meta: &StoreMetaData,
        user: i32,
        must_bind: bool,
    ) -> StoreResult<Arc<dyn GeneralStore>> {
        self.inner.get_store(meta, user, must_bind)
    }

    /// Number of queued or scheduled sync tasks.
    pub fn active_count(&self) -> usize {
        self.inner.actives.len()
    }

    /// Number of requests waiting to start.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if let Some(executor) = self.inner.executor() {
            let mut tasks = Vec::new();
            self.inner.actives.erase_if(|_, task| {
                tasks.push(*task);
                true
            });
            for task in tasks {
                executor.remove(task);
            }
        }
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("bound", &self.is_bound())
            .field("actives", &self.active_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Removes an active task entry once its closure is gone.
struct ActiveRef {
    inner: Weak<Inner>,
    id: u64,
}

impl Drop for ActiveRef {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.actives.erase(&self.id);
        }
    }
}

struct WeakScheduler(Weak<Inner>);

impl RetryScheduler for WeakScheduler {
    fn reschedule(&self, attempt: u32, delay: Duration, info: SyncInfo) -> Option<TaskId> {
        let inner = self.0.upgrade()?;
        let executor = inner.executor()?;
        let active = generate_id(info.user);
        let task = inner.sync_task(attempt, true, Some(active), info);
        let mut scheduled = INVALID_TASK_ID;
        inner.actives.compute(active, |_, slot| {
            *slot = executor.schedule(delay, task);
            scheduled = *slot;
            true
        });
        Some(scheduled)
    }
}

impl Inner {
    fn executor(&self) -> Option<Arc<ExecutorPool>> {
        self.executor.read().clone()
    }

    fn sync_task(
        self: &Arc<Self>,
        attempts_made: u32,
        auto_retry: bool,
        active: Option<u64>,
        info: SyncInfo,
    ) -> impl FnOnce() + Send + 'static {
        let attempt = attempts_made + 1;
        let weak = Arc::downgrade(self);
        let active = active.map(|id| ActiveRef {
            inner: Arc::downgrade(self),
            id,
        });
        move || {
            let _active = active;
            if let Some(inner) = weak.upgrade() {
                inner.run_sync(attempt, auto_retry, info);
            }
        }
    }

    fn run_sync(self: &Arc<Self>, attempt: u32, auto_retry: bool, info: SyncInfo) {
        let sync_id = info.sync_id();
        self.pending
            .compute_if_present(&info.merge_key(), |_, pending| *pending != sync_id);

        let meta = &self.context.meta;
        let Some(cloud) = meta.load_meta::<CloudInfo>(&CloudInfo::new(info.user).key(), true) else {
            error!(user = info.user, "no cloud info");
            info.set_error(GeneralError::NotInit);
            return;
        };
        let id_mismatch = info.id != DEFAULT_ID && cloud.id != info.id;
        let bundle_off = !info.bundle_name.is_empty() && !cloud.is_on(&info.bundle_name);
        if !cloud.enable_cloud || id_mismatch || bundle_off {
            debug!(
                user = info.user,
                bundle = %info.bundle_name,
                enabled = cloud.enable_cloud,
                id_mismatch,
                "cloud sync not opened"
            );
            info.set_error(GeneralError::Unopened);
            return;
        }
        if !self.context.registry.is_network_available() {
            info.set_error(GeneralError::NetworkError);
            return;
        }

        let scheduler = Arc::new(WeakScheduler(Arc::downgrade(self)));
        let retryer = Arc::new(Retryer::new(
            attempt,
            self.policy.clone(),
            info.clone(),
            scheduler,
        ));
        let schemas = meta
            .load_meta_list::<SchemaMeta>(&cloud.schema_prefix(&info.bundle_name), true)
            .unwrap_or_default();
        if schemas.is_empty() {
            info!(user = info.user, bundle = %info.bundle_name, attempt, "cloud schema missing");
            self.context.events.post(&CloudEvent::GetSchema(StoreInfo {
                user: info.user,
                bundle_name: info.bundle_name.clone(),
                ..StoreInfo::default()
            }));
            retryer.report(SyncOutcome::Retryable(GeneralError::RetryTimeout));
            return;
        }

        let mut posted = 0usize;
        for schema in &schemas {
            if !cloud.is_on(&schema.bundle_name) {
                continue;
            }
            let instance_id = cloud
                .apps
                .get(&schema.bundle_name)
                .map_or(0, |app| app.instance_id);
            for database in &schema.databases {
                if !info.selects(&database.name) {
                    continue;
                }
                let Some(query) = info.generate_query(database) else {
                    continue;
                };
                let store = StoreInfo {
                    bundle_name: schema.bundle_name.clone(),
                    store_name: database.name.clone(),
                    instance_id,
                    user: cloud.user,
                    ..StoreInfo::default()
                };
                let mut event = SyncEvent::new(store, info.mode)
                    .with_query(query)
                    .with_wait(info.wait)
                    .with_auto_retry(auto_retry);
                event.on_detail = info.on_detail.clone();
                event.account = cloud.id.clone();
                event.retryer = auto_retry.then(|| Arc::clone(&retryer));
                self.context.events.post(&CloudEvent::Sync(event));
                posted += 1;
            }
        }
        debug!(user = info.user, bundle = %info.bundle_name, attempt, posted, "cloud sync dispatched");
    }

    fn handle_local_change(self: &Arc<Self>, event: &SyncEvent) {
        let store = &event.store;
        let mut info = SyncInfo::new(store.user)
            .with_bundle(store.bundle_name.clone())
            .with_store(store.store_name.clone(), Vec::new())
            .with_mode(event.mode)
            .with_wait(event.wait)
            .with_query(event.query.clone());
        info.on_detail = event.on_detail.clone();
        let attempts_made = if event.auto_retry {
            self.policy.client_start_attempt()
        } else {
            self.policy.max_times
        };
        let task = self.sync_task(attempts_made, event.auto_retry, None, info);
        task();
    }

    fn handle_sync(self: &Arc<Self>, event: &SyncEvent) {
        let store = &event.store;
        let local = self.context.registry.get_local_device().uuid;
        let mut lookup = StoreMetaData::new(
            local,
            store.user.to_string(),
            store.bundle_name.clone(),
            store.store_name.clone(),
        );
        lookup.instance_id = store.instance_id;
        let Some(meta) = self.context.meta.load_meta::<StoreMetaData>(&lookup.key(), false) else {
            error!(
                bundle = %store.bundle_name,
                store = %lookup.store_alias(),
                "no store meta"
            );
            self.finish_early(event, GeneralError::MetaMissing);
            return;
        };
        let general = match self.get_store(&meta, store.user, true) {
            Ok(general) => general,
            Err(err) => {
                error!(store = %meta.store_alias(), error = %err, "store unavailable for cloud sync");
                self.finish_early(event, err);
                return;
            }
        };

        let key = LastSyncKey {
            user: store.user,
            id: event.account.clone(),
            bundle: store.bundle_name.clone(),
        };
        self.record_start(&key, &store.store_name);
        let param = SyncParam::new(event.mode)
            .with_user(store.user)
            .with_wait(event.wait)
            .with_trace_id(event.trace_id.clone());
        debug!(
            user = store.user,
            bundle = %store.bundle_name,
            store = %meta.store_alias(),
            priority = event.is_priority(),
            "cloud sync start"
        );
        let callback = self.completion(event, key.clone());
        if let Err(err) = general.sync(&[DEFAULT_ID.to_string()], &event.query, Some(callback), &param) {
            self.record_finish(&key, &store.store_name, Err(err));
            self.finish_early(event, err);
        }
    }

    /// Reports a sync that failed before the engine took it.
    fn finish_early(&self, event: &SyncEvent, err: GeneralError) {
        if let Some(retryer) = event.retryer.as_ref().filter(|_| event.auto_retry) {
            retryer.report(SyncOutcome::from(Err(err)));
            return;
        }
        if let Some(callback) = &event.on_detail {
            let mut details = GenDetails::new();
            details.insert(DEFAULT_ID.to_string(), ProgressDetail::finished(Err(err)));
            callback(&details);
        }
    }

    fn completion(self: &Arc<Self>, event: &SyncEvent, key: LastSyncKey) -> DetailAsync {
        let weak = Arc::downgrade(self);
        let retryer = event.retryer.clone().filter(|_| event.auto_retry);
        let on_detail = event.on_detail.clone();
        let store = event.store.clone();
        Arc::new(move |details: &GenDetails| {
            let Some(detail) = details.values().next() else {
                warn!(store = %anonymous::change(&store.store_name), "sync reported no details");
                return;
            };
            if detail.progress != Progress::Finished {
                if let Some(callback) = &on_detail {
                    callback(details);
                }
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.record_finish(&key, &store.store_name, detail.code);
                if detail.data_change {
                    inner
                        .context
                        .events
                        .post(&CloudEvent::CloudSyncFinished(store.clone()));
                }
            }
            let forward = match &retryer {
                Some(retryer) => retryer.report(SyncOutcome::from(detail.code)) == RetryDecision::Done,
                None => true,
            };
            if forward {
                if let Some(callback) = &on_detail {
                    callback(details);
                }
            }
        })
    }

    fn record_start(&self, key: &LastSyncKey, store: &str) {
        self.last_sync.compute(key.clone(), |_, stores| {
            stores.insert(
                store.to_string(),
                LastSyncInfo {
                    start: now_ms(),
                    ..LastSyncInfo::default()
                },
            );
            true
        });
    }

    fn record_finish(&self, key: &LastSyncKey, store: &str, code: StoreResult<()>) {
        self.last_sync.compute(key.clone(), |_, stores| {
            let entry = stores.entry(store.to_string()).or_default();
            entry.finish = now_ms();
            entry.code = code;
            entry.status = SyncStatus::Finished;
            true
        });
    }

    fn get_store(
        &self,
        meta: &StoreMetaData,
        user: i32,
        must_bind: bool,
    ) -> StoreResult<Arc<dyn GeneralStore>> {
        let Some(server) = self.context.server.as_ref() else {
            debug!("cloud sync not supported without a server");
            return Err(GeneralError::NotSupport);
        };
        let store = self.context.cache.get_store(meta, &[])?;
        if store.is_bound() {
            return Ok(store);
        }

        let cloud = self
            .context
            .meta
            .load_meta::<CloudInfo>(&CloudInfo::new(user).key(), true)
            .unwrap_or_else(|| CloudInfo::new(user));
        let schema_key = cloud.schema_key(&meta.bundle_name, meta.instance_id);
        let Some(schema) = self.context.meta.load_meta::<SchemaMeta>(&schema_key, true) else {
            error!(bundle = %meta.bundle_name, store = %meta.store_alias(), "no cloud schema");
            return Err(GeneralError::MetaMissing);
        };
        let database = schema.get_database(&meta.store_id).cloned().unwrap_or_default();
        let db = server.connect_cloud_db(meta.token_id, &database);
        let loader = server.connect_asset_loader(meta.token_id, &database);
        if must_bind && (db.is_none() || loader.is_none()) {
            error!(
                token = meta.token_id,
                database = %anonymous::change(&database.name),
                "no cloud db"
            );
            return Err(GeneralError::Error);
        }
        if db.is_some() || loader.is_some() {
            let config = CloudConfig::default().with_limits(cloud.max_number, cloud.max_size);
            let mut bind_infos = BTreeMap::new();
            bind_infos.insert(user, BindInfo { db, loader });
            if let Err(err) = store.bind(&database, bind_infos, &config) {
                warn!(store = %meta.store_alias(), error = %err, "cloud bind failed");
                if must_bind {
                    return Err(err);
                }
            }
        }
        Ok(store)
    }
}
