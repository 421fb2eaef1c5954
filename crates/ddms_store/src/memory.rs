//! In-memory sync engines for tests and for running without a platform.
//!
//! Both engines record every call they receive and let a test script the
//! outcome of syncs, cleans and cloud progress. Nearby traffic is modelled
//! with an outbox of pushed entries and a [`MemoryKvSyncDelegate::receive`]
//! entry point so interceptors run exactly as they would on the wire.

use crate::engine::{
    BriefCallback, ClearMode, CloudSyncConfig, CloudSyncOption, DeviceStatuses, EngineChange,
    EngineObserver, EngineOrigin, EngineStoreId, InterceptedData, Interceptor, KvEngine,
    KvOpenOptions, KvSyncDelegate, ProcessCallback, RdbOpenOptions, RelationalDelegate,
    RelationalEngine, SyncProcess, TableBriefCallback, TableStatus, TableStatuses,
};
use crate::error::{EngineError, EngineResult};
use ddms_core::metadata::Database;
use ddms_core::store::{sync_mode, AssetLoader, CloudDb, GenQuery, TableKind};
use ddms_core::{VBucket, VBuckets, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A call received by an in-memory engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    /// Nearby sync.
    Sync {
        /// Target devices.
        devices: Vec<String>,
        /// Engine mode.
        mode: i32,
        /// A query or table list narrowed the sync.
        narrowed: bool,
    },
    /// Remote query subscription.
    SubscribeRemote(Vec<String>),
    /// Remote query unsubscription.
    UnsubscribeRemote(Vec<String>),
    /// Cloud sync.
    CloudSync {
        /// Cloud users.
        users: Vec<String>,
        /// Engine mode.
        mode: i32,
        /// Run ahead of automatic tasks.
        priority: bool,
    },
    /// Data removal.
    RemoveDeviceData {
        /// Device; empty for all.
        device: String,
        /// Table; empty for all.
        table: String,
        /// What was cleared.
        mode: ClearMode,
    },
    /// Identifier equivalence.
    SetEqualIdentifier {
        /// The identifier.
        identifier: String,
        /// Devices allowed to use it.
        devices: Vec<String>,
    },
    /// Cloud connectors installed for these users.
    SetCloudDb(Vec<String>),
    /// Cloud schema installed.
    SetCloudDbSchema,
    /// Cloud limits installed.
    SetCloudSyncConfig(CloudSyncConfig),
    /// Asset loader installed.
    SetAssetLoader,
    /// Table made distributed.
    CreateDistributedTable(String, TableKind),
    /// Database closed.
    Close,
}

#[derive(Default)]
struct CloudScript {
    status: Mutex<Option<EngineError>>,
    reports: Mutex<Vec<SyncProcess>>,
    tasks: AtomicUsize,
}

impl CloudScript {
    fn run(&self, option: &CloudSyncOption, on_process: &ProcessCallback) -> EngineResult<()> {
        if let Some(err) = self.status.lock().clone() {
            return Err(err);
        }
        let mut reports = self.reports.lock().clone();
        if reports.is_empty() {
            reports.push(SyncProcess::finished(Ok(())));
        }
        let target = option.users.first().cloned().unwrap_or_default();
        for report in reports {
            let mut processes = BTreeMap::new();
            processes.insert(target.clone(), report);
            on_process(&processes);
        }
        Ok(())
    }
}

/// In-memory KV sync engine database.
pub struct MemoryKvSyncDelegate {
    local_id: String,
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    received: Mutex<BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
    outbox: Mutex<Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)>>,
    calls: Mutex<Vec<EngineCall>>,
    device_status: Mutex<BTreeMap<String, EngineError>>,
    failing_removals: Mutex<BTreeSet<String>>,
    cloud_versions: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    cloud: CloudScript,
    push: RwLock<Option<Interceptor>>,
    receive: RwLock<Option<Interceptor>>,
    observer: RwLock<Option<Arc<dyn EngineObserver>>>,
    closed: AtomicBool,
}

impl MemoryKvSyncDelegate {
    /// Creates an empty database on the device `local_id`.
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            entries: Mutex::new(BTreeMap::new()),
            received: Mutex::new(BTreeMap::new()),
            outbox: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            device_status: Mutex::new(BTreeMap::new()),
            failing_removals: Mutex::new(BTreeSet::new()),
            cloud_versions: Mutex::new(BTreeMap::new()),
            cloud: CloudScript::default(),
            push: RwLock::new(None),
            receive: RwLock::new(None),
            observer: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Writes a local entry.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        self.entries.lock().insert(key.to_vec(), value.to_vec());
    }

    /// Makes nearby syncs with `device` report `err`.
    pub fn set_device_status(&self, device: &str, err: EngineError) {
        self.device_status.lock().insert(device.to_string(), err);
    }

    /// Makes data removal for `device` fail.
    pub fn fail_removal(&self, device: &str) {
        self.failing_removals.lock().insert(device.to_string());
    }

    /// Makes every cloud sync fail to start with `err`, or succeed on `None`.
    pub fn set_cloud_status(&self, err: Option<EngineError>) {
        *self.cloud.status.lock() = err;
    }

    /// Progress reports delivered by each cloud sync, in order.
    pub fn set_cloud_reports(&self, reports: Vec<SyncProcess>) {
        *self.cloud.reports.lock() = reports;
    }

    /// Sets the number of running sync tasks.
    pub fn set_task_count(&self, count: usize) {
        self.cloud.tasks.store(count, Ordering::SeqCst);
    }

    /// Records cloud water versions for `device`.
    pub fn set_cloud_version(&self, device: &str, versions: BTreeMap<String, String>) {
        self.cloud_versions.lock().insert(device.to_string(), versions);
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    /// Entries pushed to each device, in push order.
    pub fn outbox(&self) -> Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)> {
        self.outbox.lock().clone()
    }

    /// Entries received from `device`.
    pub fn received(&self, device: &str) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.received.lock().get(device).cloned().unwrap_or_default()
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns true while an observer is registered.
    pub fn has_observer(&self) -> bool {
        self.observer.read().is_some()
    }

    /// Accepts entries pushed by `source`, running the receive interceptor.
    pub fn receive(&self, source: &str, entries: Vec<(Vec<u8>, Vec<u8>)>) -> EngineResult<()> {
        self.ensure_open()?;
        let mut data = InterceptedData::new(entries);
        if let Some(interceptor) = self.receive.read().clone() {
            interceptor(&mut data, source, &self.local_id)?;
        }
        let entries = data.into_entries();
        let inserted = entries
            .iter()
            .map(|(key, _)| Value::Bytes(key.clone()))
            .collect();
        self.received
            .lock()
            .entry(source.to_string())
            .or_default()
            .extend(entries);
        self.notify(
            EngineOrigin::Remote,
            source,
            EngineChange {
                inserted,
                ..EngineChange::default()
            },
        );
        Ok(())
    }

    /// Simulates changes downloaded from the cloud.
    pub fn cloud_change(&self, change: EngineChange) {
        self.notify(EngineOrigin::Cloud, "", change);
    }

    fn notify(&self, origin: EngineOrigin, source: &str, change: EngineChange) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_change(origin, source, &change);
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }

    fn statuses(&self, devices: &[String]) -> DeviceStatuses {
        let failing = self.device_status.lock();
        devices
            .iter()
            .map(|device| {
                let status = failing.get(device).cloned().map_or(Ok(()), Err);
                (device.clone(), status)
            })
            .collect()
    }

    fn push_to(&self, device: &str, query: Option<&GenQuery>) -> EngineResult<()> {
        let entries: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, _)| query.map_or(true, |q| key.starts_with(&q.key_prefix)))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let mut data = InterceptedData::new(entries);
        if let Some(interceptor) = self.push.read().clone() {
            interceptor(&mut data, &self.local_id, device)?;
        }
        self.outbox
            .lock()
            .push((device.to_string(), data.into_entries()));
        Ok(())
    }
}

impl KvSyncDelegate for MemoryKvSyncDelegate {
    fn sync(
        &self,
        devices: &[String],
        mode: i32,
        query: Option<&GenQuery>,
        on_complete: BriefCallback,
        _wait: bool,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::Sync {
            devices: devices.to_vec(),
            mode,
            narrowed: query.is_some(),
        });
        let mut statuses = self.statuses(devices);
        if mode == sync_mode::NEARBY_PUSH || mode == sync_mode::NEARBY_PULL_PUSH {
            for device in devices {
                if let Err(err) = self.push_to(device, query) {
                    statuses.insert(device.clone(), Err(err));
                }
            }
        }
        on_complete(&statuses);
        Ok(())
    }

    fn subscribe_remote_query(
        &self,
        devices: &[String],
        _query: &GenQuery,
        on_complete: BriefCallback,
        _wait: bool,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::SubscribeRemote(devices.to_vec()));
        on_complete(&self.statuses(devices));
        Ok(())
    }

    fn unsubscribe_remote_query(
        &self,
        devices: &[String],
        _query: &GenQuery,
        on_complete: BriefCallback,
        _wait: bool,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::UnsubscribeRemote(devices.to_vec()));
        on_complete(&self.statuses(devices));
        Ok(())
    }

    fn cloud_sync(&self, option: &CloudSyncOption, on_process: ProcessCallback) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::CloudSync {
            users: option.users.clone(),
            mode: option.mode,
            priority: option.priority_task,
        });
        self.cloud.run(option, &on_process)
    }

    fn remove_device_data(&self, device: &str, mode: ClearMode) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::RemoveDeviceData {
            device: device.to_string(),
            table: String::new(),
            mode,
        });
        if self.failing_removals.lock().contains(device) {
            return Err(EngineError::db(format!("cannot clean {device}")));
        }
        if mode == ClearMode::Device {
            let mut received = self.received.lock();
            if device.is_empty() {
                received.clear();
            } else {
                received.remove(device);
            }
        }
        Ok(())
    }

    fn set_equal_identifier(&self, identifier: &str, devices: &[String]) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::SetEqualIdentifier {
            identifier: identifier.to_string(),
            devices: devices.to_vec(),
        });
        Ok(())
    }

    fn set_cloud_db(&self, dbs: BTreeMap<String, Arc<dyn CloudDb>>) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::SetCloudDb(dbs.into_keys().collect()));
        Ok(())
    }

    fn set_cloud_db_schema(&self, _schemas: BTreeMap<String, Database>) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::SetCloudDbSchema);
        Ok(())
    }

    fn set_cloud_sync_config(&self, config: &CloudSyncConfig) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::SetCloudSyncConfig(*config));
        Ok(())
    }

    fn set_push_interceptor(&self, interceptor: Interceptor) {
        *self.push.write() = Some(interceptor);
    }

    fn set_receive_interceptor(&self, interceptor: Interceptor) {
        *self.receive.write() = Some(interceptor);
    }

    fn register_observer(&self, observer: Arc<dyn EngineObserver>) -> EngineResult<()> {
        self.ensure_open()?;
        *self.observer.write() = Some(observer);
        Ok(())
    }

    fn unregister_observer(&self) -> EngineResult<()> {
        self.observer
            .write()
            .take()
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound("observer".into()))
    }

    fn task_count(&self) -> usize {
        self.cloud.tasks.load(Ordering::SeqCst)
    }

    fn get_cloud_version(&self, device: &str) -> EngineResult<BTreeMap<String, String>> {
        self.ensure_open()?;
        self.cloud_versions
            .lock()
            .get(device)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(device.to_string()))
    }

    fn close(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens [`MemoryKvSyncDelegate`]s, one per store id.
pub struct MemoryKvEngine {
    local_id: String,
    stores: Mutex<BTreeMap<String, Arc<MemoryKvSyncDelegate>>>,
    opened: Mutex<Vec<(EngineStoreId, KvOpenOptions)>>,
    fail_open: AtomicBool,
}

impl MemoryKvEngine {
    /// Creates an engine for the device `local_id`.
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            stores: Mutex::new(BTreeMap::new()),
            opened: Mutex::new(Vec::new()),
            fail_open: AtomicBool::new(false),
        }
    }

    /// Makes every open fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// The database opened for `store_id`.
    pub fn delegate(&self, store_id: &str) -> Option<Arc<MemoryKvSyncDelegate>> {
        self.stores.lock().get(store_id).cloned()
    }

    /// Every open request with its options.
    pub fn opened(&self) -> Vec<(EngineStoreId, KvOpenOptions)> {
        self.opened.lock().clone()
    }
}

impl KvEngine for MemoryKvEngine {
    fn open(&self, id: &EngineStoreId, options: &KvOpenOptions) -> EngineResult<Arc<dyn KvSyncDelegate>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(EngineError::NotFound(id.store_id.clone()));
        }
        self.opened.lock().push((id.clone(), options.clone()));
        let mut stores = self.stores.lock();
        let delegate = stores
            .entry(id.store_id.clone())
            .and_modify(|existing| {
                if existing.is_closed() {
                    *existing = Arc::new(MemoryKvSyncDelegate::new(self.local_id.clone()));
                }
            })
            .or_insert_with(|| Arc::new(MemoryKvSyncDelegate::new(self.local_id.clone())));
        Ok(Arc::clone(delegate) as Arc<dyn KvSyncDelegate>)
    }
}

/// In-memory relational engine database.
///
/// Queries ignore the SQL text and return every row of the table.
pub struct MemoryRelationalDelegate {
    rows: Mutex<BTreeMap<String, VBuckets>>,
    remote_rows: Mutex<BTreeMap<String, VBuckets>>,
    distributed: Mutex<BTreeMap<String, TableKind>>,
    failing_tables: Mutex<BTreeSet<String>>,
    failing_removals: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<EngineCall>>,
    cloud: CloudScript,
    cloud_db: Mutex<Option<Arc<dyn CloudDb>>>,
    loader: Mutex<Option<Arc<dyn AssetLoader>>>,
    schema: Mutex<Option<Database>>,
    observer: RwLock<Option<Arc<dyn EngineObserver>>>,
    closed: AtomicBool,
}

impl Default for MemoryRelationalDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelationalDelegate {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            remote_rows: Mutex::new(BTreeMap::new()),
            distributed: Mutex::new(BTreeMap::new()),
            failing_tables: Mutex::new(BTreeSet::new()),
            failing_removals: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
            cloud: CloudScript::default(),
            cloud_db: Mutex::new(None),
            loader: Mutex::new(None),
            schema: Mutex::new(None),
            observer: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Inserts a local row and reports it as a local change keyed by
    /// the row's `id` column.
    pub fn insert(&self, table: &str, row: VBucket) {
        let key = row.get("id").cloned().unwrap_or(Value::Null);
        self.rows.lock().entry(table.to_string()).or_default().push(row);
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_change(
                EngineOrigin::Local,
                "",
                &EngineChange {
                    table: table.to_string(),
                    inserted: vec![key],
                    ..EngineChange::default()
                },
            );
        }
    }

    /// Rows a nearby device answers remote queries with.
    pub fn set_remote_rows(&self, device: &str, rows: VBuckets) {
        self.remote_rows.lock().insert(device.to_string(), rows);
    }

    /// Makes syncs and distribution of `table` fail.
    pub fn fail_table(&self, table: &str) {
        self.failing_tables.lock().insert(table.to_string());
    }

    /// Makes data removal for `device` fail.
    pub fn fail_removal(&self, device: &str) {
        self.failing_removals.lock().insert(device.to_string());
    }

    /// Makes every cloud sync fail to start with `err`, or succeed on `None`.
    pub fn set_cloud_status(&self, err: Option<EngineError>) {
        *self.cloud.status.lock() = err;
    }

    /// Progress reports delivered by each cloud sync, in order.
    pub fn set_cloud_reports(&self, reports: Vec<SyncProcess>) {
        *self.cloud.reports.lock() = reports;
    }

    /// Sets the number of running cloud tasks.
    pub fn set_cloud_task_count(&self, count: usize) {
        self.cloud.tasks.store(count, Ordering::SeqCst);
    }

    /// Distributed tables and their kinds.
    pub fn distributed_tables(&self) -> BTreeMap<String, TableKind> {
        self.distributed.lock().clone()
    }

    /// The installed cloud schema.
    pub fn cloud_schema(&self) -> Option<Database> {
        self.schema.lock().clone()
    }

    /// Returns true once both cloud connector and asset loader are set.
    pub fn has_cloud(&self) -> bool {
        self.cloud_db.lock().is_some() && self.loader.lock().is_some()
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

impl RelationalDelegate for MemoryRelationalDelegate {
    fn sync(
        &self,
        devices: &[String],
        mode: i32,
        tables: &[String],
        on_complete: TableBriefCallback,
        _wait: bool,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::Sync {
            devices: devices.to_vec(),
            mode,
            narrowed: !tables.is_empty(),
        });
        let selected: Vec<String> = if tables.is_empty() {
            self.distributed.lock().keys().cloned().collect()
        } else {
            tables.to_vec()
        };
        let failing = self.failing_tables.lock().clone();
        let statuses: TableStatuses = devices
            .iter()
            .map(|device| {
                let per_table = selected
                    .iter()
                    .map(|table| TableStatus {
                        table: table.clone(),
                        status: if failing.contains(table) {
                            Err(EngineError::db(format!("sync of {table} failed")))
                        } else {
                            Ok(())
                        },
                    })
                    .collect();
                (device.clone(), per_table)
            })
            .collect();
        on_complete(&statuses);
        Ok(())
    }

    fn cloud_sync(&self, option: &CloudSyncOption, on_process: ProcessCallback) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::CloudSync {
            users: option.users.clone(),
            mode: option.mode,
            priority: option.priority_task,
        });
        self.cloud.run(option, &on_process)
    }

    fn remove_device_data(&self, device: &str, table: &str, mode: ClearMode) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::RemoveDeviceData {
            device: device.to_string(),
            table: table.to_string(),
            mode,
        });
        if self.failing_removals.lock().contains(device) {
            return Err(EngineError::db(format!("cannot clean {device}")));
        }
        Ok(())
    }

    fn create_distributed_table(&self, table: &str, kind: TableKind) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::CreateDistributedTable(table.to_string(), kind));
        if self.failing_tables.lock().contains(table) {
            return Err(EngineError::db(format!("cannot distribute {table}")));
        }
        self.distributed.lock().insert(table.to_string(), kind);
        Ok(())
    }

    fn query(&self, table: &str, _sql: &str, _args: &[Value]) -> EngineResult<VBuckets> {
        self.ensure_open()?;
        self.rows
            .lock()
            .get(table)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(table.to_string()))
    }

    fn remote_query(&self, device: &str, _sql: &str, _args: &[Value]) -> EngineResult<VBuckets> {
        self.ensure_open()?;
        self.remote_rows
            .lock()
            .get(device)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(device.to_string()))
    }

    fn set_cloud_db(&self, db: Arc<dyn CloudDb>) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::SetCloudDb(Vec::new()));
        *self.cloud_db.lock() = Some(db);
        Ok(())
    }

    fn set_asset_loader(&self, loader: Arc<dyn AssetLoader>) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::SetAssetLoader);
        *self.loader.lock() = Some(loader);
        Ok(())
    }

    fn set_cloud_db_schema(&self, schema: &Database) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::SetCloudDbSchema);
        *self.schema.lock() = Some(schema.clone());
        Ok(())
    }

    fn register_observer(&self, observer: Arc<dyn EngineObserver>) -> EngineResult<()> {
        self.ensure_open()?;
        *self.observer.write() = Some(observer);
        Ok(())
    }

    fn unregister_observer(&self) -> EngineResult<()> {
        self.observer
            .write()
            .take()
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound("observer".into()))
    }

    fn cloud_task_count(&self) -> usize {
        self.cloud.tasks.load(Ordering::SeqCst)
    }

    fn close(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.record(EngineCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens [`MemoryRelationalDelegate`]s, one per store id.
#[derive(Default)]
pub struct MemoryRelationalEngine {
    stores: Mutex<BTreeMap<String, Arc<MemoryRelationalDelegate>>>,
    fail_open: AtomicBool,
}

impl MemoryRelationalEngine {
    /// Creates an engine with no databases.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every open fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// The database opened for `store_id`.
    pub fn delegate(&self, store_id: &str) -> Option<Arc<MemoryRelationalDelegate>> {
        self.stores.lock().get(store_id).cloned()
    }
}

impl RelationalEngine for MemoryRelationalEngine {
    fn open(
        &self,
        id: &EngineStoreId,
        _options: &RdbOpenOptions,
    ) -> EngineResult<Arc<dyn RelationalDelegate>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(EngineError::NotFound(id.store_id.clone()));
        }
        let mut stores = self.stores.lock();
        let delegate = stores
            .entry(id.store_id.clone())
            .and_modify(|existing| {
                if existing.is_closed() {
                    *existing = Arc::new(MemoryRelationalDelegate::new());
                }
            })
            .or_insert_with(|| Arc::new(MemoryRelationalDelegate::new()));
        Ok(Arc::clone(delegate) as Arc<dyn RelationalDelegate>)
    }
}
