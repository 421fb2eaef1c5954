//! General store over the relational sync engine.

use crate::context::StoreContext;
use crate::engine::{
    ClearMode, CloudSyncOption, EngineObserver, EngineStoreId, RdbOpenOptions, RelationalDelegate,
    RelationalEngine,
};
use crate::error::convert_status;
use crate::observer::{ObserverProxy, ProxyKind};
use crate::progress::{cloud_process, table_brief};
use ddms_core::anonymous;
use ddms_core::metadata::{Database, StoreMetaData};
use ddms_core::store::{
    sync_mode, BindInfo, CleanMode, CloudConfig, DetailAsync, GenQuery, GeneralStore, Origin,
    StoreInfo, SyncParam, TableKind, Watcher,
};
use ddms_core::{GeneralError, RefCounter, StoreResult, VBuckets, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// A [`GeneralStore`] backed by the relational sync engine.
pub struct RdbGeneralStore {
    delegate: RwLock<Option<Arc<dyn RelationalDelegate>>>,
    observer: Arc<ObserverProxy>,
    is_bound: AtomicBool,
    bind_info: Mutex<BindInfo>,
    info: StoreInfo,
    ref_count: RefCounter,
    context: Arc<StoreContext>,
}

impl RdbGeneralStore {
    /// Opens the relational database described by `meta`.
    pub fn open(
        meta: &StoreMetaData,
        engine: &dyn RelationalEngine,
        context: Arc<StoreContext>,
    ) -> StoreResult<Arc<Self>> {
        let options = RdbOpenOptions {
            is_encrypted: meta.is_encrypt,
            password: context.password(meta),
            sync_dual_tuple_mode: true,
        };
        let id = EngineStoreId {
            app_id: meta.app_id.clone(),
            user: meta.user.clone(),
            instance_id: meta.instance_id,
            store_id: meta.store_id.clone(),
            data_dir: meta.data_dir.clone(),
        };
        let delegate = engine.open(&id, &options).map_err(|err| {
            error!(store = %meta.store_alias(), error = %err, "failed to open relational store");
            GeneralError::from(err)
        })?;
        let observer = Arc::new(ObserverProxy::new(meta.store_id.clone(), ProxyKind::Relational));
        delegate
            .register_observer(Arc::clone(&observer) as Arc<dyn EngineObserver>)
            .map_err(GeneralError::from)?;

        let info = StoreInfo {
            token_id: meta.token_id,
            bundle_name: meta.bundle_name.clone(),
            store_name: meta.store_id.clone(),
            instance_id: meta.instance_id,
            user: meta.user.parse().unwrap_or(0),
        };
        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let ref_count = RefCounter::new();
            let weak = weak.clone();
            ref_count.set_on_zero(move || {
                if let Some(store) = weak.upgrade() {
                    store.teardown();
                }
            });
            Self {
                delegate: RwLock::new(Some(delegate)),
                observer,
                is_bound: AtomicBool::new(false),
                bind_info: Mutex::new(BindInfo::default()),
                info,
                ref_count,
                context,
            }
        }))
    }

    /// Identity of this store in events.
    pub fn store_info(&self) -> &StoreInfo {
        &self.info
    }

    /// Runs a read query on one nearby device.
    pub fn remote_query(&self, device: &str, sql: &str, args: &[Value]) -> StoreResult<VBuckets> {
        let guard = self.delegate.read();
        let delegate = guard.as_ref().ok_or(GeneralError::AlreadyClosed)?;
        delegate.remote_query(device, sql, args).map_err(|err| {
            error!(device = %anonymous::change(device), error = %err, "remote query failed");
            GeneralError::from(err)
        })
    }

    fn alias(&self) -> String {
        anonymous::change(&self.info.store_name)
    }

    fn close_bind_info(&self) {
        let mut bind = self.bind_info.lock();
        bind.loader = None;
        if let Some(db) = bind.db.take() {
            if let Err(err) = db.close() {
                warn!(store = %self.alias(), error = %err, "cloud db close failed");
            }
        }
    }

    fn teardown(&self) {
        if let Some(delegate) = self.delegate.write().take() {
            if let Err(err) = delegate.unregister_observer() {
                debug!(store = %self.alias(), error = %err, "observer already gone");
            }
            if let Err(err) = delegate.close() {
                warn!(store = %self.alias(), error = %err, "engine close failed");
            }
        }
        self.close_bind_info();
    }
}

impl GeneralStore for RdbGeneralStore {
    fn bind(
        &self,
        database: &Database,
        bind_infos: BTreeMap<i32, BindInfo>,
        _config: &CloudConfig,
    ) -> StoreResult<()> {
        let bind = bind_infos
            .get(&self.info.user)
            .or_else(|| bind_infos.values().next())
            .cloned()
            .ok_or(GeneralError::InvalidArgs)?;
        let (Some(db), Some(loader)) = (bind.db.clone(), bind.loader.clone()) else {
            return Err(GeneralError::InvalidArgs);
        };
        let guard = self.delegate.write();
        let Some(delegate) = guard.as_ref() else {
            error!(database = %anonymous::change(&database.name), "store already closed");
            return Err(GeneralError::AlreadyClosed);
        };
        if self.is_bound.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let applied = delegate
            .set_cloud_db(db)
            .and_then(|()| delegate.set_asset_loader(loader))
            .and_then(|()| delegate.set_cloud_db_schema(database));
        if let Err(err) = applied {
            self.is_bound.store(false, Ordering::SeqCst);
            error!(store = %self.alias(), error = %err, "cloud bind failed");
            return Err(err.into());
        }
        *self.bind_info.lock() = bind;
        info!(store = %self.alias(), tables = database.tables.len(), "cloud db bound");
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.is_bound.load(Ordering::SeqCst)
    }

    fn sync(
        &self,
        devices: &[String],
        query: &GenQuery,
        callback: Option<DetailAsync>,
        param: &SyncParam,
    ) -> StoreResult<()> {
        let guard = self.delegate.read();
        let Some(delegate) = guard.as_ref() else {
            error!(store = %self.alias(), devices = devices.len(), mode = param.mode, "store already closed");
            return Err(GeneralError::AlreadyClosed);
        };
        let mode = param.sync_mode();
        let status = if sync_mode::is_nearby(mode) {
            if devices.is_empty() {
                return Err(GeneralError::InvalidArgs);
            }
            let wait = !param.wait.is_zero();
            delegate.sync(devices, mode, &query.tables, table_brief(callback), wait)
        } else if sync_mode::is_cloud(mode) {
            let option = CloudSyncOption {
                devices: devices.to_vec(),
                mode,
                query: query.clone(),
                wait: param.wait,
                users: vec![self.context.cloud_user(param.user, self.info.user)?],
                priority_task: sync_mode::is_priority(param.mode),
                compensated_only: param.is_compensation,
            };
            let on_process = cloud_process(callback, self.context.on_cloud_change.clone());
            delegate.cloud_sync(&option, on_process)
        } else {
            return Err(GeneralError::InvalidArgs);
        };
        convert_status(&status)
    }

    fn clean(&self, devices: &[String], mode: CleanMode, table: &str) -> StoreResult<()> {
        let guard = self.delegate.read();
        let Some(delegate) = guard.as_ref() else {
            error!(store = %self.alias(), ?mode, table = %anonymous::change(table), "store already closed");
            return Err(GeneralError::AlreadyClosed);
        };
        let status = match mode {
            CleanMode::CloudInfo => delegate.remove_device_data("", "", ClearMode::CloudInfo),
            CleanMode::CloudData => delegate.remove_device_data("", "", ClearMode::CloudData),
            CleanMode::NearbyData if devices.is_empty() => {
                delegate.remove_device_data("", "", ClearMode::Device)
            }
            CleanMode::NearbyData => {
                let mut first_failure = Ok(());
                for device in devices {
                    let status = delegate.remove_device_data(device, table, ClearMode::Device);
                    if let Err(err) = &status {
                        warn!(store = %self.alias(), device = %anonymous::change(device), error = %err, "device clean failed");
                        if first_failure.is_ok() {
                            first_failure = status;
                        }
                    }
                }
                first_failure
            }
            CleanMode::LocalData | CleanMode::CleanWater => return Err(GeneralError::NotSupport),
        };
        status.map_err(|_| GeneralError::Error)
    }

    fn watch(&self, origin: Origin, watcher: Arc<dyn Watcher>) -> StoreResult<()> {
        self.observer.watch(origin, watcher)
    }

    fn unwatch(&self, origin: Origin, watcher: &Arc<dyn Watcher>) -> StoreResult<()> {
        self.observer.unwatch(origin, watcher)
    }

    fn query(&self, table: &str, sql: &str, args: &[Value]) -> StoreResult<VBuckets> {
        let guard = self.delegate.read();
        let Some(delegate) = guard.as_ref() else {
            error!(table = %anonymous::change(table), "store already closed");
            return Err(GeneralError::AlreadyClosed);
        };
        delegate.query(table, sql, args).map_err(GeneralError::from)
    }

    fn set_distributed_tables(&self, tables: &[String], kind: TableKind) -> StoreResult<()> {
        let guard = self.delegate.read();
        let Some(delegate) = guard.as_ref() else {
            error!(tables = tables.len(), ?kind, "store already closed");
            return Err(GeneralError::AlreadyClosed);
        };
        for table in tables {
            debug!(table = %anonymous::change(table), ?kind, "create distributed table");
            if let Err(err) = delegate.create_distributed_table(table, kind) {
                error!(table = %anonymous::change(table), error = %err, "create distributed table failed");
                return Err(GeneralError::Error);
            }
        }
        Ok(())
    }

    fn set_equal_identifier(&self, _app_id: &str, _store_id: &str) -> StoreResult<()> {
        Ok(())
    }

    fn get_water_version(&self, device: &str) -> Vec<String> {
        if self.delegate.read().is_none() {
            error!(device = %anonymous::change(device), "store already closed");
        }
        Vec::new()
    }

    fn close(&self) -> StoreResult<()> {
        let mut guard = self.delegate.write();
        let Some(delegate) = guard.as_ref() else {
            return Ok(());
        };
        let tasks = delegate.cloud_task_count();
        if tasks > 0 {
            debug!(store = %self.alias(), tasks, "close refused while cloud syncing");
            return Err(GeneralError::Busy);
        }
        if let Err(err) = delegate.unregister_observer() {
            debug!(store = %self.alias(), error = %err, "observer already gone");
        }
        delegate.close().map_err(GeneralError::from)?;
        *guard = None;
        drop(guard);
        self.close_bind_info();
        Ok(())
    }

    fn add_ref(&self) -> i32 {
        self.ref_count.add_ref()
    }

    fn release(&self) -> i32 {
        self.ref_count.release()
    }

    fn ref_count(&self) -> i32 {
        self.ref_count.count()
    }
}

impl Drop for RdbGeneralStore {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for RdbGeneralStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdbGeneralStore")
            .field("store", &self.alias())
            .field("is_bound", &self.is_bound())
            .field("watched", &self.observer.has_watcher())
            .finish()
    }
}
