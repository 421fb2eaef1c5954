//! General store over the KV sync engine.

use crate::context::StoreContext;
use crate::engine::{
    ClearMode, CloudSyncConfig, CloudSyncOption, ConflictPolicy, EngineObserver, EngineStoreId,
    InterceptedData, Interceptor, KvEngine, KvOpenOptions, KvSyncDelegate, SecurityFlag,
    SecurityOption,
};
use crate::error::{convert_status, EngineError, EngineResult};
use crate::identifier::{kv_store_identifier, rewrite_key, DEFAULT_ACCOUNT_ID};
use crate::observer::{ObserverProxy, ProxyKind};
use crate::progress::{cloud_process, device_brief};
use ddms_core::anonymous;
use ddms_core::metadata::{security_level, store_type, Database, StoreMetaData};
use ddms_core::store::{
    sync_mode, BindInfo, CleanMode, CloudConfig, DetailAsync, GenQuery, GeneralStore, Origin,
    StoreInfo, SyncParam, TableKind, Watcher,
};
use ddms_core::{GeneralError, RefCounter, StoreResult, VBuckets, Value};
use ddms_device::{AuthType, DeviceRegistry};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Compression rate of the service's own metadata stores.
pub const META_COMPRESS_RATE: u8 = 10;

/// Security option for a metadata security level.
pub fn security_option(level: i32) -> SecurityOption {
    if !(security_level::NO_LABEL..=security_level::S4).contains(&level) {
        return SecurityOption {
            label: security_level::NO_LABEL,
            flag: SecurityFlag::Ece,
        };
    }
    let flag = if level == security_level::S3 {
        SecurityFlag::Sece
    } else {
        SecurityFlag::Ece
    };
    SecurityOption { label: level, flag }
}

/// Engine options for a KV store.
pub fn open_options(meta: &StoreMetaData, is_public: bool, password: Vec<u8>, is_service: bool) -> KvOpenOptions {
    let mut options = KvOpenOptions {
        create_if_necessary: false,
        is_encrypted: meta.is_encrypt,
        is_need_compress: meta.is_need_compress,
        schema: meta.schema.clone(),
        security: security_option(meta.security_level),
        ..KvOpenOptions::default()
    };
    if meta.is_encrypt {
        options.password = password;
    }
    if is_public || meta.store_type == store_type::DEVICE_COLLABORATION {
        options.conflict_policy = ConflictPolicy::DeviceCollaboration;
    } else if meta.store_type == store_type::SINGLE_VERSION {
        options.conflict_policy = ConflictPolicy::LastWin;
    }
    if is_service {
        options.compression_rate = META_COMPRESS_RATE;
        options.conflict_policy = ConflictPolicy::LastWin;
    } else {
        options.sync_dual_tuple_mode = true;
    }
    options
}

fn push_interceptor(store_type: i32, registry: Arc<DeviceRegistry>) -> Interceptor {
    Arc::new(move |data: &mut InterceptedData, source: &str, target: &str| {
        if store_type != store_type::DEVICE_COLLABORATION {
            return Ok(());
        }
        if target.is_empty() {
            error!("push target is empty");
            return Err(EngineError::db("empty push target"));
        }
        if registry.is_compatible_peer(&registry.to_network_id(target)) {
            return Ok(());
        }
        for (index, key) in data.keys().into_iter().enumerate() {
            if key.is_empty() {
                continue;
            }
            let scoped = rewrite_key(&key, source)?;
            data.modify_key(index, scoped)?;
        }
        Ok(())
    })
}

fn receive_interceptor(store_type: i32, registry: Arc<DeviceRegistry>) -> Interceptor {
    Arc::new(move |data: &mut InterceptedData, source: &str, _target: &str| {
        if store_type != store_type::DEVICE_COLLABORATION {
            return Ok(());
        }
        if source.is_empty() {
            error!("receive source is empty");
            return Err(EngineError::db("empty receive source"));
        }
        let network_id = registry.to_network_id(source);
        if registry.is_compatible_peer(&network_id) {
            return Ok(());
        }
        for (index, key) in data.keys().into_iter().enumerate() {
            if key.is_empty() {
                continue;
            }
            let encrypted = registry.get_encrypted_uuid_by_network_id(&network_id);
            if encrypted.is_empty() {
                warn!(source = %anonymous::change(source), "no encrypted uuid for source");
                continue;
            }
            let scoped = rewrite_key(&key, &encrypted)?;
            data.modify_key(index, scoped)?;
        }
        Ok(())
    })
}

/// A [`GeneralStore`] backed by the KV sync engine.
///
/// The engine handle lives behind a read-write lock: syncs, cleans and
/// lookups hold it shared, while bind and close hold it exclusively so a
/// close can never free the engine under a running call.
pub struct KvGeneralStore {
    delegate: RwLock<Option<Arc<dyn KvSyncDelegate>>>,
    observer: Arc<ObserverProxy>,
    is_bound: AtomicBool,
    bind_infos: Mutex<Vec<BindInfo>>,
    is_public: bool,
    enable_cloud: bool,
    info: StoreInfo,
    ref_count: RefCounter,
    context: Arc<StoreContext>,
}

impl KvGeneralStore {
    /// Opens the KV database described by `meta`.
    pub fn open(
        meta: &StoreMetaData,
        engine: &dyn KvEngine,
        context: Arc<StoreContext>,
    ) -> StoreResult<Arc<Self>> {
        let is_service = context.is_service_store(meta);
        let is_public = context.is_public(meta);
        let options = open_options(meta, is_public, context.password(meta), is_service);
        let id = EngineStoreId {
            app_id: meta.app_id.clone(),
            user: if is_service {
                DEFAULT_ACCOUNT_ID.to_string()
            } else {
                meta.user.clone()
            },
            instance_id: meta.instance_id,
            store_id: meta.store_id.clone(),
            data_dir: meta.data_dir.clone(),
        };
        let delegate = engine.open(&id, &options).map_err(|err| {
            error!(store = %meta.store_alias(), error = %err, "failed to open kv store");
            GeneralError::from(err)
        })?;

        delegate.set_push_interceptor(push_interceptor(meta.store_type, Arc::clone(&context.registry)));
        delegate.set_receive_interceptor(receive_interceptor(
            meta.store_type,
            Arc::clone(&context.registry),
        ));
        let observer = Arc::new(ObserverProxy::new(meta.store_id.clone(), ProxyKind::Kv));
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
                bind_infos: Mutex::new(Vec::new()),
                is_public,
                enable_cloud: meta.enable_cloud,
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

    /// Returns true while the engine is open.
    pub fn is_valid(&self) -> bool {
        self.delegate.read().is_some()
    }

    fn alias(&self) -> String {
        anonymous::change(&self.info.store_name)
    }

    fn cloud_sync(
        &self,
        delegate: &dyn KvSyncDelegate,
        devices: &[String],
        query: &GenQuery,
        callback: Option<DetailAsync>,
        param: &SyncParam,
    ) -> StoreResult<()> {
        let user = self.context.cloud_user(param.user, self.info.user)?;
        let option = CloudSyncOption {
            devices: devices.to_vec(),
            mode: param.sync_mode(),
            query: query.clone(),
            wait: param.wait,
            users: vec![user],
            priority_task: sync_mode::is_priority(param.mode),
            compensated_only: param.is_compensation,
        };
        let on_process = cloud_process(callback, self.context.on_cloud_change.clone());
        convert_status(&delegate.cloud_sync(&option, on_process))
    }

    fn nearby_sync(
        &self,
        delegate: &dyn KvSyncDelegate,
        devices: &[String],
        query: &GenQuery,
        callback: Option<DetailAsync>,
        param: &SyncParam,
    ) -> StoreResult<()> {
        if devices.is_empty() {
            error!(store = %self.alias(), mode = param.mode, "nearby sync without devices");
            return Err(GeneralError::InvalidArgs);
        }
        if !query.is_valid() {
            return Err(GeneralError::InvalidArgs);
        }
        let on_complete = device_brief(callback);
        let status: EngineResult<()> = match param.sync_mode() {
            sync_mode::NEARBY_SUBSCRIBE_REMOTE => {
                delegate.subscribe_remote_query(devices, query, on_complete, false)
            }
            sync_mode::NEARBY_UNSUBSCRIBE_REMOTE => {
                delegate.unsubscribe_remote_query(devices, query, on_complete, false)
            }
            mode if mode < sync_mode::NEARBY_END => {
                let query = (!query.is_full()).then_some(query);
                delegate.sync(devices, mode, query, on_complete, false)
            }
            mode => {
                error!(store = %self.alias(), mode, "unknown sync mode");
                return Err(GeneralError::InvalidArgs);
            }
        };
        convert_status(&status)
    }

    fn identifier_devices(registry: &DeviceRegistry, auth: AuthType) -> Vec<String> {
        registry
            .get_remote_devices()
            .into_iter()
            .filter(|device| !registry.is_compatible_peer(&device.network_id))
            .filter(|device| registry.get_auth_type(&device.network_id) == auth)
            .map(|device| device.uuid)
            .collect()
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
        for bound in self.bind_infos.lock().drain(..) {
            if let Some(db) = bound.db {
                if let Err(err) = db.close() {
                    warn!(store = %self.alias(), error = %err, "cloud db close failed");
                }
            }
        }
    }
}

impl GeneralStore for KvGeneralStore {
    fn bind(
        &self,
        database: &Database,
        bind_infos: BTreeMap<i32, BindInfo>,
        config: &CloudConfig,
    ) -> StoreResult<()> {
        let guard = self.delegate.write();
        let delegate = guard.as_ref().ok_or(GeneralError::AlreadyClosed)?;
        if bind_infos.is_empty() {
            warn!(store = %self.alias(), "no cloud db to bind");
            return Ok(());
        }
        if bind_infos.values().any(|bind| bind.db.is_none()) {
            return Err(GeneralError::InvalidArgs);
        }
        if self.is_bound.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut dbs = BTreeMap::new();
        let mut schemas = BTreeMap::new();
        for (user, bind) in &bind_infos {
            if let Some(db) = &bind.db {
                dbs.insert(user.to_string(), Arc::clone(db));
                schemas.insert(user.to_string(), database.clone());
            }
        }
        let sync_config = CloudSyncConfig {
            max_upload_count: config.max_number,
            max_upload_size: config.max_size,
            max_retry_conflict_times: config.max_retry_conflict_times,
        };
        let applied = delegate
            .set_cloud_db(dbs)
            .and_then(|()| delegate.set_cloud_db_schema(schemas))
            .and_then(|()| delegate.set_cloud_sync_config(&sync_config));
        if let Err(err) = applied {
            self.is_bound.store(false, Ordering::SeqCst);
            error!(store = %self.alias(), error = %err, "cloud bind failed");
            return Err(err.into());
        }
        self.bind_infos.lock().extend(bind_infos.into_values());
        info!(store = %self.alias(), "cloud db bound");
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
        if sync_mode::is_cloud(param.mode) {
            if !self.enable_cloud {
                return Err(GeneralError::NotSupport);
            }
            return self.cloud_sync(delegate.as_ref(), devices, query, callback, param);
        }
        self.nearby_sync(delegate.as_ref(), devices, query, callback, param)
    }

    fn clean(&self, devices: &[String], mode: CleanMode, _table: &str) -> StoreResult<()> {
        let guard = self.delegate.read();
        let Some(delegate) = guard.as_ref() else {
            error!(store = %self.alias(), ?mode, "store already closed");
            return Err(GeneralError::AlreadyClosed);
        };
        let status = match mode {
            CleanMode::CloudInfo => {
                let clear = if self.is_public {
                    ClearMode::CloudData
                } else {
                    ClearMode::CloudInfo
                };
                delegate.remove_device_data("", clear)
            }
            CleanMode::CloudData => delegate.remove_device_data("", ClearMode::CloudData),
            CleanMode::NearbyData if devices.is_empty() => {
                delegate.remove_device_data("", ClearMode::Device)
            }
            CleanMode::NearbyData => {
                let mut first_failure = Ok(());
                for device in devices {
                    let status = delegate.remove_device_data(device, ClearMode::Device);
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

    fn query(&self, _table: &str, _sql: &str, _args: &[Value]) -> StoreResult<VBuckets> {
        Err(GeneralError::NotSupport)
    }

    fn set_distributed_tables(&self, _tables: &[String], _kind: TableKind) -> StoreResult<()> {
        Ok(())
    }

    fn set_equal_identifier(&self, app_id: &str, store_id: &str) -> StoreResult<()> {
        let guard = self.delegate.read();
        let Some(delegate) = guard.as_ref() else {
            error!(app_id, store = %anonymous::change(store_id), "store already closed");
            return Err(GeneralError::AlreadyClosed);
        };
        let registry = &self.context.registry;
        let same_account = Self::identifier_devices(registry, AuthType::IdenticalAccount);
        let no_account = Self::identifier_devices(registry, AuthType::NoAccount);

        if !same_account.is_empty() {
            let account = self.context.account.current_account_id();
            let identifier = kv_store_identifier(&account, app_id, store_id);
            info!(
                store = %anonymous::change(store_id),
                devices = same_account.len(),
                "same account identifier"
            );
            delegate
                .set_equal_identifier(&identifier, &same_account)
                .map_err(GeneralError::from)?;
        }
        if !no_account.is_empty() {
            let identifier = kv_store_identifier(DEFAULT_ACCOUNT_ID, app_id, store_id);
            info!(
                store = %anonymous::change(store_id),
                devices = no_account.len(),
                "no account identifier"
            );
            delegate
                .set_equal_identifier(&identifier, &no_account)
                .map_err(GeneralError::from)?;
        }
        Ok(())
    }

    fn get_water_version(&self, device: &str) -> Vec<String> {
        let guard = self.delegate.read();
        let Some(delegate) = guard.as_ref() else {
            error!(device = %anonymous::change(device), "store already closed");
            return Vec::new();
        };
        match delegate.get_cloud_version(device) {
            Ok(versions) => versions.into_values().collect(),
            Err(err) => {
                debug!(store = %self.alias(), error = %err, "no water version");
                Vec::new()
            }
        }
    }

    fn close(&self) -> StoreResult<()> {
        let mut guard = self.delegate.write();
        let Some(delegate) = guard.as_ref() else {
            return Ok(());
        };
        let tasks = delegate.task_count();
        if tasks > 0 {
            debug!(store = %self.alias(), tasks, "close refused while syncing");
            return Err(GeneralError::Busy);
        }
        if let Err(err) = delegate.unregister_observer() {
            debug!(store = %self.alias(), error = %err, "observer already gone");
        }
        delegate.close().map_err(GeneralError::from)?;
        *guard = None;
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

impl Drop for KvGeneralStore {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for KvGeneralStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvGeneralStore")
            .field("store", &self.alias())
            .field("is_bound", &self.is_bound())
            .field("watched", &self.observer.has_watcher())
            .field("is_public", &self.is_public)
            .field("valid", &self.is_valid())
            .finish()
    }
}
