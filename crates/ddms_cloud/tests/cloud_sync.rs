//! Cloud sync through the service, the manager and an in-memory relational engine.

use ddms_cloud::{
    CloudContext, CloudError, CloudEvent, CloudService, MockCloudServer, RetryPolicy, SyncEvent,
    SyncInfo, SyncStatus,
};
use ddms_core::account::StaticAccount;
use ddms_core::metadata::{
    store_type, AppInfo, CloudInfo, Database, MetaPlane, SchemaMeta, StoreMetaData,
};
use ddms_core::store::{sync_mode, CleanMode, DetailAsync, GenDetails, StoreInfo};
use ddms_core::{
    AutoCache, CacheConfig, EventGuard, ExecutorConfig, ExecutorPool, GeneralError, MetaConfig,
    MetaDataManager, StoreResult,
};
use ddms_device::{DeviceRegistry, MockDeviceTransport, RegistryConfig};
use ddms_storage::{KvDelegate, MemoryKvDelegate, StorageResult};
use ddms_store::{
    register_creators, ClearMode, EngineCall, EngineError, MemoryKvEngine,
    MemoryRelationalEngine, StoreContext, SyncProcess, TableProcess, TransferInfo,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const USER: i32 = 100;
const ACCOUNT: &str = "account-hash";
const BUNDLE: &str = "com.example.notes";
const STORE: &str = "notes";
const LOCAL: &str = "uuid-local";

struct Env {
    service: Arc<CloudService>,
    context: Arc<CloudContext>,
    server: Arc<MockCloudServer>,
    rdb: Arc<MemoryRelationalEngine>,
    executor: Arc<ExecutorPool>,
    syncs: Arc<Mutex<Vec<StoreInfo>>>,
    _watch: EventGuard<CloudEvent>,
}

fn quick_policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_max_times(3)
        .with_retry_interval(Duration::from_millis(20))
        .with_locked_interval(Duration::from_millis(20))
        .with_busy_interval(Duration::from_millis(20))
        .with_backoff_multiplier(1.0)
}

fn env(policy: RetryPolicy) -> Env {
    let transport = Arc::new(MockDeviceTransport::new());
    transport.set_local("net-local", LOCAL, "udid-local");
    transport.set_net_available(true);
    let registry = DeviceRegistry::new(transport, RegistryConfig::default());
    registry.init_device_info(false);

    let synced = Arc::new(MemoryKvDelegate::new());
    let local = Arc::new(MemoryKvDelegate::new());
    let opener = move |plane: MetaPlane| -> StorageResult<Arc<dyn KvDelegate>> {
        Ok(match plane {
            MetaPlane::Synced => Arc::clone(&synced) as Arc<dyn KvDelegate>,
            MetaPlane::Local => Arc::clone(&local) as Arc<dyn KvDelegate>,
        })
    };
    let meta = Arc::new(MetaDataManager::new(Arc::new(opener), MetaConfig::default()));
    let account = Arc::new(StaticAccount::new(vec![USER], ACCOUNT));

    let cache = Arc::new(AutoCache::new(CacheConfig::default()));
    let rdb = Arc::new(MemoryRelationalEngine::new());
    let store_context = StoreContext::new(
        Arc::clone(&meta),
        Arc::clone(&registry),
        Arc::clone(&account) as _,
        "ddms",
    );
    register_creators(
        &cache,
        Arc::new(MemoryKvEngine::new(LOCAL)),
        Arc::clone(&rdb) as _,
        Arc::new(store_context),
    );

    let server = Arc::new(MockCloudServer::new());
    let context = Arc::new(
        CloudContext::new(meta, cache, registry, account).with_server(Arc::clone(&server) as _),
    );
    let syncs = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&syncs);
    let watch = context.events.subscribe(move |event: &CloudEvent| {
        if let CloudEvent::Sync(event) = event {
            sink.lock().push(event.store.clone());
        }
    });
    let executor = Arc::new(ExecutorPool::new(&ExecutorConfig::new(2, 4)).unwrap());
    let service = CloudService::new(Arc::clone(&context), policy);
    Env {
        service,
        context,
        server,
        rdb,
        executor,
        syncs,
        _watch: watch,
    }
}

fn cloud_info(enable_cloud: bool, switch: bool) -> CloudInfo {
    let mut info = CloudInfo::new(USER);
    info.id = ACCOUNT.into();
    info.enable_cloud = enable_cloud;
    info.apps.insert(
        BUNDLE.into(),
        AppInfo {
            bundle_name: BUNDLE.into(),
            cloud_switch: switch,
            ..AppInfo::default()
        },
    );
    info
}

fn store_meta() -> StoreMetaData {
    let mut meta = StoreMetaData::new(LOCAL, USER.to_string(), BUNDLE, STORE);
    meta.store_type = store_type::RELATIONAL;
    meta.token_id = 7;
    meta
}

/// Saves account, schema and store metadata so a sync can run.
fn provision(env: &Env, info: &CloudInfo) {
    let meta = &env.context.meta;
    meta.save_meta(&info.key(), info, true).unwrap();
    let schema = SchemaMeta {
        version: 1,
        bundle_name: BUNDLE.into(),
        databases: vec![Database {
            name: STORE.into(),
            alias: "cloud_notes".into(),
            ..Database::default()
        }],
    };
    meta.save_meta(&info.schema_key(BUNDLE, 0), &schema, true).unwrap();
    let store = store_meta();
    meta.save_meta(&store.key(), &store, false).unwrap();
}

fn capture() -> (DetailAsync, Arc<Mutex<Vec<GenDetails>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (Arc::new(move |d: &GenDetails| sink.lock().push(d.clone())), seen)
}

fn final_codes(seen: &Mutex<Vec<GenDetails>>) -> Vec<StoreResult<()>> {
    seen.lock()
        .iter()
        .filter_map(|details| details.values().next())
        .filter(|detail| detail.progress == ddms_core::store::Progress::Finished)
        .map(|detail| detail.code)
        .collect()
}

fn cloud_syncs(env: &Env) -> usize {
    env.rdb
        .delegate(STORE)
        .map(|delegate| {
            delegate
                .calls()
                .iter()
                .filter(|call| matches!(call, EngineCall::CloudSync { .. }))
                .count()
        })
        .unwrap_or(0)
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn requests_before_bind_are_refused() {
    let env = env(RetryPolicy::default());
    let manager = env.service.sync_manager();
    assert_eq!(manager.do_cloud_sync(SyncInfo::new(USER)), Err(GeneralError::NotInit));

    env.service.on_bind(Arc::clone(&env.executor)).unwrap();
    assert_eq!(manager.do_cloud_sync(SyncInfo::new(USER)), Ok(()));
    assert_eq!(manager.stop_cloud_sync(-1), Ok(()));
}

#[test]
fn notify_data_change_dispatches_exactly_one_sync() {
    let env = env(RetryPolicy::default());
    env.service.on_bind(Arc::clone(&env.executor)).unwrap();
    provision(&env, &cloud_info(false, true));

    assert!(matches!(
        env.service.notify_data_change(USER, ACCOUNT, BUNDLE),
        Err(CloudError::CloudDisabled)
    ));
    std::thread::sleep(Duration::from_millis(50));
    assert!(env.syncs.lock().is_empty());

    provision(&env, &cloud_info(true, true));
    env.service.notify_data_change(USER, ACCOUNT, BUNDLE).unwrap();
    assert!(wait_until(|| cloud_syncs(&env) == 1));
    std::thread::sleep(Duration::from_millis(50));

    let syncs = env.syncs.lock();
    assert_eq!(syncs.len(), 1);
    assert_eq!(syncs[0].bundle_name, BUNDLE);
    assert_eq!(syncs[0].store_name, STORE);
    assert_eq!(syncs[0].user, USER);
    assert_eq!(cloud_syncs(&env), 1);
}

#[test]
fn last_sync_info_records_the_outcome() {
    let env = env(RetryPolicy::default());
    env.service.on_bind(Arc::clone(&env.executor)).unwrap();
    provision(&env, &cloud_info(true, true));

    let manager = env.service.sync_manager();
    let (callback, seen) = capture();
    manager
        .do_cloud_sync(SyncInfo::new(USER).with_bundle(BUNDLE).with_callback(callback))
        .unwrap();
    assert!(wait_until(|| !final_codes(&seen).is_empty()));
    assert_eq!(final_codes(&seen), vec![Ok(())]);

    let last = manager.query_last_sync_info(USER, ACCOUNT, BUNDLE, &[]);
    let notes = &last[STORE];
    assert_eq!(notes.status, SyncStatus::Finished);
    assert_eq!(notes.code, Ok(()));
    assert!(notes.finish >= notes.start);
    assert!(manager
        .query_last_sync_info(USER, ACCOUNT, BUNDLE, &["other".into()])
        .is_empty());
    assert!(wait_until(|| manager.active_count() == 0));
}

#[test]
fn enable_cloud_skips_unknown_bundles_but_persists() {
    let env = env(RetryPolicy::default());
    env.service.on_bind(Arc::clone(&env.executor)).unwrap();
    let before = cloud_info(false, false);
    env.context.meta.save_meta(&before.key(), &before, true).unwrap();

    let mut switches = BTreeMap::new();
    switches.insert("com.example.missing".to_string(), true);
    env.service.enable_cloud(USER, ACCOUNT, &switches).unwrap();

    let after: CloudInfo = env.context.meta.load_meta(&before.key(), true).unwrap();
    assert!(after.enable_cloud);
    assert_eq!(after.apps, before.apps);
    assert!(!after.exists("com.example.missing"));
}

#[test]
fn locked_store_retries_until_it_succeeds() {
    let env = env(quick_policy()
        .with_max_times(6)
        .with_locked_interval(Duration::from_millis(100)));
    env.service.on_bind(Arc::clone(&env.executor)).unwrap();
    provision(&env, &cloud_info(true, true));
    env.context.cache.get_store(&store_meta(), &[]).unwrap();
    let delegate = env.rdb.delegate(STORE).unwrap();
    delegate.set_cloud_status(Some(EngineError::CloudLock));

    let (callback, seen) = capture();
    env.service
        .sync_manager()
        .do_cloud_sync(SyncInfo::new(USER).with_bundle(BUNDLE).with_callback(callback))
        .unwrap();
    assert!(wait_until(|| cloud_syncs(&env) >= 1));
    delegate.set_cloud_status(None);

    assert!(wait_until(|| !final_codes(&seen).is_empty()));
    assert_eq!(final_codes(&seen), vec![Ok(())]);
    assert!(cloud_syncs(&env) >= 2);
}

#[test]
fn retries_stop_when_the_budget_runs_out() {
    let env = env(quick_policy());
    env.service.on_bind(Arc::clone(&env.executor)).unwrap();
    provision(&env, &cloud_info(true, true));
    env.context.cache.get_store(&store_meta(), &[]).unwrap();
    env.rdb
        .delegate(STORE)
        .unwrap()
        .set_cloud_status(Some(EngineError::CloudLock));

    let (callback, seen) = capture();
    env.service
        .sync_manager()
        .do_cloud_sync(SyncInfo::new(USER).with_bundle(BUNDLE).with_callback(callback))
        .unwrap();
    assert!(wait_until(|| !final_codes(&seen).is_empty()));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(final_codes(&seen), vec![Err(GeneralError::LockedByOthers)]);
    assert_eq!(cloud_syncs(&env), 3);
}

#[test]
fn fatal_failures_are_not_retried() {
    let env = env(quick_policy());
    env.service.on_bind(Arc::clone(&env.executor)).unwrap();
    provision(&env, &cloud_info(true, true));
    env.server.refuse_connect(true);

    let (callback, seen) = capture();
    env.service
        .sync_manager()
        .do_cloud_sync(SyncInfo::new(USER).with_bundle(BUNDLE).with_callback(callback))
        .unwrap();
    assert!(wait_until(|| !final_codes(&seen).is_empty()));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(final_codes(&seen), vec![Err(GeneralError::Error)]);
    assert_eq!(cloud_syncs(&env), 0);
}

#[test]
fn local_change_syncs_inline() {
    let env = env(RetryPolicy::default());
    provision(&env, &cloud_info(true, true));

    let (callback, seen) = capture();
    let store = StoreInfo {
        bundle_name: BUNDLE.into(),
        store_name: STORE.into(),
        user: USER,
        ..StoreInfo::default()
    };
    let mode = sync_mode::mix_mode(sync_mode::CLOUD_TIME_FIRST, sync_mode::MANUAL_SYNC_MODE);
    let event = SyncEvent::new(store, mode).with_callback(callback);
    env.context.events.post(&CloudEvent::LocalChange(event));

    assert_eq!(final_codes(&seen), vec![Ok(())]);
    assert_eq!(cloud_syncs(&env), 1);
    assert!(matches!(
        env.rdb.delegate(STORE).unwrap().calls().last(),
        Some(EngineCall::CloudSync { priority: true, .. })
    ));
}

#[test]
fn downloads_announce_cloud_sync_finished() {
    let env = env(RetryPolicy::default());
    provision(&env, &cloud_info(true, true));
    env.context.cache.get_store(&store_meta(), &[]).unwrap();
    let mut table = TableProcess::default();
    table.download = TransferInfo {
        total: 2,
        success_count: 2,
        update_count: 2,
        ..TransferInfo::default()
    };
    let mut done = SyncProcess::finished(Ok(()));
    done.tables.insert("note".into(), table);
    env.rdb.delegate(STORE).unwrap().set_cloud_reports(vec![done]);

    let finished = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&finished);
    let _guard = env.context.events.subscribe(move |event: &CloudEvent| {
        if let CloudEvent::CloudSyncFinished(store) = event {
            sink.lock().push(store.clone());
        }
    });
    let store = StoreInfo {
        bundle_name: BUNDLE.into(),
        store_name: STORE.into(),
        user: USER,
        ..StoreInfo::default()
    };
    let event = SyncEvent::new(store, sync_mode::CLOUD_TIME_FIRST);
    env.context.events.post(&CloudEvent::LocalChange(event));

    let finished = finished.lock();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].store_name, STORE);
}

#[test]
fn clean_reaches_every_store_of_the_bundle() {
    let env = env(RetryPolicy::default());
    env.service.on_bind(Arc::clone(&env.executor)).unwrap();
    provision(&env, &cloud_info(true, true));

    let mut actions = BTreeMap::new();
    actions.insert(BUNDLE.to_string(), CleanMode::CloudData);
    env.service.clean(USER, ACCOUNT, &actions).unwrap();
    assert!(env
        .rdb
        .delegate(STORE)
        .unwrap()
        .calls()
        .contains(&EngineCall::RemoveDeviceData {
            device: String::new(),
            table: String::new(),
            mode: ClearMode::CloudData,
        }));
}

#[test]
fn account_change_cleans_old_cloud_info() {
    let env = env(RetryPolicy::default());
    env.service.on_bind(Arc::clone(&env.executor)).unwrap();
    provision(&env, &cloud_info(true, true));

    let mut moved = cloud_info(true, true);
    moved.id = "another-account".into();
    env.server.set_info(moved.clone());
    assert!(env.service.update_cloud_info(USER));

    let stored: CloudInfo = env.context.meta.load_meta(&moved.key(), true).unwrap();
    assert_eq!(stored.id, "another-account");
    assert!(env
        .rdb
        .delegate(STORE)
        .unwrap()
        .calls()
        .contains(&EngineCall::RemoveDeviceData {
            device: String::new(),
            table: String::new(),
            mode: ClearMode::CloudInfo,
        }));
}
