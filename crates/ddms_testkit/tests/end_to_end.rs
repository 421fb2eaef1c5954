//! Scenarios crossing metadata, devices, schemas, cloud sync and data share.

use ddms_cloud::CloudError;
use ddms_core::metadata::{CloudInfo, StoreMetaData};
use ddms_device::{
    ChangeLevel, DeviceChangeListener, DeviceChangeType, DeviceInfo, DmDeviceInfo,
    CLOUD_DEVICE_UUID,
};
use ddms_schema::{
    CompareResult, RelationalSchemaObject, RelationalSyncOpinion, RelationalSyncStrategy,
    SchemaType,
};
use ddms_share::{
    Caller, MemoryTemplateDataSource, ObserverHandle, PredicateTemplateNode, RdbObserver,
    RecordingObserver, SchedulerConfig, Template,
};
use ddms_testkit::prelude::*;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn disabled_cloud_refuses_then_enabled_cloud_syncs_once() {
    let harness = CloudHarness::new();
    harness.provision(false, true);
    assert!(matches!(
        harness.service.notify_data_change(TEST_USER, TEST_ACCOUNT, TEST_BUNDLE),
        Err(CloudError::CloudDisabled)
    ));
    std::thread::sleep(Duration::from_millis(50));
    assert!(harness.sync_events().is_empty());

    harness.provision(true, true);
    harness
        .service
        .notify_data_change(TEST_USER, TEST_ACCOUNT, TEST_BUNDLE)
        .unwrap();
    assert!(wait_until(|| harness.cloud_syncs() == 1));
    std::thread::sleep(Duration::from_millis(50));

    let syncs = harness.sync_events();
    assert_eq!(syncs.len(), 1);
    assert_eq!(syncs[0].user, TEST_USER);
    assert_eq!(syncs[0].bundle_name, TEST_BUNDLE);
    assert_eq!(syncs[0].store_name, TEST_STORE);
}

#[test]
fn switched_off_bundle_is_not_synced() {
    let harness = CloudHarness::new();
    harness.provision(true, false);
    assert!(matches!(
        harness.service.notify_data_change(TEST_USER, TEST_ACCOUNT, TEST_BUNDLE),
        Err(CloudError::SwitchOff(_))
    ));
    assert!(harness.sync_events().is_empty());
}

#[test]
fn store_metadata_survives_reopen() {
    let env = TestEnv::file();
    let meta = StoreMetaData::new(TEST_UUID, TEST_USER.to_string(), TEST_BUNDLE, TEST_STORE);
    env.meta.save_meta(&meta.key(), &meta, false).unwrap();
    let account = CloudHarness::account(true, true);
    env.meta.save_meta(&account.key(), &account, true).unwrap();

    let env = env.reopen();
    let loaded: StoreMetaData = env.meta.load_meta(&meta.key(), false).unwrap();
    assert_eq!(loaded, meta);
    let loaded: CloudInfo = env.meta.load_meta(&account.key(), true).unwrap();
    assert_eq!(loaded, account);
    assert!(env.meta.load_meta::<CloudInfo>(&account.key(), false).is_none());
}

#[test]
fn template_subscription_delivers_query_rows() {
    let env = TestEnv::memory();
    let source = Arc::new(MemoryTemplateDataSource::new());
    source.set_result("select * from inbox", "[{\"id\":1}]");
    let share = env.share(Arc::clone(&source) as _, SchedulerConfig::default());

    let key = ddms_share::SubscriberKey::new("datashareproxy://com.example.mail/inbox", 1, "com.example.mail");
    let template = Template::new(vec![PredicateTemplateNode::new("inbox", "select * from inbox")]);
    share.templates.add(&key, TEST_USER, &template).unwrap();

    let recorder = RecordingObserver::new();
    let store = StoreMetaData::new(TEST_UUID, TEST_USER.to_string(), "com.example.mail", "mail");
    share
        .rdb
        .add(
            &key,
            ObserverHandle::<dyn RdbObserver>::new(Arc::clone(&recorder) as _),
            Caller::new(TEST_TOKEN, 1),
            TEST_USER,
            &store,
        )
        .unwrap();

    let changes = recorder.rdb_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].uri, key.uri);
    assert_eq!(changes[0].data, vec!["{\"inbox\":[{\"id\":1}]}".to_string()]);

    share.rdb.emit(&key.uri, TEST_USER, &store);
    assert_eq!(recorder.rdb_changes().len(), 2);
    share.rdb.delete_by_process(TEST_TOKEN, 1);
    assert_eq!(share.rdb.get_count(), 0);
}

struct NetworkLog(Arc<Mutex<Vec<(String, DeviceChangeType)>>>);

impl DeviceChangeListener for NetworkLog {
    fn on_device_changed(&self, info: &DeviceInfo, change: DeviceChangeType) {
        self.0.lock().push((info.uuid.clone(), change));
    }

    fn change_level(&self) -> ChangeLevel {
        ChangeLevel::Min
    }
}

#[test]
fn network_drives_the_cloud_pseudo_device() {
    let env = TestEnv::memory();
    let log = Arc::new(Mutex::new(Vec::new()));
    let watch = env
        .registry
        .start_watch_device_change(Some(Arc::new(NetworkLog(Arc::clone(&log)))))
        .unwrap();

    env.registry.on_network_available();
    assert!(env.registry.is_network_available());
    assert!(wait_until(|| log.lock().len() == 1));
    assert_eq!(
        log.lock()[0],
        (CLOUD_DEVICE_UUID.to_string(), DeviceChangeType::Online)
    );

    env.registry.on_network_lost();
    assert!(!env.registry.is_network_available());
    assert!(wait_until(|| log
        .lock()
        .contains(&(CLOUD_DEVICE_UUID.to_string(), DeviceChangeType::Offline))));
    env.registry.stop_watch_device_change(watch).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn schema_text_survives_the_metadata_store(schema in schema_strategy()) {
        let env = TestEnv::memory();
        let key = "schema###notes";
        env.meta.save_meta(key, &schema.to_schema_string(), true).unwrap();
        let text: String = env.meta.load_meta(key, true).unwrap();
        let parsed = RelationalSchemaObject::parse_from_schema_string(&text).unwrap();
        for (name, table) in schema.tables() {
            prop_assert_eq!(parsed.get_table(name).unwrap().compare_with_table(table), CompareResult::Equal);
        }
    }

    #[test]
    fn peers_agree_on_permitted_tables(local in schema_strategy(), remote in schema_strategy()) {
        let ours = RelationalSyncOpinion::make_local(&local, SchemaType::Relative);
        let theirs = RelationalSyncOpinion::make_local(&remote, SchemaType::Relative);
        let bytes = theirs.encode().unwrap();
        let received = RelationalSyncOpinion::decode(&bytes).unwrap();
        prop_assert_eq!(
            RelationalSyncStrategy::conclude(&ours, &received).permitted_tables(),
            RelationalSyncStrategy::conclude(&received, &ours).permitted_tables()
        );
    }

    #[test]
    fn enabling_cloud_never_invents_apps(
        account in cloud_info_strategy(TEST_USER, TEST_ACCOUNT),
        switches in switches_strategy(),
    ) {
        let harness = CloudHarness::new();
        harness.env.meta.save_meta(&account.key(), &account, true).unwrap();
        harness.service.enable_cloud(TEST_USER, TEST_ACCOUNT, &switches).unwrap();

        let stored = harness.stored_account().unwrap();
        prop_assert!(stored.enable_cloud);
        let known: Vec<&String> = account.apps.keys().collect();
        let stored_known: Vec<&String> = stored.apps.keys().collect();
        prop_assert_eq!(known, stored_known);
        for (bundle, app) in &stored.apps {
            let expected = switches.get(bundle).copied().unwrap_or(account.apps[bundle].cloud_switch);
            prop_assert_eq!(app.cloud_switch, expected);
        }
    }

    #[test]
    fn every_peer_id_finds_the_same_record(peers in peers_strategy(6)) {
        let env = TestEnv::memory();
        for peer in &peers {
            env.transport.add_peer(&peer.network_id, &peer.uuid, &peer.udid, false);
            env.registry.online(&DmDeviceInfo {
                network_id: peer.network_id.clone(),
                ..DmDeviceInfo::default()
            });
        }
        let mut by_uuid = BTreeMap::new();
        for peer in &peers {
            let record = env.registry.get_device_info(&peer.network_id);
            prop_assert_eq!(&record, &env.registry.get_device_info(&peer.uuid));
            prop_assert_eq!(&record, &env.registry.get_device_info(&peer.udid));
            by_uuid.insert(record.uuid.clone(), record);
        }
        prop_assert_eq!(by_uuid.len(), peers.len());
    }
}
