//! Cross-crate scenario helpers.
//!
//! [`CloudHarness`] provisions one cloud account with one relational store
//! and records every sync the manager dispatches, so tests can assert on
//! what reached the engine.

use crate::fixtures::{TestEnv, TEST_ACCOUNT, TEST_USER, TEST_UUID};
use ddms_cloud::{CloudEvent, CloudService, RetryPolicy};
use ddms_core::metadata::{store_type, AppInfo, CloudInfo, Database, SchemaMeta, StoreMetaData};
use ddms_core::store::StoreInfo;
use ddms_core::EventGuard;
use ddms_store::EngineCall;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Bundle every harness account knows.
pub const TEST_BUNDLE: &str = "com.example.notes";
/// Relational store of [`TEST_BUNDLE`].
pub const TEST_STORE: &str = "notes";
/// Token id the store belongs to.
pub const TEST_TOKEN: u32 = 7;

/// A bound cloud service over a [`TestEnv`], recording dispatched syncs.
pub struct CloudHarness {
    /// The wired environment.
    pub env: TestEnv,
    /// The service under test.
    pub service: Arc<CloudService>,
    syncs: Arc<Mutex<Vec<StoreInfo>>>,
    _watch: EventGuard<CloudEvent>,
}

impl CloudHarness {
    /// Creates a harness with the default retry policy.
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    /// Creates a harness whose retries are quick enough for tests.
    pub fn quick() -> Self {
        Self::with_policy(
            RetryPolicy::default()
                .with_max_times(3)
                .with_retry_interval(Duration::from_millis(20))
                .with_locked_interval(Duration::from_millis(20))
                .with_busy_interval(Duration::from_millis(20))
                .with_backoff_multiplier(1.0),
        )
    }

    /// Creates a harness with `policy`.
    pub fn with_policy(policy: RetryPolicy) -> Self {
        let env = TestEnv::memory();
        let service = env.cloud_service(policy);
        let syncs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&syncs);
        let watch = service.context().events.subscribe(move |event: &CloudEvent| {
            if let CloudEvent::Sync(event) = event {
                sink.lock().push(event.store.clone());
            }
        });
        Self {
            env,
            service,
            syncs,
            _watch: watch,
        }
    }

    /// The harness account with cloud `enable` and the bundle `switch`.
    pub fn account(enable: bool, switch: bool) -> CloudInfo {
        let mut info = CloudInfo::new(TEST_USER);
        info.id = TEST_ACCOUNT.into();
        info.enable_cloud = enable;
        info.apps.insert(
            TEST_BUNDLE.into(),
            AppInfo {
                bundle_name: TEST_BUNDLE.into(),
                cloud_switch: switch,
                ..AppInfo::default()
            },
        );
        info
    }

    /// Metadata of the harness store.
    pub fn store_meta() -> StoreMetaData {
        let mut meta = StoreMetaData::new(TEST_UUID, TEST_USER.to_string(), TEST_BUNDLE, TEST_STORE);
        meta.store_type = store_type::RELATIONAL;
        meta.token_id = TEST_TOKEN;
        meta
    }

    /// Saves `info`, the bundle schema and the store metadata.
    pub fn provision_with(&self, info: &CloudInfo) {
        let meta = &self.env.meta;
        meta.save_meta(&info.key(), info, true)
            .expect("Failed to save cloud info");
        let schema = SchemaMeta {
            version: 1,
            bundle_name: TEST_BUNDLE.into(),
            databases: vec![Database {
                name: TEST_STORE.into(),
                alias: format!("cloud_{TEST_STORE}"),
                ..Database::default()
            }],
        };
        meta.save_meta(&info.schema_key(TEST_BUNDLE, 0), &schema, true)
            .expect("Failed to save schema");
        let store = Self::store_meta();
        meta.save_meta(&store.key(), &store, false)
            .expect("Failed to save store metadata");
    }

    /// Provisions the harness account with cloud `enable` and the bundle `switch`.
    pub fn provision(&self, enable: bool, switch: bool) {
        self.provision_with(&Self::account(enable, switch));
    }

    /// Stored cloud info of the harness user.
    pub fn stored_account(&self) -> Option<CloudInfo> {
        self.env
            .meta
            .load_meta(&CloudInfo::new(TEST_USER).key(), true)
    }

    /// Syncs the manager dispatched, in order.
    pub fn sync_events(&self) -> Vec<StoreInfo> {
        self.syncs.lock().clone()
    }

    /// Cloud syncs the relational engine ran for the harness store.
    pub fn cloud_syncs(&self) -> usize {
        self.env
            .rdb
            .delegate(TEST_STORE)
            .map(|delegate| {
                delegate
                    .calls()
                    .iter()
                    .filter(|call| matches!(call, EngineCall::CloudSync { .. }))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for CloudHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_saves_everything_a_sync_needs() {
        let harness = CloudHarness::new();
        assert!(harness.stored_account().is_none());
        harness.provision(true, true);

        let stored = harness.stored_account().unwrap();
        assert!(stored.is_on(TEST_BUNDLE));
        let schemas: Vec<SchemaMeta> = harness
            .env
            .meta
            .load_meta_list(&stored.schema_prefix(TEST_BUNDLE), true)
            .unwrap();
        assert_eq!(schemas.len(), 1);
        assert!(schemas[0].get_database(TEST_STORE).is_some());
        assert!(harness.sync_events().is_empty());
        assert_eq!(harness.cloud_syncs(), 0);
    }
}
