//! Test fixtures.
//!
//! [`TestEnv`] wires the framework the way the daemon does, over in-memory
//! collaborators, so cross-crate tests start from one line.

use ddms_cloud::{CloudContext, CloudService, MockCloudServer, RetryPolicy};
use ddms_core::account::StaticAccount;
use ddms_core::metadata::MetaPlane;
use ddms_core::{AutoCache, CacheConfig, ExecutorConfig, ExecutorPool, MetaConfig, MetaDataManager};
use ddms_device::{DeviceRegistry, MockDeviceTransport, RegistryConfig};
use ddms_share::{
    PublishedDataSubscriberManager, RdbSubscriberManager, SchedulerConfig, SchedulerManager,
    TemplateDataSource, TemplateManager,
};
use ddms_storage::{FileKvDelegate, KvDelegate, MemoryKvDelegate, StorageResult};
use ddms_store::{register_creators, MemoryKvEngine, MemoryRelationalEngine, StoreContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Foreground user of every fixture.
pub const TEST_USER: i32 = 100;
/// Cloud account id of every fixture.
pub const TEST_ACCOUNT: &str = "account-hash";
/// Uuid of the local device.
pub const TEST_UUID: &str = "uuid-local";
/// Application label the fixture's stores are registered under.
pub const TEST_LABEL: &str = "ddms";

/// A wired set of services with automatic cleanup.
pub struct TestEnv {
    /// Worker pool.
    pub executor: Arc<ExecutorPool>,
    /// Metadata over both planes.
    pub meta: Arc<MetaDataManager>,
    /// Programmable device manager.
    pub transport: Arc<MockDeviceTransport>,
    /// Device registry, initialised.
    pub registry: Arc<DeviceRegistry>,
    /// Foreground users and account.
    pub account: Arc<StaticAccount>,
    /// Store cache with both creators registered.
    pub cache: Arc<AutoCache>,
    /// KV sync engine.
    pub kv: Arc<MemoryKvEngine>,
    /// Relational sync engine.
    pub rdb: Arc<MemoryRelationalEngine>,
    /// Cloud provider.
    pub server: Arc<MockCloudServer>,
    _temp_dir: Option<TempDir>,
}

impl TestEnv {
    /// Creates an environment with in-memory metadata.
    pub fn memory() -> Self {
        Self::with_planes(
            Arc::new(MemoryKvDelegate::new()),
            Arc::new(MemoryKvDelegate::new()),
            None,
        )
    }

    /// Creates an environment with metadata journals in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let (synced, local) = open_journals(temp_dir.path());
        Self::with_planes(synced, local, Some(temp_dir))
    }

    /// Drops every service and opens the same journals again.
    ///
    /// Anything the caller still holds that shares this environment's
    /// metadata keeps the journal lock; drop it first.
    pub fn reopen(mut self) -> Self {
        let temp_dir = self
            ._temp_dir
            .take()
            .expect("Only file environments can be reopened");
        drop(self);
        let (synced, local) = open_journals(temp_dir.path());
        Self::with_planes(synced, local, Some(temp_dir))
    }

    fn with_planes(
        synced: Arc<dyn KvDelegate>,
        local: Arc<dyn KvDelegate>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let executor = Arc::new(
            ExecutorPool::new(&ExecutorConfig::new(2, 4).with_thread_name("ddms-test"))
                .expect("Failed to start executor"),
        );
        let opener = move |plane: MetaPlane| -> StorageResult<Arc<dyn KvDelegate>> {
            Ok(match plane {
                MetaPlane::Synced => Arc::clone(&synced),
                MetaPlane::Local => Arc::clone(&local),
            })
        };
        let meta = Arc::new(MetaDataManager::new(
            Arc::new(opener),
            MetaConfig::new().with_retry_interval(Duration::from_millis(10)),
        ));

        let transport = Arc::new(MockDeviceTransport::new());
        transport.set_local("net-local", TEST_UUID, "udid-local");
        transport.set_net_available(true);
        let registry = DeviceRegistry::new(Arc::clone(&transport) as _, RegistryConfig::default());
        registry.init(Arc::clone(&executor));
        let account = Arc::new(StaticAccount::new(vec![TEST_USER], TEST_ACCOUNT));

        let cache = Arc::new(AutoCache::new(CacheConfig::default()));
        let kv = Arc::new(MemoryKvEngine::new(TEST_UUID));
        let rdb = Arc::new(MemoryRelationalEngine::new());
        let store_context = StoreContext::new(
            Arc::clone(&meta),
            Arc::clone(&registry),
            Arc::clone(&account) as _,
            TEST_LABEL,
        );
        register_creators(
            &cache,
            Arc::clone(&kv) as _,
            Arc::clone(&rdb) as _,
            Arc::new(store_context),
        );

        Self {
            executor,
            meta,
            transport,
            registry,
            account,
            cache,
            kv,
            rdb,
            server: Arc::new(MockCloudServer::new()),
            _temp_dir: temp_dir,
        }
    }

    /// Directory holding the journals, if file-based.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Cloud collaborators over this environment.
    pub fn cloud_context(&self) -> Arc<CloudContext> {
        Arc::new(
            CloudContext::new(
                Arc::clone(&self.meta),
                Arc::clone(&self.cache),
                Arc::clone(&self.registry),
                Arc::clone(&self.account) as _,
            )
            .with_server(Arc::clone(&self.server) as _),
        )
    }

    /// A cloud service bound to this environment's executor.
    pub fn cloud_service(&self, policy: RetryPolicy) -> Arc<CloudService> {
        let service = CloudService::new(self.cloud_context(), policy);
        service
            .on_bind(Arc::clone(&self.executor))
            .expect("Failed to bind cloud service");
        service
    }

    /// Template and published data subscriptions over `source`.
    pub fn share(&self, source: Arc<dyn TemplateDataSource>, config: SchedulerConfig) -> SharePlane {
        let scheduler = SchedulerManager::new(Arc::clone(&self.meta), Arc::clone(&source), config);
        scheduler.bind(Arc::clone(&self.executor));
        let templates = Arc::new(TemplateManager::new(Arc::clone(&self.meta), Arc::clone(&scheduler)));
        let rdb = RdbSubscriberManager::new(
            Arc::clone(&templates),
            Arc::clone(&scheduler),
            Arc::clone(&source),
        );
        SharePlane {
            scheduler,
            templates,
            rdb,
            published: PublishedDataSubscriberManager::new(source),
        }
    }
}

/// The data share managers of a [`TestEnv`].
pub struct SharePlane {
    /// Template timers.
    pub scheduler: Arc<SchedulerManager>,
    /// Stored templates.
    pub templates: Arc<TemplateManager>,
    /// Template subscriptions.
    pub rdb: Arc<RdbSubscriberManager>,
    /// Published data subscriptions.
    pub published: Arc<PublishedDataSubscriberManager>,
}

fn open_journals(dir: &Path) -> (Arc<dyn KvDelegate>, Arc<dyn KvDelegate>) {
    let open = |name: &str| -> Arc<dyn KvDelegate> {
        Arc::new(FileKvDelegate::open(&dir.join(name)).expect("Failed to open journal"))
    };
    (open("synced"), open("local"))
}

/// Polls `done` until it holds or five seconds pass.
pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}
