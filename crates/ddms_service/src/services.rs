//! The composition root.
//!
//! [`Services::build`] constructs every long-lived service once and hands
//! each its dependencies. Nothing here is a process-wide singleton, so
//! tests build as many independent instances as they like.

use crate::config::ServiceConfig;
use crate::error::ServiceResult;
use ddms_cloud::{CloudContext, CloudServer, CloudService, NET_UUID};
use ddms_core::account::{AccountDelegate, StaticAccount};
use ddms_core::dfx::{DfxReporter, TracingReporter};
use ddms_core::metadata::MetaPlane;
use ddms_core::{AutoCache, ExecutorPool, MetaDataManager};
use ddms_device::{
    ChangeLevel, DeviceChangeListener, DeviceChangeType, DeviceInfo, DeviceRegistry,
    DeviceTransport, MockDeviceTransport, WatchId, CLOUD_DEVICE_UUID,
};
use ddms_share::{
    MemoryTemplateDataSource, PublishedDataSubscriberManager, RdbSubscriberManager,
    SchedulerManager, TemplateDataSource, TemplateManager,
};
use ddms_storage::{FileKvDelegate, KvDelegate, MemoryKvDelegate, StorageResult};
use ddms_store::{
    register_creators, KvEngine, MemoryKvEngine, MemoryRelationalEngine, RelationalEngine,
    StoreContext,
};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Application id the service's own stores are registered under.
pub const PROCESS_LABEL: &str = "ddms";

/// Outside systems the services talk to.
pub struct Collaborators {
    /// Platform device manager.
    pub transport: Arc<dyn DeviceTransport>,
    /// Foreground users and account.
    pub account: Arc<dyn AccountDelegate>,
    /// KV sync engine.
    pub kv_engine: Arc<dyn KvEngine>,
    /// Relational sync engine.
    pub rdb_engine: Arc<dyn RelationalEngine>,
    /// Cloud provider, if any.
    pub cloud_server: Option<Arc<dyn CloudServer>>,
    /// Store behind data share templates.
    pub template_source: Arc<dyn TemplateDataSource>,
    /// Telemetry sink.
    pub dfx: Arc<dyn DfxReporter>,
}

impl Collaborators {
    /// In-process collaborators for running without a platform.
    ///
    /// The local device gets `config.local_uuid`, or a fresh random uuid.
    pub fn standalone(config: &ServiceConfig) -> Self {
        let uuid = config
            .local_uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let transport = MockDeviceTransport::new();
        transport.set_local(&format!("net-{uuid}"), &uuid, &format!("udid-{uuid}"));
        transport.set_net_available(true);
        Self {
            transport: Arc::new(transport),
            account: Arc::new(StaticAccount::new(config.users.clone(), config.account_id.clone())),
            kv_engine: Arc::new(MemoryKvEngine::new(uuid)),
            rdb_engine: Arc::new(MemoryRelationalEngine::new()),
            cloud_server: None,
            template_source: Arc::new(MemoryTemplateDataSource::new()),
            dfx: Arc::new(TracingReporter),
        }
    }
}

/// Every service of the daemon.
pub struct Services {
    /// Shared worker pool.
    pub executor: Arc<ExecutorPool>,
    /// Durable metadata.
    pub meta: Arc<MetaDataManager>,
    /// Device identity and presence.
    pub registry: Arc<DeviceRegistry>,
    /// Open general stores.
    pub cache: Arc<AutoCache>,
    /// Cloud sync.
    pub cloud: Arc<CloudService>,
    /// Template timers.
    pub scheduler: Arc<SchedulerManager>,
    /// Data share templates.
    pub templates: Arc<TemplateManager>,
    /// Template subscriptions.
    pub rdb_subscribers: Arc<RdbSubscriberManager>,
    /// Published data subscriptions.
    pub published_subscribers: Arc<PublishedDataSubscriberManager>,
    dfx: Arc<dyn DfxReporter>,
    network_watch: Option<WatchId>,
}

impl Services {
    /// Builds and starts every service.
    pub fn build(config: &ServiceConfig, collaborators: Collaborators) -> ServiceResult<Self> {
        let executor = Arc::new(ExecutorPool::new(&config.executor_config())?);
        let meta = Arc::new(open_metadata(config)?);

        let registry = DeviceRegistry::new(collaborators.transport, config.registry_config());
        registry.init(Arc::clone(&executor));

        let cache = Arc::new(AutoCache::new(config.cache_config()));
        cache.bind(&executor);
        let store_context = Arc::new(StoreContext::new(
            Arc::clone(&meta),
            Arc::clone(&registry),
            Arc::clone(&collaborators.account),
            PROCESS_LABEL,
        ));
        register_creators(
            &cache,
            collaborators.kv_engine,
            collaborators.rdb_engine,
            store_context,
        );

        let mut cloud_context = CloudContext::new(
            Arc::clone(&meta),
            Arc::clone(&cache),
            Arc::clone(&registry),
            collaborators.account,
        );
        if let Some(server) = collaborators.cloud_server {
            cloud_context = cloud_context.with_server(server);
        }
        let cloud = CloudService::new(Arc::new(cloud_context), config.retry_policy());
        cloud.on_bind(Arc::clone(&executor))?;
        cloud.on_initialize();
        let listener: Arc<dyn DeviceChangeListener> = Arc::new(NetworkListener(Arc::downgrade(&cloud)));
        let network_watch = match registry.start_watch_device_change(Some(listener)) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "cloud will not follow the network");
                None
            }
        };

        let scheduler = SchedulerManager::new(
            Arc::clone(&meta),
            Arc::clone(&collaborators.template_source),
            config.scheduler_config(),
        );
        scheduler.bind(Arc::clone(&executor));
        let templates = Arc::new(TemplateManager::new(Arc::clone(&meta), Arc::clone(&scheduler)));
        let rdb_subscribers = RdbSubscriberManager::new(
            Arc::clone(&templates),
            Arc::clone(&scheduler),
            Arc::clone(&collaborators.template_source),
        );
        let published_subscribers =
            PublishedDataSubscriberManager::new(collaborators.template_source);

        collaborators.dfx.report_behaviour("service_start", ddms_core::VERSION);
        info!(
            version = ddms_core::VERSION,
            persistent = config.data_dir.is_some(),
            device_ready = registry.is_initialized(),
            "services ready"
        );
        Ok(Self {
            executor,
            meta,
            registry,
            cache,
            cloud,
            scheduler,
            templates,
            rdb_subscribers,
            published_subscribers,
            dfx: collaborators.dfx,
            network_watch,
        })
    }

    /// A client process exited; drops everything it subscribed.
    pub fn on_process_exit(&self, token_id: u32, pid: u32) {
        self.rdb_subscribers.delete_by_process(token_id, pid);
        self.published_subscribers.delete_by_process(token_id, pid);
    }

    /// The wall clock or time zone changed; re-arms template timers.
    pub fn on_time_changed(&self) {
        self.scheduler.re_execute_all();
    }

    /// Stops timers and closes every open store.
    ///
    /// Returns the number of stores closed.
    pub fn shutdown(&self) -> usize {
        if let Some(id) = self.network_watch {
            if let Err(err) = self.registry.stop_watch_device_change(id) {
                warn!(error = %err, "network listener already gone");
            }
        }
        self.scheduler.clear_timer();
        self.cache.unbind(&self.executor);
        let closed = self.cache.close_all();
        self.dfx.report_behaviour("service_stop", &closed.to_string());
        info!(closed, "services stopped");
        closed
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("executor", &self.executor)
            .field("registry", &self.registry)
            .field("stores", &self.cache.store_count())
            .finish_non_exhaustive()
    }
}

/// Opens the metadata journals under `data_dir`, or in-memory planes.
fn open_metadata(config: &ServiceConfig) -> ServiceResult<MetaDataManager> {
    let (synced, local): (Arc<dyn KvDelegate>, Arc<dyn KvDelegate>) = match &config.data_dir {
        Some(dir) => (
            Arc::new(FileKvDelegate::open(&dir.join("synced"))?),
            Arc::new(FileKvDelegate::open(&dir.join("local"))?),
        ),
        None => (Arc::new(MemoryKvDelegate::new()), Arc::new(MemoryKvDelegate::new())),
    };
    let opener = move |plane: MetaPlane| -> StorageResult<Arc<dyn KvDelegate>> {
        Ok(match plane {
            MetaPlane::Synced => Arc::clone(&synced),
            MetaPlane::Local => Arc::clone(&local),
        })
    };
    Ok(MetaDataManager::new(Arc::new(opener), config.meta_config()))
}

/// Brings cloud sync up and down with the network.
struct NetworkListener(Weak<CloudService>);

impl DeviceChangeListener for NetworkListener {
    fn on_device_changed(&self, info: &DeviceInfo, change: DeviceChangeType) {
        if info.uuid != CLOUD_DEVICE_UUID {
            return;
        }
        let Some(cloud) = self.0.upgrade() else {
            return;
        };
        let result = match change {
            DeviceChangeType::Online => cloud.on_network_online(NET_UUID),
            DeviceChangeType::Offline => cloud.on_network_offline(NET_UUID),
            DeviceChangeType::Ready => Ok(()),
        };
        if let Err(err) = result {
            warn!(error = %err, ?change, "cloud did not follow the network");
        }
    }

    fn change_level(&self) -> ChangeLevel {
        ChangeLevel::Min
    }
}
