//! Collaborators shared by the sync manager and the cloud service.

use crate::event::CloudEvent;
use crate::server::CloudServer;
use ddms_core::account::AccountDelegate;
use ddms_core::{AutoCache, EventBus, MetaDataManager};
use ddms_device::DeviceRegistry;
use std::sync::Arc;

/// Services cloud sync needs.
#[derive(Clone)]
pub struct CloudContext {
    /// Cloud, schema and store metadata.
    pub meta: Arc<MetaDataManager>,
    /// Open stores.
    pub cache: Arc<AutoCache>,
    /// Local device identity and network state.
    pub registry: Arc<DeviceRegistry>,
    /// Foreground users.
    pub account: Arc<dyn AccountDelegate>,
    /// The cloud provider; cloud sync is unsupported without one.
    pub server: Option<Arc<dyn CloudServer>>,
    /// The cloud event topic.
    pub events: EventBus<CloudEvent>,
}

impl CloudContext {
    /// Creates a context without a cloud server.
    pub fn new(
        meta: Arc<MetaDataManager>,
        cache: Arc<AutoCache>,
        registry: Arc<DeviceRegistry>,
        account: Arc<dyn AccountDelegate>,
    ) -> Self {
        Self {
            meta,
            cache,
            registry,
            account,
            server: None,
            events: EventBus::new(),
        }
    }

    /// Attaches a cloud server.
    #[must_use]
    pub fn with_server(mut self, server: Arc<dyn CloudServer>) -> Self {
        self.server = Some(server);
        self
    }

    /// Shares an existing event topic.
    #[must_use]
    pub fn with_events(mut self, events: EventBus<CloudEvent>) -> Self {
        self.events = events;
        self
    }
}

impl std::fmt::Debug for CloudContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudContext")
            .field("server", &self.server.is_some())
            .field("subscribers", &self.events.subscriber_count())
            .finish()
    }
}
