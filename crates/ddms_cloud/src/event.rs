//! Events exchanged on the cloud topic.

use crate::retry::Retryer;
use ddms_core::store::{sync_mode, DetailAsync, GenQuery, StoreInfo};
use std::sync::Arc;
use std::time::Duration;

/// A request to sync one store with the cloud.
#[derive(Clone)]
pub struct SyncEvent {
    /// Store to sync.
    pub store: StoreInfo,
    /// Sync mode including its trigger bits.
    pub mode: i32,
    /// How long the caller waits.
    pub wait: Duration,
    /// Failures go through the retry policy instead of the callback.
    pub auto_retry: bool,
    /// Data to sync.
    pub query: GenQuery,
    /// Receives progress and the final outcome.
    pub on_detail: Option<DetailAsync>,
    /// Cloud account the sync runs for.
    pub account: String,
    /// Trace id propagated to the engine.
    pub trace_id: String,
    pub(crate) retryer: Option<Arc<Retryer>>,
}

impl SyncEvent {
    /// A sync of `store` in `mode` over every table.
    pub fn new(store: StoreInfo, mode: i32) -> Self {
        Self {
            store,
            mode,
            wait: Duration::ZERO,
            auto_retry: false,
            query: GenQuery::all(),
            on_detail: None,
            account: String::new(),
            trace_id: String::new(),
            retryer: None,
        }
    }

    /// Sets the query.
    #[must_use]
    pub fn with_query(mut self, query: GenQuery) -> Self {
        self.query = query;
        self
    }

    /// Sets the wait time.
    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Routes failures through the retry policy.
    #[must_use]
    pub fn with_auto_retry(mut self, auto_retry: bool) -> Self {
        self.auto_retry = auto_retry;
        self
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn with_callback(mut self, callback: DetailAsync) -> Self {
        self.on_detail = Some(callback);
        self
    }

    /// Sets the trace id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Returns true if the sync was triggered manually.
    ///
    /// Manual syncs are scheduled ahead of background ones.
    pub fn is_priority(&self) -> bool {
        sync_mode::is_priority(self.mode)
    }
}

impl std::fmt::Debug for SyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEvent")
            .field("store", &self.store)
            .field("mode", &self.mode)
            .field("auto_retry", &self.auto_retry)
            .field("query", &self.query)
            .field("priority", &self.is_priority())
            .finish()
    }
}

/// Events on the cloud topic.
#[derive(Debug, Clone)]
pub enum CloudEvent {
    /// The schema of a bundle is needed from the server.
    GetSchema(StoreInfo),
    /// A store should sync with the cloud.
    Sync(SyncEvent),
    /// An application changed local data and asks for a sync.
    LocalChange(SyncEvent),
    /// A cloud sync finished and changed local data.
    CloudSyncFinished(StoreInfo),
}

impl CloudEvent {
    /// Store the event is about.
    pub fn store(&self) -> &StoreInfo {
        match self {
            CloudEvent::GetSchema(store) | CloudEvent::CloudSyncFinished(store) => store,
            CloudEvent::Sync(event) | CloudEvent::LocalChange(event) => &event.store,
        }
    }
}
