//! Observer handles and the payloads delivered to them.
//!
//! An [`ObserverHandle`] stands in for a callback living in another
//! process. Registries hold the handle, never a raw reference to the
//! callback, and identify it by a stable id. When the owning process goes
//! away the handle is killed, which runs every death recipient linked to
//! it exactly once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Stable id of an observer handle.
pub type ObserverId = u64;

/// Process identity of the caller registering an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Caller {
    /// Access token of the calling application.
    pub token_id: u32,
    /// Process id of the caller.
    pub pid: u32,
}

impl Caller {
    /// Creates a caller identity.
    pub fn new(token_id: u32, pid: u32) -> Self {
        Self { token_id, pid }
    }
}

/// Change payload for a template subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RdbChangeNode {
    /// Subscribed URI.
    pub uri: String,
    /// Subscriber id of the template.
    pub subscriber_id: i64,
    /// Bundle owning the template.
    pub bundle_name: String,
    /// One JSON object per predicate with a non-empty result.
    pub data: Vec<String>,
}

/// Value of a published data item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishedValue {
    /// Text value.
    Text(String),
    /// Binary value.
    Bytes(Vec<u8>),
}

/// One published data item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedItem {
    /// Published key.
    pub key: String,
    /// Subscriber id the item was published for.
    pub subscriber_id: i64,
    /// Current value.
    pub value: PublishedValue,
}

/// Change payload for published data subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedDataChangeNode {
    /// Bundle that published the data.
    pub owner_bundle_name: String,
    /// Changed items.
    pub datas: Vec<PublishedItem>,
}

/// Receives template change notifications.
pub trait RdbObserver: Send + Sync {
    /// Called with the predicate results of a template.
    fn on_change_from_rdb(&self, change: &RdbChangeNode);
}

/// Receives published data change notifications.
pub trait PublishedDataObserver: Send + Sync {
    /// Called with the changed items.
    fn on_change_from_published_data(&self, change: &PublishedDataChangeNode);
}

type DeathRecipient = Box<dyn FnOnce(ObserverId) + Send>;

struct Remote {
    alive: AtomicBool,
    recipients: Mutex<Vec<DeathRecipient>>,
}

/// Shared handle to a remote observer.
///
/// Clones share the id, the callback and the death state.
pub struct ObserverHandle<T: ?Sized> {
    id: ObserverId,
    callback: Arc<T>,
    remote: Arc<Remote>,
}

impl<T: ?Sized> ObserverHandle<T> {
    /// Wraps `callback` in a live handle with a fresh id.
    pub fn new(callback: Arc<T>) -> Self {
        Self {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            callback,
            remote: Arc::new(Remote {
                alive: AtomicBool::new(true),
                recipients: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Stable id of the handle.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// The wrapped callback.
    pub fn callback(&self) -> &T {
        &self.callback
    }

    /// Returns false once the owning process died.
    pub fn is_alive(&self) -> bool {
        self.remote.alive.load(Ordering::Acquire)
    }

    /// Runs `recipient` when the owning process dies.
    ///
    /// Returns false, without linking, if it already died.
    pub fn link_to_death(&self, recipient: impl FnOnce(ObserverId) + Send + 'static) -> bool {
        let mut recipients = self.remote.recipients.lock();
        if !self.is_alive() {
            return false;
        }
        recipients.push(Box::new(recipient));
        true
    }

    /// Marks the owning process dead and runs the linked recipients.
    pub fn kill(&self) {
        let recipients = {
            let mut recipients = self.remote.recipients.lock();
            if !self.remote.alive.swap(false, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *recipients)
        };
        for recipient in recipients {
            recipient(self.id);
        }
    }
}

impl<T: ?Sized> Clone for ObserverHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
            remote: Arc::clone(&self.remote),
        }
    }
}

impl<T: ?Sized> PartialEq for ObserverHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: ?Sized> Eq for ObserverHandle<T> {}

impl<T: ?Sized> std::fmt::Debug for ObserverHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Observer that records what it receives.
#[derive(Default)]
pub struct RecordingObserver {
    rdb: Mutex<Vec<RdbChangeNode>>,
    published: Mutex<Vec<PublishedDataChangeNode>>,
}

impl RecordingObserver {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Template notifications received so far.
    pub fn rdb_changes(&self) -> Vec<RdbChangeNode> {
        self.rdb.lock().clone()
    }

    /// Published data notifications received so far.
    pub fn published_changes(&self) -> Vec<PublishedDataChangeNode> {
        self.published.lock().clone()
    }

    /// Forgets everything received.
    pub fn reset(&self) {
        self.rdb.lock().clear();
        self.published.lock().clear();
    }
}

impl RdbObserver for RecordingObserver {
    fn on_change_from_rdb(&self, change: &RdbChangeNode) {
        self.rdb.lock().push(change.clone());
    }
}

impl PublishedDataObserver for RecordingObserver {
    fn on_change_from_published_data(&self, change: &PublishedDataChangeNode) {
        self.published.lock().push(change.clone());
    }
}
