//! Typed in-process event topics.
//!
//! Each topic is an [`EventBus`] over its own event type, so handlers never
//! downcast. Subscribing returns an [`EventGuard`]; dropping the guard
//! unsubscribes, which keeps handler lifetimes tied to their owners.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct BusInner<E> {
    next_id: AtomicU64,
    handlers: RwLock<BTreeMap<u64, Handler<E>>>,
}

/// A broadcast topic for events of type `E`.
///
/// Delivery is synchronous on the posting thread, in subscription order.
/// Handlers may subscribe, unsubscribe or post from inside a callback.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> EventBus<E> {
    /// Creates an empty topic.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                handlers: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Registers a handler for every future event.
    #[must_use = "dropping the guard unsubscribes the handler"]
    pub fn subscribe<F>(&self, handler: F) -> EventGuard<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().insert(id, Arc::new(handler));
        EventGuard {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `event` to every current handler.
    ///
    /// Returns the number of handlers invoked.
    pub fn post(&self, event: &E) -> usize {
        let handlers: Vec<Handler<E>> = self.inner.handlers.read().values().cloned().collect();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.read().len()
    }
}

/// Subscription handle returned by [`EventBus::subscribe`].
pub struct EventGuard<E> {
    id: u64,
    bus: Weak<BusInner<E>>,
}

impl<E> EventGuard<E> {
    /// Subscription id, unique within its topic.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<E> Drop for EventGuard<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.handlers.write().remove(&self.id);
        }
    }
}

impl<E> std::fmt::Debug for EventGuard<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventGuard").field("id", &self.id).finish()
    }
}
