//! Reference counting with a one-shot release hook.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};

type OnZero = Box<dyn FnOnce() + Send>;

/// Explicit reference count for objects handed out by caches.
///
/// Starts at one. Once the count reaches zero the counter is a tombstone:
/// further `add_ref` calls fail and the release hook has run exactly once.
pub struct RefCounter {
    count: AtomicI32,
    on_zero: Mutex<Option<OnZero>>,
}

impl Default for RefCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCounter {
    /// Creates a counter holding one reference.
    pub fn new() -> Self {
        Self {
            count: AtomicI32::new(1),
            on_zero: Mutex::new(None),
        }
    }

    /// Installs the hook run when the last reference is released.
    pub fn set_on_zero<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_zero.lock() = Some(Box::new(hook));
    }

    /// Takes a reference. Returns the new count, or 0 on a tombstone.
    pub fn add_ref(&self) -> i32 {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return 0;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current + 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops a reference. Returns the new count.
    pub fn release(&self) -> i32 {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return 0;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let remaining = current - 1;
        if remaining == 0 {
            let hook = self.on_zero.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        remaining
    }

    /// Current count.
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true once the count has reached zero.
    pub fn is_dead(&self) -> bool {
        self.count() <= 0
    }
}

impl std::fmt::Debug for RefCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCounter")
            .field("count", &self.count())
            .finish()
    }
}
