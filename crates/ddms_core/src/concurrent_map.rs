//! A map whose entries are mutated under per-key locks.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

type Slot<V> = Arc<Mutex<Option<V>>>;

/// Concurrent map with per-key compute semantics.
///
/// The index is a [`DashMap`] of per-key slots. Shard guards are released
/// before a slot is locked, so closures passed to the `compute` family run
/// while holding only the lock of the affected key: long running work for
/// one key (opening a store, say) neither blocks keys sharing its shard nor
/// deadlocks when it reads the map again.
///
/// Iteration works on snapshots ordered by key.
pub struct ConcurrentMap<K, V> {
    entries: DashMap<K, Slot<V>>,
}

impl<K: Ord + Hash + Clone, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Hash + Clone, V> ConcurrentMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Inserts or replaces a value. Returns the previous one.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let slot = self.entries.insert(key, Arc::new(Mutex::new(Some(value))));
        slot.and_then(|s| s.lock().take())
    }

    /// Mutates the entry for `key`, creating it with `V::default()` if absent.
    ///
    /// The entry is removed when `action` returns false. Returns whether
    /// the entry exists afterwards.
    pub fn compute<F>(&self, key: K, action: F) -> bool
    where
        V: Default,
        F: FnOnce(&K, &mut V) -> bool,
    {
        let mut action = Some(action);
        loop {
            let slot = Arc::clone(
                self.entries
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(Some(V::default()))))
                    .value(),
            );
            let mut guard = slot.lock();
            let Some(value) = guard.as_mut() else {
                continue;
            };
            let Some(action) = action.take() else {
                return true;
            };
            if action(&key, value) {
                return true;
            }
            *guard = None;
            self.detach(&key, &slot);
            return false;
        }
    }

    /// Inserts the value produced by `make` if `key` is absent.
    ///
    /// `make` runs without any lock held. When another caller inserts the
    /// key first, the made value is dropped. Returns true if a value was
    /// inserted.
    pub fn compute_if_absent<F>(&self, key: K, make: F) -> bool
    where
        F: FnOnce(&K) -> V,
    {
        if self.entries.contains_key(&key) {
            return false;
        }
        let value = make(&key);
        match self.entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(Some(value))));
                true
            }
        }
    }

    /// Mutates the entry for `key` only if present.
    ///
    /// The entry is removed when `action` returns false. Returns whether
    /// the entry exists afterwards.
    pub fn compute_if_present<F>(&self, key: &K, action: F) -> bool
    where
        F: FnOnce(&K, &mut V) -> bool,
    {
        let Some(slot) = self.slot(key) else {
            return false;
        };
        let mut guard = slot.lock();
        let Some(value) = guard.as_mut() else {
            return false;
        };
        if action(key, value) {
            return true;
        }
        *guard = None;
        self.detach(key, &slot);
        false
    }

    /// Returns a copy of the value for `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let slot = self.slot(key)?;
        let guard = slot.lock();
        guard.clone()
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes and returns the value for `key`.
    pub fn erase(&self, key: &K) -> Option<V> {
        let (_, slot) = self.entries.remove(key)?;
        let mut guard = slot.lock();
        guard.take()
    }

    /// Removes every entry for which `predicate` returns true.
    ///
    /// Returns the number of entries removed.
    pub fn erase_if<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        let mut removed = 0;
        for (key, slot) in self.snapshot() {
            let mut guard = slot.lock();
            let erase = match guard.as_mut() {
                Some(value) => predicate(&key, value),
                None => false,
            };
            if erase {
                *guard = None;
                self.detach(&key, &slot);
                removed += 1;
            }
        }
        removed
    }

    /// Visits a snapshot of the entries; stops early when `visit` returns true.
    pub fn for_each_copies<F>(&self, mut visit: F)
    where
        V: Clone,
        F: FnMut(&K, &V) -> bool,
    {
        for (key, slot) in self.snapshot() {
            let value = slot.lock().clone();
            if let Some(value) = value {
                if visit(&key, &value) {
                    return;
                }
            }
        }
    }

    /// Keys currently present, in order.
    pub fn keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn slot(&self, key: &K) -> Option<Slot<V>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    fn snapshot(&self) -> Vec<(K, Slot<V>)> {
        let mut entries: Vec<(K, Slot<V>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn detach(&self, key: &K, slot: &Slot<V>) {
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn compute_creates_and_removes() {
        let map: ConcurrentMap<&str, u32> = ConcurrentMap::new();
        assert!(map.compute("a", |_, v| {
            *v += 1;
            true
        }));
        assert_eq!(map.get(&"a"), Some(1));
        assert!(!map.compute("a", |_, _| false));
        assert!(!map.contains(&"a"));
    }

    #[test]
    fn compute_if_absent_runs_once() {
        let map: ConcurrentMap<u32, String> = ConcurrentMap::new();
        assert!(map.compute_if_absent(1, |k| format!("v{k}")));
        assert!(!map.compute_if_absent(1, |_| unreachable!()));
        assert_eq!(map.get(&1).as_deref(), Some("v1"));
    }

    #[test]
    fn compute_if_present_skips_missing() {
        let map: ConcurrentMap<u32, u32> = ConcurrentMap::new();
        assert!(!map.compute_if_present(&9, |_, _| true));
        map.insert(9, 1);
        assert!(map.compute_if_present(&9, |_, v| {
            *v = 2;
            true
        }));
        assert_eq!(map.get(&9), Some(2));
    }

    #[test]
    fn erase_if_and_iteration() {
        let map: ConcurrentMap<u32, u32> = ConcurrentMap::new();
        for i in 0..10 {
            map.insert(i, i * i);
        }
        assert_eq!(map.erase_if(|k, _| k % 2 == 0), 5);
        let mut seen = Vec::new();
        map.for_each_copies(|k, _| {
            seen.push(*k);
            false
        });
        assert_eq!(seen, vec![1, 3, 5, 7, 9]);
        assert_eq!(map.erase(&3), Some(9));
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn concurrent_compute_creates_once() {
        let map = Arc::new(ConcurrentMap::<u32, u32>::new());
        let created = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                let created = Arc::clone(&created);
                thread::spawn(move || {
                    map.compute(1, |_, v| {
                        if *v == 0 {
                            created.fetch_add(1, Ordering::SeqCst);
                        }
                        *v += 1;
                        true
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(map.get(&1), Some(8));
    }

    #[test]
    fn make_may_read_the_map() {
        let map: ConcurrentMap<u32, u32> = ConcurrentMap::new();
        map.insert(1, 10);
        assert!(map.compute_if_absent(2, |_| map.get(&1).unwrap_or(0) + 1));
        assert_eq!(map.get(&2), Some(11));
    }

    #[test]
    fn compute_on_one_key_does_not_block_another() {
        let map = Arc::new(ConcurrentMap::<u32, u32>::new());
        map.insert(2, 0);
        let inner = Arc::clone(&map);
        assert!(map.compute(1, move |_, v| {
            *v = inner.get(&2).unwrap_or(0) + 1;
            inner.compute_if_present(&2, |_, other| {
                *other = 5;
                true
            })
        }));
        assert_eq!(map.get(&1), Some(1));
        assert_eq!(map.get(&2), Some(5));
    }
}
