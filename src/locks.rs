// Keyed locks - serialise work per key without a global lock
//
// Each key gets its own mutex, created on first use and dropped again once no
// caller holds or waits on it. Sets of keys are always taken in key order, so
// two callers with overlapping sets cannot deadlock.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::Arc;

pub struct KeyedLocks<K: Eq + Hash + Clone> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        KeyedLocks {
            locks: DashMap::new(),
        }
    }

    /// Run `f` while holding the lock for `key`
    pub fn with_lock<T>(&self, key: &K, f: impl FnOnce() -> T) -> T {
        let lock = self.handle(key);

        let result = {
            let _guard = lock.lock();
            f()
        };

        self.release(key, lock);
        result
    }

    /// Run `f` while holding the lock of every key in `keys`
    pub fn with_locks<T>(&self, keys: &BTreeSet<K>, f: impl FnOnce() -> T) -> T
    where
        K: Ord,
    {
        let handles: Vec<(K, Arc<Mutex<()>>)> = keys.iter().map(|k| (k.clone(), self.handle(k))).collect();

        let result = {
            let _guards: Vec<_> = handles.iter().map(|(_, lock)| lock.lock()).collect();
            f()
        };

        for (key, lock) in handles {
            self.release(&key, lock);
        }
        result
    }

    // Clone the Arc out so the shard lock is released before we block
    fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release(&self, key: &K, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(key, |_, l| Arc::strong_count(l) == 1);
    }

    /// Keys with a live lock (held or awaited)
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
