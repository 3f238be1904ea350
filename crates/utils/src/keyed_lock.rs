//! Per-key async mutual exclusion with immediate cleanup of idle keys

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable<K> = Arc<DashMap<K, Weak<Mutex<()>>>>;

/// Guard of a [`KeyedLock`] key.
///
/// Dropping the last guard (or waiter) of a key removes the key from the table.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Arc<Mutex<()>>,
    key: K,
    table: LockTable<K>,
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());

        // The owned guard held its own Arc; once it is gone a count of one means
        // nobody else waits on this key.
        if Arc::strong_count(&self.mutex) == 1 {
            self.table
                .remove_if(&self.key, |_, weak| weak.strong_count() <= 1);
        }
    }
}

/// Serializes async critical sections per key.
///
/// Sections for the same key run one after another, sections for different keys run
/// concurrently. The agent keys it by pod UID so that runtime callbacks for one pod
/// never interleave while callbacks for different pods proceed in parallel.
///
/// Keys are stored as weak references and vanish as soon as the last guard is dropped,
/// so the table only ever holds keys that are locked or awaited.
pub struct KeyedLock<K>
where
    K: Hash + Eq + Clone,
{
    table: LockTable<K>,
}

impl<K> KeyedLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            table: Arc::new(DashMap::new()),
        }
    }

    /// Waits until `key` is free and returns the guard holding it.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let mutex = self.mutex_for(key);
        let guard = Arc::clone(&mutex).lock_owned().await;

        KeyedLockGuard {
            guard: Some(guard),
            mutex,
            key: key.clone(),
            table: Arc::clone(&self.table),
        }
    }

    fn mutex_for(&self, key: &K) -> Arc<Mutex<()>> {
        loop {
            match self.table.entry(key.clone()) {
                Entry::Occupied(occupied) => {
                    if let Some(strong) = occupied.get().upgrade() {
                        return strong;
                    }
                    occupied.remove();
                }
                Entry::Vacant(vacant) => {
                    let strong = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&strong));
                    return strong;
                }
            }
        }
    }

    /// Number of keys currently locked or awaited.
    pub fn held_keys(&self) -> usize {
        self.table
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}

impl<K> Default for KeyedLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
