//! Mutual exclusion keyed by transmission id.
//!
//! Unrelated transmissions never contend. Idle entries are removed when the
//! last guard for a key is dropped, so the map only holds keys in use.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A set of async mutexes created on demand per key.
pub struct KeyedLocks<K> {
    slots: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self { slots: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Creates an empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the lock for `key` is free and takes it.
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;

        KeyGuard { key: Some(key), slots: self.slots.clone(), guard: Some(guard) }
    }

    /// Number of keys currently locked or waited on.
    pub fn active_keys(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Holds the lock for one key until dropped.
pub struct KeyGuard<K: Eq + Hash> {
    key: Option<K>,
    slots: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        // Release before inspecting the slot so a waiter's clone is visible.
        drop(self.guard.take());

        let Some(key) = self.key.take() else { return };
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(&key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(&key);
        }
    }
}
