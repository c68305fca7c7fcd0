//! Per-key serialization.
//!
//! Every event for a business key is handled under that key's lock, so at
//! most one transition per key is in flight inside a process. Writers in
//! other processes are caught by the store's version check.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use common::BusinessKey;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<BusinessKey, Arc<AsyncMutex<()>>>;

/// A set of async locks, one per business key.
///
/// Entries are dropped once nobody holds or waits for them.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl KeyedLocks {
    /// Creates an empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for and takes the lock of `key`.
    pub async fn lock(&self, key: &BusinessKey) -> KeyGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(key.clone()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;

        KeyGuard {
            key: key.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Returns the number of keys currently locked or waited on.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

/// Holds a key's lock until dropped.
pub struct KeyGuard {
    key: BusinessKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl KeyGuard {
    /// Returns the locked key.
    pub fn key(&self) -> &BusinessKey {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Only the map still references the mutex: no holder, no waiter
        if let Ok(mut locks) = self.locks.lock()
            && let Some(mutex) = locks.get(&self.key)
            && Arc::strong_count(mutex) == 1
        {
            locks.remove(&self.key);
        }
    }
}

/// Maps a business key onto one of `partitions` workers.
///
/// The same key always lands on the same partition.
pub fn partition_for(key: &BusinessKey, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}
