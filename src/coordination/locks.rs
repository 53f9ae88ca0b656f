//! Per-repository mutual exclusion.
//!
//! Every operation that touches a checkout on disk goes through
//! [`RepositoryLocker::acquire`].  The registry hands out a reference-counted
//! lease on a per-key [`tokio::sync::Mutex`]; entries only exist while at
//! least one caller holds or waits for the lease, so the map stays bounded by
//! the number of currently contended repositories.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

use crate::model::RepositoryId;

struct LockEntry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    leases: usize,
}

/// Lease registry keyed by repository identity.
pub struct RepositoryLocker<K = RepositoryId> {
    // Short-lived std mutex: never held across an await point.
    entries: Mutex<HashMap<K, LockEntry>>,
}

impl<K> Default for RepositoryLocker<K> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> RepositoryLocker<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the entry for `key` and take one lease on it.
    pub fn lease(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        let entry = entries.entry(key.clone()).or_insert_with(|| LockEntry {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
            leases: 0,
        });
        entry.leases += 1;
        trace!(?key, leases = entry.leases, "lease taken");
        Arc::clone(&entry.mutex)
    }

    /// Drop one lease on `key`, evicting the entry once nobody holds it.
    ///
    /// The caller must already have unlocked the mutex returned by
    /// [`lease`](Self::lease).
    pub fn release(&self, key: &K) {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.leases = entry.leases.saturating_sub(1);
            trace!(?key, leases = entry.leases, "lease released");
            if entry.leases == 0 {
                entries.remove(key);
            }
        }
    }

    /// Lease and lock `key`.  Dropping the guard unlocks, then releases.
    ///
    /// Dropping the future while it waits for the lock also releases the
    /// lease.
    pub async fn acquire(self: &Arc<Self>, key: K) -> RepositoryGuard<K> {
        let mutex = self.lease(&key);
        let mut guard = RepositoryGuard {
            locker: Arc::clone(self),
            key,
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);
        guard
    }

    /// Number of keys with at least one outstanding lease.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scoped hold on one repository's critical section.
pub struct RepositoryGuard<K = RepositoryId>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    locker: Arc<RepositoryLocker<K>>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> RepositoryGuard<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for RepositoryGuard<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn drop(&mut self) {
        // Unlock strictly before the lease goes away.
        drop(self.guard.take());
        self.locker.release(&self.key);
    }
}
