//! Per-digest reader/writer locks
//!
//! Locks are held in-process only. Lookups and copies out of an entry take
//! the read side; storing and evicting take the write side. Idle locks are
//! pruned by the janitor so the table does not grow without bound.

use crate::cache::digest::ContentDigest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Table of reader/writer locks keyed by content digest
#[derive(Debug, Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<ContentDigest, Arc<RwLock<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, digest: &ContentDigest) -> Arc<RwLock<()>> {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(table.entry(digest.clone()).or_default())
    }

    /// Shared access; waits for any writer of the same digest
    pub async fn read(&self, digest: &ContentDigest) -> OwnedRwLockReadGuard<()> {
        self.lock_for(digest).read_owned().await
    }

    /// Exclusive access; waits for all readers and writers of the same digest
    pub async fn write(&self, digest: &ContentDigest) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(digest).write_owned().await
    }

    /// Exclusive access without waiting; `None` if the digest is in use
    pub fn try_write(&self, digest: &ContentDigest) -> Option<OwnedRwLockWriteGuard<()>> {
        self.lock_for(digest).try_write_owned().ok()
    }

    /// Drop locks nobody currently holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = table.len();
        table.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
