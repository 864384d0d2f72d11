//! Per-record locks.
//!
//! A ratchet step reads a record, advances it and writes it back; two steps
//! on the same session or sender key must not interleave. Unrelated records
//! proceed concurrently.
//!
//! Every record lock also holds the shared side of a store-wide gate.
//! Whole-store operations (backup and restore) take the exclusive side, so
//! they never observe or overwrite a half-finished step. A task must not
//! hold one guard while acquiring another.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

use sigil_protocol::ProtocolAddress;
use uuid::Uuid;

/// Retained entries before idle locks are pruned.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Session(ProtocolAddress),
    SenderKey(ProtocolAddress, Uuid),
}

/// Held for the duration of one step on one record.
pub struct RecordGuard {
    _record: OwnedMutexGuard<()>,
    _store: OwnedRwLockReadGuard<()>,
}

#[derive(Default)]
pub struct LockTable {
    store: Arc<RwLock<()>>,
    locks: DashMap<RecordKey, Arc<AsyncMutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn lock(&self, key: RecordKey) -> RecordGuard {
        let store = self.store.clone().read_owned().await;
        if self.locks.len() > PRUNE_THRESHOLD {
            // Only the table holds these: nobody owns or awaits them.
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        let lock = self.locks.entry(key).or_default().clone();
        RecordGuard {
            _record: lock.lock_owned().await,
            _store: store,
        }
    }

    /// For store writes outside any single session or sender key.
    pub async fn shared(&self) -> OwnedRwLockReadGuard<()> {
        self.store.clone().read_owned().await
    }

    /// Waits for every in-flight step and holds off new ones.
    pub async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.store.clone().write_owned().await
    }
}
