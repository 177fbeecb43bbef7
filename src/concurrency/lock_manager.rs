//! Non blocking shared/exclusive locks keyed by `(rid, space)`.
//!
//! A denied request returns `false` immediately; retrying or aborting is up
//! to the caller. Locks are only ever released in bulk by `commit`/`abort`.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::trace;

use crate::{
    error::{StorageError, StorageResult},
    storage::{Rid, RidSpace},
};

/// Opaque holder identity handed out by [`LockManager::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(u64);

impl TxnId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

pub type LockKey = (Rid, RidSpace);

#[derive(Debug, Default)]
struct LockEntry {
    // At most one distinct holder
    exclusive: Vec<TxnId>,
    shared: Vec<TxnId>,
}

impl LockEntry {
    fn is_empty(&self) -> bool {
        self.exclusive.is_empty() && self.shared.is_empty()
    }

    fn read_safe(&self, txn: TxnId) -> bool {
        self.exclusive.iter().all(|holder| *holder == txn)
    }

    // A lone shared lock held by the caller itself may be upgraded
    fn write_safe(&self, txn: TxnId) -> bool {
        match self.shared.as_slice() {
            [] => {}
            [holder] if *holder == txn => {}
            _ => return false,
        }
        self.exclusive.iter().all(|holder| *holder == txn)
    }
}

#[derive(Debug, Default)]
pub struct LockManager {
    // Each entry is checked and mutated under its own shard guard
    table: DashMap<LockKey, LockEntry>,
    next_txn: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> TxnId {
        TxnId(self.next_txn.fetch_add(1, Ordering::SeqCst))
    }

    pub fn acquire_read(&self, txn: TxnId, rid: Rid, space: RidSpace) -> bool {
        let mut entry = self.table.entry((rid, space)).or_default();
        if !entry.read_safe(txn) {
            trace!("{:?} denied read on {:?} {}", txn, space, rid);
            return false;
        }

        if !entry.shared.contains(&txn) {
            entry.shared.push(txn);
        }
        true
    }

    pub fn acquire_write(&self, txn: TxnId, rid: Rid, space: RidSpace) -> bool {
        let mut entry = self.table.entry((rid, space)).or_default();
        if !entry.write_safe(txn) {
            trace!("{:?} denied write on {:?} {}", txn, space, rid);
            return false;
        }

        if !entry.exclusive.contains(&txn) {
            entry.exclusive.push(txn);
        }
        true
    }

    pub fn read_lock(&self, txn: TxnId, rid: Rid, space: RidSpace) -> StorageResult<()> {
        if self.acquire_read(txn, rid, space) {
            Ok(())
        } else {
            Err(StorageError::LockDenied { rid, space })
        }
    }

    pub fn write_lock(&self, txn: TxnId, rid: Rid, space: RidSpace) -> StorageResult<()> {
        if self.acquire_write(txn, rid, space) {
            Ok(())
        } else {
            Err(StorageError::LockDenied { rid, space })
        }
    }

    pub fn commit(&self, txn: TxnId) -> usize {
        self.shrink(txn)
    }

    pub fn abort(&self, txn: TxnId) -> usize {
        self.shrink(txn)
    }

    // Removes txn from every holder list. Returns how many locks it held.
    fn shrink(&self, txn: TxnId) -> usize {
        let mut released = 0;
        self.table.retain(|_, entry| {
            let before = entry.exclusive.len() + entry.shared.len();
            entry.exclusive.retain(|holder| *holder != txn);
            entry.shared.retain(|holder| *holder != txn);
            released += before - entry.exclusive.len() - entry.shared.len();
            !entry.is_empty()
        });
        released
    }

    pub fn holds_read(&self, txn: TxnId, rid: Rid, space: RidSpace) -> bool {
        self.table
            .get(&(rid, space))
            .is_some_and(|entry| entry.shared.contains(&txn))
    }

    pub fn holds_write(&self, txn: TxnId, rid: Rid, space: RidSpace) -> bool {
        self.table
            .get(&(rid, space))
            .is_some_and(|entry| entry.exclusive.contains(&txn))
    }

    // Number of (rid, space) keys with at least one holder
    pub fn locked_keys(&self) -> usize {
        self.table.len()
    }
}
