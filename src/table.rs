use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use log::{debug, warn};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    buffer::{buffer_pool_manager::BufferPool, page_guard::PinnedPageSet},
    concurrency::lock_manager::{LockManager, TxnId},
    config::constants::{NULL_RID, RECORDS_PER_PAGE},
    error::{StorageError, StorageResult},
    storage::{
        disk::manager::Disk, key_directory::KeyDirectory, rid_position, Rid, RidSpace, TableId,
    },
};

/// One table: its files, its key directory and shared handles on the pool
/// and lock manager of the engine that opened it.
///
/// Every record operation takes the rid lock first and fails fast with
/// `LockDenied` when another transaction holds it. The directory latch is
/// only held for lookups and rid reservation, never across page I/O.
pub struct Table {
    disk: Arc<Disk>,
    directory: RwLock<KeyDirectory>,
    pool: Arc<BufferPool>,
    locks: Arc<LockManager>,

    // Next base group the merge scheduler looks at
    merge_cursor: AtomicU64,
}

impl Table {
    pub fn open(disk: Disk, pool: Arc<BufferPool>, locks: Arc<LockManager>) -> StorageResult<Self> {
        let directory = disk.load_key_directory()?;
        Ok(Table {
            disk: Arc::new(disk),
            directory: RwLock::new(directory),
            pool,
            locks,
            merge_cursor: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        self.disk.name()
    }

    pub fn table_id(&self) -> TableId {
        self.disk.table_id()
    }

    pub fn num_columns(&self) -> usize {
        self.disk.num_columns()
    }

    pub fn key_column(&self) -> usize {
        self.disk.key_column()
    }

    /// Number of keys currently in the directory.
    pub fn len(&self) -> usize {
        self.directory.read().num_keys()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup_by_key(&self, key: u64) -> Option<Rid> {
        self.directory.read().base_rid(key)
    }

    fn check_width(&self, found: usize) -> StorageResult<()> {
        let expected = self.num_columns();
        if found != expected {
            return Err(StorageError::ColumnCountMismatch { expected, found });
        }
        Ok(())
    }

    /// Inserts a new base record and returns its rid. The caller's
    /// transaction keeps a write lock on the rid until it commits.
    pub fn insert_base_record(&self, txn: TxnId, values: &[u64]) -> StorageResult<Rid> {
        self.check_width(values.len())?;
        let key = values[self.key_column()];

        let (rid, block_start, fresh) = {
            let mut directory = self.directory.write();
            if directory.contains_key(key) {
                return Err(StorageError::DuplicateKey(key));
            }

            let (rid, new_block) = self.disk.allocate_rid(RidSpace::Base);
            let (block_start, fresh) = match new_block {
                Some(block_start) => (block_start, true),
                None => self.group_block(&directory, RidSpace::Base, rid),
            };

            // Issued and locked under the write latch; merge takes the read
            // latch before locking a group, so it never sees the rid unlocked
            self.locks.write_lock(txn, rid, RidSpace::Base)?;
            directory.insert_base(key, rid, block_start);
            self.disk.record_inserted();
            (rid, block_start, fresh)
        };

        let written = self.pin(RidSpace::Base, block_start, fresh).map(|mut page_set| {
            let (_, slot) = rid_position(rid);
            page_set.write().write_base_record(slot, rid, values);
        });

        if let Err(err) = written {
            // The rid stays burnt, the key becomes free again
            warn!("Insert of key {} into {} failed: {}", key, self.name(), err);
            let mut directory = self.directory.write();
            if directory.remove_key(key).is_some() {
                self.disk.record_discarded();
            }
            return Err(err);
        }

        debug!("Inserted key {} as rid {} into {}", key, rid, self.name());
        Ok(rid)
    }

    /// Appends a tail record holding `deltas` to the version chain of
    /// `base_rid`. `None` leaves a column unchanged.
    pub fn append_tail_update(
        &self,
        txn: TxnId,
        base_rid: Rid,
        deltas: &[Option<u64>],
    ) -> StorageResult<Rid> {
        self.check_width(deltas.len())?;
        self.locks.write_lock(txn, base_rid, RidSpace::Base)?;

        let base_block = self.base_block(base_rid)?;
        let (_, base_slot) = rid_position(base_rid);

        let previous = {
            let base = self.pool.get_page_set(&self.disk, RidSpace::Base, base_block)?;
            let indirection = base.read().indirection(base_slot);
            indirection
        };

        let (tail_rid, tail_block, fresh) = {
            let mut directory = self.directory.write();
            let (tail_rid, new_block) = self.disk.allocate_rid(RidSpace::Tail);
            let (tail_block, fresh) = match new_block {
                Some(block_start) => (block_start, true),
                None => self.group_block(&directory, RidSpace::Tail, tail_rid),
            };
            directory.insert_tail(tail_rid, tail_block);
            (tail_rid, tail_block, fresh)
        };

        let mask = {
            let mut tail = self.pin(RidSpace::Tail, tail_block, fresh)?;
            let (_, tail_slot) = rid_position(tail_rid);
            let mask = tail
                .write()
                .write_tail_record(tail_slot, tail_rid, previous, base_rid, deltas);
            mask
        };

        // Only now does the new version become reachable from the base
        let mut base = self.pool.get_page_set(&self.disk, RidSpace::Base, base_block)?;
        {
            let mut page_set = base.write();
            page_set.set_indirection(base_slot, tail_rid);
            let schema = page_set.schema_encoding(base_slot);
            page_set.set_schema_encoding(base_slot, schema | mask);
            page_set.increment_update_counter();
        }

        debug!(
            "Appended tail {} to base {} of {} with mask {:#b}",
            tail_rid,
            base_rid,
            self.name(),
            mask
        );
        Ok(tail_rid)
    }

    /// Reads the newest committed value of every column of `base_rid`.
    pub fn read_current_value(&self, txn: TxnId, base_rid: Rid) -> StorageResult<Vec<u64>> {
        self.locks.read_lock(txn, base_rid, RidSpace::Base)?;

        let base_block = self.base_block(base_rid)?;
        let (_, slot) = rid_position(base_rid);

        let (mut values, next, schema, tps) = {
            let base = self.pool.get_page_set(&self.disk, RidSpace::Base, base_block)?;
            let page_set = base.read();
            (
                page_set.columns(slot),
                page_set.indirection(slot),
                page_set.schema_encoding(slot),
                page_set.tail_position(),
            )
        };

        self.overlay_tails(&mut values, next, schema, tps)?;
        Ok(values)
    }

    /// Walks a version chain newest first and copies the newest value of
    /// every column in `pending` into `values`. Tails below `tps` are
    /// already part of the base and end the walk.
    pub(crate) fn overlay_tails(
        &self,
        values: &mut [u64],
        mut next: Rid,
        mut pending: u64,
        tps: Rid,
    ) -> StorageResult<()> {
        while next != NULL_RID && next >= tps && pending != 0 {
            let tail_block = self.tail_block(next)?;
            let (_, slot) = rid_position(next);

            let tail = self.pool.get_page_set(&self.disk, RidSpace::Tail, tail_block)?;
            let page_set = tail.read();

            let fresh = page_set.schema_encoding(slot) & pending;
            for (column, value) in values.iter_mut().enumerate() {
                if fresh & (1 << column) != 0 {
                    *value = page_set.column(slot, column);
                }
            }
            pending &= !fresh;
            next = page_set.indirection(slot);
        }
        Ok(())
    }

    pub fn update_by_key(&self, txn: TxnId, key: u64, deltas: &[Option<u64>]) -> StorageResult<Rid> {
        let rid = self.lookup_by_key(key).ok_or(StorageError::KeyNotFound(key))?;
        self.append_tail_update(txn, rid, deltas)
    }

    pub fn read_by_key(&self, txn: TxnId, key: u64) -> StorageResult<Vec<u64>> {
        let rid = self.lookup_by_key(key).ok_or(StorageError::KeyNotFound(key))?;
        self.read_current_value(txn, rid)
    }

    /// Writes this table's dirty page sets, then the directory and header
    /// that point into them.
    pub fn flush(&self) -> StorageResult<()> {
        let num_keys = self.disk.persist_with(|| {
            // Every block the snapshot references is already in the pool, so
            // the page flush right after covers it
            let snapshot = {
                let directory = self.directory.read();
                (directory.clone(), self.disk.info())
            };
            self.pool.flush_table(self.table_id())?;
            Ok(snapshot)
        })?;
        self.disk.sync()?;

        debug!("Flushed {} with {} keys", self.name(), num_keys);
        Ok(())
    }

    pub fn base_block(&self, rid: Rid) -> StorageResult<u64> {
        self.directory.read().base_block(rid).ok_or(StorageError::InvalidRid {
            rid,
            space: RidSpace::Base,
        })
    }

    pub fn tail_block(&self, rid: Rid) -> StorageResult<u64> {
        self.directory.read().tail_block(rid).ok_or(StorageError::InvalidRid {
            rid,
            space: RidSpace::Tail,
        })
    }

    // Block of an already open group. Rids whose insert failed leave holes,
    // so scan back to the nearest mapped member; a group with no mapped
    // member left gets a block of its own.
    fn group_block(&self, directory: &KeyDirectory, space: RidSpace, rid: Rid) -> (u64, bool) {
        let group_start = rid - rid % RECORDS_PER_PAGE as u64;
        let mapped = (group_start..rid).rev().find_map(|member| match space {
            RidSpace::Base => directory.base_block(member),
            RidSpace::Tail => directory.tail_block(member),
        });

        match mapped {
            Some(block_start) => (block_start, false),
            None => {
                let block_start = self.disk.block_start(self.disk.allocate_next_block(space));
                (block_start, true)
            }
        }
    }

    fn pin(
        &self,
        space: RidSpace,
        block_start: u64,
        fresh: bool,
    ) -> StorageResult<PinnedPageSet<'_>> {
        if fresh {
            self.pool.new_page_set(&self.disk, space, block_start)
        } else {
            self.pool.get_page_set(&self.disk, space, block_start)
        }
    }

    // Handles used by the merge scheduler

    pub(crate) fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub(crate) fn directory(&self) -> RwLockReadGuard<'_, KeyDirectory> {
        self.directory.read()
    }

    pub(crate) fn directory_mut(&self) -> RwLockWriteGuard<'_, KeyDirectory> {
        self.directory.write()
    }

    /// Number of base groups that have had at least one rid issued.
    pub fn base_group_count(&self) -> u64 {
        self.disk.next_rid(RidSpace::Base).div_ceil(RECORDS_PER_PAGE as u64)
    }

    /// The next `count` groups in round robin order, without repeats.
    pub(crate) fn next_merge_groups(&self, count: usize) -> Vec<u64> {
        let groups = self.base_group_count();
        if groups == 0 {
            return Vec::new();
        }

        let count = (count as u64).min(groups);
        let start = self.merge_cursor.fetch_add(count, Ordering::Relaxed);
        (start..start + count).map(|cursor| cursor % groups).collect()
    }
}
