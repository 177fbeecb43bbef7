use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::storage::page::page_set::PageSet;

use super::buffer_pool_manager::{BufferPool, FrameId, FrameSlot, PageSetKey};

/// A pin on one resident page set. The page set cannot be evicted while
/// any pin on it is alive; dropping the handle unpins it.
///
/// The pin says nothing about logical concurrency. Callers still need the
/// rid locks from the lock manager before touching record slots.
pub struct PinnedPageSet<'a> {
    pool: &'a BufferPool,
    frame_id: FrameId,
    key: PageSetKey,
    slot: &'a FrameSlot,
    dirty: bool,
}

impl<'a> PinnedPageSet<'a> {
    pub(crate) fn new(
        pool: &'a BufferPool,
        frame_id: FrameId,
        key: PageSetKey,
        slot: &'a FrameSlot,
    ) -> Self {
        PinnedPageSet {
            pool,
            frame_id,
            key,
            slot,
            dirty: false,
        }
    }

    pub fn key(&self) -> PageSetKey {
        self.key
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PageSet> {
        self.slot.page_set.read()
    }

    // Any write access counts as a mutation
    pub fn write(&mut self) -> RwLockWriteGuard<'_, PageSet> {
        self.dirty = true;
        self.slot.page_set.write()
    }
}

impl Drop for PinnedPageSet<'_> {
    fn drop(&mut self) {
        self.pool.release(self.frame_id, self.dirty);
    }
}
