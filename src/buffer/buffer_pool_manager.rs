use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    config::ReplacerKind,
    error::{StorageError, StorageResult},
    storage::{disk::manager::Disk, page::page_set::PageSet, RidSpace, TableId},
    utils::replacer::{LruKReplacer, LruReplacer, Replacer},
};

use super::page_guard::PinnedPageSet;

pub type FrameId = usize;

/// Identifies a page set across every table sharing the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageSetKey {
    pub table_id: TableId,
    pub space: RidSpace,
    pub block_start: u64,
}

pub(crate) struct FrameSlot {
    pub(crate) page_set: RwLock<PageSet>,
    // False while a load is in flight or after it failed
    pub(crate) valid: AtomicBool,
}

#[derive(Default)]
struct FrameHeader {
    key: Option<PageSetKey>,
    disk: Option<Arc<Disk>>,
    pin_count: u32,
    is_dirty: bool,
}

struct PoolState {
    frames: Vec<FrameHeader>,
    page_table: HashMap<PageSetKey, FrameId>,
    free_frames: VecDeque<FrameId>,
    replacer: Box<dyn Replacer<FrameId>>,

    // Dirty page sets evicted but not yet written back. A miss on one of
    // these keys takes the copy instead of reading stale bytes from disk.
    pending_writes: HashMap<PageSetKey, (Arc<Disk>, Arc<PageSet>)>,
}

enum Source {
    Disk,
    Fresh(usize),
    Pending(Arc<PageSet>),
}

/// Bounded cache of page sets shared by every table of a storage engine.
///
/// The pool latch only guards bookkeeping; disk reads and writes happen
/// after it is released. Page set writes are serialized by `write_latch`
/// so two write backs of the same block can never land out of order.
pub struct BufferPool {
    num_frames: usize,
    state: Mutex<PoolState>,
    slots: Vec<FrameSlot>,
    write_latch: Mutex<()>,
}

impl BufferPool {
    pub fn new(num_frames: usize) -> Self {
        Self::with_replacer(num_frames, Box::new(LruReplacer::new()))
    }

    pub fn with_kind(num_frames: usize, kind: ReplacerKind) -> Self {
        let replacer: Box<dyn Replacer<FrameId>> = match kind {
            ReplacerKind::Lru => Box::new(LruReplacer::new()),
            ReplacerKind::LruK(k) => Box::new(LruKReplacer::new(k)),
        };
        Self::with_replacer(num_frames, replacer)
    }

    pub fn with_replacer(num_frames: usize, replacer: Box<dyn Replacer<FrameId>>) -> Self {
        let mut frames = Vec::with_capacity(num_frames);
        let mut slots = Vec::with_capacity(num_frames);
        let mut free_frames = VecDeque::with_capacity(num_frames);

        for frame_id in 0..num_frames {
            frames.push(FrameHeader::default());
            slots.push(FrameSlot {
                page_set: RwLock::new(PageSet::new(0)),
                valid: AtomicBool::new(false),
            });
            free_frames.push_back(frame_id);
        }

        Self {
            num_frames,
            state: Mutex::new(PoolState {
                frames,
                page_table: HashMap::new(),
                free_frames,
                replacer,
                pending_writes: HashMap::new(),
            }),
            slots,
            write_latch: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.num_frames
    }

    /// Pins the page set at `block_start`, loading it from disk on a miss.
    pub fn get_page_set(
        &self,
        disk: &Arc<Disk>,
        space: RidSpace,
        block_start: u64,
    ) -> StorageResult<PinnedPageSet<'_>> {
        self.pin(disk, space, block_start, false)
    }

    /// Pins a freshly allocated block without reading it; it starts zeroed.
    pub fn new_page_set(
        &self,
        disk: &Arc<Disk>,
        space: RidSpace,
        block_start: u64,
    ) -> StorageResult<PinnedPageSet<'_>> {
        self.pin(disk, space, block_start, true)
    }

    fn pin(
        &self,
        disk: &Arc<Disk>,
        space: RidSpace,
        block_start: u64,
        fresh: bool,
    ) -> StorageResult<PinnedPageSet<'_>> {
        let key = PageSetKey {
            table_id: disk.table_id(),
            space,
            block_start,
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;

        // 1.
        // Resident. The load may still be running in another thread, so wait
        // on the slot before handing the pin out.
        if let Some(&frame_id) = state.page_table.get(&key) {
            state.frames[frame_id].pin_count += 1;
            state.replacer.set_evictable(frame_id, false);
            drop(guard);

            let handle = PinnedPageSet::new(self, frame_id, key, &self.slots[frame_id]);
            let loaded = {
                let _wait = self.slots[frame_id].page_set.read();
                self.slots[frame_id].valid.load(Ordering::Acquire)
            };
            if !loaded {
                return Err(StorageError::Io(io::Error::other(format!(
                    "load of {key:?} failed in a concurrent request"
                ))));
            }
            return Ok(handle);
        }

        // 2.
        // Find a frame: a free one first, otherwise evict through the replacer.
        let frame_id = match state.free_frames.pop_front() {
            Some(frame_id) => frame_id,
            None => state.replacer.evict().ok_or(StorageError::PoolExhausted)?,
        };

        let victim = std::mem::take(&mut state.frames[frame_id]);
        debug_assert_eq!(victim.pin_count, 0);

        // Nobody holds the slot: it is unpinned and flushes pin before reading
        let mut slot = self.slots[frame_id].page_set.write();
        self.slots[frame_id].valid.store(false, Ordering::Release);

        let mut write_back = None;
        if let Some(victim_key) = victim.key {
            state.page_table.remove(&victim_key);
            debug!("Evicting {:?} from frame {}", victim_key, frame_id);

            if victim.is_dirty {
                if let Some(victim_disk) = victim.disk {
                    let data = Arc::new(std::mem::replace(&mut *slot, PageSet::new(0)));
                    state
                        .pending_writes
                        .insert(victim_key, (Arc::clone(&victim_disk), Arc::clone(&data)));
                    write_back = Some((victim_key, victim_disk, data));
                }
            }
        }

        let source = match state.pending_writes.remove(&key) {
            Some((_, data)) => Source::Pending(data),
            None if fresh => Source::Fresh(disk.num_columns()),
            None => Source::Disk,
        };

        state.frames[frame_id] = FrameHeader {
            key: Some(key),
            disk: Some(Arc::clone(disk)),
            pin_count: 1,
            // A page set that only lives in memory must reach disk eventually
            is_dirty: !matches!(source, Source::Disk),
        };
        state.page_table.insert(key, frame_id);
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);
        drop(guard);

        let handle = PinnedPageSet::new(self, frame_id, key, &self.slots[frame_id]);

        if let Some((victim_key, victim_disk, data)) = write_back {
            self.write_back(victim_key, &victim_disk, &data);
        }

        let loaded = match source {
            Source::Disk => {
                debug!("Loading {:?} into frame {}", key, frame_id);
                disk.read_page_set(space, block_start)
            }
            Source::Fresh(num_columns) => Ok(PageSet::new(num_columns)),
            Source::Pending(data) => Ok(Arc::unwrap_or_clone(data)),
        };

        match loaded {
            Ok(page_set) => {
                *slot = page_set;
                self.slots[frame_id].valid.store(true, Ordering::Release);
                drop(slot);
                Ok(handle)
            }
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    if state.page_table.get(&key) == Some(&frame_id) {
                        state.page_table.remove(&key);
                    }
                    // Orphaned: returns to the free list once the last pin goes
                    state.frames[frame_id].key = None;
                    state.frames[frame_id].disk = None;
                    state.frames[frame_id].is_dirty = false;
                }
                drop(slot);
                drop(handle);
                Err(err)
            }
        }
    }

    // Writes an evicted page set unless a newer copy has taken its place.
    fn write_back(&self, key: PageSetKey, disk: &Arc<Disk>, data: &Arc<PageSet>) {
        let _latch = self.write_latch.lock();

        let current = self
            .state
            .lock()
            .pending_writes
            .get(&key)
            .is_some_and(|(_, pending)| Arc::ptr_eq(pending, data));
        if !current {
            return;
        }

        match disk.write_page_set(key.space, data, key.block_start) {
            Ok(()) => {
                let mut state = self.state.lock();
                if state
                    .pending_writes
                    .get(&key)
                    .is_some_and(|(_, pending)| Arc::ptr_eq(pending, data))
                {
                    state.pending_writes.remove(&key);
                }
            }
            Err(err) => warn!("Write back of {:?} failed, keeping it pending: {}", key, err),
        }
    }

    pub(crate) fn release(&self, frame_id: FrameId, dirty: bool) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let frame = &mut state.frames[frame_id];

        frame.is_dirty |= dirty && frame.key.is_some();
        frame.pin_count -= 1;

        if frame.pin_count == 0 {
            if frame.key.is_none() {
                state.replacer.remove(frame_id);
                state.free_frames.push_back(frame_id);
            } else {
                state.replacer.record_access(frame_id);
                state.replacer.set_evictable(frame_id, true);
            }
        }
    }

    /// Drops a pin, recording whether the holder changed the page set.
    /// The page set stays resident; write back waits for eviction or a flush.
    pub fn unpin(&self, mut handle: PinnedPageSet<'_>, dirty: bool) {
        if dirty {
            handle.mark_dirty();
        }
        drop(handle);
    }

    /// Writes the handle's page set to disk if it is dirty.
    pub fn flush(&self, handle: &PinnedPageSet<'_>) -> StorageResult<()> {
        let frame_id = handle.frame_id();
        let disk = {
            let mut state = self.state.lock();
            let frame = &mut state.frames[frame_id];
            if !frame.is_dirty && !handle.is_dirty() {
                return Ok(());
            }
            frame.is_dirty = false;
            frame.disk.clone()
        };

        let Some(disk) = disk else {
            return Ok(());
        };
        self.write_frame(frame_id, handle.key(), &disk)
    }

    fn write_frame(&self, frame_id: FrameId, key: PageSetKey, disk: &Disk) -> StorageResult<()> {
        let result = {
            let _latch = self.write_latch.lock();
            let page_set = self.slots[frame_id].page_set.read();
            disk.write_page_set(key.space, &page_set, key.block_start)
        };

        if result.is_err() {
            self.state.lock().frames[frame_id].is_dirty = true;
        }
        result
    }

    /// Writes every dirty page set, and any failed write backs, to disk.
    pub fn flush_all(&self) -> StorageResult<()> {
        self.flush_where(|_| true)
    }

    pub fn flush_table(&self, table_id: TableId) -> StorageResult<()> {
        self.flush_where(|key| key.table_id == table_id)
    }

    fn flush_where(&self, filter: impl Fn(&PageSetKey) -> bool) -> StorageResult<()> {
        // Pin the dirty frames so they cannot be evicted while being written
        let (dirty, pending) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let mut dirty = Vec::new();
            for (frame_id, frame) in state.frames.iter_mut().enumerate() {
                let (Some(key), Some(disk)) = (frame.key, frame.disk.as_ref()) else {
                    continue;
                };
                if frame.is_dirty && filter(&key) {
                    frame.is_dirty = false;
                    frame.pin_count += 1;
                    state.replacer.set_evictable(frame_id, false);
                    dirty.push((frame_id, key, Arc::clone(disk)));
                }
            }

            let pending: Vec<_> = state
                .pending_writes
                .iter()
                .filter(|(key, _)| filter(key))
                .map(|(key, (disk, data))| (*key, Arc::clone(disk), Arc::clone(data)))
                .collect();

            (dirty, pending)
        };

        let mut first_error = None;
        for (frame_id, key, disk) in dirty {
            if let Err(err) = self.write_frame(frame_id, key, &disk) {
                warn!("Flush of {:?} failed: {}", key, err);
                first_error.get_or_insert(err);
            }
            self.release(frame_id, false);
        }

        for (key, disk, data) in pending {
            self.write_back(key, &disk, &data);
            if self.state.lock().pending_writes.contains_key(&key) && first_error.is_none() {
                first_error = Some(StorageError::Io(io::Error::other(format!(
                    "write back of {key:?} failed"
                ))));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drops every clean, unpinned page set of a table from the pool.
    pub fn discard_table(&self, table_id: TableId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        for (frame_id, frame) in state.frames.iter_mut().enumerate() {
            let Some(key) = frame.key else { continue };
            if key.table_id == table_id && frame.pin_count == 0 && !frame.is_dirty {
                state.page_table.remove(&key);
                state.replacer.remove(frame_id);
                *frame = FrameHeader::default();
                state.free_frames.push_back(frame_id);
            }
        }
    }

    pub fn pin_count(&self, key: &PageSetKey) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(key)
            .map(|frame_id| state.frames[*frame_id].pin_count)
    }

    pub fn is_resident(&self, key: &PageSetKey) -> bool {
        self.state.lock().page_table.contains_key(key)
    }

    pub fn resident_count(&self) -> usize {
        self.state.lock().page_table.len()
    }
}
