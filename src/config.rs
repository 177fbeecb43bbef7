use std::time::Duration;

pub mod constants {
    // Size
    pub const PAGE_SIZE: usize = 1024 * 4;
    // Every slot in a page is a little endian u64
    pub const SLOT_SIZE: usize = 8;
    pub const RECORDS_PER_PAGE: usize = PAGE_SIZE / SLOT_SIZE;

    pub const START_RID: u64 = 0;
    pub const NULL_RID: u64 = u64::MAX;

    // Indirection, rid, schema encoding, base rid, merge metadata
    pub const METADATA_PAGES: usize = 5;
    // Schema encodings are u64 bitmasks
    pub const MAX_COLUMNS: usize = 64;

    // Key, base rid, tail rid, base block, tail block
    pub const PAGES_PER_KEY_DIRECTORY_SET: usize = 5;
    pub const KEY_DIRECTORY_SET_SIZE: usize = PAGES_PER_KEY_DIRECTORY_SET * PAGE_SIZE;

    // num_columns, key_column, num_records, next_base_rid, next_tail_rid,
    // next_base_block, next_tail_block
    pub const INFO_HEADER_FIELDS: usize = 7;
    pub const INFO_HEADER_SIZE: usize = INFO_HEADER_FIELDS * SLOT_SIZE;

    pub const BUFFERPOOL_SIZE: usize = 1024 * 1024;
    pub const MAX_PAGES_IN_BUFFER: usize = BUFFERPOOL_SIZE / PAGE_SIZE;

    pub const MERGE_TIMER_INTERVAL_SECS: u64 = 7;
    // Tail appends against a base page set before it becomes a merge candidate
    pub const MERGE_THRESHOLD: u64 = 100;
    pub const NUMBER_OF_BASE_PAGE_SETS_TO_CHECK: usize = 3;

    pub const TABLES_DIR: &str = "Tables";
}

use constants::*;

/// Which eviction policy the buffer pool is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacerKind {
    Lru,
    LruK(usize),
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    // Buffer pool budget in bytes, divided by PAGE_SIZE to get the frame count
    pub bufferpool_bytes: usize,
    pub merge_interval: Duration,
    pub merge_threshold: u64,
    pub page_sets_to_check: usize,
    pub replacer: ReplacerKind,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            bufferpool_bytes: BUFFERPOOL_SIZE,
            merge_interval: Duration::from_secs(MERGE_TIMER_INTERVAL_SECS),
            merge_threshold: MERGE_THRESHOLD,
            page_sets_to_check: NUMBER_OF_BASE_PAGE_SETS_TO_CHECK,
            replacer: ReplacerKind::Lru,
        }
    }
}

impl StoreOptions {
    pub fn bufferpool_bytes(mut self, bytes: usize) -> Self {
        self.bufferpool_bytes = bytes;
        self
    }

    /// Sizes the pool to hold exactly `frames` page sets.
    pub fn bufferpool_frames(mut self, frames: usize) -> Self {
        self.bufferpool_bytes = frames * PAGE_SIZE;
        self
    }

    pub fn merge_interval(mut self, interval: Duration) -> Self {
        self.merge_interval = interval;
        self
    }

    pub fn merge_threshold(mut self, threshold: u64) -> Self {
        self.merge_threshold = threshold;
        self
    }

    pub fn page_sets_to_check(mut self, count: usize) -> Self {
        self.page_sets_to_check = count;
        self
    }

    pub fn replacer(mut self, kind: ReplacerKind) -> Self {
        self.replacer = kind;
        self
    }

    pub fn max_page_sets_in_buffer(&self) -> usize {
        (self.bufferpool_bytes / PAGE_SIZE).max(1)
    }
}
