use crate::config::constants::{METADATA_PAGES, NULL_RID};

use super::page::Page;

// Page offsets of the metadata pages within a page set.
pub mod metadata_pages {
    pub const INDIRECTION: usize = 0;
    pub const RID: usize = 1;
    pub const SCHEMA_ENCODING: usize = 2;
    pub const BASE_RID: usize = 3;
    pub const MERGE_META: usize = 4;

    // Slots inside the MERGE_META page. These describe the page set, not a record.
    pub const UPDATE_COUNTER_SLOT: usize = 0;
    pub const TPS_SLOT: usize = 1;
    pub const RECORD_COUNT_SLOT: usize = 2;
}

use metadata_pages::*;

/// One physical row block: `METADATA_PAGES` metadata pages followed by one
/// page per column. Record slot `s` of every page belongs to the same record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSet {
    pages: Vec<Page>,
}

impl PageSet {
    pub fn new(num_columns: usize) -> Self {
        PageSet {
            pages: vec![Page::new(); num_columns + METADATA_PAGES],
        }
    }

    pub fn from_pages(pages: Vec<Page>) -> Self {
        debug_assert!(pages.len() >= METADATA_PAGES);
        PageSet { pages }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn num_columns(&self) -> usize {
        self.pages.len() - METADATA_PAGES
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut [Page] {
        &mut self.pages
    }

    pub fn indirection(&self, slot: usize) -> u64 {
        self.pages[INDIRECTION].read_slot(slot)
    }

    pub fn set_indirection(&mut self, slot: usize, rid: u64) {
        self.pages[INDIRECTION].write_slot(slot, rid);
    }

    pub fn rid(&self, slot: usize) -> u64 {
        self.pages[RID].read_slot(slot)
    }

    pub fn schema_encoding(&self, slot: usize) -> u64 {
        self.pages[SCHEMA_ENCODING].read_slot(slot)
    }

    pub fn set_schema_encoding(&mut self, slot: usize, mask: u64) {
        self.pages[SCHEMA_ENCODING].write_slot(slot, mask);
    }

    pub fn base_rid(&self, slot: usize) -> u64 {
        self.pages[BASE_RID].read_slot(slot)
    }

    pub fn column(&self, slot: usize, column: usize) -> u64 {
        self.pages[METADATA_PAGES + column].read_slot(slot)
    }

    pub fn set_column(&mut self, slot: usize, column: usize, value: u64) {
        self.pages[METADATA_PAGES + column].write_slot(slot, value);
    }

    pub fn columns(&self, slot: usize) -> Vec<u64> {
        (0..self.num_columns())
            .map(|column| self.column(slot, column))
            .collect()
    }

    pub fn update_counter(&self) -> u64 {
        self.pages[MERGE_META].read_slot(UPDATE_COUNTER_SLOT)
    }

    pub fn set_update_counter(&mut self, count: u64) {
        self.pages[MERGE_META].write_slot(UPDATE_COUNTER_SLOT, count);
    }

    pub fn increment_update_counter(&mut self) -> u64 {
        let count = self.update_counter() + 1;
        self.set_update_counter(count);
        count
    }

    /// Every tail rid below this value has been folded into the base values.
    pub fn tail_position(&self) -> u64 {
        self.pages[MERGE_META].read_slot(TPS_SLOT)
    }

    pub fn set_tail_position(&mut self, tps: u64) {
        self.pages[MERGE_META].write_slot(TPS_SLOT, tps);
    }

    pub fn record_count(&self) -> u64 {
        self.pages[MERGE_META].read_slot(RECORD_COUNT_SLOT)
    }

    fn note_record(&mut self, slot: usize) {
        let count = self.record_count().max(slot as u64 + 1);
        self.pages[MERGE_META].write_slot(RECORD_COUNT_SLOT, count);
    }

    pub fn write_base_record(&mut self, slot: usize, rid: u64, values: &[u64]) {
        debug_assert_eq!(values.len(), self.num_columns());

        self.pages[INDIRECTION].write_slot(slot, NULL_RID);
        self.pages[RID].write_slot(slot, rid);
        self.pages[SCHEMA_ENCODING].write_slot(slot, 0);
        self.pages[BASE_RID].write_slot(slot, rid);
        for (column, value) in values.iter().enumerate() {
            self.set_column(slot, column, *value);
        }
        self.note_record(slot);
    }

    // Columns whose bit is clear in the mask are left zeroed
    pub fn write_tail_record(
        &mut self,
        slot: usize,
        tail_rid: u64,
        previous: u64,
        base_rid: u64,
        deltas: &[Option<u64>],
    ) -> u64 {
        debug_assert_eq!(deltas.len(), self.num_columns());

        let mut mask = 0u64;
        for (column, delta) in deltas.iter().enumerate() {
            let value = match delta {
                Some(value) => {
                    mask |= 1 << column;
                    *value
                }
                None => 0,
            };
            self.set_column(slot, column, value);
        }

        self.pages[INDIRECTION].write_slot(slot, previous);
        self.pages[RID].write_slot(slot, tail_rid);
        self.pages[SCHEMA_ENCODING].write_slot(slot, mask);
        self.pages[BASE_RID].write_slot(slot, base_rid);
        self.note_record(slot);

        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_record_layout() {
        let mut page_set = PageSet::new(3);
        page_set.write_base_record(7, 7, &[5, 6, 7]);

        assert_eq!(page_set.page_count(), 3 + METADATA_PAGES);
        assert_eq!(page_set.indirection(7), NULL_RID);
        assert_eq!(page_set.rid(7), 7);
        assert_eq!(page_set.base_rid(7), 7);
        assert_eq!(page_set.columns(7), vec![5, 6, 7]);
        assert_eq!(page_set.record_count(), 8);
    }

    #[test]
    fn tail_record_carries_only_updated_columns() {
        let mut page_set = PageSet::new(3);
        let mask = page_set.write_tail_record(0, 0, NULL_RID, 12, &[None, Some(10), None]);

        assert_eq!(mask, 0b010);
        assert_eq!(page_set.schema_encoding(0), 0b010);
        assert_eq!(page_set.base_rid(0), 12);
        assert_eq!(page_set.columns(0), vec![0, 10, 0]);
    }

    #[test]
    fn merge_metadata_is_page_set_wide() {
        let mut page_set = PageSet::new(1);
        page_set.write_base_record(0, 0, &[1]);

        assert_eq!(page_set.increment_update_counter(), 1);
        assert_eq!(page_set.increment_update_counter(), 2);
        page_set.set_tail_position(42);

        // Record slot 0 of the indirection page is untouched by the counters
        assert_eq!(page_set.indirection(0), NULL_RID);
        assert_eq!(page_set.update_counter(), 2);
        assert_eq!(page_set.tail_position(), 42);
    }
}
