use byteorder::{ByteOrder, LittleEndian};

use crate::config::constants::{PAGE_SIZE, RECORDS_PER_PAGE, SLOT_SIZE};

/// A fixed 4KB block. The storage layer only ever looks at it as an
/// array of `RECORDS_PER_PAGE` little endian u64 slots.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used = self.data.iter().filter(|byte| **byte != 0).count();
        f.debug_struct("Page").field("non_zero_bytes", &used).finish()
    }
}

impl Page {
    pub fn new() -> Self {
        Page {
            data: Box::new([0; PAGE_SIZE]),
        }
    }

    // Short buffers are zero filled, long ones truncated
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut page = Page::new();
        let len = bytes.len().min(PAGE_SIZE);
        page.data[..len].copy_from_slice(&bytes[..len]);
        page
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    pub fn read_slot(&self, slot: usize) -> u64 {
        debug_assert!(slot < RECORDS_PER_PAGE);
        let start = slot * SLOT_SIZE;
        LittleEndian::read_u64(&self.data[start..start + SLOT_SIZE])
    }

    pub fn write_slot(&mut self, slot: usize, value: u64) {
        debug_assert!(slot < RECORDS_PER_PAGE);
        let start = slot * SLOT_SIZE;
        LittleEndian::write_u64(&mut self.data[start..start + SLOT_SIZE], value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_little_endian() {
        let mut page = Page::new();
        page.write_slot(1, 0x0102_0304_0506_0708);

        assert_eq!(&page.as_bytes()[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(page.read_slot(1), 0x0102_0304_0506_0708);
        assert_eq!(page.read_slot(0), 0);
    }

    #[test]
    fn short_buffer_is_zero_filled() {
        let page = Page::from_bytes(&[0xff; 10]);

        assert_eq!(page.read_slot(0), u64::MAX);
        assert_eq!(page.read_slot(1), 0xffff);
        assert_eq!(page.read_slot(RECORDS_PER_PAGE - 1), 0);
    }
}
