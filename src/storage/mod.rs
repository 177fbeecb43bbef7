pub mod disk;
pub mod key_directory;
pub mod page;

use crate::config::constants::RECORDS_PER_PAGE;

pub type Rid = u64;
pub type TableId = u64;

/// The two RID namespaces of a table. Each has its own counter and file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RidSpace {
    Base = 0,
    Tail = 1,
}

/// Logical page set group a rid falls into and its slot within that group.
pub fn rid_position(rid: Rid) -> (u64, usize) {
    (
        rid / RECORDS_PER_PAGE as u64,
        (rid % RECORDS_PER_PAGE as u64) as usize,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_positions() {
        assert_eq!(rid_position(0), (0, 0));
        assert_eq!(rid_position(511), (0, 511));
        assert_eq!(rid_position(512), (1, 0));
        assert_eq!(rid_position(1030), (2, 6));
    }
}
