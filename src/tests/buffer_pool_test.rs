#[cfg(test)]
pub mod test {

    use std::{sync::Arc, thread};

    use tempfile::TempDir;

    use crate::{
        buffer::buffer_pool_manager::{BufferPool, PageSetKey},
        config::ReplacerKind,
        error::StorageError,
        storage::{disk::manager::Disk, RidSpace},
        tests::init_logger,
    };

    const NUM_COLUMNS: usize = 2;

    fn setup() -> (TempDir, Arc<Disk>) {
        init_logger();
        let root = TempDir::new().unwrap();
        let disk = Disk::open_or_create(root.path(), 7, "pool", NUM_COLUMNS, 0).unwrap();
        (root, Arc::new(disk))
    }

    fn key(disk: &Disk, block: u64) -> PageSetKey {
        PageSetKey {
            table_id: 7,
            space: RidSpace::Base,
            block_start: disk.block_start(block),
        }
    }

    #[test]
    fn pinned_frames_are_never_evicted() {
        let (_root, disk) = setup();
        let pool = BufferPool::new(2);

        let first = pool.get_page_set(&disk, RidSpace::Base, disk.block_start(0)).unwrap();
        let second = pool.get_page_set(&disk, RidSpace::Base, disk.block_start(1)).unwrap();

        let err = pool
            .get_page_set(&disk, RidSpace::Base, disk.block_start(2))
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::PoolExhausted));
        assert!(err.is_retryable());

        // Both pins survived the failed request
        assert_eq!(pool.pin_count(&key(&disk, 0)), Some(1));
        assert_eq!(pool.pin_count(&key(&disk, 1)), Some(1));

        drop(first);
        let third = pool.get_page_set(&disk, RidSpace::Base, disk.block_start(2)).unwrap();
        assert!(!pool.is_resident(&key(&disk, 0)));
        assert_eq!(pool.resident_count(), 2);

        drop(second);
        drop(third);
    }

    #[test]
    fn same_page_set_shares_one_frame() {
        let (_root, disk) = setup();
        let pool = BufferPool::new(4);

        let a = pool.get_page_set(&disk, RidSpace::Tail, 0).unwrap();
        let b = pool.get_page_set(&disk, RidSpace::Tail, 0).unwrap();
        assert_eq!(a.frame_id(), b.frame_id());

        let tail_key = PageSetKey {
            table_id: 7,
            space: RidSpace::Tail,
            block_start: 0,
        };
        assert_eq!(pool.pin_count(&tail_key), Some(2));

        pool.unpin(a, false);
        assert_eq!(pool.pin_count(&tail_key), Some(1));
        drop(b);
        assert_eq!(pool.pin_count(&tail_key), Some(0));

        // Base and tail block 0 are different page sets
        assert!(!pool.is_resident(&key(&disk, 0)));
    }

    #[test]
    fn dirty_page_set_is_written_back_on_eviction() {
        let (_root, disk) = setup();
        let pool = BufferPool::new(1);

        {
            let mut page_set = pool.new_page_set(&disk, RidSpace::Base, disk.block_start(0)).unwrap();
            page_set.write().set_column(3, 1, 99);
        }

        // The only frame is reused, which forces the write back
        {
            let page_set = pool.get_page_set(&disk, RidSpace::Base, disk.block_start(1)).unwrap();
            assert_eq!(page_set.read().column(3, 1), 0);
        }
        assert_eq!(
            disk.read_page_set(RidSpace::Base, disk.block_start(0)).unwrap().column(3, 1),
            99
        );

        let page_set = pool.get_page_set(&disk, RidSpace::Base, disk.block_start(0)).unwrap();
        assert_eq!(page_set.read().column(3, 1), 99);
    }

    #[test]
    fn flush_table_only_touches_that_table() {
        let (root, disk) = setup();
        let other = Arc::new(Disk::open_or_create(root.path(), 8, "other", NUM_COLUMNS, 0).unwrap());
        let pool = BufferPool::with_kind(4, ReplacerKind::LruK(2));

        {
            let mut mine = pool.new_page_set(&disk, RidSpace::Base, 0).unwrap();
            mine.write().set_indirection(0, 12);
            let mut theirs = pool.new_page_set(&other, RidSpace::Base, 0).unwrap();
            theirs.write().set_indirection(0, 34);
        }

        pool.flush_table(disk.table_id()).unwrap();
        assert_eq!(disk.read_page_set(RidSpace::Base, 0).unwrap().indirection(0), 12);
        assert_eq!(other.read_page_set(RidSpace::Base, 0).unwrap().indirection(0), 0);

        pool.flush_all().unwrap();
        assert_eq!(other.read_page_set(RidSpace::Base, 0).unwrap().indirection(0), 34);

        // Flushing leaves nothing pinned behind
        assert_eq!(pool.pin_count(&key(&disk, 0)), Some(0));
    }

    #[test]
    fn discard_table_frees_clean_frames() {
        let (_root, disk) = setup();
        let pool = BufferPool::new(4);

        {
            let mut page_set = pool.new_page_set(&disk, RidSpace::Base, 0).unwrap();
            page_set.write().set_update_counter(3);
        }
        // Still dirty, so it stays
        pool.discard_table(disk.table_id());
        assert!(pool.is_resident(&key(&disk, 0)));

        pool.flush_table(disk.table_id()).unwrap();
        pool.discard_table(disk.table_id());
        assert_eq!(pool.resident_count(), 0);
    }

    #[test]
    fn concurrent_increments_survive_eviction() {
        let (_root, disk) = setup();
        let pool = Arc::new(BufferPool::new(2));
        const THREADS: u64 = 8;
        const ROUNDS: u64 = 50;
        const BLOCKS: u64 = 4;

        let handles: Vec<_> = (0..THREADS)
            .map(|thread_id| {
                let pool = Arc::clone(&pool);
                let disk = Arc::clone(&disk);
                thread::spawn(move || {
                    let block_start = disk.block_start(thread_id % BLOCKS);
                    let mut done = 0;
                    while done < ROUNDS {
                        match pool.get_page_set(&disk, RidSpace::Base, block_start) {
                            Ok(mut page_set) => {
                                let mut data = page_set.write();
                                let count = data.column(0, 0);
                                data.set_column(0, 0, count + 1);
                                done += 1;
                            }
                            Err(err) if err.is_retryable() => thread::yield_now(),
                            Err(err) => panic!("unexpected pool error: {err}"),
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        pool.flush_all().unwrap();
        let total: u64 = (0..BLOCKS)
            .map(|block| {
                disk.read_page_set(RidSpace::Base, disk.block_start(block))
                    .unwrap()
                    .column(0, 0)
            })
            .sum();
        assert_eq!(total, THREADS * ROUNDS);
    }
}
