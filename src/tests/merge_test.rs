#[cfg(test)]
pub mod test {

    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    use tempfile::TempDir;

    use crate::{
        buffer::buffer_pool_manager::BufferPool,
        concurrency::lock_manager::LockManager,
        config::{constants::RECORDS_PER_PAGE, StoreOptions},
        merge::scheduler::{group_update_count, MergeOutcome, MergeScheduler},
        storage::{disk::manager::Disk, RidSpace},
        table::Table,
        tests::init_logger,
    };

    fn table(root: &TempDir, num_columns: usize) -> Arc<Table> {
        init_logger();
        let disk = Disk::open_or_create(root.path(), 0, "merge", num_columns, 0).unwrap();
        let table = Table::open(disk, Arc::new(BufferPool::new(16)), Arc::new(LockManager::new()));
        Arc::new(table.unwrap())
    }

    fn scheduler(threshold: u64) -> MergeScheduler {
        MergeScheduler::new(
            &StoreOptions::default()
                .merge_threshold(threshold)
                .page_sets_to_check(2),
        )
    }

    #[test]
    fn merged_group_reads_the_same() {
        let root = TempDir::new().unwrap();
        let table = table(&root, 3);
        let records = RECORDS_PER_PAGE as u64 + 40;

        let txn = table.locks().begin();
        for key in 0..records {
            table.insert_base_record(txn, &[key, key, 0]).unwrap();
        }
        for key in (0..records).step_by(3) {
            table.update_by_key(txn, key, &[None, Some(key + 1), None]).unwrap();
            table.update_by_key(txn, key, &[None, None, Some(key * 2)]).unwrap();
        }
        table.locks().commit(txn);

        let before: Vec<_> = {
            let txn = table.locks().begin();
            let values = (0..records).map(|key| table.read_by_key(txn, key).unwrap()).collect();
            table.locks().commit(txn);
            values
        };

        let old_block = table.base_block(0).unwrap();
        let stats = scheduler(1).force_merge(&table);
        assert_eq!(stats.groups_merged, 2);
        assert_eq!(stats.records_merged, records as usize);
        assert_ne!(table.base_block(0).unwrap(), old_block);
        assert_eq!(group_update_count(&table, 0).unwrap(), Some(0));
        assert_eq!(group_update_count(&table, 1).unwrap(), Some(0));

        let txn = table.locks().begin();
        for key in 0..records {
            assert_eq!(table.read_by_key(txn, key).unwrap(), before[key as usize]);
        }
        table.locks().commit(txn);

        // Updates after the merge chain off the folded tails
        let txn = table.locks().begin();
        table.update_by_key(txn, 3, &[None, Some(100), None]).unwrap();
        assert_eq!(table.read_by_key(txn, 3).unwrap(), vec![3, 100, 6]);
        assert_eq!(group_update_count(&table, 0).unwrap(), Some(1));

        // Inserts into a merged group land in the merged block
        let rid = table.insert_base_record(txn, &[records, 1, 1]).unwrap();
        assert_eq!(table.base_block(rid).unwrap(), table.base_block(rid - 1).unwrap());
        assert_eq!(table.read_by_key(txn, records).unwrap(), vec![records, 1, 1]);
    }

    #[test]
    fn locked_group_is_skipped() {
        let root = TempDir::new().unwrap();
        let table = table(&root, 2);
        let scheduler = scheduler(1);

        let setup = table.locks().begin();
        for key in 0..10 {
            table.insert_base_record(setup, &[key, 0]).unwrap();
        }
        table.locks().commit(setup);

        let writer = table.locks().begin();
        table.update_by_key(writer, 4, &[None, Some(1)]).unwrap();

        assert_eq!(scheduler.merge_group(&table, 0).unwrap(), MergeOutcome::Busy);
        // The merge gave back every lock it took
        assert_eq!(table.locks().locked_keys(), 1);

        table.locks().commit(writer);
        assert!(matches!(
            scheduler.merge_group(&table, 0).unwrap(),
            MergeOutcome::Merged { records: 10, .. }
        ));
        assert_eq!(table.locks().locked_keys(), 0);

        let reader = table.locks().begin();
        assert_eq!(table.read_by_key(reader, 4).unwrap(), vec![4, 1]);
    }

    #[test]
    fn cycle_waits_for_the_threshold() {
        let root = TempDir::new().unwrap();
        let table = table(&root, 2);
        let scheduler = scheduler(5);
        let tables = vec![Arc::clone(&table)];

        let txn = table.locks().begin();
        table.insert_base_record(txn, &[1, 0]).unwrap();
        for value in 1..=4 {
            table.update_by_key(txn, 1, &[None, Some(value)]).unwrap();
        }
        table.locks().commit(txn);

        let stats = scheduler.run_cycle(&tables);
        assert_eq!(stats.groups_checked, 1);
        assert_eq!(stats.groups_merged, 0);
        assert_eq!(group_update_count(&table, 0).unwrap(), Some(4));

        let txn = table.locks().begin();
        table.update_by_key(txn, 1, &[None, Some(5)]).unwrap();
        table.locks().commit(txn);

        let stats = scheduler.run_cycle(&tables);
        assert_eq!(stats.groups_merged, 1);
        assert_eq!(group_update_count(&table, 0).unwrap(), Some(0));

        let block = table.base_block(0).unwrap();
        let page_set = table.pool().get_page_set(table.disk(), RidSpace::Base, block).unwrap();
        assert_eq!(page_set.read().column(0, 1), 5);
        assert_eq!(page_set.read().tail_position(), 5);
    }

    #[test]
    fn inserts_survive_merges_of_their_group() {
        let root = TempDir::new().unwrap();
        let table = table(&root, 2);
        let scheduler = scheduler(1);
        let done = AtomicBool::new(false);

        let setup = table.locks().begin();
        table.insert_base_record(setup, &[0, 0]).unwrap();
        table.locks().commit(setup);

        thread::scope(|scope| {
            scope.spawn(|| {
                for key in 1..300 {
                    let txn = table.locks().begin();
                    // A merge must never hold the lock of a rid it did not see issued
                    table.insert_base_record(txn, &[key, key + 1]).unwrap();
                    table.locks().commit(txn);
                }
                done.store(true, Ordering::SeqCst);
            });
            scope.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    let outcome = scheduler.merge_group(&table, 0).unwrap();
                    assert_ne!(outcome, MergeOutcome::Empty);
                }
            });
        });

        assert_eq!(table.locks().locked_keys(), 0);
        assert!(matches!(
            scheduler.merge_group(&table, 0).unwrap(),
            MergeOutcome::Merged { records: 300, .. }
        ));
        let txn = table.locks().begin();
        assert_eq!(table.read_by_key(txn, 0).unwrap(), vec![0, 0]);
        for key in 1..300 {
            assert_eq!(table.read_by_key(txn, key).unwrap(), vec![key, key + 1]);
        }
        table.locks().commit(txn);
    }

    #[test]
    fn empty_table_has_nothing_to_merge() {
        let root = TempDir::new().unwrap();
        let table = table(&root, 1);
        let scheduler = scheduler(1);

        assert_eq!(scheduler.merge_group(&table, 0).unwrap(), MergeOutcome::Empty);
        assert_eq!(scheduler.force_merge(&table).groups_checked, 0);
        assert_eq!(group_update_count(&table, 3).unwrap(), None);
    }
}
