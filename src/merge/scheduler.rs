use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use log::{debug, info, warn};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use crate::{
    config::{constants::RECORDS_PER_PAGE, StoreOptions},
    error::StorageResult,
    storage::{page::page_set::PageSet, rid_position, Rid, RidSpace},
    table::Table,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The group now lives in a fresh block with an update counter of zero.
    Merged { records: usize, block_start: u64 },
    /// Fewer updates than the threshold since the last merge.
    BelowThreshold(u64),
    /// Some rid of the group was locked by a transaction.
    Busy,
    /// An insert joined the group while it was being merged.
    Raced,
    /// No live record in the group.
    Empty,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub groups_checked: usize,
    pub groups_merged: usize,
    pub groups_skipped: usize,
    pub records_merged: usize,
    pub errors: usize,
}

impl MergeStats {
    fn record(&mut self, outcome: &StorageResult<MergeOutcome>) {
        self.groups_checked += 1;
        match outcome {
            Ok(MergeOutcome::Merged { records, .. }) => {
                self.groups_merged += 1;
                self.records_merged += records;
            }
            Ok(_) => self.groups_skipped += 1,
            Err(_) => self.errors += 1,
        }
    }

    pub fn absorb(&mut self, other: MergeStats) {
        self.groups_checked += other.groups_checked;
        self.groups_merged += other.groups_merged;
        self.groups_skipped += other.groups_skipped;
        self.records_merged += other.records_merged;
        self.errors += other.errors;
    }
}

/// Folds tail records back into their base page sets.
///
/// A merge never blocks a transaction: it locks every rid of a group with
/// a transaction of its own and simply skips the group when any lock is
/// denied. Readers keep working on the old block until the directory swap.
pub struct MergeScheduler {
    threshold: u64,
    page_sets_to_check: usize,
    interval: Duration,
}

impl MergeScheduler {
    pub fn new(options: &StoreOptions) -> Self {
        MergeScheduler {
            threshold: options.merge_threshold,
            page_sets_to_check: options.page_sets_to_check,
            interval: options.merge_interval,
        }
    }

    /// One timer tick: the next few groups of every table, merged when
    /// their update counter reached the threshold.
    pub fn run_cycle(&self, tables: &[Arc<Table>]) -> MergeStats {
        let mut stats = MergeStats::default();
        for table in tables {
            for group in table.next_merge_groups(self.page_sets_to_check) {
                let outcome = self.merge_if_due(table, group, self.threshold);
                if let Err(err) = &outcome {
                    warn!("Merge of group {} in {} failed: {}", group, table.name(), err);
                }
                stats.record(&outcome);
            }
        }

        if stats.groups_merged > 0 {
            info!(
                "Merge cycle folded {} records in {} groups",
                stats.records_merged, stats.groups_merged
            );
        }
        stats
    }

    /// Merges every group of `table` that has seen at least one update.
    pub fn force_merge(&self, table: &Table) -> MergeStats {
        let mut stats = MergeStats::default();
        for group in 0..table.base_group_count() {
            let outcome = self.merge_if_due(table, group, 1);
            if let Err(err) = &outcome {
                warn!("Forced merge of group {} in {} failed: {}", group, table.name(), err);
            }
            stats.record(&outcome);
        }
        stats
    }

    fn merge_if_due(&self, table: &Table, group: u64, threshold: u64) -> StorageResult<MergeOutcome> {
        match group_update_count(table, group)? {
            None => Ok(MergeOutcome::Empty),
            Some(count) if count < threshold => Ok(MergeOutcome::BelowThreshold(count)),
            Some(_) => self.merge_group(table, group),
        }
    }

    /// Collapses one base group into a new block regardless of its counter.
    pub fn merge_group(&self, table: &Table, group: u64) -> StorageResult<MergeOutcome> {
        let locks = table.locks();
        let txn = locks.begin();

        let group_start = group * RECORDS_PER_PAGE as u64;
        let group_end = {
            // Inserts issue and lock their rid under the write latch, so every
            // rid below group_end is either locked here or held by its writer
            let _directory = table.directory();
            let group_end = group_limit(table, group_start);
            if group_start >= group_end {
                return Ok(MergeOutcome::Empty);
            }

            for rid in group_start..group_end {
                if !locks.acquire_write(txn, rid, RidSpace::Base) {
                    debug!("Group {} of {} is busy at rid {}", group, table.name(), rid);
                    locks.abort(txn);
                    return Ok(MergeOutcome::Busy);
                }
            }
            group_end
        };

        let outcome = relocate_group(table, group_start, group_end);
        match &outcome {
            Ok(MergeOutcome::Merged { records, block_start }) => {
                locks.commit(txn);
                debug!(
                    "Merged group {} of {}: {} records now at block {}",
                    group,
                    table.name(),
                    records,
                    block_start
                );
            }
            _ => {
                locks.abort(txn);
            }
        }
        outcome
    }

    /// Starts the merge timer on the current tokio runtime. Every tick runs
    /// one cycle over whatever `tables` returns at that moment.
    pub fn spawn<F>(self: Arc<Self>, tables: F) -> anyhow::Result<MergeHandle>
    where
        F: Fn() -> Vec<Arc<Table>> + Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .context("the merge scheduler needs a running tokio runtime")?;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let tables = Arc::new(tables);
        let period = self.interval.max(Duration::from_millis(1));

        let task = runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let scheduler = Arc::clone(&self);
                        let tables = Arc::clone(&tables);
                        let stats = tokio::task::spawn_blocking(move || {
                            let snapshot = (*tables)();
                            scheduler.run_cycle(&snapshot)
                        })
                        .await
                        .context("merge cycle panicked")?;
                        debug!("Merge cycle done: {:?}", stats);
                    }
                    _ = &mut stop_rx => break,
                }
            }
            Ok::<(), anyhow::Error>(())
        });

        info!("Merge scheduler started, ticking every {:?}", period);
        Ok(MergeHandle {
            stop: Some(stop_tx),
            task: Some(task),
        })
    }
}

/// Owner of a running merge timer. Dropping it stops the timer after the
/// cycle in progress, if any.
pub struct MergeHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl MergeHandle {
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(stop) = self.stop.take() {
            // The task may already be gone after a failed cycle
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.context("merge scheduler task panicked")??;
        }
        info!("Merge scheduler stopped");
        Ok(())
    }
}

impl Drop for MergeHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

// Caller holds the directory latch
fn group_limit(table: &Table, group_start: Rid) -> Rid {
    let next_rid = table.disk().next_rid(RidSpace::Base);
    next_rid.min(group_start + RECORDS_PER_PAGE as u64)
}

/// Update counter of the block holding a group, `None` when nothing in the
/// group has been inserted.
pub fn group_update_count(table: &Table, group: u64) -> StorageResult<Option<u64>> {
    let group_start = group * RECORDS_PER_PAGE as u64;

    let block_start = {
        let directory = table.directory();
        let group_end = group_limit(table, group_start);
        (group_start..group_end).find_map(|rid| directory.base_block(rid))
    };
    let Some(block_start) = block_start else {
        return Ok(None);
    };

    let page_set = table.pool().get_page_set(table.disk(), RidSpace::Base, block_start)?;
    let count = page_set.read().update_counter();
    Ok(Some(count))
}

struct SourceRecord {
    slot: usize,
    rid: Rid,
    indirection: Rid,
    schema: u64,
    values: Vec<u64>,
    tps: Rid,
}

// Caller holds write locks on every rid in [group_start, group_end).
fn relocate_group(
    table: &Table,
    group_start: Rid,
    group_end: Rid,
) -> StorageResult<MergeOutcome> {
    let disk = table.disk();
    let pool = table.pool();

    let (members, live) = {
        let directory = table.directory();
        let members: Vec<(Rid, u64)> = (group_start..group_end)
            .filter_map(|rid| directory.base_block(rid).map(|block| (rid, block)))
            .collect();
        let live: HashSet<Rid> = directory
            .key_to_base_rid()
            .values()
            .copied()
            .filter(|rid| (group_start..group_end).contains(rid))
            .collect();
        (members, live)
    };
    if live.is_empty() {
        return Ok(MergeOutcome::Empty);
    }

    // Every tail appended so far belongs to a finished writer
    let tps = disk.next_rid(RidSpace::Tail);

    let mut by_block: BTreeMap<u64, Vec<Rid>> = BTreeMap::new();
    for (rid, block) in &members {
        if live.contains(rid) {
            by_block.entry(*block).or_default().push(*rid);
        }
    }

    let mut sources = Vec::with_capacity(live.len());
    for (block_start, rids) in by_block {
        let pinned = pool.get_page_set(disk, RidSpace::Base, block_start)?;
        let page_set = pinned.read();
        for rid in rids {
            let (_, slot) = rid_position(rid);
            sources.push(SourceRecord {
                slot,
                rid,
                indirection: page_set.indirection(slot),
                schema: page_set.schema_encoding(slot),
                values: page_set.columns(slot),
                tps: page_set.tail_position(),
            });
        }
    }

    let mut merged = PageSet::new(disk.num_columns());
    for record in &mut sources {
        table.overlay_tails(&mut record.values, record.indirection, record.schema, record.tps)?;
        merged.write_base_record(record.slot, record.rid, &record.values);
        // Later updates keep chaining off the newest tail
        merged.set_indirection(record.slot, record.indirection);
        merged.set_schema_encoding(record.slot, record.schema);
    }
    merged.set_update_counter(0);
    merged.set_tail_position(tps);

    let block_start = disk.block_start(disk.allocate_next_block(RidSpace::Base));
    {
        let mut pinned = pool.new_page_set(disk, RidSpace::Base, block_start)?;
        *pinned.write() = merged;
    }

    let mut directory = table.directory_mut();
    if group_limit(table, group_start) != group_end {
        return Ok(MergeOutcome::Raced);
    }
    // Holes move too so later inserts into the group land in the new block
    for (rid, _) in &members {
        directory.relocate_base(*rid, block_start);
    }

    Ok(MergeOutcome::Merged {
        records: sources.len(),
        block_start,
    })
}
