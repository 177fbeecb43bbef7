use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    buffer::buffer_pool_manager::BufferPool,
    concurrency::lock_manager::{LockManager, TxnId},
    config::{constants::TABLES_DIR, StoreOptions},
    error::{StorageError, StorageResult},
    merge::scheduler::{MergeHandle, MergeScheduler, MergeStats},
    storage::disk::manager::Disk,
    table::Table,
};

type TableCatalog = Arc<RwLock<HashMap<String, Arc<Table>>>>;

/// Owns everything shared between tables: one buffer pool, one lock
/// manager and the merge scheduler.
///
/// Tables already on disk under `root/Tables` are opened eagerly.
pub struct StorageEngine {
    root: PathBuf,
    pool: Arc<BufferPool>,
    locks: Arc<LockManager>,
    tables: TableCatalog,
    next_table_id: AtomicU64,

    merge: Arc<MergeScheduler>,
    merge_handle: Mutex<Option<MergeHandle>>,
}

impl StorageEngine {
    pub fn open(root: impl AsRef<Path>, options: StoreOptions) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let tables_dir = root.join(TABLES_DIR);
        fs::create_dir_all(&tables_dir)?;

        let pool = Arc::new(BufferPool::with_kind(
            options.max_page_sets_in_buffer(),
            options.replacer,
        ));
        let locks = Arc::new(LockManager::new());

        let mut names = Vec::new();
        for entry in fs::read_dir(&tables_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        // Stable table ids across runs with the same set of tables
        names.sort();

        let mut tables = HashMap::with_capacity(names.len());
        for (table_id, name) in names.into_iter().enumerate() {
            let disk = Disk::open_or_create(&root, table_id as u64, &name, 0, 0)?;
            let table = Table::open(disk, Arc::clone(&pool), Arc::clone(&locks))?;
            tables.insert(name, Arc::new(table));
        }

        info!(
            "Opened storage at {:?} with {} tables and {} buffer frames",
            root,
            tables.len(),
            pool.capacity()
        );

        Ok(StorageEngine {
            root,
            next_table_id: AtomicU64::new(tables.len() as u64),
            pool,
            locks,
            tables: Arc::new(RwLock::new(tables)),
            merge: Arc::new(MergeScheduler::new(&options)),
            merge_handle: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create_table(
        &self,
        name: &str,
        num_columns: usize,
        key_column: usize,
    ) -> StorageResult<Arc<Table>> {
        let mut tables = self.tables.write();
        if tables.contains_key(name) || Disk::exists(&self.root, name) {
            return Err(StorageError::TableExists(name.to_string()));
        }

        let table = self.load_table(name, num_columns, key_column)?;
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    // Closed tables come back under a new id so none of their old frames match
    fn load_table(&self, name: &str, num_columns: usize, key_column: usize) -> StorageResult<Arc<Table>> {
        let table_id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let disk = Disk::open_or_create(&self.root, table_id, name, num_columns, key_column)?;
        let table = Table::open(disk, Arc::clone(&self.pool), Arc::clone(&self.locks))?;
        Ok(Arc::new(table))
    }

    /// Returns the table `name`, opening it from disk when it was closed
    /// and creating it with the given layout when it does not exist yet.
    /// The layout arguments are ignored for a table that has files.
    pub fn open_table(
        &self,
        name: &str,
        num_columns: usize,
        key_column: usize,
    ) -> StorageResult<Arc<Table>> {
        if let Some(table) = self.tables.read().get(name) {
            return Ok(Arc::clone(table));
        }

        let mut tables = self.tables.write();
        if let Some(table) = tables.get(name) {
            return Ok(Arc::clone(table));
        }
        let table = self.load_table(name, num_columns, key_column)?;
        tables.insert(name.to_string(), Arc::clone(&table));
        info!("Opened table {} as id {}", name, table.table_id());
        Ok(table)
    }

    pub fn table(&self, name: &str) -> StorageResult<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Flushes a table and drops it from the engine. Its files stay on disk.
    pub fn close_table(&self, name: &str) -> StorageResult<()> {
        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))?;
        table.flush()?;
        self.pool.discard_table(table.table_id());
        Ok(())
    }

    pub fn begin(&self) -> TxnId {
        self.locks.begin()
    }

    pub fn commit(&self, txn: TxnId) -> usize {
        self.locks.commit(txn)
    }

    /// Releases the locks of `txn`. Writes it already made stay in place.
    pub fn abort(&self, txn: TxnId) -> usize {
        self.locks.abort(txn)
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Merges every group of `name` that has pending tail records.
    pub fn force_merge(&self, name: &str) -> StorageResult<MergeStats> {
        let table = self.table(name)?;
        Ok(self.merge.force_merge(&table))
    }

    pub fn force_merge_all(&self) -> MergeStats {
        let mut stats = MergeStats::default();
        for table in self.snapshot_tables() {
            stats.absorb(self.merge.force_merge(&table));
        }
        stats
    }

    /// One merge cycle over every table, the same work a timer tick does.
    pub fn run_merge_cycle(&self) -> MergeStats {
        self.merge.run_cycle(&self.snapshot_tables())
    }

    fn snapshot_tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().values().cloned().collect()
    }

    /// Starts the periodic merge on the current tokio runtime. Calling it
    /// again while the timer runs does nothing.
    pub fn start_merge_scheduler(&self) -> anyhow::Result<()> {
        let mut handle = self.merge_handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        let tables = Arc::clone(&self.tables);
        *handle = Some(
            Arc::clone(&self.merge)
                .spawn(move || tables.read().values().cloned().collect())?,
        );
        Ok(())
    }

    /// Stops the merge timer and waits for a running cycle to finish.
    pub async fn stop_merge_scheduler(&self) -> anyhow::Result<()> {
        let handle = self.merge_handle.lock().take();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    pub fn flush_all(&self) -> StorageResult<()> {
        let mut first_error = None;
        for table in self.snapshot_tables() {
            if let Err(err) = table.flush() {
                warn!("Flush of {} failed: {}", table.name(), err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Signals the merge timer to stop and flushes every table.
    pub fn close(&self) -> StorageResult<()> {
        drop(self.merge_handle.lock().take());
        self.flush_all()?;
        info!("Closed storage at {:?}", self.root);
        Ok(())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Storage at {:?} was not flushed cleanly on drop: {}", self.root, err);
        }
    }
}
