use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use log::{debug, info};
use parking_lot::Mutex;

use crate::{
    config::constants::{MAX_COLUMNS, METADATA_PAGES, PAGE_SIZE, RECORDS_PER_PAGE, TABLES_DIR},
    error::{StorageError, StorageResult},
    storage::{
        key_directory::KeyDirectory,
        page::{page::Page, page_set::PageSet},
        Rid, RidSpace, TableId,
    },
};

use super::codec::{decode_info, decode_key_directory, encode_info, encode_key_directory, TableInfo};

struct TableFiles {
    base: PathBuf,
    tail: PathBuf,
    info: PathBuf,
    directory: PathBuf,
}

impl TableFiles {
    fn new(table_dir: &Path, name: &str) -> Self {
        TableFiles {
            base: table_dir.join(format!("{name}.base")),
            tail: table_dir.join(format!("{name}.tail")),
            info: table_dir.join(format!("{name}.info")),
            directory: table_dir.join(format!("{name}.kd")),
        }
    }

    fn all(&self) -> [&PathBuf; 4] {
        [&self.base, &self.tail, &self.info, &self.directory]
    }
}

/// The on disk half of a table: base and tail page set files, the info
/// header and the key directory file.
///
/// Page sets are read and written with positioned I/O so concurrent callers
/// never share a file cursor.
pub struct Disk {
    table_id: TableId,
    name: String,
    table_dir: PathBuf,
    files: TableFiles,

    base_io: File,
    tail_io: File,

    // Single source of truth for rid and block allocation
    info: Mutex<TableInfo>,

    // Held from snapshot to the last file write of a directory rewrite
    persist_latch: Mutex<()>,
}

impl Disk {
    pub fn table_dir(root: &Path, name: &str) -> PathBuf {
        root.join(TABLES_DIR).join(name)
    }

    pub fn exists(root: &Path, name: &str) -> bool {
        Self::table_dir(root, name).is_dir()
    }

    /// Opens the table under `root/Tables/<name>`, creating it when the
    /// directory does not exist yet. An existing header is trusted over the
    /// `num_columns`/`key_column` arguments.
    pub fn open_or_create(
        root: &Path,
        table_id: TableId,
        name: &str,
        num_columns: usize,
        key_column: usize,
    ) -> StorageResult<Disk> {
        let table_dir = Self::table_dir(root, name);
        let files = TableFiles::new(&table_dir, name);

        let info = if table_dir.is_dir() {
            let missing: Vec<_> = files.all().into_iter().filter(|path| !path.exists()).collect();
            if !missing.is_empty() {
                return Err(StorageError::init(
                    &table_dir,
                    format!("missing backing files {missing:?}"),
                ));
            }

            let bytes = fs::read(&files.info)?;
            let info = decode_info(&bytes)
                .map_err(|err| StorageError::init(&files.info, format!("unreadable header: {err}")))?;
            check_layout(&files.info, info.num_columns as usize, info.key_column as usize)?;
            info!("Opened table {} with {} records", name, info.num_records);
            info
        } else {
            check_layout(&table_dir, num_columns, key_column)?;

            fs::create_dir_all(&table_dir)?;
            File::create(&files.base)?;
            File::create(&files.tail)?;
            File::create(&files.directory)?;

            let info = TableInfo::new(num_columns, key_column);
            fs::write(&files.info, encode_info(&info))?;
            info!("Created table {} with {} columns", name, num_columns);
            info
        };

        let base_io = OpenOptions::new().read(true).write(true).open(&files.base)?;
        let tail_io = OpenOptions::new().read(true).write(true).open(&files.tail)?;

        Ok(Disk {
            table_id,
            name: name.to_string(),
            table_dir,
            files,
            base_io,
            tail_io,
            info: Mutex::new(info),
            persist_latch: Mutex::new(()),
        })
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.table_dir
    }

    pub fn num_columns(&self) -> usize {
        self.info.lock().num_columns as usize
    }

    pub fn key_column(&self) -> usize {
        self.info.lock().key_column as usize
    }

    pub fn pages_per_set(&self) -> usize {
        self.num_columns() + METADATA_PAGES
    }

    pub fn info(&self) -> TableInfo {
        *self.info.lock()
    }

    pub fn block_start(&self, block_index: u64) -> u64 {
        block_index * self.pages_per_set() as u64
    }

    fn file(&self, space: RidSpace) -> &File {
        match space {
            RidSpace::Base => &self.base_io,
            RidSpace::Tail => &self.tail_io,
        }
    }

    /// Reads the page set starting at page `block_start`. Bytes past the
    /// end of the file read back as zeros.
    pub fn read_page_set(&self, space: RidSpace, block_start: u64) -> StorageResult<PageSet> {
        let pages_per_set = self.pages_per_set();
        let mut buffer = vec![0u8; pages_per_set * PAGE_SIZE];
        let offset = block_start * PAGE_SIZE as u64;

        let read = read_full_at(self.file(space), &mut buffer, offset)?;
        if read < buffer.len() {
            debug!(
                "Short read of {:?} block {} in {}: {} of {} bytes",
                space,
                block_start,
                self.name,
                read,
                buffer.len()
            );
        }

        let pages = buffer.chunks_exact(PAGE_SIZE).map(Page::from_bytes).collect();
        Ok(PageSet::from_pages(pages))
    }

    pub fn write_page_set(
        &self,
        space: RidSpace,
        page_set: &PageSet,
        block_start: u64,
    ) -> StorageResult<()> {
        let file = self.file(space);
        let mut offset = block_start * PAGE_SIZE as u64;

        // Writing past the end grows the file, the gap reads back as zeros
        for page in page_set.pages() {
            file.write_all_at(page.as_bytes(), offset)?;
            offset += PAGE_SIZE as u64;
        }

        Ok(())
    }

    /// Returns the next block index of `space` and advances the counter.
    pub fn allocate_next_block(&self, space: RidSpace) -> u64 {
        let mut info = self.info.lock();
        Self::take_block(&mut info, space)
    }

    fn take_block(info: &mut TableInfo, space: RidSpace) -> u64 {
        let counter = match space {
            RidSpace::Base => &mut info.next_base_block,
            RidSpace::Tail => &mut info.next_tail_block,
        };
        let block = *counter;
        *counter += 1;
        block
    }

    /// Issues the next rid of `space`. When the rid opens a new group a
    /// block is allocated under the same latch and its start index returned.
    pub fn allocate_rid(&self, space: RidSpace) -> (Rid, Option<u64>) {
        let pages_per_set = self.pages_per_set() as u64;
        let mut info = self.info.lock();

        let counter = match space {
            RidSpace::Base => &mut info.next_base_rid,
            RidSpace::Tail => &mut info.next_tail_rid,
        };
        let rid = *counter;
        *counter += 1;

        let new_block = if rid % RECORDS_PER_PAGE as u64 == 0 {
            Some(Self::take_block(&mut info, space) * pages_per_set)
        } else {
            None
        };

        (rid, new_block)
    }

    /// Keeps the header's record count in step with the directory's keys.
    /// Callers hold the directory latch so both change together.
    pub fn record_inserted(&self) {
        self.info.lock().num_records += 1;
    }

    pub fn record_discarded(&self) {
        let mut info = self.info.lock();
        info.num_records = info.num_records.saturating_sub(1);
    }

    pub fn next_rid(&self, space: RidSpace) -> Rid {
        let info = self.info.lock();
        match space {
            RidSpace::Base => info.next_base_rid,
            RidSpace::Tail => info.next_tail_rid,
        }
    }

    pub fn load_key_directory(&self) -> StorageResult<KeyDirectory> {
        let info = self.info();
        let bytes = fs::read(&self.files.directory)?;

        let directory = decode_key_directory(
            &bytes,
            info.num_records as usize,
            info.next_tail_rid as usize,
        )?;
        debug!(
            "Loaded key directory of {}: {} keys, {} tails",
            self.name,
            directory.num_keys(),
            directory.num_tails()
        );
        Ok(directory)
    }

    /// Rewrites the key directory file and the header from scratch. The
    /// directory must hold a block for every tail rid issued so far.
    pub fn persist_key_directory(&self, directory: &KeyDirectory) -> StorageResult<()> {
        let _latch = self.persist_latch.lock();
        self.write_directory(directory, self.info())
    }

    /// Rewrites the directory and the header together. `header` must be a
    /// counter snapshot taken while `directory` could not change.
    pub fn persist(&self, directory: &KeyDirectory, header: TableInfo) -> StorageResult<()> {
        let _latch = self.persist_latch.lock();
        self.write_directory(directory, header)
    }

    /// Like [`Disk::persist`], but `snapshot` runs under the persist latch.
    /// Overlapping rewrites therefore land in snapshot order and a newer
    /// directory is never overwritten by an older one.
    pub fn persist_with<F>(&self, snapshot: F) -> StorageResult<usize>
    where
        F: FnOnce() -> StorageResult<(KeyDirectory, TableInfo)>,
    {
        let _latch = self.persist_latch.lock();
        let (directory, header) = snapshot()?;
        self.write_directory(&directory, header)?;
        Ok(directory.num_keys())
    }

    // Caller holds persist_latch
    fn write_directory(&self, directory: &KeyDirectory, mut header: TableInfo) -> StorageResult<()> {
        header.num_records = directory.num_keys() as u64;
        let bytes = encode_key_directory(directory)?;

        fs::write(&self.files.directory, bytes)?;
        fs::write(&self.files.info, encode_info(&header))?;
        Ok(())
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.base_io.sync_data()?;
        self.tail_io.sync_data()?;
        Ok(())
    }
}

fn check_layout(path: &Path, num_columns: usize, key_column: usize) -> StorageResult<()> {
    if num_columns == 0 || num_columns > MAX_COLUMNS || key_column >= num_columns {
        return Err(StorageError::init(
            path,
            format!("invalid layout: {num_columns} columns, key column {key_column}"),
        ));
    }
    Ok(())
}

fn read_full_at(file: &File, buffer: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut read = 0;
    while read < buffer.len() {
        match file.read_at(&mut buffer[read..], offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(read)
}
