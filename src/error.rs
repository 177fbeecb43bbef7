use std::path::PathBuf;

use thiserror::Error;

use crate::storage::{Rid, RidSpace};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("table directory {path:?} is inconsistent: {reason}")]
    StorageInit { path: PathBuf, reason: String },
    #[error("lock denied on {space:?} rid {rid}")]
    LockDenied { rid: Rid, space: RidSpace },
    #[error("buffer pool exhausted: every resident page set is pinned")]
    PoolExhausted,
    #[error("corrupt key directory record: {0}")]
    CorruptDirectoryRecord(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("duplicated key: {0}")]
    DuplicateKey(u64),
    #[error("key {0} not found")]
    KeyNotFound(u64),
    #[error("expected {expected} columns, got {found}")]
    ColumnCountMismatch { expected: usize, found: usize },
    #[error("table {0} not found")]
    UnknownTable(String),
    #[error("table {0} already exists")]
    TableExists(String),
    #[error("{space:?} rid {rid} has not been assigned")]
    InvalidRid { rid: Rid, space: RidSpace },
}

impl StorageError {
    /// Lock denial and pool exhaustion clear up once other operations finish.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::LockDenied { .. } | StorageError::PoolExhausted)
    }

    pub fn corrupt(message: impl ToString) -> Self {
        StorageError::CorruptDirectoryRecord(message.to_string())
    }

    pub fn init(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StorageError::StorageInit {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
