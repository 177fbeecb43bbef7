//! A lineage based page store: base records that are never rewritten in
//! place, append only tail records carrying updates, and a background merge
//! that folds tails back into fresh base page sets.

pub mod buffer;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod merge;
pub mod storage;
pub mod table;
pub mod utils;

#[cfg(test)]
mod tests;

pub use config::StoreOptions;
pub use engine::StorageEngine;
pub use error::{StorageError, StorageResult};
