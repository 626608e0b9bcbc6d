//! Entry persistence.
//!
//! The engine talks to storage only through the [`EntryStore`] trait:
//! content-addressed `has`/`get`/`put` keyed by [`EntryId`]. Stores must be
//! safe to share across tasks; they synchronize internally.
//!
//! - [`MemoryStore`]: process-local map, the default.
//! - [`FsStore`]: one JSON file per entry under a directory.

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::entry::{Entry, EntryId};
use crate::error::ErrorCode;

/// Errors surfaced by an [`EntryStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored entry could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("entry stored under {key} has id {actual}")]
    KeyMismatch { key: EntryId, actual: EntryId },

    #[error("refusing to store under malformed id {0}")]
    InvalidKey(EntryId),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::StoreFailure
    }
}

/// Content-addressed key/value persistence for log entries.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn has(&self, id: &EntryId) -> Result<bool, StoreError>;

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError>;

    /// Storing an id twice is a no-op.
    async fn put(&self, id: &EntryId, entry: &Entry) -> Result<(), StoreError>;

    /// Every stored entry, in no particular order.
    ///
    /// Used to re-derive heads and the accumulator when a log is reopened.
    /// Stores that cannot enumerate return an empty list.
    async fn scan(&self) -> Result<Vec<Entry>, StoreError> {
        Ok(Vec::new())
    }
}

/// Builds the store for one instance id.
pub type StoreFactory = Arc<dyn Fn(&str) -> Arc<dyn EntryStore> + Send + Sync>;

/// Factory handing every instance a fresh [`MemoryStore`].
#[must_use]
pub fn memory_factory() -> StoreFactory {
    Arc::new(|_id: &str| Arc::new(MemoryStore::new()) as Arc<dyn EntryStore>)
}

fn check_key(key: &EntryId, entry: &Entry) -> Result<(), StoreError> {
    if &entry.id == key {
        Ok(())
    } else {
        Err(StoreError::KeyMismatch {
            key: key.clone(),
            actual: entry.id.clone(),
        })
    }
}
