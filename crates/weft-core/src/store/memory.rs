use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{EntryStore, StoreError, check_key};
use crate::entry::{Entry, EntryId};

/// In-memory [`EntryStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<EntryId, Entry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn has(&self, id: &EntryId) -> Result<bool, StoreError> {
        Ok(self.entries.read().await.contains_key(id))
    }

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn put(&self, id: &EntryId, entry: &Entry) -> Result<(), StoreError> {
        check_key(id, entry)?;
        self.entries
            .write()
            .await
            .entry(id.clone())
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<Entry>, StoreError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }
}
