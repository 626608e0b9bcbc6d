//! Causal append log for one replica of one CRDT instance.
//!
//! The [`Log`] owns the replica's frontier ("heads") and writes entries
//! through an [`EntryStore`]. Entries form a DAG via their parent ids; the
//! log is append-only and never mutates or removes a stored entry.
//!
//! # Frontier invariant
//!
//! `heads` is exactly the set of known entry ids that no known entry names as
//! a parent, and no head is an ancestor of another head. The log maintains it
//! with [`recompute_frontier`], which relies on ancestor completeness: every
//! parent of an integrated entry is already stored. Under that precondition
//! any head that is an ancestor of the new entry is one of its direct
//! parents, since a deeper ancestor was already superseded when its own child
//! was integrated.
//!
//! Heads are not persisted. [`Log::restore`] re-derives them from a scan of
//! the store with [`derive_frontier`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::auth::{AuthError, Authenticator};
use crate::entry::{Entry, EntryId};
use crate::error::ErrorCode;
use crate::store::{EntryStore, StoreError};

/// Errors from log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// An entry was integrated before one of its parents.
    #[error("entry {entry} integrated before its parent {parent}")]
    MissingAncestor { entry: EntryId, parent: EntryId },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl LogError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingAncestor { .. } => ErrorCode::MissingAncestor,
            Self::Store(_) => ErrorCode::StoreFailure,
            Self::Auth(_) => ErrorCode::AuthenticationFailed,
        }
    }
}

/// The causal history of one replica.
pub struct Log {
    replica: String,
    heads: BTreeSet<EntryId>,
    store: Arc<dyn EntryStore>,
    authenticator: Arc<dyn Authenticator>,
}

/// Read-only view of a log's store, shared with the network layer.
#[derive(Clone)]
pub struct LogReader {
    store: Arc<dyn EntryStore>,
}

impl LogReader {
    pub async fn has(&self, id: &EntryId) -> Result<bool, StoreError> {
        self.store.has(id).await
    }

    pub async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        self.store.get(id).await
    }
}

impl Log {
    pub fn new(
        replica: impl Into<String>,
        store: Arc<dyn EntryStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            replica: replica.into(),
            heads: BTreeSet::new(),
            store,
            authenticator,
        }
    }

    #[must_use]
    pub fn replica(&self) -> &str {
        &self.replica
    }

    #[must_use]
    pub const fn heads(&self) -> &BTreeSet<EntryId> {
        &self.heads
    }

    #[must_use]
    pub fn reader(&self) -> LogReader {
        LogReader {
            store: Arc::clone(&self.store),
        }
    }

    /// Append a locally produced payload on top of the current heads.
    ///
    /// The new entry names every current head as a parent, so it becomes the
    /// sole head.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Auth`] if the authenticator rejects the entry, or
    /// [`LogError::Store`] if the write fails. Heads are unchanged on error.
    #[instrument(skip_all, fields(replica = %self.replica))]
    pub async fn append(&mut self, payload: Value) -> Result<Entry, LogError> {
        let mut entry = Entry::new(payload, self.heads.iter().cloned(), self.replica.clone());
        entry.authentication = self.authenticator.authenticate(&entry, &entry.parents)?;
        self.store.put(&entry.id, &entry).await?;
        self.heads = recompute_frontier(&self.heads, &entry);
        debug!(entry = %entry.id, parents = entry.parents.len(), "appended entry");
        Ok(entry)
    }

    pub async fn has(&self, id: &EntryId) -> Result<bool, StoreError> {
        self.store.has(id).await
    }

    pub async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        self.store.get(id).await
    }

    /// Integrate a remote entry whose ancestors are all present.
    ///
    /// Returns `false` without touching the store if the entry is already
    /// known.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::MissingAncestor`] if a parent is not stored.
    #[instrument(skip_all, fields(replica = %self.replica, entry = %entry.id))]
    pub async fn integrate(&mut self, entry: &Entry) -> Result<bool, LogError> {
        if self.store.has(&entry.id).await? {
            return Ok(false);
        }
        for parent in &entry.parents {
            if !self.store.has(parent).await? {
                return Err(LogError::MissingAncestor {
                    entry: entry.id.clone(),
                    parent: parent.clone(),
                });
            }
        }

        self.store.put(&entry.id, entry).await?;
        self.heads = recompute_frontier(&self.heads, entry);
        debug!(heads = self.heads.len(), "integrated entry");
        Ok(true)
    }

    /// Reload heads from the store and return every stored entry in causal
    /// order, ready to be folded.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Store`] if the scan fails.
    pub async fn restore(&mut self) -> Result<Vec<Entry>, LogError> {
        let entries = self.store.scan().await?;
        self.heads = derive_frontier(&entries);
        let ordered = topological_order(&entries).into_iter().cloned().collect::<Vec<_>>();
        if !ordered.is_empty() {
            debug!(
                replica = %self.replica,
                entries = ordered.len(),
                heads = self.heads.len(),
                "restored log from store"
            );
        }
        Ok(ordered)
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("replica", &self.replica)
            .field("heads", &self.heads)
            .finish_non_exhaustive()
    }
}

/// Compute the frontier after adding `entry` to a log whose frontier was
/// `old`. The entry's parents must already be known.
#[must_use]
pub fn recompute_frontier(old: &BTreeSet<EntryId>, entry: &Entry) -> BTreeSet<EntryId> {
    let mut heads: BTreeSet<EntryId> = old
        .iter()
        .filter(|head| !entry.parents.contains(*head))
        .cloned()
        .collect();
    heads.insert(entry.id.clone());
    heads
}

/// Frontier of an arbitrary set of entries: ids never referenced as a
/// parent.
#[must_use]
pub fn derive_frontier(entries: &[Entry]) -> BTreeSet<EntryId> {
    let referenced: HashSet<&EntryId> = entries.iter().flat_map(|e| &e.parents).collect();
    entries
        .iter()
        .map(|e| &e.id)
        .filter(|id| !referenced.contains(id))
        .cloned()
        .collect()
}

/// Order entries so every parent precedes its children (Kahn's algorithm).
///
/// Parents outside the slice are ignored. When several entries are ready at
/// once the smallest id goes first, so the order is deterministic.
#[must_use]
pub fn topological_order(entries: &[Entry]) -> Vec<&Entry> {
    let by_id: HashMap<&EntryId, &Entry> = entries.iter().map(|e| (&e.id, e)).collect();
    let mut in_degree: HashMap<&EntryId, usize> = HashMap::with_capacity(by_id.len());
    let mut children: HashMap<&EntryId, Vec<&EntryId>> = HashMap::new();

    for (&id, entry) in &by_id {
        let known_parents: BTreeSet<&EntryId> = entry
            .parents
            .iter()
            .filter(|p| by_id.contains_key(p))
            .collect();
        in_degree.insert(id, known_parents.len());
        for parent in known_parents {
            children.entry(parent).or_default().push(id);
        }
    }

    let mut ready: BTreeSet<&EntryId> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut result = Vec::with_capacity(by_id.len());

    while let Some(current) = ready.pop_first() {
        if let Some(entry) = by_id.get(current) {
            result.push(*entry);
        }
        for &child in children.get(current).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(child) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    ready.insert(child);
                }
            }
        }
    }

    result
}
