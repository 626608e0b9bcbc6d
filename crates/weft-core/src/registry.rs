//! Name to policy table.
//!
//! A registry is built mutably at startup and then frozen behind an `Arc`
//! inside a [`Weft`](crate::Weft) factory. Names are write-once.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::crdt::{self, TypePolicy};
use crate::error::ConfigError;

#[derive(Debug, Clone, Default)]
pub struct Registry {
    types: BTreeMap<String, Arc<dyn TypePolicy>>,
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in policy.
    #[must_use]
    pub fn with_builtins() -> Self {
        let types = crdt::builtins()
            .into_iter()
            .map(|(name, policy)| (name.to_string(), policy))
            .collect();
        Self { types }
    }

    /// Register `policy` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateType`] if `name` is already taken.
    pub fn define(
        &mut self,
        name: impl Into<String>,
        policy: Arc<dyn TypePolicy>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.types.contains_key(&name) {
            return Err(ConfigError::DuplicateType(name));
        }
        tracing::debug!(%name, "defined type");
        self.types.insert(name, policy);
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn TypePolicy>> {
        self.types.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}
