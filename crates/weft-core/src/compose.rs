//! Schema-shaped handle over several named instances.
//!
//! Composition is purely namespacing: each named instance keeps its own log,
//! network and value, and there is no coordination between them.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::crdt::Value;
use crate::engine::{EngineError, Instance};
use crate::entry::Entry;
use crate::error::ErrorCode;
use crate::network::NetworkError;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("no instance named {0} in this schema")]
    UnknownName(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ComposeError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownName(_) => ErrorCode::UnknownInstance,
            Self::Engine(err) => err.code(),
        }
    }
}

/// Instances created by [`Weft::compose`](crate::Weft::compose), keyed by
/// schema name.
#[derive(Debug, Clone)]
pub struct Composite {
    instances: BTreeMap<String, Instance>,
}

impl Composite {
    pub(crate) const fn new(instances: BTreeMap<String, Instance>) -> Self {
        Self { instances }
    }

    /// # Errors
    ///
    /// Returns [`ComposeError::UnknownName`] if `name` is not in the schema.
    pub fn instance(&self, name: &str) -> Result<&Instance, ComposeError> {
        self.instances
            .get(name)
            .ok_or_else(|| ComposeError::UnknownName(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    /// Route a mutator call to the instance named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::UnknownName`] or the instance's own error.
    pub async fn mutate(
        &self,
        name: &str,
        mutator: &str,
        args: Vec<Json>,
    ) -> Result<Entry, ComposeError> {
        Ok(self.instance(name)?.mutate(mutator, args).await?)
    }

    /// # Errors
    ///
    /// Returns [`ComposeError::UnknownName`] if `name` is not in the schema.
    pub fn value(&self, name: &str) -> Result<Value, ComposeError> {
        Ok(self.instance(name)?.value())
    }

    /// Every value, keyed by schema name.
    #[must_use]
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.instances
            .iter()
            .map(|(name, instance)| (name.clone(), instance.value()))
            .collect()
    }

    /// Start every instance's network.
    ///
    /// # Errors
    ///
    /// Returns the first failure; networks started before it keep running.
    pub async fn start(&self) -> Result<(), NetworkError> {
        for instance in self.instances.values() {
            instance.network().start().await?;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        for instance in self.instances.values() {
            instance.network().stop().await;
        }
    }
}
