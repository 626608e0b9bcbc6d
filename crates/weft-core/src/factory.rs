//! Entry point: creates instances from a frozen registry and layered
//! default options.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;
use uuid::Uuid;

use crate::auth::Unauthenticated;
use crate::clock::SystemClock;
use crate::compose::Composite;
use crate::config::Options;
use crate::engine::{EngineSetup, Instance, MergeEngine};
use crate::error::ConfigError;
use crate::log::Log;
use crate::registry::Registry;
use crate::store::memory_factory;

/// Instance factory bound to a registry and default options. Cheap to
/// clone.
#[derive(Debug, Clone)]
pub struct Weft {
    registry: Arc<Registry>,
    defaults: Options,
}

impl Default for Weft {
    fn default() -> Self {
        Self::new(Registry::with_builtins())
    }
}

impl Weft {
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            defaults: Options::default(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A new factory sharing this registry, whose defaults are this
    /// factory's defaults shallowly overridden by `overrides`.
    #[must_use]
    pub fn defaults(&self, overrides: Options) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            defaults: self.defaults.clone().merge(overrides),
        }
    }

    /// Create one replica of the instance `id` of type `type_name`.
    ///
    /// The network is created stopped; call `instance.network().start()` to
    /// begin gossiping.
    ///
    /// # Errors
    ///
    /// Checked in this order: [`ConfigError::UnknownType`],
    /// [`ConfigError::MissingId`], [`ConfigError::MissingNetwork`], and
    /// [`ConfigError::NoRuntime`] when called outside a tokio runtime.
    pub fn create(
        &self,
        type_name: &str,
        id: &str,
        options: Options,
    ) -> Result<Instance, ConfigError> {
        let policy = self
            .registry
            .lookup(type_name)
            .ok_or_else(|| ConfigError::UnknownType(type_name.to_string()))?;
        if id.is_empty() {
            return Err(ConfigError::MissingId);
        }
        let options = self.defaults.clone().merge(options);
        let transport = options.network.ok_or(ConfigError::MissingNetwork)?;
        if Handle::try_current().is_err() {
            return Err(ConfigError::NoRuntime);
        }

        let replica = options
            .replica
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let make_store = options.store.unwrap_or_else(memory_factory);
        let store = make_store.as_ref()(id);
        let authenticator = options
            .authenticate
            .unwrap_or_else(|| Arc::new(Unauthenticated));
        let clock = options.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let config = options.config.unwrap_or_default();

        info!(kind = type_name, id, %replica, "creating instance");
        Ok(MergeEngine::spawn(EngineSetup {
            type_name: type_name.to_string(),
            id: id.to_string(),
            policy,
            log: Log::new(replica, store, authenticator),
            transport,
            clock,
            config,
        }))
    }

    /// Create one instance per `name -> type` pair of `schema`.
    ///
    /// Each instance id is the name, or `<namespace>/<name>` when the merged
    /// options carry a namespace.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] raised by [`create`](Self::create);
    /// instances created before the failure are dropped.
    pub fn compose<'a>(
        &self,
        schema: impl IntoIterator<Item = (&'a str, &'a str)>,
        options: Options,
    ) -> Result<Composite, ConfigError> {
        let options = self.defaults.clone().merge(options);
        let mut instances = BTreeMap::new();
        for (name, type_name) in schema {
            let id = match options.namespace.as_deref() {
                Some(prefix) => format!("{prefix}/{name}"),
                None => name.to_string(),
            };
            let instance = self.create(type_name, &id, options.clone())?;
            instances.insert(name.to_string(), instance);
        }
        Ok(Composite::new(instances))
    }
}
