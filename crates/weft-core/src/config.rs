use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::Authenticator;
use crate::clock::Clock;
use crate::network::NetworkConfig;
use crate::store::StoreFactory;
use crate::transport::Transport;

/// Tunables shared by every instance a factory creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,
    /// Re-issue a want that has gone unanswered for this long. Unset means a
    /// want waits indefinitely.
    #[serde(default)]
    pub want_retry_ms: Option<u64>,
    #[serde(default = "default_want_topic")]
    pub want_topic: String,
    /// Change notifications buffered per instance before slow subscribers
    /// start lagging.
    #[serde(default = "default_change_buffer")]
    pub change_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: default_broadcast_interval_ms(),
            want_retry_ms: None,
            want_topic: default_want_topic(),
            change_buffer: default_change_buffer(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// # Errors
    ///
    /// Returns an error if `content` is not a valid config document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Self>(content)?)
    }

    /// Head broadcast period, never shorter than one millisecond.
    #[must_use]
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms.max(1))
    }

    #[must_use]
    pub fn want_retry(&self) -> Option<Duration> {
        self.want_retry_ms.map(|ms| Duration::from_millis(ms.max(1)))
    }

    #[must_use]
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            broadcast_interval: self.broadcast_interval(),
            want_topic: self.want_topic.clone(),
        }
    }
}

const fn default_broadcast_interval_ms() -> u64 {
    200
}

fn default_want_topic() -> String {
    "want".to_string()
}

const fn default_change_buffer() -> usize {
    1024
}

/// Injected capabilities and settings for `create` and `compose`.
///
/// Every field is optional so option sets can be layered with
/// [`merge`](Self::merge).
#[derive(Clone, Default)]
pub struct Options {
    pub network: Option<Arc<dyn Transport>>,
    pub store: Option<StoreFactory>,
    pub authenticate: Option<Arc<dyn Authenticator>>,
    pub clock: Option<Arc<dyn Clock>>,
    /// Replica id used as the author of local entries. Defaults to a random
    /// UUID per instance.
    pub replica: Option<String>,
    /// Prefix for ids derived by `compose`.
    pub namespace: Option<String>,
    pub config: Option<EngineConfig>,
}

impl Options {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn network(mut self, transport: Arc<dyn Transport>) -> Self {
        self.network = Some(transport);
        self
    }

    #[must_use]
    pub fn store(mut self, factory: StoreFactory) -> Self {
        self.store = Some(factory);
        self
    }

    #[must_use]
    pub fn authenticate(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticate = Some(authenticator);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn replica(mut self, replica: impl Into<String>) -> Self {
        self.replica = Some(replica.into());
        self
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Shallow merge: every field set in `overrides` replaces the one in
    /// `self`.
    #[must_use]
    pub fn merge(self, overrides: Self) -> Self {
        Self {
            network: overrides.network.or(self.network),
            store: overrides.store.or(self.store),
            authenticate: overrides.authenticate.or(self.authenticate),
            clock: overrides.clock.or(self.clock),
            replica: overrides.replica.or(self.replica),
            namespace: overrides.namespace.or(self.namespace),
            config: overrides.config.or(self.config),
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("network", &self.network.is_some())
            .field("store", &self.store.is_some())
            .field("authenticate", &self.authenticate.is_some())
            .field("clock", &self.clock)
            .field("replica", &self.replica)
            .field("namespace", &self.namespace)
            .field("config", &self.config)
            .finish()
    }
}
