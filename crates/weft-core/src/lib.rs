//! weft-core library.
//!
//! Gossip-replicated CRDT instances backed by a content-addressed causal
//! log. Each replica appends mutations to its [`Log`], pushes its heads over
//! a pluggable [`Transport`], pulls missing ancestors with wants, and folds
//! every entry exactly once through a [`TypePolicy`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use weft_core::{LocalHub, Options, Weft};
//!
//! let hub = LocalHub::new();
//! let weft = Weft::default();
//! let counter = weft.create(
//!     "g-counter",
//!     "visits",
//!     Options::new().network(Arc::new(hub.endpoint("a"))),
//! )?;
//! counter.network().start().await?;
//! counter.increment().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Conventions
//!
//! - **Errors**: one `thiserror` enum per module, each with a `code()`
//!   mapping to [`ErrorCode`]. Config loading uses `anyhow::Result`.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod auth;
pub mod clock;
pub mod compose;
pub mod config;
pub mod crdt;
pub mod engine;
pub mod entry;
pub mod error;
pub mod factory;
pub mod log;
pub mod network;
pub mod registry;
pub mod store;
pub mod transport;

pub use auth::{AuthError, Authenticator, KeyedAuthenticator, Unauthenticated};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compose::{ComposeError, Composite};
pub use config::{EngineConfig, Options};
pub use crdt::{Accumulator, MutationContext, PolicyError, TypePolicy, Value};
pub use engine::{Change, EngineError, EngineStats, Instance, Origin};
pub use entry::{Entry, EntryId, InvalidEntryId};
pub use error::{ConfigError, ErrorCode};
pub use factory::Weft;
pub use log::{Log, LogError};
pub use network::{Network, NetworkError};
pub use registry::Registry;
pub use store::{EntryStore, FsStore, MemoryStore, StoreError};
pub use transport::{LocalBus, LocalHub, Transport, TransportError};
