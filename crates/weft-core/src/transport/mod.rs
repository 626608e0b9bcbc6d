//! Pub/sub transport abstraction.
//!
//! The network layer needs only three things from a transport: broadcast a
//! byte message on a string topic, subscribe to a topic, and unsubscribe.
//! Delivery may be lossy, duplicated or reordered; the want protocol repairs
//! gaps. Messages are JSON: a serialized [`Entry`](crate::entry::Entry) for
//! head announcements and want responses, `{"id": ...}` for want requests.
//!
//! [`LocalHub`] provides an in-process implementation for tests and
//! simulations.

mod local;

pub use local::{LocalBus, LocalHub};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ErrorCode;

/// Identifies one subscription so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// A live subscription: messages published on `topic` arrive on `messages`.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub messages: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Errors from a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport rejected message on {topic}: {reason}")]
    Rejected { topic: String, reason: String },
}

impl TransportError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Closed => ErrorCode::ChannelClosed,
            Self::Rejected { .. } => ErrorCode::TransportFailure,
        }
    }
}

/// String-topic publish/subscribe substrate.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `message` to every current subscriber of `topic`.
    async fn broadcast(&self, topic: &str, message: Vec<u8>) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;

    /// Removing an unknown subscription is a no-op.
    fn unsubscribe(&self, topic: &str, id: SubscriptionId);
}
