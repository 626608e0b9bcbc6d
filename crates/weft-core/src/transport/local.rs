use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{Subscription, SubscriptionId, Transport, TransportError};

/// In-process message hub shared by any number of [`LocalBus`] endpoints.
///
/// Every broadcast is delivered to every subscriber of the topic, the sender
/// included. A partitioned peer neither sends nor receives traffic from
/// other peers until it is reconnected.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

#[derive(Debug, Default)]
struct HubState {
    next_id: u64,
    topics: HashMap<String, Vec<Subscriber>>,
    partitioned: BTreeSet<String>,
}

#[derive(Debug)]
struct Subscriber {
    id: SubscriptionId,
    peer: String,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport endpoint for one peer.
    #[must_use]
    pub fn endpoint(&self, peer: impl Into<String>) -> LocalBus {
        LocalBus {
            hub: self.clone(),
            peer: peer.into(),
        }
    }

    /// Isolate or reconnect a peer.
    pub fn set_partitioned(&self, peer: &str, isolated: bool) {
        let mut state = self.lock();
        if isolated {
            state.partitioned.insert(peer.to_string());
        } else {
            state.partitioned.remove(peer);
        }
    }

    #[must_use]
    pub fn is_partitioned(&self, peer: &str) -> bool {
        self.lock().partitioned.contains(peer)
    }

    /// Number of live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, from: &str, topic: &str, message: &[u8]) -> usize {
        let mut state = self.lock();
        let sender_isolated = state.partitioned.contains(from);
        let HubState {
            topics, partitioned, ..
        } = &mut *state;

        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|sub| {
            let crosses_partition =
                sub.peer != from && (sender_isolated || partitioned.contains(&sub.peer));
            if crosses_partition {
                return true;
            }
            if sub.sender.send(message.to_vec()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        delivered
    }
}

/// One peer's view of a [`LocalHub`].
#[derive(Debug, Clone)]
pub struct LocalBus {
    hub: LocalHub,
    peer: String,
}

impl LocalBus {
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[must_use]
    pub const fn hub(&self) -> &LocalHub {
        &self.hub
    }
}

#[async_trait]
impl Transport for LocalBus {
    async fn broadcast(&self, topic: &str, message: Vec<u8>) -> Result<(), TransportError> {
        let delivered = self.hub.publish(&self.peer, topic, &message);
        trace!(peer = %self.peer, topic, delivered, "local broadcast");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let (sender, messages) = mpsc::unbounded_channel();
        let mut state = self.hub.lock();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id,
                peer: self.peer.clone(),
                sender,
            });
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            messages,
        })
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut state = self.hub.lock();
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.retain(|sub| sub.id != id);
            if subscribers.is_empty() {
                state.topics.remove(topic);
            }
        }
    }
}
