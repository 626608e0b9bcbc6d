//! Per-instance gossip channel.
//!
//! Two dissemination strategies run side by side:
//!
//! 1. **Push**: the advertised heads are broadcast on the instance topic
//!    immediately after every local append and again on a fixed interval.
//! 2. **Pull**: a replica missing an entry broadcasts a want for its id on
//!    the shared want topic; any replica holding it answers on a topic named
//!    by the id.
//!
//! Push keeps latency low when delivery works; pull guarantees completeness
//! when a push is lost, because any peer can re-request on demand.
//!
//! The network never decides what to fetch. Inbound head announcements are
//! forwarded to the merge engine's inbox, and want requests to its want
//! queue; the engine calls back into [`Network::get`] and
//! [`Network::answer_want`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

use crate::entry::{Entry, EntryId};
use crate::error::ErrorCode;
use crate::log::LogReader;
use crate::store::StoreError;
use crate::transport::{SubscriptionId, Transport, TransportError};

/// Errors from network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("wire message could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The response subscription closed before any peer answered.
    #[error("want for {0} abandoned: subscription closed")]
    Closed(EntryId),
}

impl NetworkError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(err) => err.code(),
            Self::Codec(_) => ErrorCode::MalformedMessage,
            Self::Store(_) => ErrorCode::StoreFailure,
            Self::Closed(_) => ErrorCode::ChannelClosed,
        }
    }
}

/// Wire form of a want request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantRequest {
    pub id: EntryId,
}

/// Tuning for one [`Network`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub broadcast_interval: Duration,
    pub want_topic: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_millis(200),
            want_topic: "want".to_string(),
        }
    }
}

/// Channels through which the network hands inbound traffic to its engine.
#[derive(Debug, Clone)]
pub struct Inbox {
    pub entries: mpsc::UnboundedSender<Entry>,
    pub wants: mpsc::UnboundedSender<EntryId>,
}

/// Gossip handle for one instance. Cheap to clone.
#[derive(Clone)]
pub struct Network {
    inner: Arc<Inner>,
}

struct Inner {
    topic: String,
    transport: Arc<dyn Transport>,
    log: LogReader,
    config: NetworkConfig,
    heads: watch::Sender<Vec<Entry>>,
    inbox: Inbox,
    running: Mutex<Option<Running>>,
}

struct Running {
    heads_sub: SubscriptionId,
    wants_sub: SubscriptionId,
    tasks: Vec<JoinHandle<()>>,
}

impl Network {
    pub fn new(
        topic: impl Into<String>,
        transport: Arc<dyn Transport>,
        log: LogReader,
        config: NetworkConfig,
        inbox: Inbox,
    ) -> Self {
        let (heads, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                topic: topic.into(),
                transport,
                log,
                config,
                heads,
                inbox,
                running: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Ids currently advertised on the instance topic.
    #[must_use]
    pub fn advertised(&self) -> Vec<EntryId> {
        self.inner.heads.borrow().iter().map(|e| e.id.clone()).collect()
    }

    /// Subscribe to head announcements and wants, start the periodic head
    /// broadcast, and announce the current heads once. Starting a running
    /// network is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Transport`] if a subscription or the initial
    /// broadcast fails.
    #[instrument(skip(self), fields(topic = %self.inner.topic))]
    pub async fn start(&self) -> Result<(), NetworkError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let transport = &self.inner.transport;
        let heads = transport.subscribe(&self.inner.topic)?;
        let wants = match transport.subscribe(&self.inner.config.want_topic) {
            Ok(sub) => sub,
            Err(err) => {
                transport.unsubscribe(&self.inner.topic, heads.id);
                return Err(err.into());
            }
        };

        let heads_sub = heads.id;
        let wants_sub = wants.id;
        let tasks = vec![
            tokio::spawn(forward_heads(heads.messages, self.inner.inbox.entries.clone())),
            tokio::spawn(forward_wants(wants.messages, self.inner.inbox.wants.clone())),
            tokio::spawn(broadcast_periodically(
                Arc::downgrade(&self.inner),
                self.inner.config.broadcast_interval,
            )),
        ];
        *running = Some(Running {
            heads_sub,
            wants_sub,
            tasks,
        });
        drop(running);

        info!(interval = ?self.inner.config.broadcast_interval, "network started");
        self.broadcast_heads().await
    }

    /// Unsubscribe and cancel the periodic broadcast. Idempotent, and safe on
    /// a network that was never started. In-flight wants are left to lapse.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().await.take() else {
            return;
        };
        for task in &running.tasks {
            task.abort();
        }
        let transport = &self.inner.transport;
        transport.unsubscribe(&self.inner.topic, running.heads_sub);
        transport.unsubscribe(&self.inner.config.want_topic, running.wants_sub);
        info!(topic = %self.inner.topic, "network stopped");
    }

    /// Advertise a freshly appended local head and push it immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the push fails; the head stays advertised for the
    /// next periodic broadcast.
    pub async fn set_head(&self, head: Entry) -> Result<(), NetworkError> {
        self.inner.heads.send_replace(vec![head]);
        if self.is_running().await {
            self.broadcast_heads().await?;
        }
        Ok(())
    }

    /// Replace the advertised heads without pushing. The periodic broadcast
    /// picks them up.
    pub fn advertise(&self, heads: Vec<Entry>) {
        self.inner.heads.send_replace(heads);
    }

    /// Broadcast every advertised head on the instance topic.
    ///
    /// # Errors
    ///
    /// Returns the first encoding or transport failure.
    pub async fn broadcast_heads(&self) -> Result<(), NetworkError> {
        broadcast_heads(&self.inner).await
    }

    /// Fetch an entry from whichever peer answers first.
    ///
    /// Responses whose content does not hash to `id` are discarded. There is
    /// no timeout: if no peer ever holds the entry the future stays pending,
    /// so callers wrap it in their own give-up policy.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Transport`] if the want cannot be sent, or
    /// [`NetworkError::Closed`] if the transport drops the subscription.
    #[instrument(skip(self), fields(topic = %self.inner.topic))]
    pub async fn get(&self, id: &EntryId) -> Result<Entry, NetworkError> {
        let transport = self.inner.transport.as_ref();
        let subscription = transport.subscribe(id.as_str())?;
        let _guard = Unsubscribe {
            transport,
            topic: id.as_str(),
            id: subscription.id,
        };
        let mut responses = subscription.messages;

        let request = serde_json::to_vec(&WantRequest { id: id.clone() })?;
        transport
            .broadcast(&self.inner.config.want_topic, request)
            .await?;
        debug!(%id, "want sent");

        while let Some(bytes) = responses.recv().await {
            match serde_json::from_slice::<Entry>(&bytes) {
                Ok(entry) if entry.id == *id && entry.verify_id() => {
                    debug!(%id, author = %entry.author, "want answered");
                    return Ok(entry);
                }
                Ok(entry) => warn!(%id, got = %entry.id, "discarding mismatched want response"),
                Err(err) => warn!(%id, error = %err, "discarding undecodable want response"),
            }
        }
        Err(NetworkError::Closed(id.clone()))
    }

    /// Answer a peer's want if the local log holds the entry.
    ///
    /// Returns `true` if a response was broadcast.
    ///
    /// # Errors
    ///
    /// Propagates store, encoding and transport failures.
    pub async fn answer_want(&self, id: &EntryId) -> Result<bool, NetworkError> {
        if !id.is_well_formed() {
            warn!(%id, "ignoring want for malformed id");
            return Ok(false);
        }
        if !self.inner.log.has(id).await? {
            return Ok(false);
        }
        let Some(entry) = self.inner.log.get(id).await? else {
            return Ok(false);
        };
        let bytes = serde_json::to_vec(&entry)?;
        self.inner.transport.broadcast(id.as_str(), bytes).await?;
        trace!(%id, "answered want");
        Ok(true)
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("topic", &self.inner.topic)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Removes a subscription when dropped, including when the owning future is
/// cancelled mid-await.
struct Unsubscribe<'a> {
    transport: &'a dyn Transport,
    topic: &'a str,
    id: SubscriptionId,
}

impl Drop for Unsubscribe<'_> {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.topic, self.id);
    }
}

async fn broadcast_heads(inner: &Inner) -> Result<(), NetworkError> {
    let heads = inner.heads.borrow().clone();
    for head in heads {
        let bytes = serde_json::to_vec(&head)?;
        inner.transport.broadcast(&inner.topic, bytes).await?;
        trace!(topic = %inner.topic, head = %head.id, "broadcast head");
    }
    Ok(())
}

async fn broadcast_periodically(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(err) = broadcast_heads(&inner).await {
            warn!(topic = %inner.topic, error = %err, "periodic head broadcast failed");
        }
    }
}

async fn forward_heads(
    mut messages: mpsc::UnboundedReceiver<Vec<u8>>,
    inbox: mpsc::UnboundedSender<Entry>,
) {
    while let Some(bytes) = messages.recv().await {
        match serde_json::from_slice::<Entry>(&bytes) {
            Ok(entry) if entry.verify_id() => {
                if inbox.send(entry).is_err() {
                    break;
                }
            }
            Ok(entry) => warn!(id = %entry.id, "dropping head whose content does not match its id"),
            Err(err) => warn!(error = %err, "dropping undecodable head announcement"),
        }
    }
}

async fn forward_wants(
    mut messages: mpsc::UnboundedReceiver<Vec<u8>>,
    wants: mpsc::UnboundedSender<EntryId>,
) {
    while let Some(bytes) = messages.recv().await {
        match serde_json::from_slice::<WantRequest>(&bytes) {
            Ok(request) => {
                if wants.send(request.id).is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "dropping undecodable want request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Unauthenticated;
    use crate::log::Log;
    use crate::store::MemoryStore;
    use crate::transport::LocalHub;
    use serde_json::json;
    use tokio::time::timeout;

    struct Harness {
        log: Log,
        network: Network,
        entries: mpsc::UnboundedReceiver<Entry>,
        wants: mpsc::UnboundedReceiver<EntryId>,
    }

    fn harness(hub: &LocalHub, peer: &str) -> Harness {
        let log = Log::new(peer, Arc::new(MemoryStore::new()), Arc::new(Unauthenticated));
        let (entries_tx, entries) = mpsc::unbounded_channel();
        let (wants_tx, wants) = mpsc::unbounded_channel();
        let network = Network::new(
            "counter",
            Arc::new(hub.endpoint(peer)),
            log.reader(),
            NetworkConfig {
                broadcast_interval: Duration::from_secs(3600),
                ..NetworkConfig::default()
            },
            Inbox {
                entries: entries_tx,
                wants: wants_tx,
            },
        );
        Harness {
            log,
            network,
            entries,
            wants,
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn set_head_pushes_to_peers() {
        let hub = LocalHub::new();
        let mut a = harness(&hub, "a");
        let mut b = harness(&hub, "b");
        a.network.start().await.expect("start a");
        b.network.start().await.expect("start b");

        let entry = a.log.append(json!(1)).await.expect("append");
        a.network.set_head(entry.clone()).await.expect("set head");

        let received = timeout(WAIT, b.entries.recv()).await.expect("in time");
        assert_eq!(received, Some(entry.clone()));
        assert_eq!(a.network.advertised(), vec![entry.id]);
    }

    #[tokio::test]
    async fn want_is_answered_by_a_peer_holding_the_entry() {
        let hub = LocalHub::new();
        let mut a = harness(&hub, "a");
        let b = harness(&hub, "b");
        a.network.start().await.expect("start a");
        b.network.start().await.expect("start b");
        let entry = a.log.append(json!({"add": "x"})).await.expect("append");

        let id = entry.id.clone();
        let fetch = {
            let network = b.network.clone();
            tokio::spawn(async move { network.get(&id).await })
        };

        let wanted = timeout(WAIT, a.wants.recv()).await.expect("want in time");
        assert_eq!(wanted, Some(entry.id.clone()));
        assert!(a.network.answer_want(&entry.id).await.expect("answer"));

        let fetched = timeout(WAIT, fetch).await.expect("in time").expect("join");
        assert_eq!(fetched.expect("fetched"), entry);
        assert_eq!(hub.subscriber_count(entry.id.as_str()), 0);
    }

    #[tokio::test]
    async fn answer_want_ignores_unknown_entries() {
        let hub = LocalHub::new();
        let a = harness(&hub, "a");
        let id = Entry::new(json!("never appended"), [], "z").id;
        assert!(!a.network.answer_want(&id).await.expect("answer"));
    }

    #[tokio::test]
    async fn malformed_want_ids_are_dropped_before_the_store() {
        let hub = LocalHub::new();
        let mut a = harness(&hub, "a");
        a.network.start().await.expect("start");
        let entry = a.log.append(json!({"add": "x"})).await.expect("append");

        let peer = hub.endpoint("mallory");
        for raw in [r#"{"id":"../sibling/secret"}"#, r#"{"id":"/etc/passwd"}"#] {
            peer.broadcast("want", raw.as_bytes().to_vec())
                .await
                .expect("broadcast");
        }
        let valid = serde_json::to_vec(&WantRequest { id: entry.id.clone() }).expect("encode");
        peer.broadcast("want", valid).await.expect("broadcast");

        let wanted = timeout(WAIT, a.wants.recv()).await.expect("in time");
        assert_eq!(wanted, Some(entry.id));
        assert!(a.wants.try_recv().is_err());

        let escape = EntryId::new_unchecked("../sibling/secret");
        assert!(!a.network.answer_want(&escape).await.expect("answer"));
    }

    #[tokio::test]
    async fn forged_want_responses_are_discarded() {
        let hub = LocalHub::new();
        let b = harness(&hub, "b");
        let forger = hub.endpoint("mallory");
        let genuine = Entry::new(json!(1), [], "a");
        let id = genuine.id.clone();

        let fetch = {
            let network = b.network.clone();
            let id = id.clone();
            tokio::spawn(async move { network.get(&id).await })
        };
        while hub.subscriber_count(id.as_str()) == 0 {
            tokio::task::yield_now().await;
        }

        let mut forged = Entry::new(json!(2), [], "a");
        forged.id = id.clone();
        forger
            .broadcast(id.as_str(), serde_json::to_vec(&forged).expect("encode"))
            .await
            .expect("broadcast");
        forger
            .broadcast(id.as_str(), serde_json::to_vec(&genuine).expect("encode"))
            .await
            .expect("broadcast");

        let fetched = timeout(WAIT, fetch).await.expect("in time").expect("join");
        assert_eq!(fetched.expect("fetched"), genuine);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_unsubscribes() {
        let hub = LocalHub::new();
        let a = harness(&hub, "a");
        a.network.stop().await;

        a.network.start().await.expect("start");
        a.network.start().await.expect("start twice");
        assert_eq!(hub.subscriber_count("counter"), 1);
        assert_eq!(hub.subscriber_count("want"), 1);

        a.network.stop().await;
        a.network.stop().await;
        assert!(!a.network.is_running().await);
        assert_eq!(hub.subscriber_count("counter"), 0);
        assert_eq!(hub.subscriber_count("want"), 0);
    }

    #[tokio::test]
    async fn periodic_broadcast_repeats_advertised_heads() {
        let hub = LocalHub::new();
        let a = harness(&hub, "a");
        let mut listener = hub.endpoint("listener").subscribe("counter").expect("subscribe");
        let head = Entry::new(json!(1), [], "a");
        a.network.advertise(vec![head.clone()]);

        let fast = Network::new(
            "counter",
            Arc::new(hub.endpoint("a")),
            a.log.reader(),
            NetworkConfig {
                broadcast_interval: Duration::from_millis(10),
                ..NetworkConfig::default()
            },
            Inbox {
                entries: mpsc::unbounded_channel().0,
                wants: mpsc::unbounded_channel().0,
            },
        );
        fast.advertise(vec![head.clone()]);
        fast.start().await.expect("start");

        for _ in 0..3 {
            let bytes = timeout(WAIT, listener.messages.recv())
                .await
                .expect("in time")
                .expect("message");
            let entry: Entry = serde_json::from_slice(&bytes).expect("decode");
            assert_eq!(entry, head);
        }
        fast.stop().await;
    }
}
