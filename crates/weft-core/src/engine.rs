//! Merge engine: one dispatch task per instance that owns the log, the
//! accumulator and the buffers of entries still waiting for ancestors.
//!
//! # State machine
//!
//! ```text
//! Idle ──local mutation──────────────────────────────► Integrating ──► Idle
//!   │                                                      ▲
//!   └──remote head──► Fetching (want missing parents) ─────┘
//! ```
//!
//! A remote entry whose parents are all stored is integrated at once. One
//! with missing parents is parked and a want is issued for every missing
//! parent that is not itself parked. Each want runs as its own task, so an
//! unanswered want stalls only the entries that descend from it. When an
//! entry is integrated, every parked child whose parents are now all stored
//! is integrated after it, so a parent is always folded before its children.
//!
//! If the store fails partway through such a cascade, the entries not yet
//! integrated are parked again. Receiving any of them, or any parked
//! descendant, later resumes the cascade.
//!
//! `reduce` runs exactly once per distinct entry id: an entry is folded only
//! when [`Log::integrate`] reports it as new, or after a local append.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::crdt::{Accumulator, MutationContext, PolicyError, TypePolicy, Value};
use crate::entry::{Entry, EntryId};
use crate::error::ErrorCode;
use crate::log::{Log, LogError};
use crate::network::{Inbox, Network, NetworkError};
use crate::store::StoreError;
use crate::transport::Transport;

/// Errors surfaced to callers of an [`Instance`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    /// The dispatch task is gone.
    #[error("instance {0} has stopped")]
    Stopped(String),
}

impl EngineError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Log(err) => err.code(),
            Self::Store(err) => err.code(),
            Self::Policy(err) => err.code(),
            Self::Network(err) => err.code(),
            Self::Stopped(_) => ErrorCode::EngineStopped,
        }
    }
}

/// Where an integrated entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Notification emitted once per newly folded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub entry: EntryId,
    pub value: Value,
    pub origin: Origin,
}

/// Snapshot of the dispatch task's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Entries folded into the accumulator, restored ones included.
    pub integrated: u64,
    /// Entries received but waiting for an ancestor.
    pub parked: usize,
    /// Wants currently in flight.
    pub wanted: usize,
}

enum Command {
    Mutate {
        mutator: String,
        args: Vec<Json>,
        reply: oneshot::Sender<Result<Entry, EngineError>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
}

/// Everything needed to start one instance.
pub struct EngineSetup {
    pub type_name: String,
    pub id: String,
    pub policy: Arc<dyn TypePolicy>,
    pub log: Log,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

/// Handle to one replica of one CRDT instance. Cheap to clone; the dispatch
/// task ends once every handle is dropped.
#[derive(Clone)]
pub struct Instance {
    type_name: Arc<str>,
    id: Arc<str>,
    replica: Arc<str>,
    policy: Arc<dyn TypePolicy>,
    commands: mpsc::UnboundedSender<Command>,
    value: watch::Receiver<Value>,
    heads: watch::Receiver<BTreeSet<EntryId>>,
    changes: broadcast::Sender<Change>,
    network: Network,
}

impl Instance {
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// Mutator names accepted by [`mutate`](Self::mutate).
    #[must_use]
    pub fn mutators(&self) -> &[&'static str] {
        self.policy.mutators()
    }

    /// Run a named mutator: build its message, append it as a new entry on
    /// top of the current heads, fold it, and push the new head.
    ///
    /// A failed push is logged rather than returned; the entry is already
    /// appended and the periodic broadcast re-announces it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Policy`] for an unknown mutator or bad
    /// arguments, [`EngineError::Log`] if the authenticator or store fails,
    /// and [`EngineError::Stopped`] if the dispatch task has exited.
    pub async fn mutate(&self, mutator: &str, args: Vec<Json>) -> Result<Entry, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Mutate {
                mutator: mutator.to_string(),
                args,
                reply,
            })
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())?
    }

    pub async fn increment(&self) -> Result<Entry, EngineError> {
        self.mutate("increment", Vec::new()).await
    }

    pub async fn increment_by(&self, amount: u64) -> Result<Entry, EngineError> {
        self.mutate("increment", vec![Json::from(amount)]).await
    }

    pub async fn decrement(&self) -> Result<Entry, EngineError> {
        self.mutate("decrement", Vec::new()).await
    }

    pub async fn add(&self, element: impl Into<String>) -> Result<Entry, EngineError> {
        self.mutate("add", vec![Json::String(element.into())]).await
    }

    pub async fn remove(&self, element: impl Into<String>) -> Result<Entry, EngineError> {
        self.mutate("remove", vec![Json::String(element.into())]).await
    }

    /// Current materialized value.
    #[must_use]
    pub fn value(&self) -> Value {
        self.value.borrow().clone()
    }

    /// Receive a [`Change`] for every entry folded after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    /// Wait until the value satisfies `predicate`, returning that value.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the dispatch task exits first.
    pub async fn settled(
        &self,
        mut predicate: impl FnMut(&Value) -> bool,
    ) -> Result<Value, EngineError> {
        let mut value = self.value.clone();
        let settled = value
            .wait_for(|v| predicate(v))
            .await
            .map_err(|_| self.stopped())?;
        Ok(settled.clone())
    }

    /// The instance's gossip handle, exposing `start` and `stop`.
    #[must_use]
    pub const fn network(&self) -> &Network {
        &self.network
    }

    /// Current frontier of the local log.
    #[must_use]
    pub fn heads(&self) -> BTreeSet<EntryId> {
        self.heads.borrow().clone()
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the dispatch task has exited.
    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> EngineError {
        EngineError::Stopped(self.id.to_string())
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("type_name", &self.type_name)
            .field("id", &self.id)
            .field("replica", &self.replica)
            .finish_non_exhaustive()
    }
}

/// The dispatch task's state. Only reachable through an [`Instance`].
pub struct MergeEngine {
    id: String,
    policy: Arc<dyn TypePolicy>,
    log: Log,
    network: Network,
    clock: Arc<dyn Clock>,
    want_retry: Option<Duration>,
    accumulator: Accumulator,
    value: watch::Sender<Value>,
    heads: watch::Sender<BTreeSet<EntryId>>,
    changes: broadcast::Sender<Change>,
    /// Received entries waiting for at least one parent.
    parked: HashMap<EntryId, Entry>,
    /// Missing parent id to the parked entries that name it.
    waiting: HashMap<EntryId, BTreeSet<EntryId>>,
    wanted: HashMap<EntryId, AbortHandle>,
    fetches: JoinSet<(EntryId, Result<Entry, NetworkError>)>,
    integrated: u64,
}

impl MergeEngine {
    /// Spawn the dispatch task and return the first handle to it.
    ///
    /// Entries already in the store are folded before any command is served.
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(setup: EngineSetup) -> Instance {
        let EngineSetup {
            type_name,
            id,
            policy,
            log,
            transport,
            clock,
            config,
        } = setup;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (entries_tx, entries) = mpsc::unbounded_channel();
        let (wants_tx, wants) = mpsc::unbounded_channel();
        let network = Network::new(
            id.clone(),
            transport,
            log.reader(),
            config.network_config(),
            Inbox {
                entries: entries_tx,
                wants: wants_tx,
            },
        );

        let accumulator = policy.first();
        let (value, value_rx) = watch::channel(policy.value_of(&accumulator));
        let (heads, heads_rx) = watch::channel(BTreeSet::new());
        let (changes, _) = broadcast::channel(config.change_buffer.max(1));

        let instance = Instance {
            type_name: type_name.as_str().into(),
            id: id.as_str().into(),
            replica: log.replica().into(),
            policy: Arc::clone(&policy),
            commands: commands_tx,
            value: value_rx,
            heads: heads_rx,
            changes: changes.clone(),
            network: network.clone(),
        };

        let span = info_span!("instance", id = %id, replica = %log.replica(), kind = %type_name);
        let engine = Self {
            id,
            policy,
            log,
            network,
            clock,
            want_retry: config.want_retry(),
            accumulator,
            value,
            heads,
            changes,
            parked: HashMap::new(),
            waiting: HashMap::new(),
            wanted: HashMap::new(),
            fetches: JoinSet::new(),
            integrated: 0,
        };
        tokio::spawn(engine.run(commands, entries, wants).instrument(span));
        instance
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut entries: mpsc::UnboundedReceiver<Entry>,
        mut wants: mpsc::UnboundedReceiver<EntryId>,
    ) {
        if let Err(err) = self.restore().await {
            warn!(error = %err, code = %err.code(), "could not restore log from store");
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(entry) = entries.recv() => {
                    if let Err(err) = self.receive(entry).await {
                        warn!(error = %err, code = %err.code(), "failed to receive entry");
                    }
                }
                Some(id) = wants.recv() => {
                    if let Err(err) = self.network.answer_want(&id).await {
                        warn!(%id, error = %err, "failed to answer want");
                    }
                }
                Some(joined) = self.fetches.join_next(), if !self.fetches.is_empty() => {
                    self.fetched(joined).await;
                }
            }
        }

        self.fetches.abort_all();
        self.network.stop().await;
        debug!(id = %self.id, "dispatch task finished");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Mutate {
                mutator,
                args,
                reply,
            } => {
                let result = self.mutate(&mutator, &args).await;
                if let Err(err) = &result {
                    debug!(%mutator, error = %err, "mutation rejected");
                }
                let _ = reply.send(result);
            }
            Command::Stats { reply } => {
                let _ = reply.send(EngineStats {
                    integrated: self.integrated,
                    parked: self.parked.len(),
                    wanted: self.wanted.len(),
                });
            }
        }
    }

    async fn restore(&mut self) -> Result<(), EngineError> {
        let entries = self.log.restore().await?;
        if entries.is_empty() {
            return Ok(());
        }
        for entry in &entries {
            if let Err(err) = self.policy.reduce(&entry.payload, &mut self.accumulator) {
                warn!(entry = %entry.id, error = %err, "skipping unreadable stored entry");
            }
            self.integrated += 1;
        }
        self.publish_heads().await?;
        self.value.send_replace(self.policy.value_of(&self.accumulator));
        Ok(())
    }

    async fn mutate(&mut self, mutator: &str, args: &[Json]) -> Result<Entry, EngineError> {
        let ctx = MutationContext {
            replica: self.log.replica(),
            accumulator: &self.accumulator,
            clock: self.clock.as_ref(),
        };
        let message = self.policy.mutate(mutator, args, &ctx)?;

        let mut next = self.accumulator.clone();
        self.policy.reduce(&message, &mut next)?;

        let entry = self.log.append(message).await?;
        self.accumulator = next;
        self.emit(&entry, Origin::Local);
        self.heads.send_replace(self.log.heads().clone());

        if let Err(err) = self.network.set_head(entry.clone()).await {
            warn!(entry = %entry.id, error = %err, "failed to push new head");
        }
        Ok(entry)
    }

    /// Handle an entry from a head announcement or a want response.
    async fn receive(&mut self, entry: Entry) -> Result<(), EngineError> {
        if let Some(fetch) = self.wanted.remove(&entry.id) {
            fetch.abort();
        }
        if self.parked.contains_key(&entry.id) {
            return self.resume(&entry.id).await;
        }
        if self.log.has(&entry.id).await? {
            trace!(entry = %entry.id, "already known");
            return Ok(());
        }

        let missing = self.missing_parents(&entry).await?;
        if missing.is_empty() {
            return self.integrate_cascade(entry).await;
        }

        debug!(entry = %entry.id, missing = missing.len(), "parking entry until ancestors arrive");
        for parent in &missing {
            self.waiting
                .entry(parent.clone())
                .or_default()
                .insert(entry.id.clone());
        }
        let id = entry.id.clone();
        self.parked.insert(id.clone(), entry);
        self.resume(&id).await
    }

    /// Walk from a parked entry through its parked ancestors. Absent
    /// ancestors that are not parked are wanted; parked ones whose parents
    /// are all stored are integrated.
    async fn resume(&mut self, id: &EntryId) -> Result<(), EngineError> {
        let mut pending = vec![id.clone()];
        let mut seen = HashSet::new();
        let mut ready = Vec::new();
        while let Some(id) = pending.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(entry) = self.parked.get(&id) else {
                continue;
            };
            let missing = self.missing_parents(entry).await?;
            if missing.is_empty() {
                ready.push(id);
                continue;
            }
            for parent in missing {
                if self.parked.contains_key(&parent) {
                    pending.push(parent);
                } else {
                    self.want(parent);
                }
            }
        }
        for id in ready {
            if let Some(entry) = self.parked.remove(&id) {
                self.integrate_cascade(entry).await?;
            }
        }
        Ok(())
    }

    async fn missing_parents(&self, entry: &Entry) -> Result<Vec<EntryId>, StoreError> {
        let mut missing = Vec::new();
        for parent in &entry.parents {
            if !self.log.has(parent).await? {
                missing.push(parent.clone());
            }
        }
        Ok(missing)
    }

    /// Integrate `entry`, then every parked descendant it completes.
    ///
    /// On failure every entry not yet integrated goes back to `parked`, and
    /// the heads reached so far are still published.
    async fn integrate_cascade(&mut self, entry: Entry) -> Result<(), EngineError> {
        let mut ready = VecDeque::from([entry]);
        let outcome = self.drain_ready(&mut ready).await;
        if outcome.is_err() {
            for entry in ready {
                self.repark(entry).await;
            }
        }
        let published = self.publish_heads().await;
        outcome?;
        Ok(published?)
    }

    /// Leaves every unintegrated entry in `ready` when it fails.
    async fn drain_ready(&mut self, ready: &mut VecDeque<Entry>) -> Result<(), EngineError> {
        while let Some(entry) = ready.pop_front() {
            let integrated = match self.log.integrate(&entry).await {
                Ok(integrated) => integrated,
                Err(err) => {
                    ready.push_front(entry);
                    return Err(err.into());
                }
            };
            if !integrated {
                continue;
            }
            self.fold(&entry);

            let Some(children) = self.waiting.remove(&entry.id) else {
                continue;
            };
            let mut children = children.into_iter();
            while let Some(child) = children.next() {
                let checked = match self.parked.get(&child) {
                    Some(parked) => self.missing_parents(parked).await,
                    None => continue,
                };
                match checked {
                    Ok(missing) if missing.is_empty() => {
                        if let Some(parked) = self.parked.remove(&child) {
                            ready.push_back(parked);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        for unchecked in std::iter::once(child).chain(children) {
                            if let Some(parked) = self.parked.remove(&unchecked) {
                                ready.push_back(parked);
                            }
                        }
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Put an entry back among the parked ones, waiting on whichever parents
    /// are absent (all of them if the store cannot tell).
    async fn repark(&mut self, entry: Entry) {
        let missing = match self.missing_parents(&entry).await {
            Ok(missing) => missing,
            Err(_) => entry.parents.clone(),
        };
        for parent in missing {
            self.waiting
                .entry(parent)
                .or_default()
                .insert(entry.id.clone());
        }
        debug!(entry = %entry.id, "re-parked after failed integration");
        self.parked.insert(entry.id.clone(), entry);
    }

    fn fold(&mut self, entry: &Entry) {
        if let Err(err) = self.policy.reduce(&entry.payload, &mut self.accumulator) {
            warn!(entry = %entry.id, author = %entry.author, error = %err, "entry could not be folded");
            return;
        }
        self.emit(entry, Origin::Remote);
    }

    fn emit(&mut self, entry: &Entry, origin: Origin) {
        self.integrated += 1;
        let value = self.policy.value_of(&self.accumulator);
        let _ = self.changes.send(Change {
            entry: entry.id.clone(),
            value: value.clone(),
            origin,
        });
        self.value.send_replace(value);
    }

    /// Mirror the log frontier to handles and to the network's advertised
    /// heads, without pushing.
    async fn publish_heads(&mut self) -> Result<(), StoreError> {
        let heads = self.log.heads().clone();
        let mut entries = Vec::with_capacity(heads.len());
        for id in &heads {
            if let Some(entry) = self.log.get(id).await? {
                entries.push(entry);
            }
        }
        self.network.advertise(entries);
        self.heads.send_replace(heads);
        Ok(())
    }

    fn want(&mut self, id: EntryId) {
        if self.wanted.contains_key(&id) {
            return;
        }
        let network = self.network.clone();
        let retry = self.want_retry;
        let key = id.clone();
        let handle = self.fetches.spawn(async move {
            let result = fetch(&network, &key, retry).await;
            (key, result)
        });
        self.wanted.insert(id, handle);
    }

    async fn fetched(
        &mut self,
        joined: Result<(EntryId, Result<Entry, NetworkError>), JoinError>,
    ) {
        let (id, result) = match joined {
            Ok(done) => done,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                warn!(error = %err, "want task failed");
                return;
            }
        };
        self.wanted.remove(&id);
        match result {
            Ok(entry) => {
                if let Err(err) = self.receive(entry).await {
                    warn!(%id, error = %err, code = %err.code(), "failed to integrate fetched entry");
                }
            }
            Err(err) => warn!(%id, error = %err, "want abandoned"),
        }
    }
}

/// Run a want, re-issuing it every `retry` if one is configured.
async fn fetch(
    network: &Network,
    id: &EntryId,
    retry: Option<Duration>,
) -> Result<Entry, NetworkError> {
    let Some(period) = retry else {
        return network.get(id).await;
    };
    loop {
        if let Ok(result) = tokio::time::timeout(period, network.get(id)).await {
            return result;
        }
        debug!(%id, ?period, "want unanswered, re-issuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Unauthenticated;
    use crate::clock::ManualClock;
    use crate::crdt::{GCounterPolicy, GSetPolicy};
    use crate::store::{EntryStore, MemoryStore};
    use crate::transport::{LocalHub, Transport as _};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Memory store whose writes start failing once `budget` is spent.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        budget: AtomicUsize,
    }

    impl FlakyStore {
        fn allow(&self, puts: usize) {
            self.budget.store(puts, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EntryStore for FlakyStore {
        async fn has(&self, id: &EntryId) -> Result<bool, StoreError> {
            self.inner.has(id).await
        }

        async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
            self.inner.get(id).await
        }

        async fn put(&self, id: &EntryId, entry: &Entry) -> Result<(), StoreError> {
            self.budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map_err(|_| StoreError::Io(std::io::Error::other("disk full")))?;
            self.inner.put(id, entry).await
        }
    }

    async fn deliver(peer: &impl crate::transport::Transport, instance: &Instance, entry: &Entry) {
        peer.broadcast(instance.id(), serde_json::to_vec(entry).expect("encode"))
            .await
            .expect("broadcast");
    }

    async fn stats_until(instance: &Instance, done: impl Fn(&EngineStats) -> bool) -> EngineStats {
        loop {
            let stats = instance.stats().await.expect("stats");
            if done(&stats) {
                return stats;
            }
            tokio::task::yield_now().await;
        }
    }

    fn spawn(
        hub: &LocalHub,
        peer: &str,
        policy: Arc<dyn TypePolicy>,
        store: Arc<dyn EntryStore>,
    ) -> Instance {
        MergeEngine::spawn(EngineSetup {
            type_name: "test".into(),
            id: "engine-test".into(),
            policy,
            log: Log::new(peer, store, Arc::new(Unauthenticated)),
            transport: Arc::new(hub.endpoint(peer)),
            clock: Arc::new(ManualClock::new(0)),
            config: EngineConfig::default(),
        })
    }

    #[tokio::test]
    async fn local_mutation_folds_and_notifies() {
        let hub = LocalHub::new();
        let instance = spawn(&hub, "a", Arc::new(GCounterPolicy), Arc::new(MemoryStore::new()));
        let mut changes = instance.subscribe();

        let entry = instance.increment().await.expect("increment");
        assert_eq!(instance.value(), Value::Counter(1));
        assert_eq!(instance.heads(), BTreeSet::from([entry.id.clone()]));

        let change = changes.recv().await.expect("change");
        assert_eq!(change.entry, entry.id);
        assert_eq!(change.origin, Origin::Local);
        assert_eq!(change.value, Value::Counter(1));
    }

    #[tokio::test]
    async fn rejected_mutation_appends_nothing() {
        let hub = LocalHub::new();
        let store = Arc::new(MemoryStore::new());
        let instance = spawn(&hub, "a", Arc::new(GSetPolicy), Arc::<MemoryStore>::clone(&store));

        let err = instance.mutate("remove", vec![json!("x")]).await.expect_err("no remove");
        assert_eq!(err.code(), ErrorCode::UnknownMutator);
        let err = instance.mutate("add", vec![json!(3)]).await.expect_err("bad element");
        assert_eq!(err.code(), ErrorCode::InvalidArguments);
        assert!(store.is_empty().await);
        assert!(instance.heads().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_entries_are_parked_then_cascaded() {
        let hub = LocalHub::new();
        let instance = spawn(&hub, "a", Arc::new(GSetPolicy), Arc::new(MemoryStore::new()));
        let mut changes = instance.subscribe();

        let root = Entry::new(json!({"add": "x"}), [], "b");
        let child = Entry::new(json!({"add": "y"}), [root.id.clone()], "b");
        let grandchild = Entry::new(json!({"add": "z"}), [child.id.clone()], "b");

        // Deliver through the network's inbox path as a peer would.
        let peer = hub.endpoint("b");
        instance.network().start().await.expect("start");
        for entry in [&grandchild, &child] {
            peer.broadcast(instance.id(), serde_json::to_vec(entry).expect("encode"))
                .await
                .expect("broadcast");
        }
        let stats = loop {
            let stats = instance.stats().await.expect("stats");
            if stats.parked == 2 {
                break stats;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(stats.integrated, 0);

        peer.broadcast(instance.id(), serde_json::to_vec(&root).expect("encode"))
            .await
            .expect("broadcast");

        let order: Vec<_> = [
            changes.recv().await.expect("change"),
            changes.recv().await.expect("change"),
            changes.recv().await.expect("change"),
        ]
        .into_iter()
        .map(|c| c.entry)
        .collect();
        assert_eq!(order, vec![root.id, child.id, grandchild.id.clone()]);

        let stats = instance.stats().await.expect("stats");
        assert_eq!(stats.parked, 0);
        assert_eq!(stats.integrated, 3);
        assert_eq!(instance.heads(), BTreeSet::from([grandchild.id]));
        instance.network().stop().await;
    }

    #[tokio::test]
    async fn store_failure_mid_cascade_reparks_the_rest() {
        let hub = LocalHub::new();
        let store = Arc::new(FlakyStore::default());
        store.allow(usize::MAX);
        let instance = spawn(&hub, "a", Arc::new(GSetPolicy), Arc::clone(&store) as _);
        instance.network().start().await.expect("start");

        let root = Entry::new(json!({"add": "x"}), [], "b");
        let child = Entry::new(json!({"add": "y"}), [root.id.clone()], "b");
        let grandchild = Entry::new(json!({"add": "z"}), [child.id.clone()], "b");
        let peer = hub.endpoint("b");
        deliver(&peer, &instance, &grandchild).await;
        deliver(&peer, &instance, &child).await;
        stats_until(&instance, |s| s.parked == 2).await;

        // Root is stored, then the write of its child fails.
        store.allow(1);
        deliver(&peer, &instance, &root).await;
        let stats = stats_until(&instance, |s| s.integrated == 1).await;
        assert_eq!(stats.parked, 2);
        assert_eq!(instance.heads(), BTreeSet::from([root.id.clone()]));
        assert_eq!(instance.value(), Value::Set(BTreeSet::from(["x".to_string()])));

        // A re-announced descendant resumes the cascade through its parked
        // ancestor.
        store.allow(usize::MAX);
        deliver(&peer, &instance, &grandchild).await;
        let stats = stats_until(&instance, |s| s.integrated == 3).await;
        assert_eq!(stats.parked, 0);
        assert_eq!(instance.heads(), BTreeSet::from([grandchild.id]));
        instance.network().stop().await;
    }

    #[tokio::test]
    async fn failed_integration_of_a_ready_entry_is_retried_on_redelivery() {
        let hub = LocalHub::new();
        let store = Arc::new(FlakyStore::default());
        let instance = spawn(&hub, "a", Arc::new(GSetPolicy), Arc::clone(&store) as _);
        instance.network().start().await.expect("start");

        let root = Entry::new(json!({"add": "x"}), [], "b");
        let peer = hub.endpoint("b");
        deliver(&peer, &instance, &root).await;
        let stats = stats_until(&instance, |s| s.parked == 1).await;
        assert_eq!(stats.integrated, 0);
        assert!(instance.heads().is_empty());

        store.allow(usize::MAX);
        deliver(&peer, &instance, &root).await;
        let stats = stats_until(&instance, |s| s.integrated == 1).await;
        assert_eq!(stats.parked, 0);
        assert_eq!(instance.heads(), BTreeSet::from([root.id]));
        instance.network().stop().await;
    }

    #[tokio::test]
    async fn restore_folds_stored_entries_without_changes() {
        let hub = LocalHub::new();
        let store = Arc::new(MemoryStore::new());
        {
            let mut log = Log::new("a", Arc::clone(&store) as _, Arc::new(Unauthenticated));
            for amount in [2, 3] {
                log.append(json!({"replica": "a", "amount": amount}))
                    .await
                    .expect("append");
            }
        }

        let instance = spawn(&hub, "a", Arc::new(GCounterPolicy), store);
        let value = instance
            .settled(|v| *v == Value::Counter(5))
            .await
            .expect("settled");
        assert_eq!(value, Value::Counter(5));
        assert_eq!(instance.heads().len(), 1);
        assert_eq!(instance.stats().await.expect("stats").integrated, 2);
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_network() {
        let hub = LocalHub::new();
        let instance = spawn(&hub, "a", Arc::new(GCounterPolicy), Arc::new(MemoryStore::new()));
        instance.network().start().await.expect("start");
        assert_eq!(hub.subscriber_count("engine-test"), 1);

        let network = instance.network().clone();
        drop(instance);
        while network.is_running().await {
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.subscriber_count("engine-test"), 0);
    }
}
