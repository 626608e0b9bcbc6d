#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::Receiver;
use weft_core::{Change, EngineConfig, Instance, LocalHub, Options, Value, Weft};

pub const DEADLINE: Duration = Duration::from_secs(5);

/// Fast gossip so tests settle quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        broadcast_interval_ms: 20,
        ..EngineConfig::default()
    }
}

pub fn options(hub: &LocalHub, replica: &str) -> Options {
    Options::new()
        .network(Arc::new(hub.endpoint(replica)))
        .replica(replica)
        .config(fast_config())
}

/// Create and start one replica per name, all on `hub`.
pub async fn replicas(
    weft: &Weft,
    hub: &LocalHub,
    type_name: &str,
    id: &str,
    names: &[&str],
) -> Vec<Instance> {
    let mut instances = Vec::new();
    for name in names {
        let instance = weft
            .create(type_name, id, options(hub, name))
            .expect("create instance");
        instance.network().start().await.expect("start network");
        instances.push(instance);
    }
    instances
}

pub async fn stop_all(instances: &[Instance]) {
    for instance in instances {
        instance.network().stop().await;
    }
}

/// Wait until every instance reports `expected`.
pub async fn converge(instances: &[Instance], expected: &Value) {
    for instance in instances {
        tokio::time::timeout(DEADLINE, instance.settled(|v| v == expected))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "{} stuck at {} instead of {expected}",
                    instance.replica(),
                    instance.value()
                )
            })
            .expect("instance alive");
    }
}

/// Wait until `instance` has folded exactly `count` entries and has no
/// wants in flight.
pub async fn integrated(instance: &Instance, count: u64) {
    tokio::time::timeout(DEADLINE, async {
        loop {
            let stats = instance.stats().await.expect("stats");
            if stats.integrated == count && stats.wanted == 0 && stats.parked == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never integrated {count} entries", instance.replica()));
}

pub fn drain(changes: &mut Receiver<Change>) -> Vec<Change> {
    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        seen.push(change);
    }
    seen
}

pub fn set(elements: &[&str]) -> Value {
    Value::Set(elements.iter().map(|e| (*e).to_string()).collect())
}
