use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{Value as Json, json};
use tracing::{debug, info};
use weft_core::{EngineConfig, ErrorCode, Instance, LocalHub, Options, Weft};

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// CRDT type to replicate (see `weft types`).
    #[arg(long = "type", short = 't', default_value = "g-counter")]
    pub type_name: String,

    /// Number of replicas sharing the instance.
    #[arg(long, short = 'r', default_value_t = 3)]
    pub replicas: usize,

    /// Random mutations to apply across replicas.
    #[arg(long, short = 'n', default_value_t = 50)]
    pub ops: usize,

    /// Seed for the operation generator.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Isolate the last replica for the first half of the run.
    #[arg(long)]
    pub partition: bool,

    /// Engine config file (TOML).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Give up waiting for convergence after this many milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,
}

const ELEMENTS: usize = 8;

pub async fn run(args: &SimulateArgs, json_output: bool) -> Result<()> {
    if args.replicas == 0 {
        bail!("--replicas must be at least 1");
    }
    let config = match &args.config {
        Some(path) => EngineConfig::load(path).context(ErrorCode::ConfigParseError)?,
        None => EngineConfig::default(),
    };

    let hub = LocalHub::new();
    let weft = Weft::default().defaults(Options::new().config(config));
    let names: Vec<String> = (0..args.replicas).map(|i| format!("r{i}")).collect();

    let mut instances = Vec::with_capacity(names.len());
    for name in &names {
        let instance = weft.create(
            &args.type_name,
            "simulation",
            Options::new()
                .network(Arc::new(hub.endpoint(name.as_str())))
                .replica(name.as_str()),
        )?;
        instance.network().start().await?;
        instances.push(instance);
    }

    let isolated = args
        .partition
        .then(|| names.last().cloned())
        .flatten()
        .filter(|_| names.len() > 1);
    if let Some(peer) = &isolated {
        hub.set_partitioned(peer, true);
        info!(%peer, "partitioned replica");
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let started = Instant::now();
    for op in 0..args.ops {
        if op == args.ops / 2
            && let Some(peer) = &isolated
        {
            hub.set_partitioned(peer, false);
            info!(%peer, op, "healed partition");
        }
        let instance = &instances[rng.gen_range(0..instances.len())];
        let (mutator, call_args) = random_call(instance, &mut rng)?;
        debug!(replica = instance.replica(), mutator, "applying");
        instance.mutate(mutator, call_args).await?;
    }
    if let Some(peer) = &isolated {
        hub.set_partitioned(peer, false);
    }

    let converged = tokio::time::timeout(
        Duration::from_millis(args.timeout_ms),
        wait_for_convergence(&instances),
    )
    .await
    .is_ok();
    let elapsed = started.elapsed();

    for instance in &instances {
        instance.network().stop().await;
    }

    report(&instances, converged, elapsed, json_output)?;
    if !converged {
        bail!("replicas did not converge within {}ms", args.timeout_ms);
    }
    Ok(())
}

fn random_call(instance: &Instance, rng: &mut StdRng) -> Result<(&'static str, Vec<Json>)> {
    let Some(&mutator) = instance.mutators().choose(rng) else {
        bail!("type {} has no mutators", instance.type_name());
    };
    let args = match mutator {
        "increment" | "decrement" => vec![json!(rng.gen_range(1..=3u64))],
        _ => vec![json!(format!("e{}", rng.gen_range(0..ELEMENTS)))],
    };
    Ok((mutator, args))
}

/// Converged means every replica holds the same frontier, i.e. the same set
/// of entries, with nothing parked.
async fn wait_for_convergence(instances: &[Instance]) {
    loop {
        let heads = instances[0].heads();
        let mut settled = instances.iter().all(|i| i.heads() == heads);
        if settled {
            for instance in instances {
                match instance.stats().await {
                    Ok(stats) if stats.parked == 0 => {}
                    _ => settled = false,
                }
            }
        }
        if settled {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn report(instances: &[Instance], converged: bool, elapsed: Duration, json_output: bool) -> Result<()> {
    if json_output {
        let replicas: Vec<_> = instances
            .iter()
            .map(|i| {
                json!({
                    "replica": i.replica(),
                    "value": i.value(),
                    "heads": i.heads().iter().map(ToString::to_string).collect::<Vec<_>>(),
                })
            })
            .collect();
        let out = json!({
            "converged": converged,
            "elapsed_ms": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "replicas": replicas,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for instance in instances {
        println!(
            "{:<4} {:<2} heads  {}",
            instance.replica(),
            instance.heads().len(),
            instance.value()
        );
    }
    if converged {
        println!("converged after {elapsed:.2?}");
    } else {
        println!("not converged after {elapsed:.2?}");
    }
    Ok(())
}
