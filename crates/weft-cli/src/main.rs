#![forbid(unsafe_code)]

mod simulate;

use clap::{Parser, Subcommand};
use std::env;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use weft_core::{ErrorCode, Registry};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "weft: gossip-replicated CRDTs over a causal log",
    long_about = None
)]
struct Cli {
    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Run an in-process multi-replica simulation",
        long_about = "Create several replicas of one CRDT instance on an in-process hub, \
                      apply random mutations, and wait for every replica to converge.",
        after_help = "EXAMPLES:\n    # Five replicas of an OR-set, 200 random operations\n    weft simulate --type or-set --replicas 5 --ops 200\n\n    # Cut one replica off for the first half of the run\n    weft simulate --type pn-counter --partition --seed 42"
    )]
    Simulate(simulate::SimulateArgs),

    #[command(about = "List the built-in CRDT types and their mutators")]
    Types,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WEFT_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "weft_core=debug,weft=debug,info"
        } else {
            "weft_core=info,warn"
        })
    });

    let format = env::var("WEFT_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn print_types(json: bool) -> anyhow::Result<()> {
    let registry = Registry::with_builtins();
    let mut types = Vec::new();
    for name in registry.names() {
        let mutators = registry
            .lookup(name)
            .map(|policy| policy.mutators().to_vec())
            .unwrap_or_default();
        types.push((name.to_string(), mutators));
    }

    if json {
        let listing: Vec<_> = types
            .iter()
            .map(|(name, mutators)| serde_json::json!({ "type": name, "mutators": mutators }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        for (name, mutators) in types {
            println!("{name:<12} {}", mutators.join(", "));
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Simulate(ref args) => simulate::run(args, cli.json).await,
        Commands::Types => print_types(cli.json),
    };

    if let Err(err) = &result {
        if let Some(config) = err.downcast_ref::<weft_core::ConfigError>() {
            report(config.code(), &config.to_string());
            std::process::exit(2);
        }
        if let Some(code) = err.downcast_ref::<ErrorCode>() {
            let causes: Vec<_> = err.chain().skip(1).map(ToString::to_string).collect();
            report(*code, &causes.join(": "));
            std::process::exit(2);
        }
    }
    result
}

fn report(code: ErrorCode, detail: &str) {
    eprintln!("error[{code}]: {}: {detail}", code.message());
    if let Some(hint) = code.hint() {
        eprintln!("  hint: {hint}");
    }
}
