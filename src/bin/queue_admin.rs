use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use reelcycle::config;
use reelcycle::db;
use reelcycle::engine::{Engine, EngineDeps, EngineSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and nudge the rotation queues")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print queue stats and workflow counts for every brand
    Stats,
    /// Sync queue partitions with the catalog
    Reconcile {
        /// Only this brand (default: all configured brands)
        #[arg(long)]
        brand: Option<String>,
    },
    /// Start a new cycle for a brand if its current one is finished
    ResetCycle {
        #[arg(long)]
        brand: String,
    },
    /// Dispatch one item for a brand and exit without waiting for it
    RunOnce {
        #[arg(long)]
        brand: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let shutdown = CancellationToken::new();
    let deps = EngineDeps::from_config(&cfg, pool, shutdown.clone())?;
    let engine = Engine::new(deps, EngineSettings::from_config(&cfg));

    let check_brand = |brand: &str| -> Result<()> {
        if !cfg.app.brands.iter().any(|b| b == brand) {
            bail!("unknown brand {brand}; configured: {}", cfg.app.brands.join(", "));
        }
        Ok(())
    };

    match args.command {
        Command::Stats => {
            let report = engine.status().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Reconcile { brand } => {
            let brands = match brand {
                Some(b) => {
                    check_brand(&b)?;
                    vec![b]
                }
                None => cfg.app.brands.clone(),
            };
            for brand in brands {
                let report = engine.reconcile(&brand).await?;
                println!("{brand}: +{} -{}", report.added, report.removed);
            }
        }
        Command::ResetCycle { brand } => {
            check_brand(&brand)?;
            let n = engine.queue().reset_cycle(&brand).await?;
            if n == 0 {
                println!("{brand}: cycle not finished, nothing reset");
            } else {
                println!("{brand}: {n} entries back in rotation");
            }
        }
        Command::RunOnce { brand } => {
            check_brand(&brand)?;
            let outcome = engine.run_once(&brand).await?;
            info!(?outcome, "dispatched");
            println!("{outcome:?}");
        }
    }

    // Stop any poll task the dispatch started; the service's sweep picks it up.
    shutdown.cancel();
    Ok(())
}
