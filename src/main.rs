use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use reelcycle::config;
use reelcycle::db;
use reelcycle::engine::{Engine, EngineDeps, EngineSettings, TickOutcome};
use reelcycle::web;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let released = engine.recover_orphans().await?;
    if released > 0 {
        warn!(released, "released entries left in flight by a previous run");
    }
    for brand in &cfg.app.brands {
        let report = engine
            .reconcile(brand)
            .await
            .with_context(|| format!("initial reconcile for {brand}"))?;
        info!(brand = %brand, added = report.added, removed = report.removed, "queue ready");
    }
    let report = engine.sweep().await?;
    info!(?report, "startup sweep done");

    let tick = Duration::from_secs(cfg.app.tick_interval_secs);
    let mut tasks = Vec::new();
    for brand in cfg.app.brands.clone() {
        tasks.push(tokio::spawn(tick_loop(engine.clone(), brand, tick, shutdown.clone())));
    }
    tasks.push(tokio::spawn(sweep_loop(
        engine.clone(),
        Duration::from_secs(cfg.pipeline.sweep_interval_secs),
        shutdown.clone(),
    )));

    let listener = tokio::net::TcpListener::bind(&cfg.app.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.app.listen_addr))?;
    info!(addr = %cfg.app.listen_addr, "listening for webhooks");
    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, web::router(engine.clone()))
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
        }
        signal_shutdown.cancel();
    });

    if let Err(err) = server.await {
        error!(?err, "http server failed");
        shutdown.cancel();
    }
    for res in join_all(tasks).await {
        if let Err(err) = res {
            error!(?err, "background task panicked");
        }
    }
    info!("stopped");
    Ok(())
}

/// One dispatch per tick. The first tick fires immediately.
async fn tick_loop(engine: Arc<Engine>, brand: String, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        match engine.run_once(&brand).await {
            Ok(TickOutcome::Idle) => {}
            Ok(outcome) => info!(brand = %brand, ?outcome, "tick"),
            Err(err) => error!(brand = %brand, error = %err, "tick failed"),
        }
    }
}

async fn sweep_loop(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The startup sweep already ran.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        if let Err(err) = engine.sweep().await {
            error!(error = %err, "sweep failed");
        }
    }
}
