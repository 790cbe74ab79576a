//! pulse-daemon - project activity synchronization daemon.
//!
//! Reads the tracked-source registry, pulls new activity from each source
//! (clone-based repositories or feeds), and appends normalized events.
//! Runs one batch with `--once`, or keeps syncing on the configured poll
//! interval until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pulse_core::{NoIdentityResolver, SyncConfig};
use pulse_daemon::{FeedAdapter, Orchestrator, SqliteStore, SyncWorker, VcsAdapter};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// pulse activity synchronization daemon.
#[derive(Parser, Debug)]
#[command(name = "pulse-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "pulse.toml")]
    config: PathBuf,

    /// Run one batch and exit instead of polling.
    #[arg(long)]
    once: bool,

    /// Override the configured clone root directory.
    #[arg(long)]
    clones_root: Option<PathBuf>,

    /// Override the configured database path.
    #[arg(long)]
    database: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let mut config = if args.config.exists() {
        SyncConfig::from_file(&args.config)
            .with_context(|| format!("loading config from {}", args.config.display()))?
    } else {
        info!(path = %args.config.display(), "no config file; using defaults");
        SyncConfig::default()
    };

    if let Some(clones_root) = &args.clones_root {
        config.clones_root.clone_from(clones_root);
    }
    if let Some(database) = &args.database {
        config.database_path.clone_from(database);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .with_context(|| format!("opening database {}", config.database_path.display()))?,
    );
    let vcs = Arc::new(VcsAdapter::new(&config));
    let feed = Arc::new(FeedAdapter::new(&config).context("building feed client")?);

    let concurrency = config.concurrency;
    let poll_interval = config.poll_interval();
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        store,
        Arc::new(NoIdentityResolver),
        vcs,
        feed,
    ));
    let worker = Arc::new(SyncWorker::new(orchestrator, concurrency, poll_interval));

    if args.once {
        let report = worker.run_once().await;
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            inserted = report.inserted,
            "one-shot batch complete"
        );
        return Ok(());
    }

    let shutdown = worker.shutdown_handle();
    let run_worker = Arc::clone(&worker);
    let task = tokio::spawn(async move { run_worker.run().await });

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received; shutting down"),
        _ = sigint.recv() => info!("SIGINT received; shutting down"),
    }

    shutdown.request();
    task.await.context("worker task failed")?;
    Ok(())
}
