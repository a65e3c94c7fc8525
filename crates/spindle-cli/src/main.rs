//! `spindle` - archive task dispatcher and worker fleet.
//!
//! - `spindle serve`: dispatch HTTP API plus the reaper and band-schedule loops
//! - `spindle worker`: one polling service that runs tasks as child processes

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use spindle_core::app::{BandScheduleLoop, DispatcherBuilder, ReaperLoop};
use spindle_core::config::Config;
use spindle_core::impls::{InMemoryArchiveStore, StoreSnapshot};
use spindle_core::ports::{Clock, SystemClock};

mod backoff;
mod client;
mod executor;
mod server;
mod worker;

use crate::backoff::PollBackoff;
use crate::client::DispatchClient;
use crate::executor::CommandExecutor;
use crate::worker::{Worker, WorkerSettings};

#[derive(Debug, Parser)]
#[command(name = "spindle", version, about = "Archive task dispatcher")]
struct Cli {
    /// tracing filter, e.g. "info" or "spindle_core=debug"
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the dispatch server.
    Serve(ServeArgs),
    /// Run a worker service against a dispatch server.
    Worker(WorkerArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long)]
    config: PathBuf,

    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// JSON snapshot loaded into the in-memory store at startup.
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    #[arg(long)]
    division: String,

    #[arg(long, value_delimiter = ',')]
    features: Vec<String>,

    #[arg(long, value_delimiter = ',', required = true)]
    tasks: Vec<String>,

    #[arg(long, default_value_t = 1)]
    threads: u32,

    /// First idle backoff; doubles per empty poll.
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    max_poll_ms: u64,

    #[arg(long, default_value_t = 240)]
    heartbeat_secs: u64,

    /// TOML file mapping task names to commands.
    #[arg(long)]
    exec: PathBuf,

    /// Stop after this many seconds.
    #[arg(long)]
    time: Option<u64>,

    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::new(&cli.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Worker(args) => run_worker(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = Config::load_from(&args.config)
        .await
        .with_context(|| format!("load config {}", args.config.display()))?;
    let band_schedule = config.scheduler.band_schedule;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let snapshot = match &args.seed {
        Some(path) => load_seed(path).await?,
        None => StoreSnapshot::default(),
    };
    let store = Arc::new(InMemoryArchiveStore::from_snapshot(snapshot, Arc::clone(&clock)));

    let dispatcher = Arc::new(
        DispatcherBuilder::new(config)
            .catalog(store.clone())
            .restore(store)
            .clock(Arc::clone(&clock))
            .build()
            .await
            .context("build dispatcher")?,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut loops = Vec::new();
    loops.push(tokio::spawn(
        ReaperLoop::new(Arc::clone(&dispatcher)).run(stop_rx.clone()),
    ));
    if band_schedule {
        loops.push(tokio::spawn(
            BandScheduleLoop::new(Arc::clone(&dispatcher), Arc::clone(&clock)).run(stop_rx.clone()),
        ));
    }

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!(addr = %args.listen, "spindle listening");

    axum::serve(listener, server::router(dispatcher))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = stop_tx.send(true);
    for handle in loops {
        handle.await.context("background loop panicked")?;
    }
    info!("spindle stopped");
    Ok(())
}

async fn load_seed(path: &Path) -> Result<StoreSnapshot> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read seed {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse seed {}", path.display()))
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    let executor = CommandExecutor::load_from(&args.exec).await?;
    for task in &args.tasks {
        if !executor.handles(task) {
            tracing::warn!(%task, "no command configured; leases of this task will fail");
        }
    }

    let settings = WorkerSettings {
        division: args.division,
        features: args.features,
        tasks: args.tasks,
        threads: args.threads,
        backoff: PollBackoff::new(
            Duration::from_millis(args.poll_ms),
            Duration::from_millis(args.max_poll_ms),
        ),
        heartbeat: Duration::from_secs(args.heartbeat_secs.max(1)),
        host: args.host,
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let time_limit = args.time;
    tokio::spawn(async move {
        match time_limit {
            Some(secs) => {
                tokio::select! {
                    _ = shutdown_signal() => {}
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        info!(secs, "time limit reached");
                    }
                }
            }
            None => shutdown_signal().await,
        }
        let _ = stop_tx.send(true);
    });

    let worker = Worker::new(DispatchClient::new(&args.server), Arc::new(executor), settings);
    let report = worker.run(stop_rx).await?;
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        returned = report.returned,
        "worker finished"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
