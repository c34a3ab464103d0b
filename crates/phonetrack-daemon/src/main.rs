//! `phonetrackd`: polls PhoneTrack endpoints and serves device tracker state.
//!
//! Usage:
//!   phonetrackd [--config <path>]          run the trackers and the HTTP API
//!   phonetrackd [--config <path>] check    validate every tracker and exit

mod http;

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use phonetrack_core::config::{Config, TrackerConfig};
use phonetrack_core::error::{ConfigError, SetupError};
use phonetrack_core::evaluator;
use phonetrack_core::fetch::{Fetcher, HttpFetcher};
use phonetrack_core::platform;
use phonetrack_core::tracker::Tracker;
use phonetrack_core::validation::{validate_connection, validate_static};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::http::SharedTrackers;

/// PhoneTrack device tracker daemon.
#[derive(Parser, Debug)]
#[command(name = "phonetrackd", version, about = "PhoneTrack device tracker daemon")]
struct Cli {
    /// Config file (defaults to ~/.config/phonetrack/config.toml).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe every configured tracker and print its validation result.
    Check,
}

fn init_logging() -> anyhow::Result<PathBuf> {
    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = platform::log_path();

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,phonetrack_core=debug,phonetrack_daemon=debug,hyper=warn,reqwest=warn",
                )
            }),
        )
        .init();

    Ok(log_path)
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(p) => Config::load_from(p)?,
        None => Config::load()?,
    };
    info!(
        "Config loaded from: {:?}",
        path.cloned().unwrap_or_else(Config::config_path)
    );
    Ok(config)
}

/// Returns the duplicate error if this tracker's key was already claimed.
fn claim_key(seen: &mut HashSet<String>, config: &TrackerConfig) -> Result<(), ConfigError> {
    // Trackers that fail static checks report that error from setup instead.
    if let Ok(validated) = validate_static(config) {
        if !seen.insert(validated.config_key()) {
            return Err(ConfigError::AlreadyConfigured(validated.device_name));
        }
    }
    Ok(())
}

async fn run_check(config: &Config, fetcher: &dyn Fetcher) -> anyhow::Result<()> {
    if config.trackers.is_empty() {
        println!("no trackers configured in {:?}", Config::config_path());
        return Ok(());
    }

    let mut seen = HashSet::new();
    let mut failed = 0usize;
    for (idx, tracker) in config.trackers.iter().enumerate() {
        let result = match claim_key(&mut seen, tracker) {
            Ok(()) => validate_connection(tracker, fetcher).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => println!("[{}] {}: ok", idx, tracker.device_name.trim()),
            Err(e) => {
                failed += 1;
                println!(
                    "[{}] {}: {} ({})",
                    idx,
                    tracker.device_name.trim(),
                    e.error_code(),
                    e
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} trackers failed validation", failed, config.trackers.len());
    }
    Ok(())
}

/// Result of the first setup pass.
struct Startup {
    ready: Vec<Tracker>,
    /// Trackers whose first refresh failed, by config index. Retried later.
    pending: Vec<(usize, TrackerConfig)>,
}

async fn setup_trackers(config: &Config, fetcher: Arc<dyn Fetcher>) -> Startup {
    let mut seen = HashSet::new();
    let mut startup = Startup {
        ready: Vec::new(),
        pending: Vec::new(),
    };

    for (idx, tracker_config) in config.trackers.iter().enumerate() {
        if let Err(e) = claim_key(&mut seen, tracker_config) {
            error!("[setup] tracker {} rejected: {} ({})", idx, e, e.error_code());
            continue;
        }
        match Tracker::setup(tracker_config, Arc::clone(&fetcher)).await {
            Ok(tracker) => startup.ready.push(tracker),
            Err(SetupError::Config(e)) => {
                error!("[setup] tracker {} rejected: {} ({})", idx, e, e.error_code());
            }
            Err(SetupError::NotReady(e)) => {
                warn!("[setup] tracker {} not ready, will retry: {}", idx, e);
                startup.pending.push((idx, tracker_config.clone()));
            }
        }
    }

    startup
}

/// Log phase transitions as the tracker publishes new revisions, until
/// `cancel` fires.
fn watch_phases(
    tracker: &Tracker,
    cancel: CancellationToken,
) -> impl Future<Output = ()> + Send + 'static {
    let coordinator = Arc::clone(tracker.coordinator());
    let evaluation = tracker.settings().evaluation_config();
    let mut rx = tracker.subscribe();

    async move {
        let mut last_phase = None;
        loop {
            let state = coordinator.snapshot().await;
            let phase = evaluator::phase(&state, &evaluation, Utc::now());
            if last_phase != Some(phase) {
                if let Some(prev) = last_phase {
                    info!("[state] {}: {:?} -> {:?}", coordinator.name(), prev, phase);
                }
                last_phase = Some(phase);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Retry setup of a not-ready tracker once per update interval. Once it is up
/// it joins `trackers` and its phases are logged like any other.
fn spawn_retry(
    idx: usize,
    config: TrackerConfig,
    fetcher: Arc<dyn Fetcher>,
    trackers: SharedTrackers,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(config.update_interval);
        match Tracker::retry_setup(&config, fetcher, period, &shutdown).await {
            Ok(Some(tracker)) => {
                let phases = watch_phases(&tracker, shutdown.clone());
                trackers.write().await.push(tracker);
                info!("[setup] tracker {} is now running", idx);
                phases.await;
            }
            Ok(None) => {}
            Err(e) => error!("[setup] tracker {} rejected: {} ({})", idx, e, e.error_code()),
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_path = init_logging()?;
    info!("Log file: {:?}", log_path);

    let config = load_config(cli.config.as_ref())?;
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);

    if let Some(Command::Check) = cli.command {
        return run_check(&config, fetcher.as_ref()).await;
    }

    let Startup { ready, pending } = setup_trackers(&config, Arc::clone(&fetcher)).await;
    if ready.is_empty() && pending.is_empty() {
        anyhow::bail!(
            "no tracker could be started ({} configured)",
            config.trackers.len()
        );
    }
    info!(
        "{} of {} trackers running, {} waiting to retry",
        ready.len(),
        config.trackers.len(),
        pending.len()
    );

    let shutdown = CancellationToken::new();
    let trackers: SharedTrackers = Arc::new(RwLock::new(Vec::new()));
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    for tracker in ready {
        tasks.push(tokio::spawn(watch_phases(&tracker, shutdown.clone())));
        trackers.write().await.push(tracker);
    }
    for (idx, tracker_config) in pending {
        tasks.push(spawn_retry(
            idx,
            tracker_config,
            Arc::clone(&fetcher),
            Arc::clone(&trackers),
            shutdown.clone(),
        ));
    }

    let http_handle = if config.http.enabled {
        Some(http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            Arc::clone(&trackers),
            shutdown.clone(),
        ))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("[setup] tracker task failed: {}", e);
        }
    }
    if let Some(handle) = http_handle {
        if let Err(e) = handle.await {
            error!("[http] server task failed: {}", e);
        }
    }

    let running = std::mem::take(&mut *trackers.write().await);
    for tracker in running {
        tracker.unload().await;
    }

    Ok(())
}
