//! crate-drop - location-triggered crate collection engine
//!
//! Subcommands:
//! - `track` - foreground session: sensor events (JSON lines) from stdin or a file
//! - `background` - one OS-scheduled batch over recorded samples
//! - `sync` - merge the server's collection records into local storage
//! - `open` - open a collected crate
//! - `inventory` - list collected crates
//!
//! Module structure:
//! - `domain/` - Value types and geodesy
//! - `services/` - Filter, heading, radar, proximity index, collection guard, reconciler
//! - `io/` - Durable storage, remote store, events, Prometheus
//! - `infra/` - Config, metrics, identity

use anyhow::Context;
use clap::{Parser, Subcommand};
use crate_drop::domain::types::{Crate, ExecutionContext, RawSample, RecordId, SensorEvent};
use crate_drop::infra::{load_or_create_user_id, Config, Metrics};
use crate_drop::io::{
    create_event_channel, DedupSet, DurableStore, EventLog, FileStore, MemoryRemoteStore,
    RemoteStore, RestRemoteStore,
};
use crate_drop::services::{run_background_batch, CollectionLedger, Inventory, Reconciler};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Location-triggered crate collection engine
#[derive(Parser, Debug)]
#[command(name = "crate-drop", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Serve crates from a JSON file with an in-process store instead of the HTTP remote
    #[arg(long)]
    offline_crates: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a foreground tracking session
    Track {
        /// Sensor event file (JSON lines); stdin if omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Run one background batch over recorded position samples
    Background {
        /// Sample file (JSON lines of sensor events or raw samples)
        input: PathBuf,
    },
    /// Pull this user's collection records from the server
    Sync,
    /// Open a collected crate
    Open {
        record_id: String,
    },
    /// List collected crates
    Inventory {
        /// Only crates not opened yet
        #[arg(long)]
        unopened: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug to see rejected samples
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        storage_dir = %config.storage_dir(),
        remote = %config.remote_base_url(),
        radar_range_m = %config.radar_max_range_m(),
        refetch_distance_m = %config.refetch_distance_m(),
        collection_radius_m = %config.collection_radius_m(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );
    for warning in config.warnings() {
        warn!(warning = %warning, "config_warning");
    }

    let store: Arc<dyn DurableStore> = Arc::new(
        FileStore::open(config.storage_dir())
            .with_context(|| format!("Failed to open storage at {}", config.storage_dir()))?,
    );
    let remote = build_remote(args.offline_crates.as_deref(), &config)?;

    match args.command {
        Command::Track { input } => track(config, store, remote, input).await,
        Command::Background { input } => background(config, store, remote, &input).await,
        Command::Sync => {
            let report = inventory(store, remote)?.sync_from_server().await?;
            println!("{}", serde_json::json!({
                "remote_records": report.remote_records,
                "added": report.added,
                "opened": report.opened,
                "dedup_added": report.dedup_added,
            }));
            Ok(())
        }
        Command::Open { record_id } => {
            let record = inventory(store, remote)?.open(&RecordId(record_id)).await?;
            println!("{}", serde_json::to_string(&record)?);
            Ok(())
        }
        Command::Inventory { unopened } => {
            let inventory = inventory(store, remote)?;
            let records = if unopened { inventory.unopened()? } else { inventory.records()? };
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
    }
}

fn build_remote(offline_crates: Option<&Path>, config: &Config) -> anyhow::Result<Arc<dyn RemoteStore>> {
    match offline_crates {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read crate file {}", path.display()))?;
            let crates: Vec<Crate> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse crate file {}", path.display()))?;
            info!(crates = %crates.len(), file = %path.display(), "offline_remote_store");
            Ok(Arc::new(MemoryRemoteStore::with_crates(crates)))
        }
        None => Ok(Arc::new(RestRemoteStore::new(config)?)),
    }
}

fn inventory(store: Arc<dyn DurableStore>, remote: Arc<dyn RemoteStore>) -> anyhow::Result<Inventory> {
    let user_id = load_or_create_user_id(store.as_ref())?;
    Ok(Inventory::new(
        user_id,
        remote,
        CollectionLedger::new(store.clone()),
        DedupSet::new(store),
    ))
}

async fn track(
    config: Config,
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteStore>,
    input: Option<PathBuf>,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let metrics = Arc::new(Metrics::new());

    // Collection events go to the JSONL event log (notification collaborator)
    let (event_sender, event_rx) = create_event_channel(1000, metrics.clone());
    let event_log = EventLog::new(config.events_file());
    let event_log_handle = tokio::spawn(event_log.run(event_rx, shutdown_rx.clone()));

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = crate_drop::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                ExecutionContext::Foreground.as_str(),
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics summary
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            reporter_metrics.report().log();
        }
    });

    // Sensor events, bounded so a stalled pipeline applies backpressure to the reader
    let (sensor_tx, sensor_rx) = mpsc::channel(1000);
    tokio::spawn(read_sensor_events(input, sensor_tx));

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = signal_tx.send(true);
    });

    let mut reconciler = Reconciler::open(
        ExecutionContext::Foreground,
        &config,
        store,
        remote,
        metrics.clone(),
        Some(event_sender),
    )?;
    let result = reconciler.run(sensor_rx, shutdown_rx).await;

    // Stop background tasks and let the event log drain
    drop(reconciler);
    let _ = shutdown_tx.send(true);
    let _ = event_log_handle.await;

    metrics.report().log();
    match result {
        Ok(()) => {
            info!("crate-drop tracking stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "tracking_halted");
            Err(e.into())
        }
    }
}

async fn background(
    config: Config,
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteStore>,
    input: &Path,
) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read samples from {}", input.display()))?;
    let samples = parse_samples(&content);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let (event_sender, event_rx) = create_event_channel(1000, metrics.clone());
    let event_log_handle =
        tokio::spawn(EventLog::new(config.events_file()).run(event_rx, shutdown_rx));

    let report =
        run_background_batch(&config, store, remote, metrics.clone(), Some(event_sender), samples)
            .await?;

    let _ = shutdown_tx.send(true);
    let _ = event_log_handle.await;

    metrics.report().log();
    println!("{}", serde_json::json!({
        "samples": report.samples,
        "accepted": report.accepted,
        "rejected": report.rejected,
        "collected": report.collected,
        "failures": report.failures,
    }));
    Ok(())
}

/// Position samples from JSON lines; accepts sensor events or bare samples
fn parse_samples(content: &str) -> Vec<RawSample> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<SensorEvent>(line) {
            Ok(SensorEvent::Position(raw)) => Some(raw),
            Ok(_) => None,
            Err(_) => match serde_json::from_str::<RawSample>(line) {
                Ok(raw) => Some(raw),
                Err(e) => {
                    warn!(error = %e, "sample_line_unparseable");
                    None
                }
            },
        })
        .collect()
}

/// Forward sensor events from a JSON-lines source until EOF or the receiver goes away
async fn read_sensor_events(input: Option<PathBuf>, tx: mpsc::Sender<SensorEvent>) {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
        Some(path) => match tokio::fs::File::open(path).await {
            Ok(file) => Box::new(BufReader::new(file)),
            Err(e) => {
                error!(file = %path.display(), error = %e, "sensor_input_open_failed");
                return;
            }
        },
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SensorEvent>(&line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "sensor_event_unparseable"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "sensor_input_read_failed");
                break;
            }
        }
    }
}
