//! Walk simulator - deterministic noisy walk through a field of crates
//!
//! Drives the full pipeline without a device or a server:
//! 1. Foreground session over the first part of the walk (position + heading events)
//! 2. App suspended: a background batch over sparse samples for the rest
//! 3. App resumed: a fresh foreground reconciler and an inventory sync
//!
//! The in-process remote store enforces one record per (user, crate), so the
//! summary at the end doubles as an at-most-once check across contexts.
//!
//! Usage:
//!   cargo run --bin walk-sim -- --steps 240 --glitch-every 17

use anyhow::Context;
use clap::Parser;
use crate_drop::domain::geo::{destination, distance_m, haversine_m};
use crate_drop::domain::types::{Crate, ExecutionContext, RawSample, SensorEvent, StablePosition};
use crate_drop::infra::{Config, Metrics};
use crate_drop::io::{DedupSet, DurableStore, FileStore, MemoryRemoteStore, MemoryStore};
use crate_drop::services::{run_background_batch, CollectionLedger, Inventory, Reconciler};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const START_LAT: f64 = 52.5163;
const START_LON: f64 = 13.3777;
const WALK_BEARING_DEG: f64 = 45.0;
const STEP_M: f64 = 1.2;
const SAMPLE_INTERVAL_MS: u64 = 1_000;

// ============================================================================
// CLI Args
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "walk-sim")]
#[command(about = "Simulate a noisy walk past crates, foreground then background")]
struct Args {
    /// Config file path (defaults apply if missing)
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Number of one-second position samples in the walk
    #[arg(long, default_value = "240")]
    steps: usize,

    /// Fraction of the walk handled in the foreground before suspending
    #[arg(long, default_value = "0.5")]
    foreground_share: f64,

    /// Only every Nth sample reaches the background batch
    #[arg(long, default_value = "5")]
    background_stride: usize,

    /// Crates placed along the route
    #[arg(long, default_value = "8")]
    crates: usize,

    /// Inject a 300 m GPS glitch every N samples (0 disables)
    #[arg(long, default_value = "17")]
    glitch_every: usize,

    /// Report a 60 m accuracy radius every N samples (0 disables)
    #[arg(long, default_value = "11")]
    poor_accuracy_every: usize,

    /// Horizontal noise amplitude in meters
    #[arg(long, default_value = "2.5")]
    noise_m: f64,

    /// Simulated remote latency in milliseconds
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// Persist to this directory instead of an in-memory store
    #[arg(long)]
    storage_dir: Option<String>,
}

// ============================================================================
// Walk generation
// ============================================================================

/// Crates alternate left and right of the route; every fourth sits too far off to collect
fn place_crates(count: usize) -> Vec<Crate> {
    (0..count)
        .map(|i| {
            let along = 20.0 + i as f64 * 32.0;
            let (lat, lon) = destination(START_LAT, START_LON, WALK_BEARING_DEG, along);
            let side = if i % 2 == 0 { 90.0 } else { -90.0 };
            let offset = if i % 4 == 3 { 35.0 } else { 4.0 + (i % 3) as f64 };
            let (lat, lon) = destination(lat, lon, WALK_BEARING_DEG + side, offset);
            Crate::new(&format!("crate-{i:02}"), lat, lon, &format!("fortune-{i}"))
        })
        .collect()
}

fn true_position(step: usize) -> (f64, f64) {
    destination(START_LAT, START_LON, WALK_BEARING_DEG, step as f64 * STEP_M)
}

/// Deterministic raw sample for `step`: jitter, occasional glitches and poor fixes
fn raw_sample(args: &Args, step: usize) -> RawSample {
    let (lat, lon) = true_position(step);
    let jitter_bearing = (step as f64 * 73.0) % 360.0;
    let jitter = (step as f64 * 1.7).sin().abs() * args.noise_m;
    let (mut lat, mut lon) = destination(lat, lon, jitter_bearing, jitter);
    let mut accuracy = 4.0 + (step % 5) as f64;

    if args.glitch_every > 0 && step > 0 && step % args.glitch_every == 0 {
        (lat, lon) = destination(lat, lon, 200.0, 300.0);
    }
    if args.poor_accuracy_every > 0 && step > 0 && step % args.poor_accuracy_every == 0 {
        accuracy = 60.0;
    }

    RawSample::new(lat, lon, accuracy, step as u64 * SAMPLE_INTERVAL_MS)
}

/// Compass reading swaying a few degrees around the walking direction
fn compass_reading(step: usize) -> f64 {
    WALK_BEARING_DEG + (step as f64 * 0.9).sin() * 4.0
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    let store: Arc<dyn DurableStore> = match &args.storage_dir {
        Some(dir) => Arc::new(
            FileStore::open(dir).with_context(|| format!("Failed to open storage at {dir}"))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let crates = place_crates(args.crates);
    let remote = Arc::new(
        MemoryRemoteStore::with_crates(crates.clone())
            .with_latency(Duration::from_millis(args.latency_ms)),
    );
    let metrics = Arc::new(Metrics::new());

    let split = ((args.steps as f64) * args.foreground_share.clamp(0.0, 1.0)) as usize;
    info!(steps = %args.steps, foreground_steps = %split, crates = %crates.len(), "walk_sim_started");

    // Phase 1: foreground session
    let mut foreground = Reconciler::open(
        ExecutionContext::Foreground,
        &config,
        store.clone(),
        remote.clone(),
        metrics.clone(),
        None,
    )?;
    for step in 0..split {
        foreground.process_event(SensorEvent::Heading { degrees: compass_reading(step) }).await?;
        let raw = raw_sample(&args, step);
        if let Some(tick) = foreground.process_event(SensorEvent::Position(raw)).await? {
            for record in tick.collected() {
                println!("[fg   step {step:>4}] collected {}", record.crate_id);
            }
        }
    }
    let radar = foreground.radar();
    println!(
        "[fg] suspended with {} crate(s) on radar, display rotation {:.1} deg",
        radar.len(),
        foreground.display_rotation()
    );
    for contact in &radar {
        println!(
            "       {:<10} {:>6.1} m  bearing {:>5.1}  ({:+.2}, {:+.2})",
            contact.crate_id.to_string(),
            contact.blip.distance_m,
            contact.blip.bearing_deg,
            contact.blip.x,
            contact.blip.y
        );
    }
    drop(foreground);

    // Phase 2: OS wakes the app with a sparse batch
    let stride = args.background_stride.max(1);
    let batch: Vec<RawSample> = (split..args.steps)
        .step_by(stride)
        .map(|step| raw_sample(&args, step))
        .collect();
    let report =
        run_background_batch(&config, store.clone(), remote.clone(), metrics.clone(), None, batch)
            .await?;
    for record in &report.collected {
        println!("[bg] collected {}", record.crate_id);
    }
    println!(
        "[bg] batch: {} samples, {} accepted, {} rejected, {} failures",
        report.samples, report.accepted, report.rejected, report.failures
    );

    // Phase 3: app resumed where the walk ended
    let mut resumed = Reconciler::open(
        ExecutionContext::Foreground,
        &config,
        store.clone(),
        remote.clone(),
        metrics.clone(),
        None,
    )?;
    let last = args.steps.saturating_sub(1);
    let mut raw = raw_sample(&args, last);
    raw.timestamp_ms += SAMPLE_INTERVAL_MS;
    if let Some(tick) = resumed.process_event(SensorEvent::Position(raw)).await? {
        println!("[fg] resumed, {} new collection(s)", tick.collected().count());
    }

    let inventory = Inventory::new(
        resumed.user_id().clone(),
        remote.clone(),
        CollectionLedger::new(store.clone()),
        DedupSet::new(store.clone()),
    );
    let sync = inventory.sync_from_server().await?;
    let records = inventory.records()?;

    // At-most-once check against the server's records
    let server_records = remote.records();
    let distinct: FxHashSet<_> = server_records.iter().map(|r| r.crate_id.clone()).collect();
    let (end_lat, end_lon) = true_position(last);
    let reachable = crates
        .iter()
        .filter(|c| {
            (0..args.steps).any(|s| {
                let (lat, lon) = true_position(s);
                distance_m(&StablePosition::at(lat, lon), *c) <= config.collection_radius_m()
            })
        })
        .count();

    println!();
    println!("=== walk-sim summary ===");
    println!("user id:              {}", resumed.user_id());
    println!("walk length:          {:.0} m", haversine_m(START_LAT, START_LON, end_lat, end_lon));
    println!("crates placed:        {}", crates.len());
    println!("crates on the route:  {reachable}");
    println!("server records:       {} ({} distinct crates)", server_records.len(), distinct.len());
    println!("inventory:            {} ({} added by sync)", records.len(), sync.added);
    println!("record calls:         {}", remote.record_calls());
    println!("fetch calls:          {}", remote.fetch_calls());
    metrics.report().log();

    anyhow::ensure!(
        server_records.len() == distinct.len(),
        "a crate was collected more than once"
    );
    Ok(())
}
