//! Tests for the Reconciler module

use super::*;
use crate::domain::geo::destination;
use crate::domain::types::{Crate, FetchRequest};
use crate::io::durable::MemoryStore;
use crate::io::remote::MemoryRemoteStore;
use crate::services::signal_filter::Rejection;

const LAT: f64 = 52.5163;
const LON: f64 = 13.3777;

/// Shared store and remote, so several reconcilers can act as separate contexts
struct Harness {
    store: Arc<dyn DurableStore>,
    remote: Arc<MemoryRemoteStore>,
    metrics: Arc<Metrics>,
    config: Config,
}

impl Harness {
    fn new() -> Self {
        Self::with_crates(vec![
            crate_at("near", 90.0, 5.0),
            crate_at("mid", 0.0, 40.0),
            crate_at("far", 180.0, 500.0),
        ])
    }

    fn with_crates(crates: Vec<Crate>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            remote: Arc::new(MemoryRemoteStore::with_crates(crates)),
            metrics: Arc::new(Metrics::new()),
            config: Config::default(),
        }
    }

    fn reconciler(&self, context: ExecutionContext) -> Reconciler {
        Reconciler::open(
            context,
            &self.config,
            self.store.clone(),
            self.remote.clone(),
            self.metrics.clone(),
            None,
        )
        .unwrap()
    }
}

fn crate_at(id: &str, bearing: f64, meters: f64) -> Crate {
    let (lat, lon) = destination(LAT, LON, bearing, meters);
    Crate::new(id, lat, lon, "fortune")
}

fn sample_at(bearing: f64, meters: f64, ts: u64) -> RawSample {
    let (lat, lon) = destination(LAT, LON, bearing, meters);
    RawSample::new(lat, lon, 5.0, ts)
}

fn ids(report: &TickReport) -> Vec<String> {
    report.collected().map(|r| r.crate_id.0.clone()).collect()
}

#[tokio::test]
async fn test_first_fix_fetches_and_collects_in_range() {
    let h = Harness::new();
    let mut r = h.reconciler(ExecutionContext::Foreground);

    let tick = r.handle_position(sample_at(0.0, 0.0, 1_000)).await;
    assert!(tick.outcome.accepted().is_some());
    assert!(tick.fetched);
    assert_eq!(ids(&tick), vec!["near"]);

    // Collected crate leaves the radar, the out-of-range one stays
    assert!(!r.index().contains(&CrateId::from("near")));
    assert!(r.index().contains(&CrateId::from("mid")));
    assert!(!r.index().contains(&CrateId::from("far")));
    let radar = r.radar();
    assert_eq!(radar.len(), 1);
    assert_eq!(radar[0].crate_id, CrateId::from("mid"));
}

#[tokio::test]
async fn test_rejected_sample_does_nothing() {
    let h = Harness::new();
    let mut r = h.reconciler(ExecutionContext::Foreground);

    let mut raw = sample_at(0.0, 0.0, 1_000);
    raw.accuracy_m = 80.0;
    let tick = r.handle_position(raw).await;

    assert!(matches!(tick.outcome, FilterOutcome::Rejected(Rejection::Accuracy { .. })));
    assert!(!tick.fetched);
    assert!(tick.attempts.is_empty());
    assert_eq!(h.remote.fetch_calls(), 0);
    assert!(r.position().is_none());
    assert_eq!(h.metrics.report().samples_rejected_accuracy, 1);
}

#[tokio::test]
async fn test_no_refetch_until_moved_past_threshold() {
    let h = Harness::new();
    let mut r = h.reconciler(ExecutionContext::Foreground);

    r.handle_position(sample_at(0.0, 0.0, 0)).await;
    let tick = r.handle_position(sample_at(0.0, 10.0, 10_000)).await;
    assert!(!tick.fetched);
    assert_eq!(h.remote.fetch_calls(), 1);
}

#[tokio::test]
async fn test_fetch_failure_keeps_cache_and_retries() {
    let h = Harness::new();
    let mut r = h.reconciler(ExecutionContext::Foreground);
    r.handle_position(sample_at(0.0, 0.0, 0)).await;
    assert!(r.index().contains(&CrateId::from("mid")));

    // Walk south; the smoothed position lags the raw fixes: 10.5 m, 24.2 m, 38.7 m, 53.6 m
    h.remote.fail_next(1);
    assert!(!r.handle_position(sample_at(180.0, 15.0, 20_000)).await.fetched);
    assert!(!r.handle_position(sample_at(180.0, 30.0, 40_000)).await.fetched);

    let failed = r.handle_position(sample_at(180.0, 45.0, 60_000)).await;
    assert!(failed.fetched);
    assert!(r.index().contains(&CrateId::from("mid")));
    assert_eq!(h.metrics.report().fetch_failures, 1);

    // Still due on the next fix, measured from the last successful fetch
    let retried = r.handle_position(sample_at(180.0, 60.0, 80_000)).await;
    assert!(retried.fetched);
    assert_eq!(h.remote.fetch_calls(), 3);
    assert!(r.index().last_fetch_position().is_some_and(|req| req.latitude < LAT));
}

#[tokio::test]
async fn test_server_side_collections_hidden_on_fetch() {
    let h = Harness::new();
    let mut r = h.reconciler(ExecutionContext::Foreground);

    // Collected earlier from another install of the same account
    let mid = CrateId::from("mid");
    h.remote.record_collection(r.user_id(), &mid).await.unwrap();

    let tick = r.handle_position(sample_at(0.0, 0.0, 1_000)).await;
    assert!(tick.fetched);
    assert_eq!(ids(&tick), vec!["near"]);

    assert!(!r.index().contains(&mid));
    assert!(r.radar().iter().all(|contact| contact.crate_id != mid));
    assert!(r.guard().dedup().contains(&mid).unwrap());
    // Seed plus "near"; "mid" was never attempted
    assert_eq!(h.remote.record_calls(), 2);
    assert!(!r.guard().is_attempted(&mid));
}

#[tokio::test]
async fn test_collection_failure_retried_next_tick() {
    let h = Harness::with_crates(Vec::new());
    let mut r = h.reconciler(ExecutionContext::Foreground);
    r.handle_position(sample_at(0.0, 0.0, 0)).await;

    // A crate shows up next to the observer between refetches
    let request = FetchRequest { latitude: LAT, longitude: LON, radius_m: 100.0 };
    r.index.apply_fetch_result(&request, vec![crate_at("fresh", 270.0, 3.0)]).unwrap();

    h.remote.fail_next(1);
    let failed = r.handle_position(sample_at(0.0, 0.0, 1_000)).await;
    assert!(!failed.fetched);
    assert_eq!(failed.failures(), 1);
    assert!(r.index().contains(&CrateId::from("fresh")));
    assert!(!r.guard().is_attempted(&CrateId::from("fresh")));

    let retried = r.handle_position(sample_at(0.0, 0.0, 2_000)).await;
    assert_eq!(ids(&retried), vec!["fresh"]);
    assert!(!r.index().contains(&CrateId::from("fresh")));
}

#[tokio::test]
async fn test_background_then_foreground_never_double_collects() {
    let h = Harness::new();

    let mut background = h.reconciler(ExecutionContext::Background);
    let report = background.run_batch(vec![sample_at(0.0, 0.0, 0), sample_at(0.0, 1.0, 5_000)]).await;
    assert_eq!(report.accepted, 2);
    assert_eq!(report.collected.len(), 1);

    // Foreground starts later in a fresh process over the same durable store
    let mut foreground = h.reconciler(ExecutionContext::Foreground);
    assert_eq!(foreground.user_id(), background.user_id());
    let tick = foreground.handle_position(sample_at(0.0, 0.0, 60_000)).await;

    assert!(tick.collected().next().is_none());
    assert!(!foreground.index().contains(&CrateId::from("near")));
    assert_eq!(h.remote.records().len(), 1);
    assert_eq!(h.remote.record_calls(), 1);
}

#[tokio::test]
async fn test_heading_on_sample_drives_display_rotation() {
    let h = Harness::new();
    let mut r = h.reconciler(ExecutionContext::Foreground);

    let mut raw = sample_at(0.0, 0.0, 0);
    raw.heading_deg = Some(350.0);
    r.handle_position(raw).await;
    r.handle_heading(10.0);

    assert_eq!(r.display_rotation(), -370.0);
    assert_eq!(h.metrics.report().heading_updates, 2);

    let tick = r.handle_position(sample_at(0.0, 0.0, 1_000)).await;
    assert_eq!(tick.outcome.accepted().unwrap().heading_deg, Some(10.0));
}

#[tokio::test]
async fn test_permission_denied_ends_session() {
    let h = Harness::new();
    let mut r = h.reconciler(ExecutionContext::Foreground);
    let (tx, rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tx.send(SensorEvent::Position(sample_at(0.0, 0.0, 0))).await.unwrap();
    tx.send(SensorEvent::PermissionDenied).await.unwrap();
    tx.send(SensorEvent::Position(sample_at(0.0, 1.0, 1_000))).await.unwrap();

    let result = r.run(rx, shutdown_rx).await;
    assert_eq!(result, Err(TrackingError::PermissionDenied));
    assert_eq!(h.metrics.samples_accepted(), 1);
}

#[tokio::test]
async fn test_run_ends_when_stream_closes() {
    let h = Harness::new();
    let mut r = h.reconciler(ExecutionContext::Foreground);
    let (tx, rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tx.send(SensorEvent::Heading { degrees: 90.0 }).await.unwrap();
    tx.send(SensorEvent::Position(sample_at(0.0, 0.0, 0))).await.unwrap();
    drop(tx);

    assert_eq!(r.run(rx, shutdown_rx).await, Ok(()));
    assert_eq!(h.metrics.collections_total(), 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let h = Harness::new();
    let mut r = h.reconciler(ExecutionContext::Foreground);
    let (_tx, rx) = mpsc::channel::<SensorEvent>(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    shutdown_tx.send(true).unwrap();
    assert_eq!(r.run(rx, shutdown_rx).await, Ok(()));
}
