//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations so the sensor callback path never
//! contends on a mutex. `report` swaps the periodic counters to zero for the
//! log reporter; `snapshot` reads the cumulative ones for scrapers.
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use them for coordination or collection decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Why a raw sample was dropped, for counting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    Accuracy,
    Jump,
}

/// Lock-free metrics collector shared by both execution contexts of one process
pub struct Metrics {
    samples_accepted: AtomicU64,
    samples_rejected_accuracy: AtomicU64,
    samples_rejected_jump: AtomicU64,
    heading_updates: AtomicU64,
    fetches_total: AtomicU64,
    fetch_failures: AtomicU64,
    collections_total: AtomicU64,
    duplicates_total: AtomicU64,
    collection_failures: AtomicU64,
    events_dropped: AtomicU64,
    /// Crates currently visible in the foreground index
    visible_crates: AtomicU64,
    /// Ticks since last report (reset on report)
    ticks_since_report: AtomicU64,
    ticks_total: AtomicU64,
    tick_latency_sum_us: AtomicU64,
    tick_latency_max_us: AtomicU64,
    tick_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Lifetime histogram, never reset
    tick_latency_sum_total_us: AtomicU64,
    tick_latency_max_total_us: AtomicU64,
    tick_latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    started: Instant,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_accepted: AtomicU64::new(0),
            samples_rejected_accuracy: AtomicU64::new(0),
            samples_rejected_jump: AtomicU64::new(0),
            heading_updates: AtomicU64::new(0),
            fetches_total: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            collections_total: AtomicU64::new(0),
            duplicates_total: AtomicU64::new(0),
            collection_failures: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            visible_crates: AtomicU64::new(0),
            ticks_since_report: AtomicU64::new(0),
            ticks_total: AtomicU64::new(0),
            tick_latency_sum_us: AtomicU64::new(0),
            tick_latency_max_us: AtomicU64::new(0),
            tick_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            tick_latency_sum_total_us: AtomicU64::new(0),
            tick_latency_max_total_us: AtomicU64::new(0),
            tick_latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            started: Instant::now(),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_sample_accepted(&self) {
        self.samples_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_rejected(&self, kind: RejectKind) {
        match kind {
            RejectKind::Accuracy => self.samples_rejected_accuracy.fetch_add(1, Ordering::Relaxed),
            RejectKind::Jump => self.samples_rejected_jump.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn record_heading_update(&self) {
        self.heading_updates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fetch(&self, ok: bool) {
        self.fetches_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_collection(&self) {
        self.collections_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Remote store reported the (user, crate) pair already exists
    #[inline]
    pub fn record_duplicate(&self) {
        self.duplicates_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_collection_failure(&self) {
        self.collection_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_visible_crates(&self, count: usize) {
        self.visible_crates.store(count as u64, Ordering::Relaxed);
    }

    /// Record one reconciliation tick with its processing latency (lock-free)
    #[inline]
    pub fn record_tick(&self, latency_us: u64) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.ticks_since_report.fetch_add(1, Ordering::Relaxed);
        self.tick_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.tick_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.tick_latency_max_us, latency_us);

        self.tick_latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.tick_latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.tick_latency_max_total_us, latency_us);
    }

    #[inline]
    pub fn collections_total(&self) -> u64 {
        self.collections_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn samples_accepted(&self) -> u64 {
        self.samples_accepted.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let tick_count = self.ticks_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.tick_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.tick_latency_max_us.swap(0, Ordering::Relaxed);
        let tick_buckets = swap_buckets(&self.tick_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        self.summarize(tick_count, latency_sum, max_latency, tick_buckets, elapsed.as_secs_f64())
    }

    /// Cumulative view since startup; leaves the periodic counters untouched
    pub fn snapshot(&self) -> MetricsSummary {
        let tick_buckets = load_buckets(&self.tick_latency_buckets_total);
        self.summarize(
            tick_buckets.iter().sum(),
            self.tick_latency_sum_total_us.load(Ordering::Relaxed),
            self.tick_latency_max_total_us.load(Ordering::Relaxed),
            tick_buckets,
            self.started.elapsed().as_secs_f64(),
        )
    }

    fn summarize(
        &self,
        tick_count: u64,
        latency_sum: u64,
        max_latency: u64,
        tick_buckets: [u64; NUM_BUCKETS],
        window_secs: f64,
    ) -> MetricsSummary {
        let ticks_per_sec = if window_secs > 0.0 { tick_count as f64 / window_secs } else { 0.0 };

        MetricsSummary {
            samples_accepted: self.samples_accepted.load(Ordering::Relaxed),
            samples_rejected_accuracy: self.samples_rejected_accuracy.load(Ordering::Relaxed),
            samples_rejected_jump: self.samples_rejected_jump.load(Ordering::Relaxed),
            heading_updates: self.heading_updates.load(Ordering::Relaxed),
            fetches_total: self.fetches_total.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            collections_total: self.collections_total.load(Ordering::Relaxed),
            duplicates_total: self.duplicates_total.load(Ordering::Relaxed),
            collection_failures: self.collection_failures.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            visible_crates: self.visible_crates.load(Ordering::Relaxed),
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            ticks_per_sec,
            tick_latency_sum_us: latency_sum,
            avg_tick_latency_us: if tick_count > 0 { latency_sum / tick_count } else { 0 },
            max_tick_latency_us: max_latency,
            tick_p50_us: percentile_from_buckets(&tick_buckets, 0.50),
            tick_p99_us: percentile_from_buckets(&tick_buckets, 0.99),
            tick_buckets,
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub samples_accepted: u64,
    pub samples_rejected_accuracy: u64,
    pub samples_rejected_jump: u64,
    pub heading_updates: u64,
    pub fetches_total: u64,
    pub fetch_failures: u64,
    pub collections_total: u64,
    pub duplicates_total: u64,
    pub collection_failures: u64,
    pub events_dropped: u64,
    pub visible_crates: u64,
    pub ticks_total: u64,
    pub ticks_per_sec: f64,
    pub tick_latency_sum_us: u64,
    pub avg_tick_latency_us: u64,
    pub max_tick_latency_us: u64,
    pub tick_p50_us: u64,
    pub tick_p99_us: u64,
    pub tick_buckets: [u64; NUM_BUCKETS],
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            accepted = %self.samples_accepted,
            rejected_accuracy = %self.samples_rejected_accuracy,
            rejected_jump = %self.samples_rejected_jump,
            visible = %self.visible_crates,
            fetches = %self.fetches_total,
            fetch_failures = %self.fetch_failures,
            collected = %self.collections_total,
            duplicates = %self.duplicates_total,
            collect_failures = %self.collection_failures,
            ticks_per_sec = format!("{:.2}", self.ticks_per_sec),
            p99_us = %self.tick_p99_us,
            "metrics"
        );
    }
}
