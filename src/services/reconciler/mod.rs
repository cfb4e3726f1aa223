//! Reconciliation driver
//!
//! The Reconciler feeds each raw sample through the pipeline, in arrival order:
//! - SignalFilter (reject or smooth)
//! - ProximityIndex (refetch from the remote store when the observer has moved far enough)
//! - CollectionGuard (for every cached crate inside the collection radius)
//!
//! It owns no collection decisions; the guard does. A foreground session runs
//! it against a stream of sensor events, a background invocation runs it once
//! over a batch of samples. Both are built over the same durable store.

mod handlers;
#[cfg(test)]
mod tests;

use crate::domain::types::{
    CollectionRecord, CrateId, ExecutionContext, RawSample, SensorEvent, StablePosition, UserId,
};
use crate::error::{StorageError, TrackingError};
use crate::infra::config::Config;
use crate::infra::identity::load_or_create_user_id;
use crate::infra::metrics::Metrics;
use crate::io::dedup::DedupSet;
use crate::io::durable::DurableStore;
use crate::io::events::EventSender;
use crate::io::remote::RemoteStore;
use crate::services::collection_guard::{CollectResult, CollectionGuard};
use crate::services::heading::HeadingStabilizer;
use crate::services::inventory::CollectionLedger;
use crate::services::proximity_index::ProximityIndex;
use crate::services::radar::{RadarContact, RadarProjector};
use crate::services::signal_filter::{FilterOutcome, SignalFilter};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// What one position sample led to
#[derive(Debug)]
pub struct TickReport {
    pub outcome: FilterOutcome,
    /// A refetch was attempted on this tick
    pub fetched: bool,
    /// Guard results for every crate inside the collection radius
    pub attempts: Vec<(CrateId, CollectResult)>,
}

impl TickReport {
    pub fn collected(&self) -> impl Iterator<Item = &CollectionRecord> {
        self.attempts.iter().filter_map(|(_, result)| match result {
            CollectResult::Collected(record) => Some(record),
            _ => None,
        })
    }

    pub fn failures(&self) -> usize {
        self.attempts.iter().filter(|(_, r)| matches!(r, CollectResult::Failed(_))).count()
    }
}

/// Totals for one background batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub samples: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub collected: Vec<CollectionRecord>,
    pub failures: usize,
}

pub struct Reconciler {
    pub(crate) context: ExecutionContext,
    pub(crate) user_id: UserId,
    pub(crate) filter: SignalFilter,
    pub(crate) heading: HeadingStabilizer,
    pub(crate) index: ProximityIndex,
    pub(crate) projector: RadarProjector,
    pub(crate) guard: CollectionGuard,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) collection_radius_m: f64,
    pub(crate) metrics: Arc<Metrics>,
    /// Last accepted position
    pub(crate) position: Option<StablePosition>,
}

impl Reconciler {
    /// Build a reconciler over the shared durable store
    ///
    /// Loads (or creates) the user id from the store, so every context
    /// opened on the same store acts as the same user.
    pub fn open(
        context: ExecutionContext,
        config: &Config,
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteStore>,
        metrics: Arc<Metrics>,
        events: Option<EventSender>,
    ) -> Result<Self, StorageError> {
        let user_id = load_or_create_user_id(store.as_ref())?;
        let dedup = DedupSet::new(store.clone());
        let guard = CollectionGuard::new(
            context,
            remote.clone(),
            dedup.clone(),
            CollectionLedger::new(store),
            events,
            metrics.clone(),
        );

        info!(context = %context.as_str(), user_id = %user_id, "reconciler_opened");

        Ok(Self {
            context,
            user_id,
            filter: SignalFilter::new(config.filter().clone()),
            heading: HeadingStabilizer::new(config.heading_debounce_deg()),
            index: ProximityIndex::new(config, dedup),
            projector: RadarProjector::new(config.radar_max_range_m(), config.radar_display_radius()),
            guard,
            remote,
            collection_radius_m: config.collection_radius_m(),
            metrics,
            position: None,
        })
    }

    /// Consume sensor events until the stream ends or shutdown is signalled
    ///
    /// A tick in progress always completes before shutdown is observed, so an
    /// in-flight collection is never abandoned midway.
    pub async fn run(
        &mut self,
        mut event_rx: mpsc::Receiver<SensorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TrackingError> {
        info!(context = %self.context.as_str(), "tracking_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("tracking_shutdown");
                        break;
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Some(e) => {
                            self.process_event(e).await?;
                        }
                        None => {
                            info!("sensor_stream_closed");
                            break;
                        }
                    }
                }
            }
        }

        self.filter.reset();
        Ok(())
    }

    /// Dispatch one sensor event. `PermissionDenied` ends the session.
    pub async fn process_event(&mut self, event: SensorEvent) -> Result<Option<TickReport>, TrackingError> {
        match event {
            SensorEvent::Position(raw) => Ok(Some(self.handle_position(raw).await)),
            SensorEvent::Heading { degrees } => {
                self.handle_heading(degrees);
                Ok(None)
            }
            SensorEvent::PermissionDenied => {
                warn!(context = %self.context.as_str(), "location_permission_denied");
                Err(TrackingError::PermissionDenied)
            }
        }
    }

    /// Process a batch of samples in order (one background invocation)
    pub async fn run_batch(&mut self, samples: Vec<RawSample>) -> BatchReport {
        let mut report = BatchReport { samples: samples.len(), ..BatchReport::default() };

        for raw in samples {
            let tick = self.handle_position(raw).await;
            match tick.outcome {
                FilterOutcome::Accepted(_) => report.accepted += 1,
                FilterOutcome::Rejected(_) => report.rejected += 1,
            }
            report.failures += tick.failures();
            report.collected.extend(tick.collected().cloned());
        }

        info!(
            context = %self.context.as_str(),
            samples = %report.samples,
            accepted = %report.accepted,
            rejected = %report.rejected,
            collected = %report.collected.len(),
            failures = %report.failures,
            "batch_complete"
        );
        report
    }

    /// Radar contacts for every visible crate around the current position
    pub fn radar(&self) -> Vec<RadarContact> {
        match &self.position {
            Some(pos) => self.projector.sweep(pos, self.index.visible()),
            None => Vec::new(),
        }
    }

    /// Rotation to apply to the radar so the heading points up
    pub fn display_rotation(&self) -> f64 {
        self.heading.state().display_rotation()
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn position(&self) -> Option<&StablePosition> {
        self.position.as_ref()
    }

    pub fn index(&self) -> &ProximityIndex {
        &self.index
    }

    pub fn guard(&self) -> &CollectionGuard {
        &self.guard
    }
}
