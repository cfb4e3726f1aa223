//! Per-event handlers for the Reconciler

use super::{Reconciler, TickReport};
use crate::domain::types::{Crate, CrateId, FetchRequest, RawSample, StablePosition};
use crate::error::RefreshFailure;
use crate::services::collection_guard::CollectResult;
use crate::services::heading::HeadingChange;
use crate::services::signal_filter::FilterOutcome;
use std::time::Instant;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Handle one raw heading reading
    pub(crate) fn handle_heading(&mut self, degrees: f64) {
        match self.heading.update(degrees) {
            HeadingChange::Ignored => {}
            HeadingChange::Initial(heading) => {
                self.metrics.record_heading_update();
                debug!(heading_deg = %heading, "heading_initial");
            }
            HeadingChange::Rotated { heading_deg, delta_deg } => {
                self.metrics.record_heading_update();
                debug!(heading_deg = %heading_deg, delta_deg = %delta_deg, "heading_rotated");
            }
        }
    }

    /// Filter a position sample, refresh the index if due, then try every crate in range
    pub(crate) async fn handle_position(&mut self, raw: RawSample) -> TickReport {
        let start = Instant::now();

        if let Some(degrees) = raw.heading_deg {
            self.handle_heading(degrees);
        }

        let outcome = self.filter.process(&raw, self.heading.current_heading());
        let pos = match outcome {
            FilterOutcome::Accepted(pos) => pos,
            FilterOutcome::Rejected(rejection) => {
                self.metrics.record_sample_rejected(rejection.kind());
                return TickReport { outcome, fetched: false, attempts: Vec::new() };
            }
        };
        self.metrics.record_sample_accepted();
        self.position = Some(pos);

        let fetched = self.refresh_if_due(&pos).await;
        let attempts = self.collect_in_range(&pos).await;

        self.metrics.set_visible_crates(self.index.len());
        self.metrics.record_tick(start.elapsed().as_micros() as u64);

        TickReport { outcome, fetched, attempts }
    }

    /// Refetch nearby crates if the observer moved past the refetch distance
    ///
    /// A failed fetch keeps the current cache; the refetch stays due for the next tick.
    async fn refresh_if_due(&mut self, pos: &StablePosition) -> bool {
        let Some(request) = self.index.maybe_refetch(pos) else {
            return false;
        };

        match self.fetch_visible(&request).await {
            Ok(visible) => {
                self.metrics.record_fetch(true);
                debug!(visible = %visible, radius_m = %request.radius_m, "crates_refetched");
            }
            Err(e) => {
                self.metrics.record_fetch(false);
                warn!(
                    error = %e,
                    cached = %self.index.len(),
                    radius_m = %request.radius_m,
                    "crate_fetch_failed"
                );
            }
        }
        true
    }

    /// Fetch nearby crates and the user's server-side collections, then swap the cache
    ///
    /// Collections made on another device or install are merged into the dedup
    /// set first, so they never reach the radar.
    async fn fetch_visible(&mut self, request: &FetchRequest) -> Result<usize, RefreshFailure> {
        let crates = self.remote.fetch_nearby(request).await?;
        let owned = self.remote.fetch_user_collections(&self.user_id).await?;

        let merged = self.guard.dedup().extend(owned.iter().map(|r| &r.crate_id))?;
        if merged > 0 {
            info!(merged = %merged, user_id = %self.user_id, "server_collections_merged");
        }

        Ok(self.index.apply_fetch_result(request, crates)?)
    }

    /// Ask the guard about every cached crate within the collection radius
    async fn collect_in_range(&mut self, pos: &StablePosition) -> Vec<(CrateId, CollectResult)> {
        let candidates: Vec<Crate> = self
            .index
            .within(pos, self.collection_radius_m)
            .into_iter()
            .map(|(c, _)| c.clone())
            .collect();

        let mut attempts = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let result =
                self.guard.try_collect(&self.user_id, &candidate, pos, self.collection_radius_m).await;

            if result.is_owned() {
                self.index.remove(&candidate.id);
            }
            if let CollectResult::Collected(record) = &result {
                info!(
                    crate_id = %candidate.id,
                    record_id = %record.id,
                    remaining = %self.index.len(),
                    "crate_removed_from_radar"
                );
            }
            attempts.push((candidate.id, result));
        }
        attempts
    }
}
