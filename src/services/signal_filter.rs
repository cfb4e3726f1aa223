//! Raw position filtering
//!
//! Turns noisy platform fixes into a stable position signal:
//! - Accuracy gate: fixes with a worse accuracy radius than the threshold are dropped
//! - Jump gate: fixes too far from the last accepted position for the elapsed
//!   time are dropped as glitches
//! - Smoothing: accepted fixes move the position a fraction of the way toward
//!   the raw fix (first-order exponential filter)
//!
//! `filter` is a pure function of (state, sample); `SignalFilter` owns the
//! state for one tracking session.

use crate::domain::geo::distance_m;
use crate::domain::types::{RawSample, StablePosition};
use crate::infra::config::FilterConfig;
use crate::infra::metrics::RejectKind;
use tracing::debug;

/// Last accepted fix, the baseline for the jump gate and smoothing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastAccepted {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: u64,
}

/// Filter state for one tracking session. `Default` is the empty (session start) state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FilterState {
    pub last_accepted: Option<LastAccepted>,
}

/// Why a sample was dropped. Expected steady-state behavior, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    Accuracy { accuracy_m: f64, threshold_m: f64 },
    Jump { distance_m: f64, allowed_m: f64 },
    /// Non-finite coordinates
    Invalid,
}

impl Rejection {
    pub fn kind(&self) -> RejectKind {
        match self {
            Rejection::Jump { .. } => RejectKind::Jump,
            Rejection::Accuracy { .. } | Rejection::Invalid => RejectKind::Accuracy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterOutcome {
    Accepted(StablePosition),
    Rejected(Rejection),
}

impl FilterOutcome {
    pub fn accepted(&self) -> Option<&StablePosition> {
        match self {
            FilterOutcome::Accepted(pos) => Some(pos),
            FilterOutcome::Rejected(_) => None,
        }
    }
}

/// Jump allowed after `dt_ms` since the last accepted fix
#[inline]
pub fn allowed_jump_m(config: &FilterConfig, dt_ms: u64) -> f64 {
    config.max_jump_m.max(dt_ms as f64 * config.max_speed_m_per_ms)
}

/// Filter one raw sample. A rejected sample returns the state unchanged.
///
/// `heading_deg` is the most recent stabilized heading and is attached to the
/// output as-is.
pub fn filter(
    config: &FilterConfig,
    state: &FilterState,
    raw: &RawSample,
    heading_deg: Option<f64>,
) -> (FilterState, FilterOutcome) {
    if !raw.latitude.is_finite() || !raw.longitude.is_finite() {
        return (*state, FilterOutcome::Rejected(Rejection::Invalid));
    }

    // NaN accuracy fails this comparison too
    if !(raw.accuracy_m <= config.accuracy_threshold_m) {
        let rejection = Rejection::Accuracy {
            accuracy_m: raw.accuracy_m,
            threshold_m: config.accuracy_threshold_m,
        };
        return (*state, FilterOutcome::Rejected(rejection));
    }

    let (latitude, longitude) = match state.last_accepted {
        None => (raw.latitude, raw.longitude),
        Some(prev) => {
            let d = distance_m(&StablePosition::at(prev.latitude, prev.longitude), raw);
            let dt_ms = raw.timestamp_ms.saturating_sub(prev.timestamp_ms);
            let allowed_m = allowed_jump_m(config, dt_ms);
            if d > allowed_m {
                let rejection = Rejection::Jump { distance_m: d, allowed_m };
                return (*state, FilterOutcome::Rejected(rejection));
            }

            let k = config.smoothing_factor;
            (
                prev.latitude + (raw.latitude - prev.latitude) * k,
                prev.longitude + (raw.longitude - prev.longitude) * k,
            )
        }
    };

    let next = FilterState {
        last_accepted: Some(LastAccepted { latitude, longitude, timestamp_ms: raw.timestamp_ms }),
    };
    let position = StablePosition {
        latitude,
        longitude,
        accuracy_m: raw.accuracy_m,
        timestamp_ms: raw.timestamp_ms,
        heading_deg,
    };
    (next, FilterOutcome::Accepted(position))
}

/// Session-scoped position filter
pub struct SignalFilter {
    config: FilterConfig,
    state: FilterState,
}

impl SignalFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config, state: FilterState::default() }
    }

    pub fn process(&mut self, raw: &RawSample, heading_deg: Option<f64>) -> FilterOutcome {
        let (next, outcome) = filter(&self.config, &self.state, raw, heading_deg);
        self.state = next;

        if let FilterOutcome::Rejected(rejection) = &outcome {
            debug!(
                ts = %raw.timestamp_ms,
                accuracy_m = %raw.accuracy_m,
                rejection = ?rejection,
                "sample_rejected"
            );
        }
        outcome
    }

    /// Forget the baseline (new tracking session)
    pub fn reset(&mut self) {
        self.state = FilterState::default();
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }
}
