//! Compass heading stabilization
//!
//! Debounces jitter and keeps an unwrapped rotation accumulator so a rotating
//! display always turns the short way, including across north.

use crate::domain::geo::{circular_distance_deg, normalize_deg, signed_delta_deg};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HeadingState {
    /// Last heading that passed the debounce, in [0, 360)
    pub last_stable: Option<f64>,
    /// Unbounded sum of signed shortest deltas; equals `last_stable` modulo 360
    pub cumulative_rotation: f64,
}

impl HeadingState {
    /// Rotation to apply to an egocentric radar so the direction of travel points up
    #[inline]
    pub fn display_rotation(&self) -> f64 {
        -self.cumulative_rotation
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeadingChange {
    /// First heading of the session
    Initial(f64),
    Rotated { heading_deg: f64, delta_deg: f64 },
    /// Within the debounce band, or not a finite angle
    Ignored,
}

/// Apply one raw heading reading
pub fn update(state: &HeadingState, heading_deg: f64, debounce_deg: f64) -> (HeadingState, HeadingChange) {
    if !heading_deg.is_finite() {
        return (*state, HeadingChange::Ignored);
    }
    let heading = normalize_deg(heading_deg);

    match state.last_stable {
        None => {
            let next = HeadingState { last_stable: Some(heading), cumulative_rotation: heading };
            (next, HeadingChange::Initial(heading))
        }
        Some(last) if circular_distance_deg(last, heading) <= debounce_deg => {
            (*state, HeadingChange::Ignored)
        }
        Some(last) => {
            let delta_deg = signed_delta_deg(last, heading);
            let next = HeadingState {
                last_stable: Some(heading),
                cumulative_rotation: state.cumulative_rotation + delta_deg,
            };
            (next, HeadingChange::Rotated { heading_deg: heading, delta_deg })
        }
    }
}

pub struct HeadingStabilizer {
    debounce_deg: f64,
    state: HeadingState,
}

impl HeadingStabilizer {
    pub fn new(debounce_deg: f64) -> Self {
        Self { debounce_deg, state: HeadingState::default() }
    }

    pub fn update(&mut self, heading_deg: f64) -> HeadingChange {
        let (next, change) = update(&self.state, heading_deg, self.debounce_deg);
        self.state = next;
        change
    }

    pub fn current_heading(&self) -> Option<f64> {
        self.state.last_stable
    }

    pub fn state(&self) -> &HeadingState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = HeadingState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deltas(headings: &[f64]) -> (Vec<f64>, HeadingState) {
        let mut s = HeadingStabilizer::new(2.0);
        let mut out = Vec::new();
        for &h in headings {
            if let HeadingChange::Rotated { delta_deg, .. } = s.update(h) {
                out.push(delta_deg);
            }
        }
        (out, *s.state())
    }

    #[test]
    fn test_wraparound_takes_short_way() {
        let (d, state) = deltas(&[350.0, 355.0, 2.0, 8.0]);
        assert_eq!(d.len(), 3);
        for (got, want) in d.iter().zip([5.0, 7.0, 6.0]) {
            assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
        }
        assert!((state.cumulative_rotation - 368.0).abs() < 1e-9);
        assert_eq!(state.last_stable, Some(8.0));
    }

    #[test]
    fn test_counter_clockwise_across_north() {
        let (d, state) = deltas(&[5.0, 355.0, 340.0]);
        assert!((d[0] + 10.0).abs() < 1e-9);
        assert!((d[1] + 15.0).abs() < 1e-9);
        assert!((state.cumulative_rotation - (-20.0)).abs() < 1e-9);
        assert!((normalize_deg(state.cumulative_rotation) - 340.0).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_is_debounced() {
        let mut s = HeadingStabilizer::new(2.0);
        assert_eq!(s.update(90.0), HeadingChange::Initial(90.0));
        assert_eq!(s.update(91.5), HeadingChange::Ignored);
        assert_eq!(s.update(88.0), HeadingChange::Ignored);
        assert_eq!(s.current_heading(), Some(90.0));

        // Slow drift eventually crosses the band relative to the last stable value
        assert!(matches!(s.update(92.5), HeadingChange::Rotated { .. }));
        assert_eq!(s.current_heading(), Some(92.5));
    }

    #[test]
    fn test_debounce_across_north() {
        let mut s = HeadingStabilizer::new(2.0);
        s.update(359.5);
        assert_eq!(s.update(1.0), HeadingChange::Ignored);
    }

    #[test]
    fn test_non_finite_ignored() {
        let mut s = HeadingStabilizer::new(2.0);
        assert_eq!(s.update(f64::NAN), HeadingChange::Ignored);
        assert_eq!(s.current_heading(), None);
    }

    #[test]
    fn test_display_rotation_is_negated() {
        let mut s = HeadingStabilizer::new(2.0);
        s.update(45.0);
        assert_eq!(s.state().display_rotation(), -45.0);
        s.reset();
        assert_eq!(s.state().display_rotation(), 0.0);
    }
}
