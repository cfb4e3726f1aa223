//! Egocentric radar projection
//!
//! Projects a target into screen coordinates around the observer: x to the
//! right, y downward, north up. Targets beyond the radar range are clamped to
//! the edge. Heading rotation is a separate transform (`RadarBlip::rotated`)
//! so one projection can be reused while the display turns.

use crate::domain::geo::{distance_m, initial_bearing_deg};
use crate::domain::types::{Coordinates, Crate, CrateId};
use serde::Serialize;

/// Share of the range covered by the inner and middle bands
const INNER_BAND: f64 = 0.33;
const MIDDLE_BAND: f64 = 0.66;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProximityBand {
    Inner,
    Middle,
    Outer,
}

impl ProximityBand {
    /// Band for a distance expressed as a fraction of the radar range
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio <= INNER_BAND {
            ProximityBand::Inner
        } else if ratio <= MIDDLE_BAND {
            ProximityBand::Middle
        } else {
            ProximityBand::Outer
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RadarBlip {
    pub x: f64,
    pub y: f64,
    pub distance_m: f64,
    pub bearing_deg: f64,
    /// Distance from the radar center in display units, at most the display radius
    pub scaled: f64,
    pub band: ProximityBand,
}

impl RadarBlip {
    /// Blip position after rotating the whole display by `rotation_deg`
    pub fn rotated(&self, rotation_deg: f64) -> (f64, f64) {
        let (sin, cos) = rotation_deg.to_radians().sin_cos();
        (self.x * cos - self.y * sin, self.x * sin + self.y * cos)
    }
}

/// Project `target` relative to `observer`
pub fn project<A, B>(observer: &A, target: &B, display_radius: f64, max_range_m: f64) -> RadarBlip
where
    A: Coordinates + ?Sized,
    B: Coordinates + ?Sized,
{
    let distance_m = distance_m(observer, target);
    let bearing_deg = initial_bearing_deg(observer, target);

    let ratio = if max_range_m > 0.0 { (distance_m / max_range_m).min(1.0) } else { 1.0 };
    let scaled = ratio * display_radius;

    // Clockwise-from-north to clockwise-from-east
    let angle = (bearing_deg - 90.0).to_radians();
    RadarBlip {
        x: angle.cos() * scaled,
        y: angle.sin() * scaled,
        distance_m,
        bearing_deg,
        scaled,
        band: ProximityBand::from_ratio(ratio),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadarContact {
    pub crate_id: CrateId,
    pub blip: RadarBlip,
}

#[derive(Debug, Clone, Copy)]
pub struct RadarProjector {
    max_range_m: f64,
    display_radius: f64,
}

impl RadarProjector {
    pub fn new(max_range_m: f64, display_radius: f64) -> Self {
        Self { max_range_m, display_radius }
    }

    pub fn project<A: Coordinates + ?Sized, B: Coordinates + ?Sized>(
        &self,
        observer: &A,
        target: &B,
    ) -> RadarBlip {
        project(observer, target, self.display_radius, self.max_range_m)
    }

    /// Project every crate, nearest first
    pub fn sweep<'a, A, I>(&self, observer: &A, crates: I) -> Vec<RadarContact>
    where
        A: Coordinates + ?Sized,
        I: IntoIterator<Item = &'a Crate>,
    {
        let mut contacts: Vec<RadarContact> = crates
            .into_iter()
            .map(|c| RadarContact { crate_id: c.id.clone(), blip: self.project(observer, c) })
            .collect();
        contacts.sort_by(|a, b| a.blip.distance_m.total_cmp(&b.blip.distance_m));
        contacts
    }

    pub fn max_range_m(&self) -> f64 {
        self.max_range_m
    }

    pub fn display_radius(&self) -> f64 {
        self.display_radius
    }
}
