//! Spherical-earth geodesy and circular angle arithmetic
//!
//! All angles are in degrees; bearings and headings are clockwise from north.

use crate::domain::types::Coordinates;

/// Mean earth radius used for haversine distances (meters)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two lat/lon points (haversine)
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Great-circle distance in meters between two positioned values
#[inline]
pub fn distance_m<A: Coordinates + ?Sized, B: Coordinates + ?Sized>(from: &A, to: &B) -> f64 {
    haversine_m(from.latitude(), from.longitude(), to.latitude(), to.longitude())
}

/// Initial great-circle bearing from `from` to `to`, in [0, 360)
pub fn initial_bearing_deg<A: Coordinates + ?Sized, B: Coordinates + ?Sized>(
    from: &A,
    to: &B,
) -> f64 {
    let lat1 = from.latitude().to_radians();
    let lat2 = to.latitude().to_radians();
    let dlon = (to.longitude() - from.longitude()).to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    normalize_deg(y.atan2(x).to_degrees())
}

/// Wrap any angle into [0, 360)
#[inline]
pub fn normalize_deg(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Signed shortest rotation from `from` to `to`, in (-180, 180]
///
/// Adding this to an unbounded accumulator never crosses the 0/360 seam
/// the long way round.
#[inline]
pub fn signed_delta_deg(from: f64, to: f64) -> f64 {
    let d = normalize_deg(to - from);
    if d > 180.0 {
        d - 360.0
    } else {
        d
    }
}

/// Unsigned angular separation, in [0, 180]
#[inline]
pub fn circular_distance_deg(a: f64, b: f64) -> f64 {
    signed_delta_deg(a, b).abs()
}

/// Meters per degree of latitude, used for bounding-box approximations
pub const METERS_PER_DEG_LAT: f64 = 111_000.0;

/// Approximate (lat_delta, lon_delta) half-extents of a box of `radius_m` around `latitude`
pub fn bounding_deltas(latitude: f64, radius_m: f64) -> (f64, f64) {
    let lat_delta = radius_m / METERS_PER_DEG_LAT;
    let lon_delta = radius_m / (METERS_PER_DEG_LAT * latitude.to_radians().cos());
    (lat_delta, lon_delta)
}

/// Point `distance_m` away from (`lat`, `lon`) along `bearing_deg` (spherical destination formula)
pub fn destination(lat: f64, lon: f64, bearing_deg: f64, distance_m: f64) -> (f64, f64) {
    let delta = distance_m / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let phi1 = lat.to_radians();
    let lambda1 = lon.to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    (phi2.to_degrees(), lambda2.to_degrees())
}
