//! Shared types for the crate-drop engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Accuracy assumed when the platform omits one (always fails the accuracy gate)
const UNKNOWN_ACCURACY_M: f64 = 999.0;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for crate IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrateId(pub String);

impl std::fmt::Display for CrateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CrateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype wrapper for user IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype wrapper for collection record IDs (assigned by the remote store)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Anything with a geographic position in decimal degrees
pub trait Coordinates {
    fn latitude(&self) -> f64;
    fn longitude(&self) -> f64;
}

/// Raw position fix as delivered by the platform location sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    #[serde(default = "unknown_accuracy")]
    pub accuracy_m: f64,
    /// Sample time (epoch ms)
    pub timestamp_ms: u64,
    #[serde(default)]
    pub heading_deg: Option<f64>,
}

fn unknown_accuracy() -> f64 {
    UNKNOWN_ACCURACY_M
}

impl RawSample {
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f64, timestamp_ms: u64) -> Self {
        Self { latitude, longitude, accuracy_m, timestamp_ms, heading_deg: None }
    }
}

impl Coordinates for RawSample {
    fn latitude(&self) -> f64 {
        self.latitude
    }

    fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Filtered, smoothed position used for all downstream geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StablePosition {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub timestamp_ms: u64,
    /// Most recent stabilized compass heading, not necessarily from the same fix
    pub heading_deg: Option<f64>,
}

impl StablePosition {
    /// Position at the given point, with no heading. Mostly useful in tests and simulations.
    pub fn at(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude, accuracy_m: 0.0, timestamp_ms: 0, heading_deg: None }
    }
}

impl Coordinates for StablePosition {
    fn latitude(&self) -> f64 {
        self.latitude
    }

    fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// A server-defined collectible tied to a fixed geographic point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crate {
    pub id: CrateId,
    pub latitude: f64,
    pub longitude: f64,
    /// Content revealed when the crate is opened
    #[serde(alias = "fortune_id")]
    pub payload_id: String,
}

impl Crate {
    pub fn new(id: &str, latitude: f64, longitude: f64, payload_id: &str) -> Self {
        Self { id: CrateId::from(id), latitude, longitude, payload_id: payload_id.to_string() }
    }
}

impl Coordinates for Crate {
    fn latitude(&self) -> f64 {
        self.latitude
    }

    fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// A user's acquisition of a specific crate. One per (user, crate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: RecordId,
    pub crate_id: CrateId,
    pub user_id: UserId,
    pub collected_at: DateTime<Utc>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
}

impl CollectionRecord {
    #[inline]
    pub fn is_opened(&self) -> bool {
        self.opened_at.is_some()
    }
}

/// Query for crates around a point
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FetchRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

impl Coordinates for FetchRequest {
    fn latitude(&self) -> f64 {
        self.latitude
    }

    fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Events from the platform sensor provider, one JSON object per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorEvent {
    Position(RawSample),
    Heading { degrees: f64 },
    /// Location access was refused; tracking cannot continue
    PermissionDenied,
}

/// Which execution context is driving the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Sensor-callback loop while the app is active
    Foreground,
    /// OS-scheduled batch, possibly in a separate process lifetime
    Background,
}

impl ExecutionContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionContext::Foreground => "foreground",
            ExecutionContext::Background => "background",
        }
    }
}
