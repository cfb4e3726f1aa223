//! Domain models - core value types and geodesy
//!
//! This module contains the canonical data types used throughout the system:
//! - `RawSample` / `StablePosition` - position fixes before and after filtering
//! - `Crate` - a server-defined collectible at a fixed point
//! - `CollectionRecord` - a user's acquisition of a crate
//! - `SensorEvent` - events delivered by the platform sensor provider
//! - `geo` - great-circle distance, bearings and circular angle arithmetic

pub mod geo;
pub mod types;

// Re-export commonly used types at module level
pub use types::{
    epoch_ms, CollectionRecord, Coordinates, Crate, CrateId, ExecutionContext, FetchRequest,
    RawSample, RecordId, SensorEvent, StablePosition, UserId,
};
