//! Services - business logic and state management
//!
//! This module contains the core engine services:
//! - `signal_filter` - Accuracy/jump gating and smoothing of raw fixes
//! - `heading` - Compass debounce and unwrapped rotation
//! - `radar` - Egocentric radar projection
//! - `proximity_index` - Cached nearby crates and refetch policy
//! - `collection_guard` - At-most-once collection authority
//! - `inventory` - Collection ledger, open and sync
//! - `reconciler` - Drives the pipeline for one execution context
//! - `background` - OS-scheduled batch entry point

pub mod background;
pub mod collection_guard;
pub mod heading;
pub mod inventory;
pub mod proximity_index;
pub mod radar;
pub mod reconciler;
pub mod signal_filter;

// Re-export commonly used types
pub use background::run_background_batch;
pub use collection_guard::{CollectResult, CollectionGuard};
pub use heading::HeadingStabilizer;
pub use inventory::{CollectionLedger, Inventory, SyncReport};
pub use proximity_index::ProximityIndex;
pub use radar::{ProximityBand, RadarBlip, RadarContact, RadarProjector};
pub use reconciler::{BatchReport, Reconciler, TickReport};
pub use signal_filter::{FilterOutcome, Rejection, SignalFilter};
