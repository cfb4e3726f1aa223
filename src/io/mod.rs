//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `durable` - Key-value storage shared by foreground and background contexts
//! - `dedup` - Durable set of already-collected crate IDs
//! - `remote` - Remote data store trait and in-memory implementation
//! - `rest_store` - HTTP remote store (PostgREST-style API)
//! - `events` - Collection event channel and JSONL writer
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod dedup;
pub mod durable;
pub mod events;
pub mod prometheus;
pub mod remote;
pub mod rest_store;

// Re-export commonly used types
pub use dedup::DedupSet;
pub use durable::{DurableStore, FileStore, MemoryStore};
pub use events::{create_event_channel, CollectionEvent, EventLog, EventSender};
pub use remote::{MemoryRemoteStore, RemoteStore};
pub use rest_store::RestRemoteStore;
