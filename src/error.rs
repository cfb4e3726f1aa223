//! Error types for the crate-drop engine.
//!
//! Rejected sensor samples are not errors; see `services::signal_filter::Rejection`.

use crate::domain::types::RecordId;
use thiserror::Error;

/// Failures of the remote data store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    /// Network or server failure; the call may be retried later
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// The (user, crate) pair is already recorded server-side
    #[error("collection already recorded")]
    Duplicate,

    /// The referenced row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The response could not be decoded
    #[error("malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Creates an unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Failures of durable key-value storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Keys become file names, so they are restricted to a safe alphabet
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),

    #[error("corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Conditions that end a tracking session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackingError {
    /// Location access was refused by the platform
    #[error("location permission denied")]
    PermissionDenied,
}

/// Failures of inventory operations (open, sync).
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no collection record {0}")]
    UnknownRecord(RecordId),
}

/// Why a collection attempt failed. The attempt is retryable.
#[derive(Debug, Error)]
pub enum CollectFailure {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Why a refetch of nearby crates left the cache unchanged.
#[derive(Debug, Error)]
pub enum RefreshFailure {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
