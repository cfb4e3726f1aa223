//! Remote data store interface
//!
//! The remote store owns crates and collection records. `record_collection`
//! is the authoritative uniqueness check for a (user, crate) pair.

use crate::domain::geo::distance_m;
use crate::domain::types::{CollectionRecord, Crate, CrateId, FetchRequest, RecordId, UserId};
use crate::error::RemoteError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Crates within roughly `radius_m` of the request center
    async fn fetch_nearby(&self, request: &FetchRequest) -> Result<Vec<Crate>, RemoteError>;

    /// Insert a collection record; `RemoteError::Duplicate` if the pair already exists
    async fn record_collection(
        &self,
        user_id: &UserId,
        crate_id: &CrateId,
    ) -> Result<CollectionRecord, RemoteError>;

    async fn mark_opened(&self, record_id: &RecordId) -> Result<(), RemoteError>;

    async fn fetch_user_collections(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<CollectionRecord>, RemoteError>;
}

/// In-process remote store with a (user, crate) uniqueness constraint
///
/// Supports injected latency and failures for exercising retry and race paths.
#[derive(Default)]
pub struct MemoryRemoteStore {
    crates: Mutex<Vec<Crate>>,
    records: Mutex<Vec<CollectionRecord>>,
    /// Number of upcoming calls that fail with `Unavailable`
    failures_pending: AtomicU32,
    /// Simulated round-trip time
    latency: Option<Duration>,
    record_calls: AtomicU64,
    fetch_calls: AtomicU64,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_crates(crates: Vec<Crate>) -> Self {
        Self { crates: Mutex::new(crates), ..Self::default() }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn add_crate(&self, c: Crate) {
        self.crates.lock().push(c);
    }

    /// Make the next `n` calls fail as if the network were down
    pub fn fail_next(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<CollectionRecord> {
        self.records.lock().clone()
    }

    pub fn record_calls(&self) -> u64 {
        self.record_calls.load(Ordering::Relaxed)
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    async fn round_trip(&self) -> Result<(), RemoteError> {
        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }

        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RemoteError::unavailable("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch_nearby(&self, request: &FetchRequest) -> Result<Vec<Crate>, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        self.round_trip().await?;

        let crates: Vec<Crate> = self
            .crates
            .lock()
            .iter()
            .filter(|c| distance_m(request, *c) <= request.radius_m)
            .cloned()
            .collect();
        debug!(count = %crates.len(), radius_m = %request.radius_m, "memory_fetch_nearby");
        Ok(crates)
    }

    async fn record_collection(
        &self,
        user_id: &UserId,
        crate_id: &CrateId,
    ) -> Result<CollectionRecord, RemoteError> {
        self.record_calls.fetch_add(1, Ordering::Relaxed);
        self.round_trip().await?;

        // Check and insert under one lock: this is the uniqueness constraint
        let mut records = self.records.lock();
        if records.iter().any(|r| r.user_id == *user_id && r.crate_id == *crate_id) {
            return Err(RemoteError::Duplicate);
        }
        let record = CollectionRecord {
            id: RecordId(Uuid::now_v7().to_string()),
            crate_id: crate_id.clone(),
            user_id: user_id.clone(),
            collected_at: Utc::now(),
            opened_at: None,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn mark_opened(&self, record_id: &RecordId) -> Result<(), RemoteError> {
        self.round_trip().await?;

        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == *record_id)
            .ok_or_else(|| RemoteError::NotFound(record_id.to_string()))?;
        if record.opened_at.is_none() {
            record.opened_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fetch_user_collections(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<CollectionRecord>, RemoteError> {
        self.round_trip().await?;

        let mut records: Vec<CollectionRecord> =
            self.records.lock().iter().filter(|r| r.user_id == *user_id).cloned().collect();
        records.sort_by(|a, b| b.collected_at.cmp(&a.collected_at));
        Ok(records)
    }
}
