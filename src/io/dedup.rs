//! Durable set of crate IDs this user has already collected
//!
//! Stored as an append-only log (one JSON string per line) and deduplicated
//! on read, so foreground and background appends never overwrite each other.
//! This set is advisory: the remote store's uniqueness check is final.

use crate::domain::types::CrateId;
use crate::error::StorageError;
use crate::io::durable::DurableStore;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage key shared by every execution context
pub const COLLECTED_IDS_KEY: &str = "collected-crate-ids";

/// Clones share one in-memory copy of the set.
///
/// The set only grows, so a cached hit is always current; a miss re-reads
/// storage in case another process appended since.
#[derive(Clone)]
pub struct DedupSet {
    store: Arc<dyn DurableStore>,
    key: String,
    known: Arc<RwLock<FxHashSet<CrateId>>>,
}

impl DedupSet {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            key: COLLECTED_IDS_KEY.to_string(),
            known: Arc::new(RwLock::new(FxHashSet::default())),
        }
    }

    /// Read the full set, re-reading storage so other processes' writes are seen
    pub fn load(&self) -> Result<FxHashSet<CrateId>, StorageError> {
        let mut ids = FxHashSet::default();
        for line in self.store.lines(&self.key)? {
            match serde_json::from_str::<CrateId>(&line) {
                Ok(id) => {
                    ids.insert(id);
                }
                // A torn trailing write from a killed process; the remote store still has the truth
                Err(e) => warn!(key = %self.key, error = %e, "dedup_line_unreadable"),
            }
        }

        let mut known = self.known.write();
        known.extend(ids);
        Ok(known.clone())
    }

    fn is_cached(&self, id: &CrateId) -> bool {
        self.known.read().contains(id)
    }

    pub fn contains(&self, id: &CrateId) -> Result<bool, StorageError> {
        if self.is_cached(id) {
            return Ok(true);
        }
        Ok(self.load()?.contains(id))
    }

    /// `contains` for async callers; a cache miss reads storage on the blocking pool
    pub async fn contains_async(&self, id: &CrateId) -> Result<bool, StorageError> {
        if self.is_cached(id) {
            return Ok(true);
        }

        let this = self.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || this.contains(&id))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    /// Record `id` as collected. Idempotent.
    pub fn insert(&self, id: &CrateId) -> Result<(), StorageError> {
        if self.contains(id)? {
            return Ok(());
        }
        self.append(id)?;
        self.known.write().insert(id.clone());
        debug!(crate_id = %id, "dedup_id_recorded");
        Ok(())
    }

    /// Record many IDs at once, skipping ones already present
    pub fn extend<'a, I>(&self, ids: I) -> Result<usize, StorageError>
    where
        I: IntoIterator<Item = &'a CrateId>,
    {
        let mut known = self.load()?;
        let mut added = 0;
        for id in ids {
            if known.insert(id.clone()) {
                self.append(id)?;
                self.known.write().insert(id.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    fn append(&self, id: &CrateId) -> Result<(), StorageError> {
        let line = serde_json::to_string(id).map_err(|e| StorageError::Corrupt {
            key: self.key.clone(),
            reason: e.to_string(),
        })?;
        self.store.append(&self.key, &line)
    }
}
