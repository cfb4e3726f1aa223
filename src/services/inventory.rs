//! Local inventory of collected crates
//!
//! The ledger is an append-only log of `LedgerEntry` lines in durable storage,
//! shared by both execution contexts. Reads merge it idempotently: one record
//! per crate (first appended wins) and `opened_at` set at most once.

use crate::domain::types::{CollectionRecord, CrateId, RecordId, UserId};
use crate::error::{InventoryError, StorageError};
use crate::io::dedup::DedupSet;
use crate::io::durable::DurableStore;
use crate::io::remote::RemoteStore;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Storage key for the collection ledger
pub const LEDGER_KEY: &str = "collection-ledger";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Collected { record: CollectionRecord },
    Opened { record_id: RecordId, opened_at: DateTime<Utc> },
}

#[derive(Clone)]
pub struct CollectionLedger {
    store: Arc<dyn DurableStore>,
    key: String,
}

impl CollectionLedger {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store, key: LEDGER_KEY.to_string() }
    }

    pub fn append_collected(&self, record: &CollectionRecord) -> Result<(), StorageError> {
        self.append(&LedgerEntry::Collected { record: record.clone() })
    }

    pub fn append_opened(
        &self,
        record_id: &RecordId,
        opened_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.append(&LedgerEntry::Opened { record_id: record_id.clone(), opened_at })
    }

    fn append(&self, entry: &LedgerEntry) -> Result<(), StorageError> {
        let line = serde_json::to_string(entry).map_err(|e| StorageError::Corrupt {
            key: self.key.clone(),
            reason: e.to_string(),
        })?;
        self.store.append(&self.key, &line)
    }

    /// Merged view of the log, newest collection first
    pub fn records(&self) -> Result<Vec<CollectionRecord>, StorageError> {
        let mut records: Vec<CollectionRecord> = Vec::new();
        let mut seen_crates: FxHashSet<CrateId> = FxHashSet::default();
        let mut opened: FxHashMap<RecordId, DateTime<Utc>> = FxHashMap::default();

        for line in self.store.lines(&self.key)? {
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(LedgerEntry::Collected { record }) => {
                    if seen_crates.insert(record.crate_id.clone()) {
                        records.push(record);
                    }
                }
                Ok(LedgerEntry::Opened { record_id, opened_at }) => {
                    opened.entry(record_id).or_insert(opened_at);
                }
                Err(e) => warn!(key = %self.key, error = %e, "ledger_line_unreadable"),
            }
        }

        for record in &mut records {
            if record.opened_at.is_none() {
                record.opened_at = opened.get(&record.id).copied();
            }
        }
        records.sort_by(|a, b| b.collected_at.cmp(&a.collected_at));
        Ok(records)
    }

    pub fn contains_crate(&self, crate_id: &CrateId) -> Result<bool, StorageError> {
        Ok(self.records()?.iter().any(|r| r.crate_id == *crate_id))
    }
}

/// Outcome of a server sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub remote_records: usize,
    /// Records the ledger did not have yet
    pub added: usize,
    /// Opened marks learned from the server
    pub opened: usize,
    /// Crate IDs newly added to the DedupSet
    pub dedup_added: usize,
}

/// The user's collected crates: list, open, and reconcile with the server
pub struct Inventory {
    user_id: UserId,
    remote: Arc<dyn RemoteStore>,
    ledger: CollectionLedger,
    dedup: DedupSet,
}

impl Inventory {
    pub fn new(
        user_id: UserId,
        remote: Arc<dyn RemoteStore>,
        ledger: CollectionLedger,
        dedup: DedupSet,
    ) -> Self {
        Self { user_id, remote, ledger, dedup }
    }

    pub fn records(&self) -> Result<Vec<CollectionRecord>, StorageError> {
        self.ledger.records()
    }

    pub fn unopened(&self) -> Result<Vec<CollectionRecord>, StorageError> {
        Ok(self.ledger.records()?.into_iter().filter(|r| !r.is_opened()).collect())
    }

    /// Mark a record opened, remotely first. Opening an opened record is a no-op.
    pub async fn open(&self, record_id: &RecordId) -> Result<CollectionRecord, InventoryError> {
        let mut record = self
            .ledger
            .records()?
            .into_iter()
            .find(|r| r.id == *record_id)
            .ok_or_else(|| InventoryError::UnknownRecord(record_id.clone()))?;

        if record.is_opened() {
            return Ok(record);
        }

        self.remote.mark_opened(record_id).await?;

        let opened_at = Utc::now();
        self.ledger.append_opened(record_id, opened_at)?;
        record.opened_at = Some(opened_at);

        info!(record_id = %record_id, crate_id = %record.crate_id, "crate_opened");
        Ok(record)
    }

    /// Merge the server's records into the ledger and DedupSet
    ///
    /// A remote failure leaves local state untouched.
    pub async fn sync_from_server(&self) -> Result<SyncReport, InventoryError> {
        let remote_records = self.remote.fetch_user_collections(&self.user_id).await?;

        let local: FxHashMap<CrateId, CollectionRecord> =
            self.ledger.records()?.into_iter().map(|r| (r.crate_id.clone(), r)).collect();

        let mut report = SyncReport { remote_records: remote_records.len(), ..SyncReport::default() };
        for record in &remote_records {
            match local.get(&record.crate_id) {
                None => {
                    self.ledger.append_collected(record)?;
                    report.added += 1;
                }
                Some(existing) => {
                    if let (None, Some(opened_at)) = (existing.opened_at, record.opened_at) {
                        self.ledger.append_opened(&existing.id, opened_at)?;
                        report.opened += 1;
                    }
                }
            }
        }

        report.dedup_added = self.dedup.extend(remote_records.iter().map(|r| &r.crate_id))?;

        info!(
            remote = %report.remote_records,
            added = %report.added,
            opened = %report.opened,
            dedup_added = %report.dedup_added,
            "inventory_synced"
        );
        Ok(report)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::io::durable::MemoryStore;
    use crate::io::remote::MemoryRemoteStore;
    use chrono::TimeZone;

    fn record(id: &str, crate_id: &str, minute: u32) -> CollectionRecord {
        CollectionRecord {
            id: RecordId::from(id),
            crate_id: CrateId::from(crate_id),
            user_id: UserId::from("u1"),
            collected_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap(),
            opened_at: None,
        }
    }

    fn setup() -> (Arc<MemoryRemoteStore>, Inventory, CollectionLedger, DedupSet) {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let ledger = CollectionLedger::new(store.clone());
        let dedup = DedupSet::new(store);
        let inventory =
            Inventory::new(UserId::from("u1"), remote.clone(), ledger.clone(), dedup.clone());
        (remote, inventory, ledger, dedup)
    }

    #[test]
    fn test_ledger_merges_duplicates_and_orders_newest_first() {
        let ledger = CollectionLedger::new(Arc::new(MemoryStore::new()));
        ledger.append_collected(&record("r1", "c1", 1)).unwrap();
        ledger.append_collected(&record("r2", "c2", 5)).unwrap();
        ledger.append_collected(&record("r1", "c1", 1)).unwrap();

        let records = ledger.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, RecordId::from("r2"));
        assert!(ledger.contains_crate(&CrateId::from("c1")).unwrap());
    }

    #[test]
    fn test_ledger_first_open_mark_wins() {
        let ledger = CollectionLedger::new(Arc::new(MemoryStore::new()));
        let first = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap();

        ledger.append_collected(&record("r1", "c1", 1)).unwrap();
        ledger.append_opened(&RecordId::from("r1"), first).unwrap();
        ledger.append_opened(&RecordId::from("r1"), later).unwrap();

        assert_eq!(ledger.records().unwrap()[0].opened_at, Some(first));
    }

    #[tokio::test]
    async fn test_open_marks_remote_and_local() {
        let (remote, inventory, ledger, _) = setup();
        let rec = remote.record_collection(&UserId::from("u1"), &CrateId::from("c1")).await.unwrap();
        ledger.append_collected(&rec).unwrap();
        assert_eq!(inventory.unopened().unwrap().len(), 1);

        let opened = inventory.open(&rec.id).await.unwrap();
        assert!(opened.is_opened());
        assert!(remote.records()[0].is_opened());
        assert!(inventory.unopened().unwrap().is_empty());

        // Second open is a no-op returning the same timestamp
        let again = inventory.open(&rec.id).await.unwrap();
        assert_eq!(again.opened_at, opened.opened_at);
    }

    #[tokio::test]
    async fn test_open_unknown_record() {
        let (_, inventory, _, _) = setup();
        let err = inventory.open(&RecordId::from("missing")).await.unwrap_err();
        assert!(matches!(err, InventoryError::UnknownRecord(_)));
    }

    #[tokio::test]
    async fn test_open_remote_failure_keeps_record_unopened() {
        let (remote, inventory, ledger, _) = setup();
        let rec = remote.record_collection(&UserId::from("u1"), &CrateId::from("c1")).await.unwrap();
        ledger.append_collected(&rec).unwrap();

        remote.fail_next(1);
        let err = inventory.open(&rec.id).await.unwrap_err();
        assert!(matches!(err, InventoryError::Remote(RemoteError::Unavailable(_))));
        assert_eq!(inventory.unopened().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_from_server_fills_ledger_and_dedup() {
        let (remote, inventory, ledger, dedup) = setup();
        let user = UserId::from("u1");
        let known = remote.record_collection(&user, &CrateId::from("c1")).await.unwrap();
        remote.record_collection(&user, &CrateId::from("c2")).await.unwrap();
        ledger.append_collected(&known).unwrap();
        remote.mark_opened(&known.id).await.unwrap();

        let report = inventory.sync_from_server().await.unwrap();
        assert_eq!(report.remote_records, 2);
        assert_eq!(report.added, 1);
        assert_eq!(report.opened, 1);
        assert_eq!(report.dedup_added, 2);

        assert_eq!(inventory.records().unwrap().len(), 2);
        assert!(dedup.contains(&CrateId::from("c2")).unwrap());
        assert!(inventory.unopened().unwrap().iter().all(|r| r.crate_id == CrateId::from("c2")));

        // Idempotent
        let again = inventory.sync_from_server().await.unwrap();
        assert_eq!((again.added, again.opened, again.dedup_added), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_sync_failure_leaves_local_state() {
        let (remote, inventory, ledger, _) = setup();
        ledger.append_collected(&record("r1", "c1", 1)).unwrap();
        remote.fail_next(1);

        assert!(inventory.sync_from_server().await.is_err());
        assert_eq!(inventory.records().unwrap().len(), 1);
    }
}
