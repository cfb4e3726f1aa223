//! At-most-once collection authority
//!
//! Decision order for one (user, crate) attempt:
//! 1. Too far from the observer: `TooFar`, no side effects
//! 2. Already in the durable DedupSet or attempted in this process: `AlreadyCollected`
//! 3. Mark attempted (before any I/O), then ask the remote store to record it
//! 4. Success: persist to DedupSet and ledger, emit an event, `Collected`
//! 5. Remote duplicate: someone (the other context) got there first, `AlreadyCollected`
//! 6. Any other failure: roll back the mark so a later attempt may retry, `Failed`
//!
//! The DedupSet read in step 2 happens before the lock, off the async worker.
//! The attempted check and the mark in step 3 are one lock acquisition, so two
//! attempts in the same process cannot both pass. Across processes the remote
//! store's uniqueness constraint is the final word.

use crate::domain::geo::distance_m;
use crate::domain::types::{CollectionRecord, Crate, CrateId, ExecutionContext, StablePosition, UserId};
use crate::error::{CollectFailure, RemoteError};
use crate::infra::metrics::Metrics;
use crate::io::dedup::DedupSet;
use crate::io::events::{CollectionEvent, EventSender};
use crate::io::remote::RemoteStore;
use crate::services::inventory::CollectionLedger;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum CollectResult {
    Collected(CollectionRecord),
    AlreadyCollected,
    TooFar { distance_m: f64 },
    Failed(CollectFailure),
}

impl CollectResult {
    /// Whether the crate is now owned by the user (freshly or previously)
    pub fn is_owned(&self) -> bool {
        matches!(self, CollectResult::Collected(_) | CollectResult::AlreadyCollected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectResult::Collected(_) => "collected",
            CollectResult::AlreadyCollected => "already_collected",
            CollectResult::TooFar { .. } => "too_far",
            CollectResult::Failed(_) => "failed",
        }
    }
}

/// In-flight mark in the attempted set; removed on drop unless committed
///
/// Dropping the future mid-request (cancellation) therefore releases the
/// crate for a later retry instead of blocking it for the session.
struct AttemptMark<'a> {
    attempted: &'a Mutex<FxHashSet<CrateId>>,
    crate_id: CrateId,
    committed: bool,
}

impl AttemptMark<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for AttemptMark<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.attempted.lock().remove(&self.crate_id);
            debug!(crate_id = %self.crate_id, "collection_attempt_rolled_back");
        }
    }
}

pub struct CollectionGuard {
    context: ExecutionContext,
    remote: Arc<dyn RemoteStore>,
    dedup: DedupSet,
    ledger: CollectionLedger,
    events: Option<EventSender>,
    metrics: Arc<Metrics>,
    /// Crates attempted or collected by this process
    attempted: Mutex<FxHashSet<CrateId>>,
}

impl CollectionGuard {
    pub fn new(
        context: ExecutionContext,
        remote: Arc<dyn RemoteStore>,
        dedup: DedupSet,
        ledger: CollectionLedger,
        events: Option<EventSender>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            context,
            remote,
            dedup,
            ledger,
            events,
            metrics,
            attempted: Mutex::new(FxHashSet::default()),
        }
    }

    pub async fn try_collect(
        &self,
        user_id: &UserId,
        target: &Crate,
        observer: &StablePosition,
        collection_radius_m: f64,
    ) -> CollectResult {
        let distance_m = distance_m(observer, target);
        if distance_m > collection_radius_m {
            return CollectResult::TooFar { distance_m };
        }

        let mark = match self.begin_attempt(&target.id).await {
            Ok(Some(mark)) => mark,
            Ok(None) => {
                debug!(crate_id = %target.id, context = %self.context.as_str(), "collection_skipped_known");
                return CollectResult::AlreadyCollected;
            }
            Err(failure) => {
                self.metrics.record_collection_failure();
                error!(crate_id = %target.id, error = %failure, "dedup_read_failed");
                return CollectResult::Failed(failure);
            }
        };

        match self.remote.record_collection(user_id, &target.id).await {
            Ok(record) => {
                mark.commit();
                self.persist_local(&target.id, Some(&record));
                self.metrics.record_collection();
                info!(
                    crate_id = %target.id,
                    record_id = %record.id,
                    context = %self.context.as_str(),
                    distance_m = %format!("{distance_m:.1}"),
                    "crate_collected"
                );
                if let Some(events) = &self.events {
                    events.send(CollectionEvent::new(self.context, target, &record));
                }
                CollectResult::Collected(record)
            }
            Err(RemoteError::Duplicate) => {
                mark.commit();
                self.persist_local(&target.id, None);
                self.metrics.record_duplicate();
                info!(
                    crate_id = %target.id,
                    context = %self.context.as_str(),
                    "collection_duplicate_remote"
                );
                CollectResult::AlreadyCollected
            }
            Err(e) => {
                // Dropping the mark rolls it back
                drop(mark);
                self.metrics.record_collection_failure();
                warn!(
                    crate_id = %target.id,
                    context = %self.context.as_str(),
                    error = %e,
                    "collection_failed"
                );
                CollectResult::Failed(CollectFailure::Remote(e))
            }
        }
    }

    /// Check the DedupSet, then check-and-mark under the attempted lock. `None` if already known.
    async fn begin_attempt(&self, crate_id: &CrateId) -> Result<Option<AttemptMark<'_>>, CollectFailure> {
        if self.is_attempted(crate_id) {
            return Ok(None);
        }
        let known = self.dedup.contains_async(crate_id).await?;

        let mut attempted = self.attempted.lock();
        if !attempted.insert(crate_id.clone()) || known {
            return Ok(None);
        }
        Ok(Some(AttemptMark { attempted: &self.attempted, crate_id: crate_id.clone(), committed: false }))
    }

    /// Record a remotely confirmed collection locally
    ///
    /// Failures are logged only: the remote store already holds the record,
    /// and a later sync restores the local copies.
    fn persist_local(&self, crate_id: &CrateId, record: Option<&CollectionRecord>) {
        if let Err(e) = self.dedup.insert(crate_id) {
            error!(crate_id = %crate_id, error = %e, "dedup_persist_failed");
        }
        if let Some(record) = record {
            if let Err(e) = self.ledger.append_collected(record) {
                error!(crate_id = %crate_id, record_id = %record.id, error = %e, "ledger_persist_failed");
            }
        }
    }

    pub fn is_attempted(&self, crate_id: &CrateId) -> bool {
        self.attempted.lock().contains(crate_id)
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn dedup(&self) -> &DedupSet {
        &self.dedup
    }

    pub fn ledger(&self) -> &CollectionLedger {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::destination;
    use crate::io::durable::{DurableStore, MemoryStore};
    use crate::io::events::create_event_channel;
    use crate::io::remote::MemoryRemoteStore;
    use std::time::Duration;

    const LAT: f64 = 35.6586;
    const LON: f64 = 139.7454;

    struct Fixture {
        store: Arc<dyn DurableStore>,
        remote: Arc<MemoryRemoteStore>,
        metrics: Arc<Metrics>,
    }

    impl Fixture {
        fn new(remote: MemoryRemoteStore) -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                remote: Arc::new(remote),
                metrics: Arc::new(Metrics::new()),
            }
        }

        fn guard(&self, context: ExecutionContext, events: Option<EventSender>) -> CollectionGuard {
            CollectionGuard::new(
                context,
                self.remote.clone(),
                DedupSet::new(self.store.clone()),
                CollectionLedger::new(self.store.clone()),
                events,
                self.metrics.clone(),
            )
        }
    }

    fn user() -> UserId {
        UserId::from("u1")
    }

    fn observer() -> StablePosition {
        StablePosition::at(LAT, LON)
    }

    fn crate_at(id: &str, meters: f64) -> Crate {
        let (lat, lon) = destination(LAT, LON, 60.0, meters);
        Crate::new(id, lat, lon, "fortune")
    }

    #[tokio::test]
    async fn test_too_far_has_no_side_effects() {
        let fx = Fixture::new(MemoryRemoteStore::new());
        let guard = fx.guard(ExecutionContext::Foreground, None);

        let result = guard.try_collect(&user(), &crate_at("c1", 12.0), &observer(), 10.0).await;
        assert!(matches!(result, CollectResult::TooFar { distance_m } if (distance_m - 12.0).abs() < 0.01));
        assert_eq!(fx.remote.record_calls(), 0);
        assert!(!guard.is_attempted(&CrateId::from("c1")));
    }

    #[tokio::test]
    async fn test_collect_persists_and_emits() {
        let fx = Fixture::new(MemoryRemoteStore::new());
        let (sender, mut rx) = create_event_channel(4, fx.metrics.clone());
        let guard = fx.guard(ExecutionContext::Foreground, Some(sender));
        let target = crate_at("c1", 5.0);

        let result = guard.try_collect(&user(), &target, &observer(), 10.0).await;
        let record = match result {
            CollectResult::Collected(record) => record,
            other => panic!("expected Collected, got {other:?}"),
        };

        assert!(guard.dedup().contains(&target.id).unwrap());
        assert_eq!(guard.ledger().records().unwrap(), vec![record.clone()]);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.crate_id, target.id);
        assert_eq!(event.context, "foreground");
        assert_eq!(fx.metrics.collections_total(), 1);

        // Second attempt never reaches the remote store
        let again = guard.try_collect(&user(), &target, &observer(), 10.0).await;
        assert!(matches!(again, CollectResult::AlreadyCollected));
        assert_eq!(fx.remote.record_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_attempts_collect_once() {
        let fx = Fixture::new(MemoryRemoteStore::new().with_latency(Duration::from_millis(20)));
        let guard = fx.guard(ExecutionContext::Foreground, None);
        let target = crate_at("c1", 3.0);
        let pos = observer();
        let u = user();

        let (a, b) = tokio::join!(
            guard.try_collect(&u, &target, &pos, 10.0),
            guard.try_collect(&u, &target, &pos, 10.0)
        );

        let collected = [&a, &b].iter().filter(|r| matches!(r, CollectResult::Collected(_))).count();
        let already = [&a, &b].iter().filter(|r| matches!(r, CollectResult::AlreadyCollected)).count();
        assert_eq!((collected, already), (1, 1));
        assert_eq!(fx.remote.records().len(), 1);
        assert_eq!(fx.remote.record_calls(), 1);
    }

    #[tokio::test]
    async fn test_two_contexts_race_resolved_by_remote() {
        // Separate in-memory attempt sets, shared durable store and remote
        let fx = Fixture::new(MemoryRemoteStore::new().with_latency(Duration::from_millis(20)));
        let foreground = fx.guard(ExecutionContext::Foreground, None);
        let background = fx.guard(ExecutionContext::Background, None);
        let target = crate_at("c1", 3.0);
        let pos = observer();
        let u = user();

        let (a, b) = tokio::join!(
            foreground.try_collect(&u, &target, &pos, 10.0),
            background.try_collect(&u, &target, &pos, 10.0)
        );

        assert!(a.is_owned() && b.is_owned());
        let collected = [&a, &b].iter().filter(|r| matches!(r, CollectResult::Collected(_))).count();
        assert_eq!(collected, 1);
        assert_eq!(fx.remote.records().len(), 1);
        assert_eq!(fx.metrics.report().duplicates_total, 1);
        assert_eq!(foreground.ledger().records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_other_context_collection_seen_through_dedup() {
        let fx = Fixture::new(MemoryRemoteStore::new());
        let background = fx.guard(ExecutionContext::Background, None);
        let target = crate_at("c1", 3.0);
        assert!(matches!(
            background.try_collect(&user(), &target, &observer(), 10.0).await,
            CollectResult::Collected(_)
        ));

        // A later foreground session in a fresh process
        let foreground = fx.guard(ExecutionContext::Foreground, None);
        let result = foreground.try_collect(&user(), &target, &observer(), 10.0).await;
        assert!(matches!(result, CollectResult::AlreadyCollected));
        assert_eq!(fx.remote.record_calls(), 1);
    }

    #[tokio::test]
    async fn test_interleaved_attempts_after_dedup_read_collect_once() {
        let fx = Fixture::new(MemoryRemoteStore::new().with_latency(Duration::from_millis(20)));
        let guard = fx.guard(ExecutionContext::Foreground, None);
        let (first, second) = (crate_at("c1", 2.0), crate_at("c2", 4.0));
        let (pos, u) = (observer(), user());

        let (a, b, c, d) = tokio::join!(
            guard.try_collect(&u, &first, &pos, 10.0),
            guard.try_collect(&u, &second, &pos, 10.0),
            guard.try_collect(&u, &first, &pos, 10.0),
            guard.try_collect(&u, &second, &pos, 10.0)
        );

        let results = [a, b, c, d];
        let collected = results.iter().filter(|r| matches!(r, CollectResult::Collected(_))).count();
        assert_eq!(collected, 2);
        assert!(results.iter().all(CollectResult::is_owned));
        assert_eq!(fx.remote.record_calls(), 2);
        assert_eq!(guard.dedup().load().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remote_failure_rolls_back_for_retry() {
        let fx = Fixture::new(MemoryRemoteStore::new());
        let guard = fx.guard(ExecutionContext::Foreground, None);
        let target = crate_at("c1", 3.0);

        fx.remote.fail_next(1);
        let result = guard.try_collect(&user(), &target, &observer(), 10.0).await;
        assert!(matches!(result, CollectResult::Failed(CollectFailure::Remote(RemoteError::Unavailable(_)))));
        assert!(!guard.is_attempted(&target.id));
        assert!(!guard.dedup().contains(&target.id).unwrap());
        assert!(guard.ledger().records().unwrap().is_empty());

        let retry = guard.try_collect(&user(), &target, &observer(), 10.0).await;
        assert!(matches!(retry, CollectResult::Collected(_)));
    }

    #[tokio::test]
    async fn test_cancelled_attempt_is_released() {
        let fx = Fixture::new(MemoryRemoteStore::new().with_latency(Duration::from_secs(5)));
        let guard = fx.guard(ExecutionContext::Foreground, None);
        let target = crate_at("c1", 3.0);
        let (pos, u) = (observer(), user());

        let attempt = guard.try_collect(&u, &target, &pos, 10.0);
        let timed_out = tokio::time::timeout(Duration::from_millis(10), attempt).await;
        assert!(timed_out.is_err());
        assert!(!guard.is_attempted(&target.id));
    }
}
