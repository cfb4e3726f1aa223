//! Background batch entry point
//!
//! Invoked by the OS scheduler, possibly in a process that never ran the
//! foreground loop. Everything it needs is passed in explicitly; the only
//! state it shares with the foreground is the durable store.

use crate::domain::types::{ExecutionContext, RawSample};
use crate::error::StorageError;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::durable::DurableStore;
use crate::io::events::EventSender;
use crate::io::remote::RemoteStore;
use crate::services::reconciler::{BatchReport, Reconciler};
use std::sync::Arc;
use tracing::info;

/// Run one background invocation over `samples`, in order
///
/// Filter state starts empty: a background run shares no memory with earlier runs.
pub async fn run_background_batch(
    config: &Config,
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteStore>,
    metrics: Arc<Metrics>,
    events: Option<EventSender>,
    samples: Vec<RawSample>,
) -> Result<BatchReport, StorageError> {
    if samples.is_empty() {
        info!("background_batch_empty");
        return Ok(BatchReport::default());
    }

    let mut reconciler =
        Reconciler::open(ExecutionContext::Background, config, store, remote, metrics, events)?;
    Ok(reconciler.run_batch(samples).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Crate;
    use crate::io::durable::MemoryStore;
    use crate::io::events::create_event_channel;
    use crate::io::remote::MemoryRemoteStore;

    #[tokio::test]
    async fn test_background_batch_collects_and_emits() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemoteStore::with_crates(vec![Crate::new("c1", 1.0, 1.0, "f")]));
        let metrics = Arc::new(Metrics::new());
        let (events, mut rx) = create_event_channel(8, metrics.clone());

        let samples = vec![RawSample::new(1.0, 1.00001, 5.0, 0)];
        let report = run_background_batch(
            &Config::default(),
            store.clone(),
            remote.clone(),
            metrics,
            Some(events),
            samples.clone(),
        )
        .await
        .unwrap();
        assert_eq!(report.collected.len(), 1);
        assert_eq!(rx.try_recv().unwrap().context, "background");

        // A second scheduled run finds nothing left to do
        let again = run_background_batch(
            &Config::default(),
            store,
            remote.clone(),
            Arc::new(Metrics::new()),
            None,
            samples,
        )
        .await
        .unwrap();
        assert!(again.collected.is_empty());
        assert_eq!(remote.record_calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_touches_nothing() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let report = run_background_batch(
            &Config::default(),
            Arc::new(MemoryStore::new()),
            remote.clone(),
            Arc::new(Metrics::new()),
            None,
            Vec::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.samples, 0);
        assert_eq!(remote.fetch_calls(), 0);
    }
}
