//! Collection events - outbound notifications of successful collections
//!
//! Producers send through a bounded channel with `try_send` so the tracking
//! loop never blocks on a slow consumer. The default consumer appends each
//! event to a JSONL file.

use crate::domain::types::{epoch_ms, CollectionRecord, Crate, CrateId, ExecutionContext};
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Emitted once per crate when the collection is confirmed by the remote store
#[derive(Debug, Clone, Serialize)]
pub struct CollectionEvent {
    /// Timestamp (epoch ms)
    pub ts: u64,
    pub crate_id: CrateId,
    pub payload_id: String,
    pub record: CollectionRecord,
    /// "foreground" or "background"
    pub context: &'static str,
    pub latitude: f64,
    pub longitude: f64,
}

impl CollectionEvent {
    pub fn new(context: ExecutionContext, c: &Crate, record: &CollectionRecord) -> Self {
        Self {
            ts: epoch_ms(),
            crate_id: c.id.clone(),
            payload_id: c.payload_id.clone(),
            record: record.clone(),
            context: context.as_str(),
            latitude: c.latitude,
            longitude: c.longitude,
        }
    }
}

/// Sender handle for collection events
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, events are dropped and counted.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<CollectionEvent>,
    metrics: Arc<Metrics>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<CollectionEvent>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    pub fn send(&self, event: CollectionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            self.metrics.record_event_dropped();
            warn!(error = %e, "collection_event_dropped");
        }
    }
}

/// Create a new event channel pair
pub fn create_event_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (EventSender, mpsc::Receiver<CollectionEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EventSender::new(tx, metrics), rx)
}

/// Appends collection events to a file, one JSON object per line
pub struct EventLog {
    file_path: String,
}

impl EventLog {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "event_log_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Returns true if the event was written
    pub fn write_event(&self, event: &CollectionEvent) -> bool {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                error!(crate_id = %event.crate_id, error = %e, "event_serialize_failed");
                return false;
            }
        };

        match self.append_line(&json) {
            Ok(()) => {
                info!(
                    crate_id = %event.crate_id,
                    record_id = %event.record.id,
                    context = %event.context,
                    "collection_event_written"
                );
                true
            }
            Err(e) => {
                error!(crate_id = %event.crate_id, error = %e, "collection_event_write_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "event_log_appended");
        Ok(())
    }

    /// Consume events until shutdown, draining whatever is queued at that point
    pub async fn run(self, mut rx: mpsc::Receiver<CollectionEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(file_path = %self.file_path, "event_log_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        while let Ok(event) = rx.try_recv() {
                            self.write_event(&event);
                        }
                        info!("event_log_shutdown");
                        return;
                    }
                }
                msg = rx.recv() => match msg {
                    Some(event) => {
                        self.write_event(&event);
                    }
                    None => {
                        info!("event_log_channel_closed");
                        return;
                    }
                }
            }
        }
    }
}
