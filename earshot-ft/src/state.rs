//! Shared runtime state
//!
//! One instance is shared between the ingestion pipeline (writer) and the
//! API handlers (readers). Domain events fan out to SSE subscribers over a
//! broadcast channel.

use crate::aggregate::Aggregator;
use chrono::{DateTime, Utc};
use earshot_common::events::TrackerEvent;
use earshot_common::time;
use tokio::sync::{broadcast, RwLock};

/// Health of the ingestion loop, as reported by the status endpoint.
#[derive(Debug, Clone)]
pub struct IngestStatus {
    /// Process start, used as the staleness reference before any batch
    pub started_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Completion time of the newest successfully committed poll batch
    pub last_batch_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Set when ingestion has stopped for good (expired credentials)
    pub halted: bool,
    pub halt_reason: Option<String>,
}

pub struct SharedState {
    /// Broadcast channel for SSE event streaming
    pub event_tx: broadcast::Sender<TrackerEvent>,
    pub aggregator: RwLock<Aggregator>,
    ingest: RwLock<IngestStatus>,
}

impl SharedState {
    pub fn new(aggregator: Aggregator) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            event_tx,
            aggregator: RwLock::new(aggregator),
            ingest: RwLock::new(IngestStatus {
                started_at: time::now(),
                last_attempt_at: None,
                last_batch_at: None,
                consecutive_failures: 0,
                halted: false,
                halt_reason: None,
            }),
        }
    }

    /// Broadcast an event to all SSE subscribers.
    /// Errors are ignored (no subscribers connected is normal).
    pub fn broadcast_event(&self, event: TrackerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Subscribe to the event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn ingest_status(&self) -> IngestStatus {
        self.ingest.read().await.clone()
    }

    pub async fn record_attempt(&self) {
        self.ingest.write().await.last_attempt_at = Some(time::now());
    }

    pub async fn record_success(&self, at: DateTime<Utc>) {
        let mut status = self.ingest.write().await;
        status.last_batch_at = Some(at);
        status.consecutive_failures = 0;
    }

    /// Returns the updated failure count.
    pub async fn record_failure(&self) -> u32 {
        let mut status = self.ingest.write().await;
        status.consecutive_failures += 1;
        status.consecutive_failures
    }

    pub async fn mark_halted(&self, reason: &str) {
        let mut status = self.ingest.write().await;
        status.halted = true;
        status.halt_reason = Some(reason.to_string());
    }

    /// Reference point for "stale since": the last good batch, or process
    /// start when there has never been one.
    pub async fn stale_since(&self) -> DateTime<Utc> {
        let status = self.ingest.read().await;
        status.last_batch_at.unwrap_or(status.started_at)
    }
}
