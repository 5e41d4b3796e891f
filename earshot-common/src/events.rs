//! Event types for the tracker's broadcast/SSE channel

use crate::db::models::EndReason;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted by the ingestion pipeline for SSE subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrackerEvent {
    /// A new play interval was opened
    PlayStarted {
        event_id: Uuid,
        friend_id: String,
        track_id: String,
        artist_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An open play interval was closed
    PlayEnded {
        event_id: Uuid,
        friend_id: String,
        track_id: String,
        end_reason: EndReason,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A poll batch was applied (sent even when nothing changed, so the
    /// dashboard can refresh its staleness indicator)
    BatchIngested {
        snapshot_count: usize,
        events_opened: usize,
        events_closed: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Ingestion has stopped making progress (source down or auth expired)
    IngestStalled {
        reason: String,
        stale_since: chrono::DateTime<chrono::Utc>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Aggregates were rebuilt from the event store
    AggregatesRebuilt {
        events_applied: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}
