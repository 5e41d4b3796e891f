//! Server-Sent Events endpoint
//!
//! Forwards the pipeline's broadcast events to connected dashboards. A
//! slow subscriber that falls behind the channel simply misses the lagged
//! events; the dashboard treats the stream as refresh hints, not as a
//! reliable log.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::AppState;
use earshot_common::events::TrackerEvent;

/// GET /api/v1/events - stream tracker events as SSE
pub async fn event_stream(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("SSE subscriber connected");
    let rx = app.state.subscribe_events();

    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => {
                let name = event_name(&event);
                match serde_json::to_string(&event) {
                    Ok(data) => Some(Ok(Event::default().event(name).data(data))),
                    Err(e) => {
                        warn!("Failed to serialize SSE event: {}", e);
                        None
                    }
                }
            }
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!("SSE subscriber lagged, {} events dropped", missed);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn event_name(event: &TrackerEvent) -> &'static str {
    match event {
        TrackerEvent::PlayStarted { .. } => "play_started",
        TrackerEvent::PlayEnded { .. } => "play_ended",
        TrackerEvent::BatchIngested { .. } => "batch_ingested",
        TrackerEvent::IngestStalled { .. } => "ingest_stalled",
        TrackerEvent::AggregatesRebuilt { .. } => "aggregates_rebuilt",
    }
}
