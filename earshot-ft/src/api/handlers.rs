//! API request handlers

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use earshot_common::db::models::EndReason;
use earshot_common::time;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info};
use uuid::Uuid;

use super::AppState;
use crate::aggregate::Dimension;
use crate::store::{catalog, EventFilter};

// ===== Request/Response Types =====

/// Generic status payload, used for error responses
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct HeatmapQuery {
    pub friend_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HeatmapResponse {
    pub friend_id: Option<String>,
    /// Play counts by hour of day, UTC, index 0 = midnight
    pub hours: Vec<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    pub friend_id: Option<String>,
    pub n: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TopEntry {
    pub id: String,
    pub name: String,
    pub count: u64,
    pub last_played_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TopResponse {
    pub friend_id: Option<String>,
    pub entries: Vec<TopEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TrendQuery {
    pub dimension: String,
    pub key: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TrendResponse {
    pub dimension: String,
    pub key: String,
    pub count: u64,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub friend_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct TimelineEvent {
    pub event_id: Uuid,
    pub friend_id: String,
    pub friend_name: String,
    pub track_id: String,
    pub track_name: String,
    pub artist_id: String,
    pub artist_name: String,
    pub context_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Serialize)]
pub struct FriendEntry {
    pub friend_id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct FriendsResponse {
    pub friends: Vec<FriendEntry>,
}

#[derive(Debug, Serialize)]
pub struct TrackerStatus {
    pub started_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_batch_at: Option<DateTime<Utc>>,
    /// True when no batch has landed within twice the poll interval
    pub stale: bool,
    pub stale_since: Option<DateTime<Utc>>,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub consecutive_failures: u32,
    pub event_count: i64,
    pub friend_count: i64,
    pub aggregated_events: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct RebuildResponse {
    pub status: String,
    pub events_applied: u64,
}

// ===== Helpers =====

fn bad_request(message: String) -> (StatusCode, Json<StatusResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(StatusResponse {
            status: format!("error: {}", message),
        }),
    )
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<StatusResponse>) {
    error!("API error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(StatusResponse {
            status: format!("error: {}", e),
        }),
    )
}

/// Parse an optional RFC3339 query parameter.
fn parse_timestamp(
    value: Option<&str>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, (StatusCode, Json<StatusResponse>)> {
    match value {
        None => Ok(None),
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => Ok(Some(parsed.with_timezone(&Utc))),
            Err(e) => Err(bad_request(format!("invalid {} timestamp: {}", field, e))),
        },
    }
}

// ===== Aggregate Queries =====

/// GET /api/v1/heatmap - plays per hour of day
pub async fn get_heatmap(
    State(app): State<AppState>,
    Query(query): Query<HeatmapQuery>,
) -> Result<Json<HeatmapResponse>, (StatusCode, Json<StatusResponse>)> {
    let from = parse_timestamp(query.from.as_deref(), "from")?;
    let to = parse_timestamp(query.to.as_deref(), "to")?;

    let aggregator = app.state.aggregator.read().await;
    let hours = aggregator.heatmap(query.friend_id.as_deref(), from, to);

    Ok(Json(HeatmapResponse {
        friend_id: query.friend_id,
        hours: hours.to_vec(),
    }))
}

/// GET /api/v1/top/artists - most played artists, global or per friend
pub async fn get_top_artists(
    State(app): State<AppState>,
    Query(query): Query<TopQuery>,
) -> Result<Json<TopResponse>, (StatusCode, Json<StatusResponse>)> {
    let n = query.n.unwrap_or(app.params.top_n_size as usize);
    let ranked = {
        let aggregator = app.state.aggregator.read().await;
        aggregator.top_artists(query.friend_id.as_deref(), n)
    };

    let mut entries = Vec::with_capacity(ranked.len());
    for entry in ranked {
        let name = catalog::artist_name(app.store.pool(), &entry.id)
            .await
            .map_err(internal_error)?
            .unwrap_or_else(|| entry.id.clone());
        entries.push(TopEntry {
            id: entry.id,
            name,
            count: entry.count,
            last_played_at: entry.last_played_at,
        });
    }

    Ok(Json(TopResponse {
        friend_id: query.friend_id,
        entries,
    }))
}

/// GET /api/v1/top/tracks - most played tracks, global or per friend
pub async fn get_top_tracks(
    State(app): State<AppState>,
    Query(query): Query<TopQuery>,
) -> Result<Json<TopResponse>, (StatusCode, Json<StatusResponse>)> {
    let n = query.n.unwrap_or(app.params.top_n_size as usize);
    let ranked = {
        let aggregator = app.state.aggregator.read().await;
        aggregator.top_tracks(query.friend_id.as_deref(), n)
    };

    let mut entries = Vec::with_capacity(ranked.len());
    for entry in ranked {
        let name = catalog::track_name(app.store.pool(), &entry.id)
            .await
            .map_err(internal_error)?
            .unwrap_or_else(|| entry.id.clone());
        entries.push(TopEntry {
            id: entry.id,
            name,
            count: entry.count,
            last_played_at: entry.last_played_at,
        });
    }

    Ok(Json(TopResponse {
        friend_id: query.friend_id,
        entries,
    }))
}

/// GET /api/v1/trend - play count for one entity over a time range
pub async fn get_trend(
    State(app): State<AppState>,
    Query(query): Query<TrendQuery>,
) -> Result<Json<TrendResponse>, (StatusCode, Json<StatusResponse>)> {
    let dimension = Dimension::parse(&query.dimension).ok_or_else(|| {
        bad_request(format!(
            "unknown dimension '{}' (expected hour_of_day, artist, track, or friend)",
            query.dimension
        ))
    })?;
    let key = match (dimension, query.key) {
        // The global hourly dimension has a single unnamed bucket set
        (Dimension::HourOfDay, _) => String::new(),
        (_, Some(key)) => key,
        (_, None) => {
            return Err(bad_request(format!(
                "dimension '{}' requires a key",
                query.dimension
            )))
        }
    };
    let from = parse_timestamp(query.from.as_deref(), "from")?;
    let to = parse_timestamp(query.to.as_deref(), "to")?;

    let count = {
        let aggregator = app.state.aggregator.read().await;
        aggregator.count(dimension, &key, from, to)
    };

    Ok(Json(TrendResponse {
        dimension: dimension.as_str().to_string(),
        key,
        count,
        from: query.from,
        to: query.to,
    }))
}

// ===== Event Queries =====

/// GET /api/v1/timeline - recent play events, newest first
pub async fn get_timeline(
    State(app): State<AppState>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<TimelineResponse>, (StatusCode, Json<StatusResponse>)> {
    let from = parse_timestamp(query.from.as_deref(), "from")?;
    let to = parse_timestamp(query.to.as_deref(), "to")?;
    let limit = query.limit.unwrap_or(100).min(1000);

    let filter = EventFilter {
        friend_id: query.friend_id,
        from,
        to,
        newest_first: true,
        limit: Some(limit),
        ..Default::default()
    };
    let events = app.store.query(&filter).await.map_err(internal_error)?;

    let pool = app.store.pool();
    let mut friend_names: HashMap<String, String> = HashMap::new();
    let mut track_names: HashMap<String, String> = HashMap::new();
    let mut artist_names: HashMap<String, String> = HashMap::new();

    let mut timeline = Vec::with_capacity(events.len());
    for event in events {
        if !friend_names.contains_key(&event.friend_id) {
            let name = catalog::friend_name(pool, &event.friend_id)
                .await
                .map_err(internal_error)?
                .unwrap_or_else(|| event.friend_id.clone());
            friend_names.insert(event.friend_id.clone(), name);
        }
        if !track_names.contains_key(&event.track_id) {
            let name = catalog::track_name(pool, &event.track_id)
                .await
                .map_err(internal_error)?
                .unwrap_or_else(|| event.track_id.clone());
            track_names.insert(event.track_id.clone(), name);
        }
        if !artist_names.contains_key(&event.artist_id) {
            let name = catalog::artist_name(pool, &event.artist_id)
                .await
                .map_err(internal_error)?
                .unwrap_or_else(|| event.artist_id.clone());
            artist_names.insert(event.artist_id.clone(), name);
        }

        timeline.push(TimelineEvent {
            event_id: event.event_id,
            friend_name: friend_names[&event.friend_id].clone(),
            track_name: track_names[&event.track_id].clone(),
            artist_name: artist_names[&event.artist_id].clone(),
            friend_id: event.friend_id,
            track_id: event.track_id,
            artist_id: event.artist_id,
            context_id: event.context_id,
            started_at: event.started_at,
            ended_at: event.ended_at,
            end_reason: event.end_reason,
            last_seen_at: event.last_seen_at,
        });
    }

    Ok(Json(TimelineResponse { events: timeline }))
}

/// GET /api/v1/friends - known friends with catalog metadata
pub async fn get_friends(
    State(app): State<AppState>,
) -> Result<Json<FriendsResponse>, (StatusCode, Json<StatusResponse>)> {
    let friends = catalog::list_friends(app.store.pool())
        .await
        .map_err(internal_error)?;

    Ok(Json(FriendsResponse {
        friends: friends
            .into_iter()
            .map(|friend| FriendEntry {
                friend_id: friend.friend_id,
                name: friend.name,
                image_url: friend.image_url,
                first_seen_at: friend.first_seen_at,
                last_seen_at: friend.last_seen_at,
            })
            .collect(),
    }))
}

// ===== Operational =====

/// GET /api/v1/status - ingestion health and store counters
pub async fn get_status(
    State(app): State<AppState>,
) -> Result<Json<TrackerStatus>, (StatusCode, Json<StatusResponse>)> {
    let status = app.state.ingest_status().await;
    let aggregated_events = app.state.aggregator.read().await.events_applied();
    let event_count = app.store.count_events().await.map_err(internal_error)?;
    let friend_count = catalog::count_friends(app.store.pool())
        .await
        .map_err(internal_error)?;

    let now = time::now();
    let stale = match status.last_batch_at {
        Some(at) => now.signed_duration_since(at) > app.params.staleness_threshold(),
        None => true,
    };
    let stale_since = if stale {
        Some(status.last_batch_at.unwrap_or(status.started_at))
    } else {
        None
    };

    Ok(Json(TrackerStatus {
        started_at: status.started_at,
        last_attempt_at: status.last_attempt_at,
        last_batch_at: status.last_batch_at,
        stale,
        stale_since,
        halted: status.halted,
        halt_reason: status.halt_reason,
        consecutive_failures: status.consecutive_failures,
        event_count,
        friend_count,
        aggregated_events,
        poll_interval_secs: app.params.poll_interval_secs,
    }))
}

/// POST /api/v1/aggregates/rebuild - replay the event store into fresh
/// aggregates
pub async fn rebuild_aggregates(
    State(app): State<AppState>,
) -> Result<Json<RebuildResponse>, (StatusCode, Json<StatusResponse>)> {
    let mut aggregator = app.state.aggregator.write().await;
    let events_applied = aggregator.rebuild(&app.store).await.map_err(internal_error)?;
    drop(aggregator);

    info!("Aggregate rebuild applied {} events", events_applied);
    app.state
        .broadcast_event(earshot_common::events::TrackerEvent::AggregatesRebuilt {
            events_applied,
            timestamp: time::now(),
        });

    Ok(Json(RebuildResponse {
        status: "rebuilt".to_string(),
        events_applied,
    }))
}
