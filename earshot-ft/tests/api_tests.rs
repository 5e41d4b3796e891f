//! Integration tests for the query API
//!
//! Each test builds a router over a seeded temp database and drives it
//! with in-process requests. Aggregates are rebuilt from the store before
//! the router is handed out, matching startup behavior.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use earshot_common::db::init_database;
use earshot_common::db::models::{EndReason, PlayEvent};
use earshot_common::time;
use earshot_ft::aggregate::Aggregator;
use earshot_ft::api::{create_router, AppState};
use earshot_ft::source::Snapshot;
use earshot_ft::store::{EventOp, EventStore};
use earshot_ft::{SharedState, TrackerParams};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tower::util::ServiceExt; // for `oneshot` method
use uuid::Uuid;

// Hour-aligned so heatmap buckets are predictable
const T0: i64 = (1_700_000_000 / 3600) * 3600;

/// Test helper: build a router over a freshly seeded database
async fn setup_app(name: &str) -> (axum::Router, String) {
    let db_path = format!("/tmp/earshot-test-api-{}-{}.db", name, std::process::id());
    let _ = std::fs::remove_file(&db_path);
    let pool = init_database(Path::new(&db_path))
        .await
        .expect("Database initialization should succeed");
    let store = EventStore::new(pool);
    seed_history(&store).await;

    let params = TrackerParams::default();
    let mut aggregator = Aggregator::new(&params);
    aggregator
        .rebuild(&store)
        .await
        .expect("Aggregate rebuild should succeed");
    let state = Arc::new(SharedState::new(aggregator));

    let app = create_router(AppState {
        store,
        state,
        params,
    });
    (app, db_path)
}

fn catalog_snapshot(
    friend: (&str, &str),
    track: (&str, &str),
    artist: (&str, &str),
    observed_secs: i64,
) -> Snapshot {
    Snapshot {
        friend_id: friend.0.to_string(),
        observed_at: time::from_unix_seconds(observed_secs),
        track_id: track.0.to_string(),
        artist_id: artist.0.to_string(),
        context_id: None,
        friend_name: friend.1.to_string(),
        friend_image_url: None,
        track_name: track.1.to_string(),
        artist_name: artist.1.to_string(),
        album_id: None,
        album_name: None,
        track_image_url: None,
    }
}

fn event(
    friend: &str,
    track: &str,
    artist: &str,
    started_secs: i64,
    ended: Option<(i64, EndReason)>,
) -> PlayEvent {
    PlayEvent {
        event_id: Uuid::new_v4(),
        friend_id: friend.to_string(),
        track_id: track.to_string(),
        artist_id: artist.to_string(),
        context_id: None,
        started_at: time::from_unix_seconds(started_secs),
        ended_at: ended.map(|(secs, _)| time::from_unix_seconds(secs)),
        end_reason: ended.map(|(_, reason)| reason),
        last_seen_at: time::from_unix_seconds(started_secs),
    }
}

/// Three closed plays plus one still-open one, across two friends.
async fn seed_history(store: &EventStore) {
    let alice = ("alice", "Alice");
    let bob = ("bob", "Bob");
    let t1 = ("t1", "Track One");
    let t2 = ("t2", "Track Two");
    let x = ("x", "Artist X");
    let y = ("y", "Artist Y");

    let snapshots = vec![
        catalog_snapshot(alice, t1, x, T0),
        catalog_snapshot(alice, t2, y, T0 + 600),
        catalog_snapshot(bob, t1, x, T0 + 3600),
        catalog_snapshot(alice, t1, x, T0 + 7200),
    ];

    let closed = [
        event("alice", "t1", "x", T0, Some((T0 + 300, EndReason::TrackChange))),
        event("alice", "t2", "y", T0 + 600, Some((T0 + 900, EndReason::TrackChange))),
        event("bob", "t1", "x", T0 + 3600, Some((T0 + 4000, EndReason::Idle))),
    ];
    let mut ops = Vec::new();
    for event in &closed {
        let mut open = event.clone();
        open.ended_at = None;
        open.end_reason = None;
        ops.push(EventOp::Open(open));
        ops.push(EventOp::Close(event.clone()));
    }
    ops.push(EventOp::Open(event("alice", "t1", "x", T0 + 7200, None)));

    store
        .apply_batch(&snapshots, &ops)
        .await
        .expect("Seed batch should apply");
}

/// Test helper: create a request with an empty body
fn test_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Test helper: extract JSON body from a response
async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

// =============================================================================
// Health Endpoint
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (app, db_path) = setup_app("health").await;

    let response = app.oneshot(test_request("GET", "/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "earshot-ft");
    assert!(body["version"].is_string());

    let _ = std::fs::remove_file(&db_path);
}

// =============================================================================
// Aggregate Queries
// =============================================================================

#[tokio::test]
async fn test_heatmap_global_and_per_friend() {
    let (app, db_path) = setup_app("heatmap").await;

    let response = app
        .clone()
        .oneshot(test_request("GET", "/api/v1/heatmap"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    let hours = body["hours"].as_array().unwrap();
    assert_eq!(hours.len(), 24);
    let total: u64 = hours.iter().map(|h| h.as_u64().unwrap()).sum();
    assert_eq!(total, 3);

    let response = app
        .oneshot(test_request("GET", "/api/v1/heatmap?friend_id=alice"))
        .await
        .unwrap();
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["friend_id"], "alice");
    let total: u64 = body["hours"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h.as_u64().unwrap())
        .sum();
    assert_eq!(total, 2);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_heatmap_rejects_bad_timestamp() {
    let (app, db_path) = setup_app("heatmap-bad-ts").await;

    let response = app
        .oneshot(test_request("GET", "/api/v1/heatmap?from=yesterday"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_top_artists_resolves_names() {
    let (app, db_path) = setup_app("top-artists").await;

    let response = app
        .clone()
        .oneshot(test_request("GET", "/api/v1/top/artists"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["id"], "x");
    assert_eq!(entries[0]["name"], "Artist X");
    assert_eq!(entries[0]["count"], 2);
    assert_eq!(entries[1]["id"], "y");
    assert_eq!(entries[1]["count"], 1);

    // n caps the list
    let response = app
        .oneshot(test_request("GET", "/api/v1/top/artists?n=1"))
        .await
        .unwrap();
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_top_tracks_per_friend() {
    let (app, db_path) = setup_app("top-tracks").await;

    let response = app
        .oneshot(test_request("GET", "/api/v1/top/tracks?friend_id=bob"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["friend_id"], "bob");
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["id"], "t1");
    assert_eq!(entries[0]["name"], "Track One");
    assert_eq!(entries[0]["count"], 1);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_trend_by_dimension() {
    let (app, db_path) = setup_app("trend").await;

    let response = app
        .clone()
        .oneshot(test_request("GET", "/api/v1/trend?dimension=artist&key=x"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["dimension"], "artist");
    assert_eq!(body["key"], "x");
    assert_eq!(body["count"], 2);

    // The global hourly dimension needs no key
    let response = app
        .clone()
        .oneshot(test_request("GET", "/api/v1/trend?dimension=hour_of_day"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["count"], 3);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_trend_validation_errors() {
    let (app, db_path) = setup_app("trend-errors").await;

    let response = app
        .clone()
        .oneshot(test_request("GET", "/api/v1/trend?dimension=genre&key=rock"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Entity dimensions require a key
    let response = app
        .oneshot(test_request("GET", "/api/v1/trend?dimension=artist"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let _ = std::fs::remove_file(&db_path);
}

// =============================================================================
// Event Queries
// =============================================================================

#[tokio::test]
async fn test_timeline_newest_first_with_names() {
    let (app, db_path) = setup_app("timeline").await;

    let response = app
        .clone()
        .oneshot(test_request("GET", "/api/v1/timeline"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 4);

    // Newest first: the still-open play leads
    assert_eq!(events[0]["friend_name"], "Alice");
    assert_eq!(events[0]["track_name"], "Track One");
    assert_eq!(events[0]["artist_name"], "Artist X");
    assert!(events[0]["ended_at"].is_null());
    assert!(events[0]["end_reason"].is_null());
    assert_eq!(events[1]["friend_name"], "Bob");
    assert_eq!(events[1]["end_reason"], "idle");
    assert_eq!(events[3]["end_reason"], "track_change");

    // Limit truncates
    let response = app
        .clone()
        .oneshot(test_request("GET", "/api/v1/timeline?limit=2"))
        .await
        .unwrap();
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["events"].as_array().unwrap().len(), 2);

    // Friend filter
    let response = app
        .oneshot(test_request("GET", "/api/v1/timeline?friend_id=bob"))
        .await
        .unwrap();
    let body = extract_json(response.into_body()).await;
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["friend_id"], "bob");

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_friends_listing() {
    let (app, db_path) = setup_app("friends").await;

    let response = app.oneshot(test_request("GET", "/api/v1/friends")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    let friends = body["friends"].as_array().unwrap();
    assert_eq!(friends.len(), 2);

    // Most recently seen first
    assert_eq!(friends[0]["friend_id"], "alice");
    assert_eq!(friends[0]["name"], "Alice");
    assert_eq!(friends[1]["friend_id"], "bob");
    assert_eq!(friends[1]["name"], "Bob");

    let _ = std::fs::remove_file(&db_path);
}

// =============================================================================
// Operational Endpoints
// =============================================================================

#[tokio::test]
async fn test_status_reports_counts_and_staleness() {
    let (app, db_path) = setup_app("status").await;

    let response = app.oneshot(test_request("GET", "/api/v1/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;

    // No pipeline has run, so the feed reads stale but not halted
    assert_eq!(body["stale"], true);
    assert!(body["stale_since"].is_string());
    assert_eq!(body["halted"], false);
    assert_eq!(body["event_count"], 4);
    assert_eq!(body["friend_count"], 2);
    assert_eq!(body["aggregated_events"], 3);
    assert_eq!(body["poll_interval_secs"], 180);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_rebuild_endpoint_replays_store() {
    let (app, db_path) = setup_app("rebuild").await;

    let response = app
        .oneshot(test_request("POST", "/api/v1/aggregates/rebuild"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "rebuilt");
    assert_eq!(body["events_applied"], 3);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, db_path) = setup_app("not-found").await;

    let response = app
        .oneshot(test_request("GET", "/api/v1/playlists"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let _ = std::fs::remove_file(&db_path);
}
