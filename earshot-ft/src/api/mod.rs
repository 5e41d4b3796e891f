//! HTTP API
//!
//! Read-only query surface for the dashboard, plus SSE streaming and one
//! operational endpoint (aggregate rebuild). All routes are nested under
//! `/api/v1`; `/health` sits at the root for probes.

pub mod handlers;
pub mod sse;

use axum::{
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::params::TrackerParams;
use crate::state::SharedState;
use crate::store::EventStore;

/// Shared context for API handlers
#[derive(Clone)]
pub struct AppState {
    pub store: EventStore,
    pub state: Arc<SharedState>,
    pub params: TrackerParams,
}

/// Create the router with all API routes
pub fn create_router(app_state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/heatmap", get(handlers::get_heatmap))
        .route("/top/artists", get(handlers::get_top_artists))
        .route("/top/tracks", get(handlers::get_top_tracks))
        .route("/trend", get(handlers::get_trend))
        .route("/timeline", get(handlers::get_timeline))
        .route("/friends", get(handlers::get_friends))
        .route("/status", get(handlers::get_status))
        .route("/aggregates/rebuild", post(handlers::rebuild_aggregates))
        .route("/events", get(sse::event_stream));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        // Dashboard is served from another origin during development
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "module": "earshot-ft",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
