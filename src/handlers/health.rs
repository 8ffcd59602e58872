//! Health check endpoints.
//!
//! Provides endpoints for monitoring server health and readiness.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Server status
    pub status: &'static str,
    /// Server version
    pub version: &'static str,
}

/// Liveness probe - server is running
///
/// GET /health/live
async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub database: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_count: Option<u64>,
    /// Thumbnail jobs waiting to be picked up
    pub pending_thumbnail_jobs: usize,
}

/// Readiness probe - server can accept requests
///
/// GET /health/ready
async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    // Check database connectivity
    let media_count = state.db.media_count().ok();
    let db_ok = media_count.is_some();

    Json(ReadinessResponse {
        status: if db_ok { "ready" } else { "not_ready" },
        database: if db_ok { "connected" } else { "disconnected" },
        media_count,
        pending_thumbnail_jobs: state.queue.pending(&state.config.queue.thumbnail_topic),
    })
}

/// Create health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
}
