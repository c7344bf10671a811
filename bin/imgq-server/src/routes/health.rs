//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::warn;
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health))]
pub struct HealthApi;

/// Register health-check routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Heartbeat endpoint.
///
/// Returns `{"status": "ok", "version": "...", "executor": "...", "pending": n}`
/// with HTTP 200 once the task store answers a query, and HTTP 503 with
/// `"status": "unavailable"` when it cannot be read.
/// Load-balancers and monitoring systems should poll this endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server and task store are healthy", body = Value),
        (status = 503, description = "Task store unreachable", body = Value),
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let version = env!("CARGO_PKG_VERSION");
    match state.queue.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "status":   "ok",
                "version":  version,
                "executor": state.executor.state(),
                "pending":  stats.pending,
                "paused":   stats.paused,
            })),
        ),
        Err(e) => {
            warn!(error = %e, "health check could not read the task store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "version": version })),
            )
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
