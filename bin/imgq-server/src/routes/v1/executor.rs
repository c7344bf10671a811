//! Executor control: start, stop, pause, resume, status.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use imgq_core::ExecutorStatus;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::control::ControlResponse;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(start, stop, pause, resume, status),
    components(schemas(ControlResponse))
)]
pub struct ExecutorApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/executor/start", post(start))
        .route("/executor/stop", post(stop))
        .route("/executor/pause", post(pause))
        .route("/executor/resume", post(resume))
        .route("/executor/status", get(status))
}

#[utoipa::path(
    post,
    path = "/v1/executor/start",
    tag = "executor",
    responses((status = 200, description = "Outcome", body = ControlResponse))
)]
pub async fn start(State(state): State<Arc<AppState>>) -> Json<ControlResponse> {
    Json(if state.executor.start() {
        ControlResponse::ok("queue processing started")
    } else {
        ControlResponse::refused("already running")
    })
}

#[utoipa::path(
    post,
    path = "/v1/executor/stop",
    tag = "executor",
    responses((status = 200, description = "Outcome", body = ControlResponse))
)]
pub async fn stop(State(state): State<Arc<AppState>>) -> Json<ControlResponse> {
    Json(if state.executor.stop().await {
        ControlResponse::ok("stopping")
    } else {
        ControlResponse::refused("not running")
    })
}

/// Toggles: pauses a running executor, resumes a paused one.
#[utoipa::path(
    post,
    path = "/v1/executor/pause",
    tag = "executor",
    responses((status = 200, description = "Outcome", body = ControlResponse))
)]
pub async fn pause(State(state): State<Arc<AppState>>) -> Json<ControlResponse> {
    if state.executor.is_paused() {
        state.executor.resume();
        return Json(ControlResponse::ok("resumed"));
    }
    state.executor.pause().await;
    let text = state.executor.subscribe_status().borrow().clone();
    Json(ControlResponse::ok(text))
}

#[utoipa::path(
    post,
    path = "/v1/executor/resume",
    tag = "executor",
    responses((status = 200, description = "Outcome", body = ControlResponse))
)]
pub async fn resume(State(state): State<Arc<AppState>>) -> Json<ControlResponse> {
    if !state.executor.is_paused() {
        return Json(ControlResponse::refused("not paused"));
    }
    state.executor.resume();
    Json(ControlResponse::ok("resumed"))
}

#[utoipa::path(
    get,
    path = "/v1/executor/status",
    tag = "executor",
    responses((status = 200, description = "Executor flags, current task and queue counts", body = Object))
)]
pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<ExecutorStatus>, ServerError> {
    Ok(Json(state.executor.get_status().await?))
}
