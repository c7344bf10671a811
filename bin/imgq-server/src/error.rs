//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body with a
//! matching status code. Internal errors are logged in full and the client
//! only sees a generic message.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use imgq_core::{CaptureError, ExecutorError, HostError, QueueError};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request conflicts with what is currently running.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ExecutorError> for ServerError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Busy => ServerError::Conflict("another task is already running".into()),
            ExecutorError::NotRunnable { id, status } => {
                ServerError::Conflict(format!("task {id} is {status} and cannot be run"))
            }
            ExecutorError::NotFound(id) => ServerError::NotFound(format!("task {id} not found")),
            ExecutorError::Queue(e) => ServerError::Queue(e),
            ExecutorError::Host(e) => ServerError::Host(e),
        }
    }
}

impl From<CaptureError> for ServerError {
    fn from(e: CaptureError) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

impl From<validator::ValidationErrors> for ServerError {
    fn from(e: validator::ValidationErrors) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),

            ServerError::Queue(e) => {
                error!(error = %e, "queue store error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_owned())
            }
            ServerError::Host(e) => {
                error!(error = %e, "generation host error");
                (StatusCode::BAD_GATEWAY, "generation host error".to_owned())
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_owned())
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}
