use thiserror::Error;
use uuid::Uuid;

use crate::host::HostError;
use crate::task::TaskStatus;

/// Failure of a queue manager operation.
///
/// Missing tasks and invalid transitions are not errors; they come back as
/// `None` or `false`. Only the store can fail.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Another task is already executing.
    #[error("another task is already running")]
    Busy,

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("task {id} is {status} and cannot be run")]
    NotRunnable { id: Uuid, status: TaskStatus },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Host(#[from] HostError),
}

/// Failure to rebuild a request from stored parameters.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no valid init images found for img2img task")]
    MissingInitImages,

    #[error("stored parameters do not fit a generation request: {0}")]
    InvalidParams(#[from] serde_json::Error),

    #[error("display info is missing fields: {}", missing.join(", "))]
    InvalidDisplayInfo { missing: Vec<&'static str> },
}
