//! Queue endpoints: enqueue, inspect and rearrange tasks.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use imgq_core::capture::{HostSnapshot, capture_strategy_for};
use imgq_core::{Bookmark, CaptureFormat, Detail, GenerationRequest, Task, TaskStatus, TaskType};
use tracing::info;
use utoipa::OpenApi;
use uuid::Uuid;
use validator::Validate;

use crate::error::ServerError;
use crate::schemas::v1::bookmark::BookmarkTaskRequest;
use crate::schemas::v1::control::ControlResponse;
use crate::schemas::v1::queue::{ClearResponse, PriorityRequest, QueueRequest, RenameTaskRequest, TaskSummary};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        queue_txt2img, queue_img2img, list_queue, get_task, rename_task, delete_task, cancel_task,
        retry_task, run_task, move_up, move_down, bookmark_task, set_priority, clear_queue
    ),
    components(schemas(
        QueueRequest, TaskSummary, RenameTaskRequest, PriorityRequest, ClearResponse, ControlResponse,
        BookmarkTaskRequest
    ))
)]
pub struct QueueApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/queue", get(list_queue))
        .route("/queue/txt2img", post(queue_txt2img))
        .route("/queue/img2img", post(queue_img2img))
        .route("/queue/clear", post(clear_queue))
        .route("/queue/{id}", get(get_task).patch(rename_task).delete(delete_task))
        .route("/queue/{id}/cancel", post(cancel_task))
        .route("/queue/{id}/retry", post(retry_task))
        .route("/queue/{id}/run", post(run_task))
        .route("/queue/{id}/move-up", post(move_up))
        .route("/queue/{id}/move-down", post(move_down))
        .route("/queue/{id}/bookmark", post(bookmark_task))
        .route("/queue/{id}/priority", put(set_priority))
}

/// Capture `request` against the live host and queue it.
pub(crate) async fn capture_and_add(
    state: &AppState,
    request: GenerationRequest,
    name: Option<String>,
) -> Result<Task, ServerError> {
    let task_type = request.task_type();
    let snapshot = state.host.call(move |host| HostSnapshot::read(host, task_type)).await?;
    let format = if state.config.dynamic_capture { CaptureFormat::Dynamic } else { CaptureFormat::Legacy };
    let captured = capture_strategy_for(format).capture(&request, &snapshot, &state.config.skip_scripts);
    let task = state.queue.add_captured(captured, name).await?;
    info!(task_id = %task.id, format = %format, "queued generation request");
    Ok(task)
}

async fn enqueue(state: &AppState, tab: TaskType, body: QueueRequest) -> Result<Json<Task>, ServerError> {
    body.validate()?;
    let name = body.name.clone();
    let request = body.into_request(tab);
    if tab == TaskType::Img2Img && request.init_images.is_empty() {
        return Err(ServerError::BadRequest("img2img needs at least one init image".into()));
    }
    Ok(Json(capture_and_add(state, request, name).await?))
}

#[utoipa::path(
    post,
    path = "/v1/queue/txt2img",
    tag = "queue",
    request_body = QueueRequest,
    responses(
        (status = 200, description = "Task queued", body = Object),
        (status = 400, description = "Invalid parameters"),
    )
)]
pub async fn queue_txt2img(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueueRequest>,
) -> Result<Json<Task>, ServerError> {
    enqueue(&state, TaskType::Txt2Img, body).await
}

#[utoipa::path(
    post,
    path = "/v1/queue/img2img",
    tag = "queue",
    request_body = QueueRequest,
    responses(
        (status = 200, description = "Task queued", body = Object),
        (status = 400, description = "Invalid parameters or no init images"),
    )
)]
pub async fn queue_img2img(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueueRequest>,
) -> Result<Json<Task>, ServerError> {
    enqueue(&state, TaskType::Img2Img, body).await
}

#[utoipa::path(
    get,
    path = "/v1/queue",
    tag = "queue",
    responses((status = 200, description = "Tasks in display order", body = [TaskSummary]))
)]
pub async fn list_queue(State(state): State<Arc<AppState>>) -> Result<Json<Vec<TaskSummary>>, ServerError> {
    let tasks = state.queue.list_tasks().await?;
    Ok(Json(tasks.iter().map(TaskSummary::from).collect()))
}

#[utoipa::path(
    get,
    path = "/v1/queue/{id}",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Full task", body = Object),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ServerError> {
    state
        .queue
        .get_task(id, Detail::Full)
        .await?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))
}

#[utoipa::path(
    patch,
    path = "/v1/queue/{id}",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Task id")),
    request_body = RenameTaskRequest,
    responses(
        (status = 200, description = "Renamed task", body = Object),
        (status = 400, description = "Name too long"),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn rename_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<RenameTaskRequest>,
) -> Result<Json<Task>, ServerError> {
    body.validate()?;
    let task = state
        .queue
        .rename_task(id, body.name)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
    info!(task_id = %id, name = %task.display_name(), "task renamed");
    Ok(Json(task))
}

#[utoipa::path(
    delete,
    path = "/v1/queue/{id}",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Deleted", body = ControlResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task is running"),
    )
)]
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, ServerError> {
    let task = state
        .queue
        .get_task(id, Detail::Shallow)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
    if task.status == TaskStatus::Running {
        return Err(ServerError::Conflict("stop the task before deleting it".into()));
    }
    state.queue.delete(id).await?;
    Ok(Json(ControlResponse::ok(format!("deleted {}", task.display_name()))))
}

#[utoipa::path(
    post,
    path = "/v1/queue/{id}/cancel",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Task id")),
    responses((status = 200, description = "Outcome", body = ControlResponse))
)]
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, ServerError> {
    Ok(Json(if state.queue.cancel(id).await? {
        ControlResponse::ok("task cancelled")
    } else {
        ControlResponse::refused("only pending tasks can be cancelled")
    }))
}

#[utoipa::path(
    post,
    path = "/v1/queue/{id}/retry",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "The new pending copy", body = Object),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ServerError> {
    state
        .queue
        .retry(id)
        .await?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))
}

#[utoipa::path(
    post,
    path = "/v1/queue/{id}/run",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task started", body = ControlResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Another task is running, or this one is not pending or paused"),
    )
)]
pub async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, ServerError> {
    state.executor.run_single_task(id).await?;
    Ok(Json(ControlResponse::ok("task started")))
}

#[utoipa::path(
    post,
    path = "/v1/queue/{id}/move-up",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Task id")),
    responses((status = 200, description = "Outcome", body = ControlResponse))
)]
pub async fn move_up(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, ServerError> {
    Ok(Json(if state.queue.move_up(id).await? {
        ControlResponse::ok("moved up")
    } else {
        ControlResponse::refused("already first or not found")
    }))
}

#[utoipa::path(
    post,
    path = "/v1/queue/{id}/move-down",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Task id")),
    responses((status = 200, description = "Outcome", body = ControlResponse))
)]
pub async fn move_down(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, ServerError> {
    Ok(Json(if state.queue.move_down(id).await? {
        ControlResponse::ok("moved down")
    } else {
        ControlResponse::refused("task not found")
    }))
}

#[utoipa::path(
    post,
    path = "/v1/queue/{id}/bookmark",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Task id")),
    request_body(content = BookmarkTaskRequest, description = "Optional bookmark name"),
    responses(
        (status = 200, description = "Bookmark created", body = Object),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn bookmark_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<BookmarkTaskRequest>>,
) -> Result<Json<Bookmark>, ServerError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    body.validate()?;
    state
        .queue
        .bookmark_task(id, body.name)
        .await?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))
}

#[utoipa::path(
    put,
    path = "/v1/queue/{id}/priority",
    tag = "queue",
    params(("id" = Uuid, Path, description = "Task id")),
    request_body = PriorityRequest,
    responses(
        (status = 200, description = "Outcome", body = ControlResponse),
        (status = 400, description = "Negative priority"),
    )
)]
pub async fn set_priority(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<PriorityRequest>,
) -> Result<Json<ControlResponse>, ServerError> {
    body.validate()?;
    Ok(Json(if state.queue.reorder(id, body.priority).await? {
        ControlResponse::ok(format!("priority set to {}", body.priority))
    } else {
        ControlResponse::refused("task not found")
    }))
}

#[utoipa::path(
    post,
    path = "/v1/queue/clear",
    tag = "queue",
    responses((status = 200, description = "Finished tasks removed", body = ClearResponse))
)]
pub async fn clear_queue(State(state): State<Arc<AppState>>) -> Result<Json<ClearResponse>, ServerError> {
    let removed = state.queue.clear_completed().await?;
    Ok(Json(ClearResponse { success: true, removed }))
}
