//! Saved parameter sets.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use imgq_core::{Bookmark, Task};
use utoipa::OpenApi;
use uuid::Uuid;
use validator::Validate;

use crate::error::ServerError;
use crate::schemas::v1::bookmark::{CreateBookmarkRequest, UpdateBookmarkRequest};
use crate::schemas::v1::control::ControlResponse;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(list_bookmarks, create_bookmark, get_bookmark, update_bookmark, delete_bookmark, queue_bookmark),
    components(schemas(CreateBookmarkRequest, UpdateBookmarkRequest, ControlResponse))
)]
pub struct BookmarksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookmarks", get(list_bookmarks).post(create_bookmark))
        .route(
            "/bookmarks/{id}",
            get(get_bookmark).patch(update_bookmark).delete(delete_bookmark),
        )
        .route("/bookmarks/{id}/queue", post(queue_bookmark))
}

fn not_found(id: Uuid) -> ServerError {
    ServerError::NotFound(format!("bookmark {id} not found"))
}

#[utoipa::path(
    get,
    path = "/v1/bookmarks",
    tag = "bookmarks",
    responses((status = 200, description = "Bookmarks, newest first", body = [Object]))
)]
pub async fn list_bookmarks(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Bookmark>>, ServerError> {
    Ok(Json(state.queue.list_bookmarks().await?))
}

#[utoipa::path(
    post,
    path = "/v1/bookmarks",
    tag = "bookmarks",
    request_body = CreateBookmarkRequest,
    responses(
        (status = 200, description = "Bookmark saved", body = Object),
        (status = 400, description = "Invalid name"),
    )
)]
pub async fn create_bookmark(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBookmarkRequest>,
) -> Result<Json<Bookmark>, ServerError> {
    body.validate()?;
    let bookmark = state
        .queue
        .save_bookmark(body.name, body.task_type, body.params, body.checkpoint, body.script_args)
        .await?;
    Ok(Json(bookmark))
}

#[utoipa::path(
    get,
    path = "/v1/bookmarks/{id}",
    tag = "bookmarks",
    params(("id" = Uuid, Path, description = "Bookmark id")),
    responses(
        (status = 200, description = "Bookmark", body = Object),
        (status = 404, description = "Bookmark not found"),
    )
)]
pub async fn get_bookmark(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Bookmark>, ServerError> {
    state.queue.get_bookmark(id).await?.map(Json).ok_or_else(|| not_found(id))
}

#[utoipa::path(
    patch,
    path = "/v1/bookmarks/{id}",
    tag = "bookmarks",
    params(("id" = Uuid, Path, description = "Bookmark id")),
    request_body = UpdateBookmarkRequest,
    responses(
        (status = 200, description = "Updated bookmark", body = Object),
        (status = 400, description = "Nothing to update or invalid name"),
        (status = 404, description = "Bookmark not found"),
    )
)]
pub async fn update_bookmark(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateBookmarkRequest>,
) -> Result<Json<Bookmark>, ServerError> {
    body.validate()?;
    let update = body.into_update();
    if update.is_empty() {
        return Err(ServerError::BadRequest("nothing to update".into()));
    }
    if !state.queue.update_bookmark(id, update).await? {
        return Err(not_found(id));
    }
    state.queue.get_bookmark(id).await?.map(Json).ok_or_else(|| not_found(id))
}

#[utoipa::path(
    delete,
    path = "/v1/bookmarks/{id}",
    tag = "bookmarks",
    params(("id" = Uuid, Path, description = "Bookmark id")),
    responses((status = 200, description = "Outcome", body = ControlResponse))
)]
pub async fn delete_bookmark(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ControlResponse>, ServerError> {
    Ok(Json(if state.queue.delete_bookmark(id).await? {
        ControlResponse::ok("bookmark deleted")
    } else {
        ControlResponse::refused("bookmark not found")
    }))
}

#[utoipa::path(
    post,
    path = "/v1/bookmarks/{id}/queue",
    tag = "bookmarks",
    params(("id" = Uuid, Path, description = "Bookmark id")),
    responses(
        (status = 200, description = "New pending task", body = Object),
        (status = 404, description = "Bookmark not found"),
    )
)]
pub async fn queue_bookmark(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ServerError> {
    state.queue.queue_bookmark(id).await?.map(Json).ok_or_else(|| not_found(id))
}
