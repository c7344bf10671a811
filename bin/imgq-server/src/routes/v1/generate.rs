//! Direct generation and the "queue the next generate" intercept slot.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use imgq_core::TaskType;
use tracing::info;
use utoipa::OpenApi;
use validator::Validate;

use super::queue::capture_and_add;
use crate::error::ServerError;
use crate::schemas::v1::control::ControlResponse;
use crate::schemas::v1::generate::{GenerateResponse, InterceptResponse};
use crate::schemas::v1::queue::QueueRequest;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(arm_intercept, intercept_status, clear_intercept, generate),
    components(schemas(GenerateResponse, InterceptResponse, ControlResponse))
)]
pub struct GenerateApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/intercept", axum::routing::get(intercept_status).delete(clear_intercept))
        .route("/intercept/{tab}", post(arm_intercept))
        .route("/generate/{tab}", post(generate))
}

#[utoipa::path(
    post,
    path = "/v1/intercept/{tab}",
    tag = "generate",
    params(("tab" = String, Path, description = "`txt2img` or `img2img`")),
    responses((status = 200, description = "Slot armed", body = ControlResponse))
)]
pub async fn arm_intercept(
    State(state): State<Arc<AppState>>,
    Path(tab): Path<TaskType>,
) -> Json<ControlResponse> {
    state.intercept.arm(tab);
    Json(ControlResponse::ok(format!("next {tab} generate will be queued")))
}

#[utoipa::path(
    get,
    path = "/v1/intercept",
    tag = "generate",
    responses((status = 200, description = "Slot state", body = InterceptResponse))
)]
pub async fn intercept_status(State(state): State<Arc<AppState>>) -> Json<InterceptResponse> {
    let view = state.intercept.peek();
    Json(InterceptResponse {
        active: view.active,
        tab: view.tab.map(|t| t.as_str().to_owned()),
        last_result: state.intercept.take_last_result(),
    })
}

#[utoipa::path(
    delete,
    path = "/v1/intercept",
    tag = "generate",
    responses((status = 200, description = "Slot cleared", body = ControlResponse))
)]
pub async fn clear_intercept(State(state): State<Arc<AppState>>) -> Json<ControlResponse> {
    state.intercept.clear();
    Json(ControlResponse::ok("intercept cleared"))
}

/// Generate now, or queue the request when the slot is armed for this tab.
#[utoipa::path(
    post,
    path = "/v1/generate/{tab}",
    tag = "generate",
    params(("tab" = String, Path, description = "`txt2img` or `img2img`")),
    request_body = QueueRequest,
    responses(
        (status = 200, description = "Images, or the id of the queued task", body = GenerateResponse),
        (status = 400, description = "Invalid parameters"),
        (status = 502, description = "Host failed"),
    )
)]
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Path(tab): Path<TaskType>,
    Json(body): Json<QueueRequest>,
) -> Result<Json<GenerateResponse>, ServerError> {
    body.validate()?;
    let name = body.name.clone();
    let request = body.into_request(tab);
    if tab == TaskType::Img2Img && request.init_images.is_empty() {
        return Err(ServerError::BadRequest("img2img needs at least one init image".into()));
    }

    if state.intercept.take(tab) {
        let task = capture_and_add(&state, request, name).await?;
        let message = format!("queued: {}", task.display_name());
        state.intercept.set_last_result(message.clone());
        info!(task_id = %task.id, tab = %tab, "generate intercepted");
        return Ok(Json(GenerateResponse {
            queued: true,
            task_id: Some(task.id),
            images: Vec::new(),
            info: None,
            message,
        }));
    }

    let generated = state.host.call(move |host| host.generate(request)).await??;
    let count = generated.images.len();
    Ok(Json(GenerateResponse {
        queued: false,
        task_id: None,
        images: generated.images,
        info: Some(generated.info),
        message: format!("generated {count} image(s)"),
    }))
}
