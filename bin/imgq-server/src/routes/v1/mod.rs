pub mod bookmarks;
pub mod executor;
pub mod generate;
pub mod queue;

use std::sync::Arc;

use axum::Router;
use utoipa::OpenApi;

use crate::state::AppState;

/// Routes nested under `/v1`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(queue::router())
        .merge(executor::router())
        .merge(bookmarks::router())
        .merge(generate::router())
}

#[derive(OpenApi)]
#[openapi()]
pub struct V1Api;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut doc = V1Api::openapi();
    doc.merge(queue::QueueApi::openapi());
    doc.merge(executor::ExecutorApi::openapi());
    doc.merge(bookmarks::BookmarksApi::openapi());
    doc.merge(generate::GenerateApi::openapi());
    doc
}
