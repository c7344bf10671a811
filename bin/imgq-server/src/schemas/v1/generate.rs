use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// Result of `POST /v1/generate/{tab}`: either images, or the id of the task
/// the request was queued as.
#[derive(Debug, Serialize, ToSchema)]
pub struct GenerateResponse {
    pub queued: bool,
    pub task_id: Option<Uuid>,
    pub images: Vec<String>,
    pub info: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InterceptResponse {
    pub active: bool,
    #[schema(example = "txt2img")]
    pub tab: Option<String>,
    /// Message left by the last intercepted generate, consumed on read.
    pub last_result: Option<String>,
}
