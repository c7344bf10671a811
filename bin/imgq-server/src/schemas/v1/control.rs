use serde::Serialize;
use utoipa::ToSchema;

/// Answer to every control operation.
#[derive(Debug, Serialize, ToSchema)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}
