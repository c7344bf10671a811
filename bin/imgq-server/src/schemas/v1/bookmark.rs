use imgq_core::script_args::ScriptArg;
use imgq_core::{BookmarkUpdate, Params, TaskType};
use serde::Deserialize;
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateBookmarkRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[schema(value_type = String, example = "txt2img")]
    pub task_type: TaskType,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub params: Params,
    #[serde(default)]
    pub checkpoint: String,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub script_args: Vec<ScriptArg>,
}

#[derive(Debug, Default, Deserialize, ToSchema, Validate)]
pub struct UpdateBookmarkRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub params: Option<Params>,
    pub checkpoint: Option<String>,
    #[schema(value_type = Option<Vec<Object>>)]
    pub script_args: Option<Vec<ScriptArg>>,
}

impl UpdateBookmarkRequest {
    pub fn into_update(self) -> BookmarkUpdate {
        BookmarkUpdate {
            name: self.name,
            params: self.params,
            checkpoint: self.checkpoint,
            script_args: self.script_args,
        }
    }
}

/// Optional name for a bookmark made from a task.
#[derive(Debug, Default, Deserialize, ToSchema, Validate)]
pub struct BookmarkTaskRequest {
    #[validate(length(max = 200))]
    pub name: Option<String>,
}
