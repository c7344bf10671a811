use chrono::{DateTime, Utc};
use imgq_core::capture::{DisplayInfo, restore_strategy_for};
use imgq_core::script_args::LiveArg;
use imgq_core::{GenerationRequest, Params, Task, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Body of `POST /v1/queue/{txt2img,img2img}` and `POST /v1/generate/{tab}`.
///
/// Omitted fields take the usual WebUI defaults.
#[derive(Debug, Default, Deserialize, ToSchema, Validate)]
#[serde(default)]
pub struct QueueRequest {
    /// Display name for the queued task.
    #[validate(length(max = 200))]
    pub name: Option<String>,
    pub prompt: String,
    pub negative_prompt: String,
    pub styles: Vec<String>,
    pub seed: Option<i64>,
    pub sampler_name: Option<String>,
    pub scheduler: Option<String>,
    #[validate(range(min = 1, max = 150))]
    pub steps: Option<u32>,
    #[validate(range(min = 1.0, max = 30.0))]
    pub cfg_scale: Option<f64>,
    #[validate(range(min = 64, max = 4096))]
    pub width: Option<u32>,
    #[validate(range(min = 64, max = 4096))]
    pub height: Option<u32>,
    #[validate(range(min = 1, max = 16))]
    pub batch_size: Option<u32>,
    #[validate(range(min = 1, max = 100))]
    pub n_iter: Option<u32>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub denoising_strength: Option<f64>,
    pub enable_hr: bool,
    pub hr_scale: Option<f64>,
    pub hr_upscaler: Option<String>,
    /// Source image paths; required for img2img.
    pub init_images: Vec<String>,
    pub mask_path: Option<String>,
    #[schema(value_type = Object)]
    pub override_settings: Params,
    /// Positional extension arguments.
    #[schema(value_type = Vec<Object>)]
    pub script_args: Vec<Value>,
}

impl QueueRequest {
    /// Build the live request for `tab`. Img2img keeps the source images and
    /// defaults denoising to 0.75; txt2img drops them.
    pub fn into_request(self, tab: TaskType) -> GenerationRequest {
        let d = GenerationRequest::default();
        let mut request = GenerationRequest {
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            styles: self.styles,
            seed: self.seed.unwrap_or(d.seed),
            sampler_name: self.sampler_name.unwrap_or(d.sampler_name),
            scheduler: self.scheduler.unwrap_or(d.scheduler),
            steps: self.steps.unwrap_or(d.steps),
            cfg_scale: self.cfg_scale.unwrap_or(d.cfg_scale),
            width: self.width.unwrap_or(d.width),
            height: self.height.unwrap_or(d.height),
            batch_size: self.batch_size.unwrap_or(d.batch_size),
            n_iter: self.n_iter.unwrap_or(d.n_iter),
            denoising_strength: self.denoising_strength,
            enable_hr: self.enable_hr,
            hr_scale: self.hr_scale.unwrap_or(d.hr_scale),
            hr_upscaler: self.hr_upscaler.unwrap_or(d.hr_upscaler),
            override_settings: self.override_settings,
            script_args: self.script_args.into_iter().map(LiveArg::Json).collect(),
            ..d
        };
        match tab {
            TaskType::Img2Img => {
                request.init_images = self.init_images;
                request.mask_path = self.mask_path;
                request.denoising_strength.get_or_insert(0.75);
            }
            TaskType::Txt2Img => {}
        }
        request
    }
}

/// One row of `GET /v1/queue`.
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskSummary {
    pub id: Uuid,
    #[schema(example = "txt2img")]
    pub task_type: String,
    #[schema(example = "pending")]
    pub status: String,
    pub priority: i64,
    pub display_name: String,
    pub checkpoint: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub image_count: usize,
    pub error: Option<String>,
    pub completed_iterations: u32,
    pub original_n_iter: u32,
    pub requeued_task_id: Option<Uuid>,
    /// Settings worth showing next to the name; absent when the stored
    /// parameters are unreadable.
    #[schema(value_type = Option<Object>)]
    pub display_info: Option<DisplayInfo>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        let display_info = restore_strategy_for(task.capture_format)
            .extract_display_info(&task.params)
            .ok();
        Self {
            id: task.id,
            task_type: task.task_type.as_str().to_owned(),
            status: task.status.as_str().to_owned(),
            priority: task.priority,
            display_name: task.display_name(),
            checkpoint: task.short_checkpoint().to_owned(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            image_count: task.result_images.len(),
            error: task.error.clone(),
            completed_iterations: task.completed_iterations,
            original_n_iter: task.original_n_iter,
            requeued_task_id: task.requeued_task_id,
            display_info,
        }
    }
}

/// Body of `PATCH /v1/queue/{id}`. A missing or blank name clears the label.
#[derive(Debug, Default, Deserialize, ToSchema, Validate)]
#[serde(default)]
pub struct RenameTaskRequest {
    #[validate(length(max = 200))]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct PriorityRequest {
    #[validate(range(min = 0))]
    pub priority: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClearResponse {
    pub success: bool,
    pub removed: u64,
}
