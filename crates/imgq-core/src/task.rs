//! Task records: the durable unit of work in the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::script_args::ScriptArg;

/// Opaque generation parameters, stored as a JSON object.
pub type Params = serde_json::Map<String, Value>;

/// Kind of generation a task performs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
pub enum TaskType {
    #[default]
    #[serde(rename = "txt2img")]
    #[strum(serialize = "txt2img")]
    Txt2Img,
    #[serde(rename = "img2img")]
    #[strum(serialize = "img2img")]
    Img2Img,
}

/// Per-task lifecycle status.
///
/// `Pending -> Running -> {Completed | Failed | Cancelled | Stopped | Paused}`;
/// `Paused -> Running` when a checkpointed task is resumed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Stopped,
    Paused,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Statuses that stamp `completed_at` and are removed by a bulk clear.
    pub const TERMINAL: [TaskStatus; 4] = [
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Stopped,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Pending, running or waiting to be resumed.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running | TaskStatus::Paused)
    }
}

/// Which restore strategy rebuilds the request for this task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CaptureFormat {
    /// Explicit field list. Rows written before the column existed read as this.
    #[default]
    Legacy,
    /// Every serialisable attribute of the request.
    Dynamic,
}

impl CaptureFormat {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// One queued generation request with everything needed to reproduce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Lower runs sooner; ties go to the earlier `created_at`.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub params: Params,
    /// Model weights active when the task was queued.
    pub checkpoint: String,
    /// Positional extension arguments.
    pub script_args: Vec<ScriptArg>,
    pub result_images: Vec<String>,
    pub result_info: Option<String>,
    pub error: Option<String>,
    pub name: Option<String>,
    pub completed_iterations: u32,
    pub original_n_iter: u32,
    /// Set on a task created by retry; points at the task it was copied from.
    pub requeued_task_id: Option<Uuid>,
    pub capture_format: CaptureFormat,
}

impl Task {
    /// A fresh pending task with a new id and `created_at = now`.
    pub fn new(task_type: TaskType, params: Params) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            status: TaskStatus::Pending,
            priority: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            params,
            checkpoint: String::new(),
            script_args: Vec::new(),
            result_images: Vec::new(),
            result_info: None,
            error: None,
            name: None,
            completed_iterations: 0,
            original_n_iter: 0,
            requeued_task_id: None,
            capture_format: CaptureFormat::Legacy,
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        self.params.get("prompt").and_then(Value::as_str)
    }

    /// Images per iteration, at least 1.
    pub fn batch_size(&self) -> u32 {
        param_u32(&self.params, "batch_size").unwrap_or(1).max(1)
    }

    /// Requested iterations, at least 1.
    pub fn n_iter(&self) -> u32 {
        param_u32(&self.params, "n_iter").unwrap_or(1).max(1)
    }

    /// Human-readable label: the user's name, else the type and a prompt excerpt.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_owned();
        }
        match self.prompt().filter(|p| !p.is_empty()) {
            Some(prompt) if prompt.chars().count() > 50 => {
                let head: String = prompt.chars().take(47).collect();
                format!("{}: {head}...", self.task_type)
            }
            Some(prompt) => format!("{}: {prompt}", self.task_type),
            None => format!("{} task", self.task_type),
        }
    }

    /// Checkpoint title without the trailing `" [hash]"`.
    pub fn short_checkpoint(&self) -> &str {
        if self.checkpoint.is_empty() {
            return "Unknown";
        }
        self.checkpoint
            .split(" [")
            .next()
            .unwrap_or(&self.checkpoint)
    }
}

pub(crate) fn param_u32(params: &Params, key: &str) -> Option<u32> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}
