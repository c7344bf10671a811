//! Saved task templates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::script_args::ScriptArg;
use crate::task::{CaptureFormat, Params, Task, TaskType};

/// A named, detached snapshot of a task's inputs. Has no status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: Uuid,
    pub name: String,
    pub task_type: TaskType,
    pub created_at: DateTime<Utc>,
    pub params: Params,
    pub checkpoint: String,
    pub script_args: Vec<ScriptArg>,
    /// How `params` were captured; queued copies restore with the same strategy.
    #[serde(default)]
    pub capture_format: CaptureFormat,
}

impl Bookmark {
    pub fn new(
        name: impl Into<String>,
        task_type: TaskType,
        params: Params,
        checkpoint: impl Into<String>,
        script_args: Vec<ScriptArg>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_type,
            created_at: Utc::now(),
            params,
            checkpoint: checkpoint.into(),
            script_args,
            capture_format: CaptureFormat::Legacy,
        }
    }

    /// Snapshot the inputs of `task`. Falls back to the task's display name.
    pub fn from_task(task: &Task, name: Option<String>) -> Self {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| task.display_name());
        Self {
            capture_format: task.capture_format,
            ..Self::new(
                name,
                task.task_type,
                task.params.clone(),
                task.checkpoint.clone(),
                task.script_args.clone(),
            )
        }
    }
}

/// Partial update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarkUpdate {
    pub name: Option<String>,
    pub params: Option<Params>,
    pub checkpoint: Option<String>,
    pub script_args: Option<Vec<ScriptArg>>,
}

impl BookmarkUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.params.is_none() && self.checkpoint.is_none() && self.script_args.is_none()
    }

    pub fn apply(self, bookmark: &mut Bookmark) {
        if let Some(name) = self.name {
            bookmark.name = name;
        }
        if let Some(params) = self.params {
            bookmark.params = params;
        }
        if let Some(checkpoint) = self.checkpoint {
            bookmark.checkpoint = checkpoint;
        }
        if let Some(script_args) = self.script_args {
            bookmark.script_args = script_args;
        }
    }
}
