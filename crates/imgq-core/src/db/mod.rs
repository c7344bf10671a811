//! Persistence layer.
//!
//! [`TaskStore`] and [`BookmarkStore`] define everything the queue needs
//! from durable storage. The default implementation is
//! [`sqlite::SqliteStore`]. To move to another database, implement both
//! traits for a new type and swap the concrete type held by
//! [`crate::queue::QueueManager`].
//!
//! All trait methods use `impl Future` in their signatures so no extra
//! `async-trait` crate is required.
//!
//! A missing row is never an error: lookups return `None` and mutations
//! return `false` (or a zero count).

pub mod sqlite;

use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bookmark::{Bookmark, BookmarkUpdate};
use crate::task::{Task, TaskStatus};

/// How much of a task row to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detail {
    /// Everything except `script_args`, which is left empty. For lists and
    /// status polling.
    Shallow,
    /// Every column, for execution and detail views.
    Full,
}

/// Task counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub stopped: u64,
    pub paused: u64,
    pub total: u64,
}

impl QueueStats {
    pub(crate) fn record(&mut self, status: TaskStatus, count: u64) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Cancelled => &mut self.cancelled,
            TaskStatus::Stopped => &mut self.stopped,
            TaskStatus::Paused => &mut self.paused,
        };
        *slot += count;
        self.total += count;
    }
}

/// Outcome of one execution, written together with the status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskResult {
    pub images: Vec<String>,
    pub info: Option<String>,
    pub error: Option<String>,
    pub completed_iterations: u32,
    pub original_n_iter: u32,
}

/// Durable task table.
pub trait TaskStore: Send + Sync + 'static {
    /// Insert a new row. Fails if the id already exists.
    fn add(&self, task: &Task) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn get(
        &self,
        id: Uuid,
        detail: Detail,
    ) -> impl Future<Output = Result<Option<Task>, sqlx::Error>> + Send;

    /// Every task, shallow, in display order: running, pending, paused, then
    /// terminal tasks newest-finished first. Active tasks follow pickup order.
    fn list_all(&self) -> impl Future<Output = Result<Vec<Task>, sqlx::Error>> + Send;

    /// Pending tasks in pickup order, shallow.
    fn list_pending(&self) -> impl Future<Output = Result<Vec<Task>, sqlx::Error>> + Send;

    /// The pending task with the lowest `(priority, created_at)`.
    fn next_pending(&self) -> impl Future<Output = Result<Option<Task>, sqlx::Error>> + Send;

    /// The most recently started paused task.
    fn next_paused(&self) -> impl Future<Output = Result<Option<Task>, sqlx::Error>> + Send;

    /// Overwrite every column of the row with `task`'s current state.
    fn update(&self, task: &Task) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Atomic status transition.
    ///
    /// Entering `Running` stamps `started_at`; entering a terminal status
    /// stamps `completed_at`. Each stamp is written at most once. `Paused`
    /// stamps nothing.
    fn set_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<&str>,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// `Pending` or `Paused` to `Running`, stamping `started_at` once.
    /// `false` when the row is missing or in any other status.
    fn claim(&self, id: Uuid) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Status transition plus outcome columns in one statement.
    fn record_result(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: &TaskResult,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    fn delete(&self, id: Uuid) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Remove every task in a terminal status; returns how many went.
    fn clear_terminal(&self) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;

    fn stats(&self) -> impl Future<Output = Result<QueueStats, sqlx::Error>> + Send;

    fn reorder(
        &self,
        id: Uuid,
        priority: i64,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Set or clear the display name without touching any other column.
    fn rename(&self, id: Uuid, name: Option<&str>) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Put tasks left `running` by a previous process back to `pending`.
    fn requeue_running(&self) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;
}

/// Durable bookmark table.
pub trait BookmarkStore: Send + Sync + 'static {
    fn add_bookmark(
        &self,
        bookmark: &Bookmark,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn get_bookmark(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Bookmark>, sqlx::Error>> + Send;

    /// Newest first.
    fn list_bookmarks(&self) -> impl Future<Output = Result<Vec<Bookmark>, sqlx::Error>> + Send;

    fn update_bookmark(
        &self,
        id: Uuid,
        update: BookmarkUpdate,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    fn delete_bookmark(&self, id: Uuid) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    fn count_bookmarks(&self) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;
}
