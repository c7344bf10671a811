//! Queue manager: the one entry point for task and bookmark changes.
//!
//! Every state-changing call persists through the store and then notifies
//! subscribers synchronously with the event and the affected task. A
//! panicking subscriber is logged and skipped; it never fails the operation
//! or starves the other subscribers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use strum::{Display, IntoStaticStr};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bookmark::{Bookmark, BookmarkUpdate};
use crate::capture::Captured;
use crate::db::sqlite::SqliteStore;
use crate::db::{BookmarkStore, Detail, QueueStats, TaskResult, TaskStore};
use crate::error::QueueError;
use crate::host::thread::panic_message;
use crate::script_args::ScriptArg;
use crate::task::{Params, Task, TaskStatus, TaskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueEvent {
    TaskAdded,
    TaskUpdated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskStopped,
    TaskPaused,
    TaskDeleted,
    TasksCleared,
    TaskReordered,
    BookmarkAdded,
    BookmarkUpdated,
    BookmarkDeleted,
}

pub type Subscriber = Arc<dyn Fn(QueueEvent, Option<&Task>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Shared handle; clones see the same store and subscribers.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: SqliteStore,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager").field("store", &self.inner.store).finish_non_exhaustive()
    }
}

impl QueueManager {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                subscribers: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    fn store(&self) -> &SqliteStore {
        &self.inner.store
    }

    // ── subscribers ───────────────────────────────────────────────────────────

    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(QueueEvent, Option<&Task>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers_mut().push((id, Arc::new(f)));
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers_mut();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    fn notify(&self, event: QueueEvent, task: Option<&Task>) {
        // Snapshot so subscribers may (un)subscribe without deadlocking.
        let subs: Vec<Subscriber> = match self.inner.subscribers.read() {
            Ok(guard) => guard.iter().map(|(_, f)| Arc::clone(f)).collect(),
            Err(poisoned) => poisoned.get_ref().iter().map(|(_, f)| Arc::clone(f)).collect(),
        };
        debug!(event = %event, task_id = ?task.map(|t| t.id), subscribers = subs.len(), "queue event");
        for sub in subs {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sub(event, task))) {
                error!(event = %event, panic = %panic_message(payload.as_ref()), "queue subscriber panicked");
            }
        }
    }

    fn subscribers_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(SubscriptionId, Subscriber)>> {
        self.inner.subscribers.write().unwrap_or_else(|p| p.into_inner())
    }

    // ── reads ─────────────────────────────────────────────────────────────────

    pub async fn get_task(&self, id: Uuid, detail: Detail) -> Result<Option<Task>, QueueError> {
        Ok(self.store().get(id, detail).await?)
    }

    /// Every task in display order, shallow.
    pub async fn list_tasks(&self) -> Result<Vec<Task>, QueueError> {
        Ok(self.store().list_all().await?)
    }

    pub async fn pending_tasks(&self) -> Result<Vec<Task>, QueueError> {
        Ok(self.store().list_pending().await?)
    }

    pub async fn next_pending(&self) -> Result<Option<Task>, QueueError> {
        Ok(self.store().next_pending().await?)
    }

    pub async fn next_paused(&self) -> Result<Option<Task>, QueueError> {
        Ok(self.store().next_paused().await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store().stats().await?)
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    /// Queue a new pending task captured in the fixed-field format.
    pub async fn add_task(
        &self,
        task_type: TaskType,
        params: Params,
        checkpoint: impl Into<String>,
        script_args: Vec<ScriptArg>,
        name: Option<String>,
    ) -> Result<Task, QueueError> {
        let mut task = Task::new(task_type, params);
        task.checkpoint = checkpoint.into();
        task.script_args = script_args;
        task.name = name.filter(|n| !n.trim().is_empty());
        self.insert(task).await
    }

    /// Queue the result of a capture, keeping its format.
    pub async fn add_captured(&self, captured: Captured, name: Option<String>) -> Result<Task, QueueError> {
        let mut task = Task::new(captured.task_type, captured.params);
        task.checkpoint = captured.checkpoint;
        task.script_args = captured.script_args;
        task.capture_format = captured.capture_format;
        task.name = name.filter(|n| !n.trim().is_empty());
        self.insert(task).await
    }

    async fn insert(&self, task: Task) -> Result<Task, QueueError> {
        self.store().add(&task).await?;
        info!(task_id = %task.id, task_type = %task.task_type, name = %task.display_name(), "task added");
        self.notify(QueueEvent::TaskAdded, Some(&task));
        Ok(task)
    }

    /// Label a task, or clear its label with `None` or a blank name.
    pub async fn rename_task(&self, id: Uuid, name: Option<String>) -> Result<Option<Task>, QueueError> {
        let name = name.map(|n| n.trim().to_owned()).filter(|n| !n.is_empty());
        if !self.store().rename(id, name.as_deref()).await? {
            return Ok(None);
        }
        let task = self.store().get(id, Detail::Full).await?;
        self.notify(QueueEvent::TaskUpdated, task.as_ref());
        Ok(task)
    }

    /// Cancel a task that has not started. Anything else returns `false`.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, QueueError> {
        let Some(task) = self.store().get(id, Detail::Shallow).await? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            debug!(task_id = %id, status = %task.status, "only pending tasks can be cancelled");
            return Ok(false);
        }
        self.transition(id, TaskStatus::Cancelled, None, QueueEvent::TaskCancelled).await
    }

    /// Queue a fresh copy of any task. The original is left untouched.
    pub async fn retry(&self, id: Uuid) -> Result<Option<Task>, QueueError> {
        let Some(original) = self.store().get(id, Detail::Full).await? else {
            return Ok(None);
        };
        let mut copy = Task::new(original.task_type, original.params.clone());
        copy.checkpoint = original.checkpoint.clone();
        copy.script_args = original.script_args.clone();
        copy.name = original.name.clone();
        copy.capture_format = original.capture_format;
        copy.requeued_task_id = Some(original.id);
        info!(task_id = %copy.id, from = %original.id, "task requeued");
        self.insert(copy).await.map(Some)
    }

    /// Remove a task whatever its status.
    pub async fn delete(&self, id: Uuid) -> Result<bool, QueueError> {
        let task = self.store().get(id, Detail::Shallow).await?;
        let deleted = self.store().delete(id).await?;
        if deleted {
            info!(task_id = %id, "task deleted");
            self.notify(QueueEvent::TaskDeleted, task.as_ref());
        }
        Ok(deleted)
    }

    /// Remove every finished task.
    pub async fn clear_completed(&self) -> Result<u64, QueueError> {
        let removed = self.store().clear_terminal().await?;
        if removed > 0 {
            info!(removed, "cleared finished tasks");
            self.notify(QueueEvent::TasksCleared, None);
        }
        Ok(removed)
    }

    pub async fn reorder(&self, id: Uuid, priority: i64) -> Result<bool, QueueError> {
        if !self.store().reorder(id, priority).await? {
            return Ok(false);
        }
        let task = self.store().get(id, Detail::Shallow).await?;
        self.notify(QueueEvent::TaskReordered, task.as_ref());
        Ok(true)
    }

    /// One step sooner. A task already at priority 0 stays put.
    pub async fn move_up(&self, id: Uuid) -> Result<bool, QueueError> {
        match self.store().get(id, Detail::Shallow).await? {
            Some(task) if task.priority > 0 => self.reorder(id, task.priority - 1).await,
            _ => Ok(false),
        }
    }

    pub async fn move_down(&self, id: Uuid) -> Result<bool, QueueError> {
        match self.store().get(id, Detail::Shallow).await? {
            Some(task) => self.reorder(id, task.priority.saturating_add(1)).await,
            None => Ok(false),
        }
    }

    // ── executor transitions ──────────────────────────────────────────────────

    /// Claim a pending or paused task for execution. Any other status, or a
    /// missing row, returns `false` and leaves the task alone.
    pub async fn set_running(&self, id: Uuid) -> Result<bool, QueueError> {
        if !self.store().claim(id).await? {
            debug!(task_id = %id, "task is not runnable");
            return Ok(false);
        }
        let task = self.store().get(id, Detail::Shallow).await?;
        self.notify(QueueEvent::TaskStarted, task.as_ref());
        Ok(true)
    }

    pub async fn set_failed(&self, id: Uuid, error: &str) -> Result<bool, QueueError> {
        self.transition(id, TaskStatus::Failed, Some(error), QueueEvent::TaskFailed).await
    }

    pub async fn set_completed(
        &self,
        id: Uuid,
        images: Vec<String>,
        info: Option<String>,
    ) -> Result<bool, QueueError> {
        self.finish(id, TaskStatus::Completed, images, info, None, QueueEvent::TaskCompleted).await
    }

    pub async fn set_stopped(
        &self,
        id: Uuid,
        images: Vec<String>,
        info: Option<String>,
    ) -> Result<bool, QueueError> {
        self.finish(id, TaskStatus::Stopped, images, info, None, QueueEvent::TaskStopped).await
    }

    /// Park a partially finished task with its progress counters.
    pub async fn set_paused(
        &self,
        id: Uuid,
        images: Vec<String>,
        info: Option<String>,
        completed_iterations: u32,
        original_n_iter: u32,
    ) -> Result<bool, QueueError> {
        self.finish(
            id,
            TaskStatus::Paused,
            images,
            info,
            Some((completed_iterations, original_n_iter)),
            QueueEvent::TaskPaused,
        )
        .await
    }

    async fn transition(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<&str>,
        event: QueueEvent,
    ) -> Result<bool, QueueError> {
        if !self.store().set_status(id, status, error).await? {
            return Ok(false);
        }
        let task = self.store().get(id, Detail::Shallow).await?;
        self.notify(event, task.as_ref());
        Ok(true)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: TaskStatus,
        images: Vec<String>,
        info: Option<String>,
        progress: Option<(u32, u32)>,
        event: QueueEvent,
    ) -> Result<bool, QueueError> {
        let Some(current) = self.store().get(id, Detail::Shallow).await? else {
            return Ok(false);
        };
        let (completed_iterations, original_n_iter) =
            progress.unwrap_or((current.completed_iterations, current.original_n_iter));
        let result = TaskResult {
            images,
            info,
            error: None,
            completed_iterations,
            original_n_iter,
        };
        if !self.store().record_result(id, status, &result).await? {
            return Ok(false);
        }
        let task = self.store().get(id, Detail::Shallow).await?;
        self.notify(event, task.as_ref());
        Ok(true)
    }

    // ── bookmarks ─────────────────────────────────────────────────────────────

    pub async fn save_bookmark(
        &self,
        name: impl Into<String>,
        task_type: TaskType,
        params: Params,
        checkpoint: impl Into<String>,
        script_args: Vec<ScriptArg>,
    ) -> Result<Bookmark, QueueError> {
        let bookmark = Bookmark::new(name, task_type, params, checkpoint, script_args);
        self.store().add_bookmark(&bookmark).await?;
        info!(bookmark_id = %bookmark.id, name = %bookmark.name, "bookmark saved");
        self.notify(QueueEvent::BookmarkAdded, None);
        Ok(bookmark)
    }

    /// Save a task's inputs as a bookmark. `None` if the task does not exist.
    pub async fn bookmark_task(&self, task_id: Uuid, name: Option<String>) -> Result<Option<Bookmark>, QueueError> {
        let Some(task) = self.store().get(task_id, Detail::Full).await? else {
            return Ok(None);
        };
        let bookmark = Bookmark::from_task(&task, name);
        self.store().add_bookmark(&bookmark).await?;
        info!(bookmark_id = %bookmark.id, task_id = %task_id, "bookmarked task");
        self.notify(QueueEvent::BookmarkAdded, Some(&task));
        Ok(Some(bookmark))
    }

    pub async fn list_bookmarks(&self) -> Result<Vec<Bookmark>, QueueError> {
        Ok(self.store().list_bookmarks().await?)
    }

    pub async fn get_bookmark(&self, id: Uuid) -> Result<Option<Bookmark>, QueueError> {
        Ok(self.store().get_bookmark(id).await?)
    }

    pub async fn rename_bookmark(&self, id: Uuid, name: impl Into<String>) -> Result<bool, QueueError> {
        let update = BookmarkUpdate { name: Some(name.into()), ..Default::default() };
        self.update_bookmark(id, update).await
    }

    pub async fn update_bookmark(&self, id: Uuid, update: BookmarkUpdate) -> Result<bool, QueueError> {
        let updated = self.store().update_bookmark(id, update).await?;
        if updated {
            self.notify(QueueEvent::BookmarkUpdated, None);
        }
        Ok(updated)
    }

    pub async fn delete_bookmark(&self, id: Uuid) -> Result<bool, QueueError> {
        let deleted = self.store().delete_bookmark(id).await?;
        if deleted {
            self.notify(QueueEvent::BookmarkDeleted, None);
        }
        Ok(deleted)
    }

    pub async fn bookmark_count(&self) -> Result<u64, QueueError> {
        Ok(self.store().count_bookmarks().await?)
    }

    /// Queue a new pending task from a bookmark, named after it.
    pub async fn queue_bookmark(&self, id: Uuid) -> Result<Option<Task>, QueueError> {
        let Some(bookmark) = self.store().get_bookmark(id).await? else {
            return Ok(None);
        };
        let mut task = Task::new(bookmark.task_type, bookmark.params);
        task.checkpoint = bookmark.checkpoint;
        task.script_args = bookmark.script_args;
        task.name = Some(bookmark.name).filter(|n| !n.is_empty());
        task.capture_format = bookmark.capture_format;
        self.insert(task).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CaptureFormat;
    use serde_json::json;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    async fn queue() -> QueueManager {
        QueueManager::new(SqliteStore::in_memory().await.expect("store"))
    }

    fn params(prompt: &str) -> Params {
        let mut p = Params::new();
        p.insert("prompt".into(), json!(prompt));
        p
    }

    fn recorder(queue: &QueueManager) -> Arc<Mutex<Vec<(QueueEvent, Option<Uuid>)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        queue.subscribe(move |event, task| {
            sink.lock().expect("lock").push((event, task.map(|t| t.id)));
        });
        events
    }

    #[tokio::test]
    async fn add_task_persists_and_notifies() {
        let queue = queue().await;
        let events = recorder(&queue);
        let task = queue
            .add_task(TaskType::Txt2Img, params("a cat"), "model [abc]", vec![ScriptArg::UseDefault], Some("  ".into()))
            .await
            .expect("add");

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.name, None);
        assert_eq!(task.display_name(), "txt2img: a cat");
        let stored = queue.get_task(task.id, Detail::Full).await.expect("get").expect("row");
        assert_eq!(stored, task);
        assert_eq!(*events.lock().expect("lock"), vec![(QueueEvent::TaskAdded, Some(task.id))]);
    }

    #[tokio::test]
    async fn cancel_only_applies_to_pending() {
        let queue = queue().await;
        let a = queue.add_task(TaskType::Txt2Img, params("a"), "", vec![], None).await.expect("add");
        let b = queue.add_task(TaskType::Txt2Img, params("b"), "", vec![], None).await.expect("add");
        queue.set_running(b.id).await.expect("run");

        assert!(queue.cancel(a.id).await.expect("cancel"));
        assert!(!queue.cancel(a.id).await.expect("cancel again"));
        assert!(!queue.cancel(b.id).await.expect("cancel running"));
        assert!(!queue.cancel(Uuid::new_v4()).await.expect("cancel missing"));

        let a = queue.get_task(a.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(a.status, TaskStatus::Cancelled);
        assert!(a.completed_at.is_some());
    }

    #[tokio::test]
    async fn set_running_refuses_finished_and_cancelled_tasks() {
        let queue = queue().await;
        let cancelled = queue.add_task(TaskType::Txt2Img, params("c"), "", vec![], None).await.expect("add");
        let done = queue.add_task(TaskType::Txt2Img, params("d"), "", vec![], None).await.expect("add");
        assert!(queue.cancel(cancelled.id).await.expect("cancel"));
        assert!(queue.set_running(done.id).await.expect("run"));
        queue.set_completed(done.id, vec!["d.png".into()], None).await.expect("complete");
        let finished = queue.get_task(done.id, Detail::Shallow).await.expect("get").expect("row");
        let events = recorder(&queue);

        assert!(!queue.set_running(cancelled.id).await.expect("run cancelled"));
        assert!(!queue.set_running(done.id).await.expect("run completed"));
        assert!(!queue.set_running(Uuid::new_v4()).await.expect("run missing"));
        assert!(events.lock().expect("lock").is_empty());

        let c = queue.get_task(cancelled.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(c.status, TaskStatus::Cancelled);
        assert!(c.started_at.is_none());
        let d = queue.get_task(done.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(d, finished);
    }

    #[tokio::test]
    async fn rename_task_trims_and_notifies() {
        let queue = queue().await;
        let task = queue.add_task(TaskType::Txt2Img, params("before"), "", vec![], None).await.expect("add");
        let events = recorder(&queue);

        let named = queue.rename_task(task.id, Some("  cover art ".into())).await.expect("rename").expect("row");
        assert_eq!(named.display_name(), "cover art");
        assert_eq!(named.prompt(), Some("before"));
        let cleared = queue.rename_task(task.id, Some(" ".into())).await.expect("clear").expect("row");
        assert_eq!(cleared.name, None);
        assert_eq!(
            *events.lock().expect("lock"),
            vec![(QueueEvent::TaskUpdated, Some(task.id)), (QueueEvent::TaskUpdated, Some(task.id))]
        );

        assert!(queue.rename_task(Uuid::new_v4(), Some("ghost".into())).await.expect("missing").is_none());
        assert_eq!(events.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn retry_copies_without_touching_original() {
        let queue = queue().await;
        let mut p = params("retry me");
        p.insert("steps".into(), json!(30));
        let original = queue
            .add_task(TaskType::Img2Img, p, "model", vec![ScriptArg::Value(json!(5)), ScriptArg::UseDefault], Some("mine".into()))
            .await
            .expect("add");
        queue.set_failed(original.id, "boom").await.expect("fail");
        let before = queue.get_task(original.id, Detail::Full).await.expect("get").expect("row");

        let copy = queue.retry(original.id).await.expect("retry").expect("copy");
        let after = queue.get_task(original.id, Detail::Full).await.expect("get").expect("row");

        assert_eq!(before, after);
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.status, TaskStatus::Pending);
        assert_eq!(copy.params, original.params);
        assert_eq!(copy.checkpoint, original.checkpoint);
        assert_eq!(copy.script_args, original.script_args);
        assert_eq!(copy.name, original.name);
        assert_eq!(copy.requeued_task_id, Some(original.id));
        assert!(copy.error.is_none());

        assert!(queue.retry(Uuid::new_v4()).await.expect("retry missing").is_none());
    }

    #[tokio::test]
    async fn delete_ignores_status() {
        let queue = queue().await;
        let events = recorder(&queue);
        let t = queue.add_task(TaskType::Txt2Img, params("x"), "", vec![], None).await.expect("add");
        queue.set_running(t.id).await.expect("run");
        assert!(queue.delete(t.id).await.expect("delete"));
        assert!(!queue.delete(t.id).await.expect("delete again"));
        let last = events.lock().expect("lock").last().copied();
        assert_eq!(last, Some((QueueEvent::TaskDeleted, Some(t.id))));
    }

    #[tokio::test]
    async fn clear_completed_notifies_only_when_something_went() {
        let queue = queue().await;
        let t = queue.add_task(TaskType::Txt2Img, params("x"), "", vec![], None).await.expect("add");
        queue.set_completed(t.id, vec!["a.png".into()], None).await.expect("complete");
        let events = recorder(&queue);

        assert_eq!(queue.clear_completed().await.expect("clear"), 1);
        assert_eq!(queue.clear_completed().await.expect("clear again"), 0);
        assert_eq!(*events.lock().expect("lock"), vec![(QueueEvent::TasksCleared, None)]);
    }

    #[tokio::test]
    async fn move_up_stops_at_zero() {
        let queue = queue().await;
        let t = queue.add_task(TaskType::Txt2Img, params("x"), "", vec![], None).await.expect("add");
        assert!(!queue.move_up(t.id).await.expect("up at zero"));
        assert!(queue.move_down(t.id).await.expect("down"));
        assert!(queue.move_down(t.id).await.expect("down"));
        assert!(queue.move_up(t.id).await.expect("up"));
        let t = queue.get_task(t.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(t.priority, 1);
        assert!(!queue.move_down(Uuid::new_v4()).await.expect("missing"));
    }

    #[tokio::test]
    async fn paused_progress_is_kept_by_later_transitions() {
        let queue = queue().await;
        let t = queue.add_task(TaskType::Txt2Img, params("x"), "", vec![], None).await.expect("add");
        queue.set_running(t.id).await.expect("run");
        queue.set_paused(t.id, vec!["1.png".into()], Some("info".into()), 1, 4).await.expect("pause");

        let paused = queue.get_task(t.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(paused.status, TaskStatus::Paused);
        assert_eq!((paused.completed_iterations, paused.original_n_iter), (1, 4));
        assert!(paused.completed_at.is_none());

        queue.set_running(t.id).await.expect("resume");
        queue
            .set_completed(t.id, vec!["1.png".into(), "2.png".into()], None)
            .await
            .expect("complete");
        let done = queue.get_task(t.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result_images.len(), 2);
        assert_eq!((done.completed_iterations, done.original_n_iter), (1, 4));
        assert_eq!(done.started_at, paused.started_at);
    }

    #[tokio::test]
    #[traced_test]
    async fn panicking_subscriber_is_isolated() {
        let queue = queue().await;
        queue.subscribe(|_, _| panic!("subscriber bug"));
        let events = recorder(&queue);

        let t = queue.add_task(TaskType::Txt2Img, params("x"), "", vec![], None).await.expect("add survives");
        assert_eq!(events.lock().expect("lock").len(), 1);
        assert!(queue.get_task(t.id, Detail::Shallow).await.expect("get").is_some());
        assert!(logs_contain("queue subscriber panicked"));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let queue = queue().await;
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = queue.subscribe(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        queue.add_task(TaskType::Txt2Img, params("x"), "", vec![], None).await.expect("add");
        assert!(queue.unsubscribe(id));
        assert!(!queue.unsubscribe(id));
        queue.add_task(TaskType::Txt2Img, params("y"), "", vec![], None).await.expect("add");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bookmarks_round_trip_through_the_queue() {
        let queue = queue().await;
        let t = queue
            .add_task(TaskType::Txt2Img, params("a long prompt about a castle"), "model", vec![ScriptArg::UseDefault], None)
            .await
            .expect("add");

        let bm = queue.bookmark_task(t.id, None).await.expect("bookmark").expect("exists");
        assert_eq!(bm.name, "txt2img: a long prompt about a castle");
        assert_eq!(queue.bookmark_count().await.expect("count"), 1);
        assert!(queue.bookmark_task(Uuid::new_v4(), None).await.expect("missing").is_none());

        assert!(queue.rename_bookmark(bm.id, "castle").await.expect("rename"));
        let queued = queue.queue_bookmark(bm.id).await.expect("queue").expect("exists");
        assert_eq!(queued.name.as_deref(), Some("castle"));
        assert_eq!(queued.params, t.params);
        assert_eq!(queued.script_args, t.script_args);
        assert_eq!(queued.status, TaskStatus::Pending);

        let saved = queue
            .save_bookmark("blank", TaskType::Img2Img, Params::new(), "", vec![])
            .await
            .expect("save");
        assert_eq!(queue.list_bookmarks().await.expect("list").len(), 2);
        assert!(queue.delete_bookmark(saved.id).await.expect("delete"));
        assert!(queue.get_bookmark(saved.id).await.expect("get").is_none());
        assert!(queue.queue_bookmark(saved.id).await.expect("queue missing").is_none());
    }

    #[tokio::test]
    async fn bookmarked_dynamic_capture_queues_as_dynamic() {
        let queue = queue().await;
        let mut p = params("reflective");
        p.insert("future_knob".into(), json!(0.25));
        let captured = Captured {
            task_type: TaskType::Txt2Img,
            params: p,
            script_args: vec![],
            checkpoint: "model".into(),
            capture_format: CaptureFormat::Dynamic,
        };
        let t = queue.add_captured(captured, None).await.expect("add");

        let bm = queue.bookmark_task(t.id, Some("knobs".into())).await.expect("bookmark").expect("exists");
        assert_eq!(bm.capture_format, CaptureFormat::Dynamic);
        let queued = queue.queue_bookmark(bm.id).await.expect("queue").expect("exists");
        assert_eq!(queued.capture_format, CaptureFormat::Dynamic);
        assert_eq!(queued.params["future_knob"], json!(0.25));

        let saved = queue.save_bookmark("plain", TaskType::Txt2Img, Params::new(), "", vec![]).await.expect("save");
        let plain = queue.queue_bookmark(saved.id).await.expect("queue").expect("exists");
        assert_eq!(plain.capture_format, CaptureFormat::Legacy);
    }
}
