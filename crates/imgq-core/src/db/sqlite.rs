//! SQLite implementation of [`TaskStore`] and [`BookmarkStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are run
//! automatically by [`SqliteStore::connect`].
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves the path at compile time
//! relative to `CARGO_MANIFEST_DIR`, so the migration files are embedded in
//! the binary. The database location is chosen at runtime.
//!
//! # Queries
//!
//! The runtime-verified `sqlx::query` form is used so that no
//! `DATABASE_URL` is needed at compile time.
//!
//! # Writes
//!
//! Every mutating statement holds one store-wide async mutex, so writers
//! from the executor and from request handlers never interleave. Reads go
//! straight to the pool; each read is a single statement and therefore a
//! consistent snapshot.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BookmarkStore, Detail, QueueStats, TaskResult, TaskStore};
use crate::bookmark::{Bookmark, BookmarkUpdate};
use crate::task::{CaptureFormat, Task, TaskStatus};

const TASK_COLUMNS: &str = "id, task_type, status, priority, created_at, started_at, completed_at, \
     params, checkpoint, script_args, result_images, result_info, error, name, \
     completed_iterations, original_n_iter, requeued_task_id, capture_format";

const TASK_COLUMNS_SHALLOW: &str = "id, task_type, status, priority, created_at, started_at, completed_at, \
     params, checkpoint, '[]' AS script_args, result_images, result_info, error, name, \
     completed_iterations, original_n_iter, requeued_task_id, capture_format";

/// Pickup order for pending work.
const PICKUP_ORDER: &str = "priority ASC, created_at ASC, rowid ASC";

const TERMINAL_SQL: &str = "('completed', 'failed', 'cancelled', 'stopped')";

/// SQLite-backed task and bookmark store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://imgq.db"`.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::migrate(pool).await
    }

    /// Private in-memory database, for tests and throwaway runs.
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn fetch_one_task(&self, sql: &str) -> Result<Option<Task>, sqlx::Error> {
        let row: Option<TaskRow> = sqlx::query_as(sql).fetch_optional(&self.pool).await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn fetch_tasks(&self, sql: &str) -> Result<Vec<Task>, sqlx::Error> {
        let rows: Vec<TaskRow> = sqlx::query_as(sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }
}

// ── TaskStore ─────────────────────────────────────────────────────────────────

impl TaskStore for SqliteStore {
    async fn add(&self, task: &Task) -> Result<(), sqlx::Error> {
        let row = EncodedTask::new(task)?;
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO tasks (id, task_type, status, priority, created_at, started_at, completed_at, \
             params, checkpoint, script_args, result_images, result_info, error, name, \
             completed_iterations, original_n_iter, requeued_task_id, capture_format) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        )
        .bind(&row.id)
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(&row.created_at)
        .bind(&row.started_at)
        .bind(&row.completed_at)
        .bind(&row.params)
        .bind(&task.checkpoint)
        .bind(&row.script_args)
        .bind(&row.result_images)
        .bind(&task.result_info)
        .bind(&task.error)
        .bind(&task.name)
        .bind(i64::from(task.completed_iterations))
        .bind(i64::from(task.original_n_iter))
        .bind(&row.requeued_task_id)
        .bind(task.capture_format.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid, detail: Detail) -> Result<Option<Task>, sqlx::Error> {
        let columns = match detail {
            Detail::Shallow => TASK_COLUMNS_SHALLOW,
            Detail::Full => TASK_COLUMNS,
        };
        let row: Option<TaskRow> = sqlx::query_as(&format!("SELECT {columns} FROM tasks WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn list_all(&self) -> Result<Vec<Task>, sqlx::Error> {
        self.fetch_tasks(&format!(
            "SELECT {TASK_COLUMNS_SHALLOW} FROM tasks ORDER BY \
             CASE status WHEN 'running' THEN 0 WHEN 'pending' THEN 1 WHEN 'paused' THEN 2 ELSE 3 END, \
             CASE WHEN status IN {TERMINAL_SQL} THEN completed_at END DESC, \
             {PICKUP_ORDER}"
        ))
        .await
    }

    async fn list_pending(&self) -> Result<Vec<Task>, sqlx::Error> {
        self.fetch_tasks(&format!(
            "SELECT {TASK_COLUMNS_SHALLOW} FROM tasks WHERE status = 'pending' ORDER BY {PICKUP_ORDER}"
        ))
        .await
    }

    async fn next_pending(&self) -> Result<Option<Task>, sqlx::Error> {
        self.fetch_one_task(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' ORDER BY {PICKUP_ORDER} LIMIT 1"
        ))
        .await
    }

    async fn next_paused(&self) -> Result<Option<Task>, sqlx::Error> {
        self.fetch_one_task(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'paused' \
             ORDER BY started_at DESC, rowid DESC LIMIT 1"
        ))
        .await
    }

    async fn update(&self, task: &Task) -> Result<bool, sqlx::Error> {
        let row = EncodedTask::new(task)?;
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE tasks SET task_type = ?1, status = ?2, priority = ?3, created_at = ?4, \
             started_at = ?5, completed_at = ?6, params = ?7, checkpoint = ?8, script_args = ?9, \
             result_images = ?10, result_info = ?11, error = ?12, name = ?13, \
             completed_iterations = ?14, original_n_iter = ?15, requeued_task_id = ?16, \
             capture_format = ?17 WHERE id = ?18",
        )
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(&row.created_at)
        .bind(&row.started_at)
        .bind(&row.completed_at)
        .bind(&row.params)
        .bind(&task.checkpoint)
        .bind(&row.script_args)
        .bind(&row.result_images)
        .bind(&task.result_info)
        .bind(&task.error)
        .bind(&task.name)
        .bind(i64::from(task.completed_iterations))
        .bind(i64::from(task.original_n_iter))
        .bind(&row.requeued_task_id)
        .bind(task.capture_format.as_str())
        .bind(&row.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let now = timestamp(&Utc::now());
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = ?1, \
             started_at = CASE WHEN ?1 = 'running' THEN COALESCE(started_at, ?2) ELSE started_at END, \
             completed_at = CASE WHEN ?1 IN {TERMINAL_SQL} THEN COALESCE(completed_at, ?2) ELSE completed_at END, \
             error = COALESCE(?3, error) \
             WHERE id = ?4"
        ))
        .bind(status.as_str())
        .bind(&now)
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let now = timestamp(&Utc::now());
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = COALESCE(started_at, ?1) \
             WHERE id = ?2 AND status IN ('pending', 'paused')",
        )
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_result(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: &TaskResult,
    ) -> Result<bool, sqlx::Error> {
        let now = timestamp(&Utc::now());
        let images = encode_json(&result.images)?;
        let _guard = self.write_lock.lock().await;
        let done = sqlx::query(&format!(
            "UPDATE tasks SET status = ?1, \
             completed_at = CASE WHEN ?1 IN {TERMINAL_SQL} THEN COALESCE(completed_at, ?2) ELSE completed_at END, \
             result_images = ?3, result_info = ?4, error = ?5, \
             completed_iterations = ?6, original_n_iter = ?7 \
             WHERE id = ?8"
        ))
        .bind(status.as_str())
        .bind(&now)
        .bind(&images)
        .bind(&result.info)
        .bind(&result.error)
        .bind(i64::from(result.completed_iterations))
        .bind(i64::from(result.original_n_iter))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_terminal(&self) -> Result<u64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(&format!("DELETE FROM tasks WHERE status IN {TERMINAL_SQL}"))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats, sqlx::Error> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.parse::<TaskStatus>() {
                Ok(s) => stats.record(s, u64::try_from(count).unwrap_or(0)),
                Err(_) => tracing::warn!(status = %status, count, "unknown task status in store"),
            }
        }
        Ok(stats)
    }

    async fn reorder(&self, id: Uuid, priority: i64) -> Result<bool, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE tasks SET priority = ?1 WHERE id = ?2")
            .bind(priority)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rename(&self, id: Uuid, name: Option<&str>) -> Result<bool, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE tasks SET name = ?1 WHERE id = ?2")
            .bind(name)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue_running(&self) -> Result<u64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', started_at = NULL WHERE status = 'running'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ── BookmarkStore ─────────────────────────────────────────────────────────────

impl BookmarkStore for SqliteStore {
    async fn add_bookmark(&self, bookmark: &Bookmark) -> Result<(), sqlx::Error> {
        let params = encode_json(&bookmark.params)?;
        let script_args = encode_json(&bookmark.script_args)?;
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO bookmarks (id, name, task_type, created_at, params, checkpoint, script_args, capture_format) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(bookmark.id.to_string())
        .bind(&bookmark.name)
        .bind(bookmark.task_type.as_str())
        .bind(timestamp(&bookmark.created_at))
        .bind(&params)
        .bind(&bookmark.checkpoint)
        .bind(&script_args)
        .bind(bookmark.capture_format.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_bookmark(&self, id: Uuid) -> Result<Option<Bookmark>, sqlx::Error> {
        let row: Option<BookmarkRow> = sqlx::query_as(
            "SELECT id, name, task_type, created_at, params, checkpoint, script_args, capture_format \
             FROM bookmarks WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(BookmarkRow::into_bookmark).transpose()
    }

    async fn list_bookmarks(&self) -> Result<Vec<Bookmark>, sqlx::Error> {
        let rows: Vec<BookmarkRow> = sqlx::query_as(
            "SELECT id, name, task_type, created_at, params, checkpoint, script_args, capture_format \
             FROM bookmarks ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BookmarkRow::into_bookmark).collect()
    }

    async fn update_bookmark(&self, id: Uuid, update: BookmarkUpdate) -> Result<bool, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let Some(mut bookmark) = self.get_bookmark(id).await? else {
            return Ok(false);
        };
        update.apply(&mut bookmark);
        let result = sqlx::query(
            "UPDATE bookmarks SET name = ?1, params = ?2, checkpoint = ?3, script_args = ?4 WHERE id = ?5",
        )
        .bind(&bookmark.name)
        .bind(encode_json(&bookmark.params)?)
        .bind(&bookmark.checkpoint)
        .bind(encode_json(&bookmark.script_args)?)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_bookmark(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM bookmarks WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_bookmarks(&self) -> Result<u64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bookmarks")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

// ── row mapping ───────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    task_type: String,
    status: String,
    priority: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    params: String,
    checkpoint: String,
    script_args: String,
    result_images: String,
    result_info: Option<String>,
    error: Option<String>,
    name: Option<String>,
    completed_iterations: i64,
    original_n_iter: i64,
    requeued_task_id: Option<String>,
    capture_format: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task, sqlx::Error> {
        Ok(Task {
            id: parse_uuid(&self.id)?,
            task_type: parse_enum(&self.task_type, "task_type")?,
            status: parse_enum(&self.status, "status")?,
            priority: self.priority,
            created_at: parse_timestamp(&self.created_at, "created_at"),
            started_at: self.started_at.as_deref().and_then(|raw| parse_optional_timestamp(raw, "started_at")),
            completed_at: self
                .completed_at
                .as_deref()
                .and_then(|raw| parse_optional_timestamp(raw, "completed_at")),
            params: decode_json(&self.params, "params")?,
            checkpoint: self.checkpoint,
            script_args: decode_json(&self.script_args, "script_args")?,
            result_images: decode_json(&self.result_images, "result_images")?,
            result_info: self.result_info,
            error: self.error,
            name: self.name,
            completed_iterations: clamp_u32(self.completed_iterations),
            original_n_iter: clamp_u32(self.original_n_iter),
            requeued_task_id: self.requeued_task_id.as_deref().map(parse_uuid).transpose()?,
            capture_format: parse_capture_format(self.capture_format.as_deref())?,
        })
    }
}

/// Text forms of the columns that need encoding.
struct EncodedTask {
    id: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    params: String,
    script_args: String,
    result_images: String,
    requeued_task_id: Option<String>,
}

impl EncodedTask {
    fn new(task: &Task) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: task.id.to_string(),
            created_at: timestamp(&task.created_at),
            started_at: task.started_at.as_ref().map(timestamp),
            completed_at: task.completed_at.as_ref().map(timestamp),
            params: encode_json(&task.params)?,
            script_args: encode_json(&task.script_args)?,
            result_images: encode_json(&task.result_images)?,
            requeued_task_id: task.requeued_task_id.map(|id| id.to_string()),
        })
    }
}

#[derive(sqlx::FromRow)]
struct BookmarkRow {
    id: String,
    name: String,
    task_type: String,
    created_at: String,
    params: String,
    checkpoint: String,
    script_args: String,
    capture_format: Option<String>,
}

impl BookmarkRow {
    fn into_bookmark(self) -> Result<Bookmark, sqlx::Error> {
        Ok(Bookmark {
            id: parse_uuid(&self.id)?,
            name: self.name,
            task_type: parse_enum(&self.task_type, "task_type")?,
            created_at: parse_timestamp(&self.created_at, "created_at"),
            params: decode_json(&self.params, "params")?,
            checkpoint: self.checkpoint,
            script_args: decode_json(&self.script_args, "script_args")?,
            capture_format: parse_capture_format(self.capture_format.as_deref())?,
        })
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

/// Fixed-width UTC text so lexical order matches time order.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str, column: &'static str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        tracing::warn!(raw = %raw, column, error = %e, "failed to parse timestamp; using now");
        Utc::now()
    })
}

fn parse_optional_timestamp(raw: &str, column: &'static str) -> Option<DateTime<Utc>> {
    match raw.parse() {
        Ok(dt) => Some(dt),
        Err(e) => {
            tracing::warn!(raw = %raw, column, error = %e, "failed to parse timestamp; dropping it");
            None
        }
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, sqlx::Error> {
    raw.parse()
        .map_err(|e| sqlx::Error::Decode(format!("invalid id {raw:?}: {e}").into()))
}

fn parse_enum<T: FromStr>(raw: &str, column: &str) -> Result<T, sqlx::Error> {
    raw.parse()
        .map_err(|_| sqlx::Error::Decode(format!("unknown {column} value {raw:?}").into()))
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<T, sqlx::Error> {
    serde_json::from_str(raw)
        .map_err(|e| sqlx::Error::Decode(format!("corrupt {column} column: {e}").into()))
}

fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<String, sqlx::Error> {
    serde_json::to_string(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

/// Rows written before the column existed read as the fixed-field format.
fn parse_capture_format(raw: Option<&str>) -> Result<CaptureFormat, sqlx::Error> {
    match raw {
        None | Some("") => Ok(CaptureFormat::Legacy),
        Some(raw) => parse_enum(raw, "capture_format"),
    }
}

fn clamp_u32(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script_args::ScriptArg;
    use crate::task::{Params, TaskType};
    use chrono::Duration;
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.expect("open in-memory store")
    }

    fn task(prompt: &str, priority: i64) -> Task {
        let mut params = Params::new();
        params.insert("prompt".into(), json!(prompt));
        let mut t = Task::new(TaskType::Txt2Img, params);
        t.priority = priority;
        t
    }

    /// Tasks created in a fixed order with strictly increasing timestamps.
    fn sequenced(prompts: &[(&str, i64)]) -> Vec<Task> {
        let base = Utc::now();
        prompts
            .iter()
            .enumerate()
            .map(|(i, (p, prio))| {
                let mut t = task(p, *prio);
                t.created_at = base + Duration::milliseconds(i as i64);
                t
            })
            .collect()
    }

    // ── ordering ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn next_pending_follows_priority_then_creation() {
        let store = store().await;
        for t in sequenced(&[("three", 3), ("one", 1), ("two", 2)]) {
            store.add(&t).await.expect("add");
        }

        let mut seen = Vec::new();
        while let Some(t) = store.next_pending().await.expect("next") {
            seen.push(t.prompt().unwrap_or_default().to_owned());
            store.set_status(t.id, TaskStatus::Completed, None).await.expect("complete");
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn equal_priority_runs_in_creation_order() {
        let store = store().await;
        let tasks = sequenced(&[("cat", 0), ("dog", 0)]);
        // Insert out of order; created_at decides.
        store.add(&tasks[1]).await.expect("add dog");
        store.add(&tasks[0]).await.expect("add cat");

        let first = store.next_pending().await.expect("next").expect("a task");
        assert_eq!(first.prompt(), Some("cat"));
        store.set_status(first.id, TaskStatus::Running, None).await.expect("run");
        let second = store.next_pending().await.expect("next").expect("a task");
        assert_eq!(second.prompt(), Some("dog"));
    }

    #[tokio::test]
    async fn list_all_groups_by_status() {
        let store = store().await;
        let tasks = sequenced(&[("done-old", 0), ("pending-b", 5), ("running", 0), ("paused", 0), ("pending-a", 1), ("done-new", 0)]);
        for t in &tasks {
            store.add(t).await.expect("add");
        }
        store.set_status(tasks[0].id, TaskStatus::Completed, None).await.expect("complete");
        store.set_status(tasks[2].id, TaskStatus::Running, None).await.expect("run");
        store.set_status(tasks[3].id, TaskStatus::Paused, None).await.expect("pause");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.set_status(tasks[5].id, TaskStatus::Failed, Some("boom")).await.expect("fail");

        let order: Vec<String> = store
            .list_all()
            .await
            .expect("list")
            .iter()
            .map(|t| t.prompt().unwrap_or_default().to_owned())
            .collect();
        assert_eq!(order, vec!["running", "pending-a", "pending-b", "paused", "done-new", "done-old"]);
    }

    #[tokio::test]
    async fn next_paused_prefers_most_recently_started() {
        let store = store().await;
        let tasks = sequenced(&[("early", 0), ("late", 0)]);
        for t in &tasks {
            store.add(t).await.expect("add");
        }
        store.set_status(tasks[0].id, TaskStatus::Running, None).await.expect("run");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.set_status(tasks[1].id, TaskStatus::Running, None).await.expect("run");
        store.set_status(tasks[0].id, TaskStatus::Paused, None).await.expect("pause");
        store.set_status(tasks[1].id, TaskStatus::Paused, None).await.expect("pause");

        let next = store.next_paused().await.expect("query").expect("a paused task");
        assert_eq!(next.prompt(), Some("late"));
    }

    // ── status stamps ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn running_stamps_started_at_once() {
        let store = store().await;
        let t = task("stamp", 0);
        store.add(&t).await.expect("add");

        store.set_status(t.id, TaskStatus::Running, None).await.expect("run");
        let first = store.get(t.id, Detail::Shallow).await.expect("get").expect("row");
        let started = first.started_at.expect("started_at set");
        assert!(first.completed_at.is_none());

        store.set_status(t.id, TaskStatus::Paused, None).await.expect("pause");
        let paused = store.get(t.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(paused.started_at, Some(started));
        assert!(paused.completed_at.is_none(), "paused must not stamp completion");

        store.set_status(t.id, TaskStatus::Running, None).await.expect("resume");
        let resumed = store.get(t.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(resumed.started_at, Some(started));
    }

    #[tokio::test]
    async fn claim_only_takes_pending_or_paused_rows() {
        let store = store().await;
        let t = task("claim", 0);
        store.add(&t).await.expect("add");

        assert!(store.claim(t.id).await.expect("claim"));
        let running = store.get(t.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(running.status, TaskStatus::Running);
        let started = running.started_at.expect("started_at set");
        assert!(!store.claim(t.id).await.expect("claim running"), "already running");

        store.set_status(t.id, TaskStatus::Paused, None).await.expect("pause");
        assert!(store.claim(t.id).await.expect("claim paused"));
        let resumed = store.get(t.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(resumed.started_at, Some(started));

        for status in TaskStatus::TERMINAL {
            let done = task("done", 0);
            store.add(&done).await.expect("add");
            store.set_status(done.id, status, None).await.expect("finish");
            assert!(!store.claim(done.id).await.expect("claim"), "{status} was revived");
            let row = store.get(done.id, Detail::Shallow).await.expect("get").expect("row");
            assert_eq!(row.status, status);
            assert!(row.started_at.is_none());
        }
        assert!(!store.claim(Uuid::new_v4()).await.expect("claim missing"));
    }

    #[tokio::test]
    async fn terminal_statuses_stamp_completed_at_once() {
        let store = store().await;
        for status in TaskStatus::TERMINAL {
            let t = task("terminal", 0);
            store.add(&t).await.expect("add");
            store.set_status(t.id, status, None).await.expect("finish");
            let done = store.get(t.id, Detail::Shallow).await.expect("get").expect("row");
            let completed = done.completed_at.expect("completed_at set");
            assert!(done.started_at.is_none());

            store.set_status(t.id, status, None).await.expect("finish again");
            let again = store.get(t.id, Detail::Shallow).await.expect("get").expect("row");
            assert_eq!(again.completed_at, Some(completed), "{status} re-stamped");
        }
    }

    #[tokio::test]
    async fn set_status_keeps_error_text() {
        let store = store().await;
        let t = task("err", 0);
        store.add(&t).await.expect("add");
        store.set_status(t.id, TaskStatus::Failed, Some("out of memory")).await.expect("fail");
        let failed = store.get(t.id, Detail::Full).await.expect("get").expect("row");
        assert_eq!(failed.error.as_deref(), Some("out of memory"));
    }

    #[tokio::test]
    async fn record_result_writes_outcome_with_status() {
        let store = store().await;
        let t = task("result", 0);
        store.add(&t).await.expect("add");
        let result = TaskResult {
            images: vec!["out/0001.png".into()],
            info: Some("Steps: 20".into()),
            error: None,
            completed_iterations: 1,
            original_n_iter: 4,
        };
        assert!(store.record_result(t.id, TaskStatus::Paused, &result).await.expect("record"));
        let row = store.get(t.id, Detail::Full).await.expect("get").expect("row");
        assert_eq!(row.status, TaskStatus::Paused);
        assert_eq!(row.result_images, result.images);
        assert_eq!(row.completed_iterations, 1);
        assert_eq!(row.original_n_iter, 4);
        assert!(row.completed_at.is_none());
    }

    // ── round trip and detail levels ──────────────────────────────────────────

    #[tokio::test]
    async fn every_field_survives_storage() {
        let store = store().await;
        let mut t = task("round trip", 7);
        t.params.insert("ui_settings".into(), json!({"sd_vae": "ae.safetensors", "CLIP_stop_at_last_layers": 2}));
        t.checkpoint = "flux1-dev [abc123]".into();
        t.script_args = vec![ScriptArg::Value(json!({"enabled": true})), ScriptArg::UseDefault, ScriptArg::Value(json!(0.5))];
        t.result_images = vec!["a.png".into(), "b.png".into()];
        t.result_info = Some("Seed: 1".into());
        t.error = Some("partial".into());
        t.name = Some("label".into());
        t.started_at = Some(Utc::now());
        t.completed_at = Some(Utc::now());
        t.status = TaskStatus::Stopped;
        t.completed_iterations = 2;
        t.original_n_iter = 5;
        t.requeued_task_id = Some(Uuid::new_v4());
        t.capture_format = CaptureFormat::Dynamic;

        store.add(&t).await.expect("add");
        let back = store.get(t.id, Detail::Full).await.expect("get").expect("row");
        assert_eq!(back, t);
    }

    #[tokio::test]
    async fn empty_collections_survive_storage() {
        let store = store().await;
        let t = Task::new(TaskType::Img2Img, Params::new());
        store.add(&t).await.expect("add");
        let back = store.get(t.id, Detail::Full).await.expect("get").expect("row");
        assert_eq!(back, t);
    }

    #[tokio::test]
    async fn shallow_read_skips_script_args() {
        let store = store().await;
        let mut t = task("args", 0);
        t.script_args = vec![ScriptArg::Value(json!(1))];
        store.add(&t).await.expect("add");

        let shallow = store.get(t.id, Detail::Shallow).await.expect("get").expect("row");
        assert!(shallow.script_args.is_empty());
        let full = store.get(t.id, Detail::Full).await.expect("get").expect("row");
        assert_eq!(full.script_args, t.script_args);
        assert!(store.list_all().await.expect("list")[0].script_args.is_empty());
    }

    #[tokio::test]
    async fn rows_from_older_schema_decode() {
        let store = store().await;
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO tasks (id, task_type, status, created_at, params, script_args) \
             VALUES (?1, 'txt2img', 'pending', ?2, '{\"prompt\":\"old\"}', '[null, 3]')",
        )
        .bind(id.to_string())
        .bind(timestamp(&Utc::now()))
        .execute(&store.pool)
        .await
        .expect("raw insert");

        let t = store.get(id, Detail::Full).await.expect("get").expect("row");
        assert_eq!(t.capture_format, CaptureFormat::Legacy);
        assert_eq!(t.script_args, vec![ScriptArg::UseDefault, ScriptArg::Value(json!(3))]);
        assert_eq!(t.completed_iterations, 0);
        assert!(t.requeued_task_id.is_none());
    }

    #[tokio::test]
    async fn corrupt_params_are_a_decode_error() {
        let store = store().await;
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO tasks (id, task_type, status, created_at, params) VALUES (?1, 'txt2img', 'pending', ?2, '{oops')",
        )
        .bind(id.to_string())
        .bind(timestamp(&Utc::now()))
        .execute(&store.pool)
        .await
        .expect("raw insert");

        let err = store.get(id, Detail::Full).await.expect_err("corrupt row");
        assert!(matches!(err, sqlx::Error::Decode(_)));
    }

    // ── missing rows and bulk operations ──────────────────────────────────────

    #[tokio::test]
    async fn missing_rows_are_not_errors() {
        let store = store().await;
        let ghost = task("ghost", 0);
        assert!(store.get(ghost.id, Detail::Full).await.expect("get").is_none());
        assert!(!store.update(&ghost).await.expect("update"));
        assert!(!store.delete(ghost.id).await.expect("delete"));
        assert!(!store.set_status(ghost.id, TaskStatus::Running, None).await.expect("status"));
        assert!(!store.reorder(ghost.id, 3).await.expect("reorder"));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = store().await;
        let t = task("dup", 0);
        store.add(&t).await.expect("first add");
        assert!(store.add(&t).await.is_err());
    }

    #[tokio::test]
    async fn clear_terminal_is_idempotent_and_spares_active() {
        let store = store().await;
        let tasks = sequenced(&[("a", 0), ("b", 0), ("c", 0), ("d", 0), ("e", 0)]);
        for t in &tasks {
            store.add(t).await.expect("add");
        }
        store.set_status(tasks[0].id, TaskStatus::Completed, None).await.expect("complete");
        store.set_status(tasks[1].id, TaskStatus::Stopped, None).await.expect("stop");
        store.set_status(tasks[2].id, TaskStatus::Paused, None).await.expect("pause");
        store.set_status(tasks[3].id, TaskStatus::Running, None).await.expect("run");

        assert_eq!(store.clear_terminal().await.expect("clear"), 2);
        assert_eq!(store.clear_terminal().await.expect("clear again"), 0);

        let stats = store.stats().await.expect("stats");
        assert_eq!((stats.pending, stats.running, stats.paused, stats.total), (1, 1, 1, 3));
    }

    #[tokio::test]
    async fn stats_count_every_status() {
        let store = store().await;
        let tasks = sequenced(&[("a", 0), ("b", 0), ("c", 0)]);
        for t in &tasks {
            store.add(t).await.expect("add");
        }
        store.set_status(tasks[0].id, TaskStatus::Cancelled, None).await.expect("cancel");
        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn reorder_changes_pickup() {
        let store = store().await;
        let tasks = sequenced(&[("first", 0), ("second", 0)]);
        for t in &tasks {
            store.add(t).await.expect("add");
        }
        assert!(store.reorder(tasks[0].id, 10).await.expect("reorder"));
        let next = store.next_pending().await.expect("next").expect("task");
        assert_eq!(next.prompt(), Some("second"));
    }

    #[tokio::test]
    async fn rename_touches_only_the_name() {
        let store = store().await;
        let t = task("label me", 3);
        store.add(&t).await.expect("add");
        store.set_status(t.id, TaskStatus::Running, None).await.expect("run");
        let before = store.get(t.id, Detail::Full).await.expect("get").expect("row");

        assert!(store.rename(t.id, Some("poster")).await.expect("rename"));
        let named = store.get(t.id, Detail::Full).await.expect("get").expect("row");
        assert_eq!(named.name.as_deref(), Some("poster"));
        assert_eq!(Task { name: None, ..named }, before);

        assert!(store.rename(t.id, None).await.expect("clear"));
        let cleared = store.get(t.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(cleared.name, None);
        assert!(!store.rename(Uuid::new_v4(), Some("ghost")).await.expect("missing"));
    }

    #[tokio::test]
    async fn update_overwrites_the_row() {
        let store = store().await;
        let mut t = task("before", 0);
        store.add(&t).await.expect("add");
        t.params.insert("prompt".into(), json!("after"));
        t.name = Some("renamed".into());
        assert!(store.update(&t).await.expect("update"));
        let back = store.get(t.id, Detail::Full).await.expect("get").expect("row");
        assert_eq!(back, t);
    }

    #[tokio::test]
    async fn requeue_running_resets_orphans() {
        let store = store().await;
        let t = task("orphan", 0);
        store.add(&t).await.expect("add");
        store.set_status(t.id, TaskStatus::Running, None).await.expect("run");

        assert_eq!(store.requeue_running().await.expect("requeue"), 1);
        let back = store.get(t.id, Detail::Shallow).await.expect("get").expect("row");
        assert_eq!(back.status, TaskStatus::Pending);
        assert!(back.started_at.is_none());
    }

    // ── bookmarks ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn bookmark_lifecycle() {
        let store = store().await;
        let mut older = Bookmark::new("older", TaskType::Txt2Img, Params::new(), "model-a", vec![]);
        older.created_at = Utc::now() - Duration::seconds(5);
        let newer = Bookmark::new("newer", TaskType::Img2Img, Params::new(), "model-b", vec![ScriptArg::UseDefault]);
        store.add_bookmark(&older).await.expect("add older");
        store.add_bookmark(&newer).await.expect("add newer");

        let listed = store.list_bookmarks().await.expect("list");
        assert_eq!(listed.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(), vec!["newer", "older"]);
        assert_eq!(store.count_bookmarks().await.expect("count"), 2);
        assert_eq!(store.get_bookmark(newer.id).await.expect("get"), Some(newer.clone()));

        let update = BookmarkUpdate { name: Some("renamed".into()), ..Default::default() };
        assert!(store.update_bookmark(older.id, update).await.expect("update"));
        let renamed = store.get_bookmark(older.id).await.expect("get").expect("row");
        assert_eq!(renamed.name, "renamed");
        assert_eq!(renamed.checkpoint, "model-a");

        assert!(store.delete_bookmark(older.id).await.expect("delete"));
        assert!(!store.delete_bookmark(older.id).await.expect("delete again"));
        assert!(!store.update_bookmark(older.id, BookmarkUpdate::default()).await.expect("update missing"));
        assert_eq!(store.count_bookmarks().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn bookmark_capture_format_survives_and_defaults() {
        let store = store().await;
        let mut dynamic = Bookmark::new("dyn", TaskType::Txt2Img, Params::new(), "", vec![]);
        dynamic.capture_format = CaptureFormat::Dynamic;
        store.add_bookmark(&dynamic).await.expect("add");
        let back = store.get_bookmark(dynamic.id).await.expect("get").expect("row");
        assert_eq!(back.capture_format, CaptureFormat::Dynamic);

        let old = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO bookmarks (id, name, task_type, created_at, params, checkpoint, script_args) \
             VALUES (?1, 'old', 'txt2img', ?2, '{}', '', '[]')",
        )
        .bind(old.to_string())
        .bind(timestamp(&Utc::now()))
        .execute(&store.pool)
        .await
        .expect("raw insert");
        let legacy = store.get_bookmark(old).await.expect("get").expect("row");
        assert_eq!(legacy.capture_format, CaptureFormat::Legacy);
    }
}
