//! Persistent background queue for image-generation jobs.
//!
//! Tasks are stored in SQLite, ordered by priority and creation time, and run
//! one at a time by the [`executor::Executor`] against a [`host::HostEngine`].

pub mod bookmark;
pub mod capture;
pub mod db;
pub mod error;
pub mod executor;
pub mod host;
pub mod intercept;
pub mod queue;
pub mod script_args;
pub mod task;

pub use bookmark::{Bookmark, BookmarkUpdate};
pub use db::sqlite::SqliteStore;
pub use db::{Detail, QueueStats};
pub use error::{CaptureError, ExecutorError, QueueError};
pub use executor::{Executor, ExecutorConfig, ExecutorState, ExecutorStatus};
pub use host::{GenerationRequest, Generated, HostEngine, HostError};
pub use queue::{QueueEvent, QueueManager};
pub use task::{CaptureFormat, Params, Task, TaskStatus, TaskType};
