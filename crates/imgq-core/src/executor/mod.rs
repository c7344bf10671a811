//! Background executor: pulls tasks from the queue and runs them on the host.
//!
//! One loop at a time. The loop ends by itself once the queue is drained; a
//! fresh [`Executor::start`] is needed to pick up tasks added afterwards.

use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use strum::{Display, IntoStaticStr};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::{effective_overrides, restore_strategy_for};
use crate::db::{Detail, QueueStats};
use crate::error::{ExecutorError, QueueError};
use crate::host::checkpoint::switch_checkpoint_if_needed;
use crate::host::overrides::{OutputSubfolderOverride, SettingsOverride};
use crate::host::thread::HostThread;
use crate::host::{Generated, HostEngine, HostError};
use crate::queue::QueueManager;
use crate::script_args::{LiveArg, merge_script_args};
use crate::task::{Task, TaskStatus};


#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Pause stops after the current image and parks the task as paused.
    pub advanced_pause: bool,
    /// Log a warning for tasks that run longer than this.
    pub warn_after: Duration,
    /// strftime template appended to the host's output directory pattern.
    pub output_subfolder: Option<String>,
    pub idle_poll: Duration,
    pub busy_poll: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            advanced_pause: false,
            warn_after: Duration::from_secs(600),
            output_subfolder: None,
            idle_poll: Duration::from_millis(500),
            busy_poll: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, IntoStaticStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorState {
    Stopped,
    Running,
    Pausing,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub is_stopping: bool,
    pub state: ExecutorState,
    pub status_text: String,
    pub current_task: Option<Task>,
    pub queue_stats: QueueStats,
}

/// Shared handle to the executor. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Executor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    queue: QueueManager,
    host: HostThread,
    config: ExecutorConfig,
    running: AtomicBool,
    paused: AtomicBool,
    stopping: AtomicBool,
    /// Bumped by every `start`; a loop whose epoch is stale exits.
    epoch: AtomicU64,
    current: RwLock<Option<Task>>,
    status: watch::Sender<String>,
    /// Held for the whole execution of one task.
    execution: Arc<Mutex<()>>,
}

/// What the host thread reports back for one generation.
struct HostRun {
    outcome: Result<Generated, HostError>,
    interrupted: bool,
    stopping_generation: bool,
}

impl Executor {
    pub fn new(queue: QueueManager, host: HostThread, config: ExecutorConfig) -> Self {
        let (status, _) = watch::channel("idle".to_owned());
        Self {
            inner: Arc::new(Inner {
                queue,
                host,
                config,
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                current: RwLock::new(None),
                status,
                execution: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Start the loop. `false` when it is already running.
    pub fn start(&self) -> bool {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        inner.paused.store(false, Ordering::SeqCst);
        inner.stopping.store(false, Ordering::SeqCst);
        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(Arc::clone(inner).run_loop(epoch));
        inner.publish("started");
        info!(epoch, "queue processing started");
        true
    }

    /// Interrupt the running task and end the loop. `false` when idle.
    pub async fn stop(&self) -> bool {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return false;
        }
        inner.stopping.store(true, Ordering::SeqCst);
        inner.running.store(false, Ordering::SeqCst);
        inner.publish("stopping");
        info!("stopping queue processing");
        inner.host.interrupt().await;
        true
    }

    pub async fn pause(&self) {
        let inner = &self.inner;
        inner.paused.store(true, Ordering::SeqCst);
        if inner.config.advanced_pause && inner.current_task().is_some() {
            inner.host.stop_generating().await;
            inner.publish("pausing_image");
            info!("pausing after the current image");
        } else {
            inner.publish("pausing_task");
            info!("pausing after the current task");
        }
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.publish("resumed");
        info!("queue processing resumed");
    }

    /// Run one pending or paused task now, outside queue order. Finished
    /// tasks are rerun through [`QueueManager::retry`] instead.
    pub async fn run_single_task(&self, id: Uuid) -> Result<(), ExecutorError> {
        let inner = Arc::clone(&self.inner);
        let guard = Arc::clone(&inner.execution)
            .try_lock_owned()
            .map_err(|_| ExecutorError::Busy)?;
        if inner.current_task().is_some() {
            return Err(ExecutorError::Busy);
        }
        let task = inner.queue.get_task(id, Detail::Full).await?.ok_or(ExecutorError::NotFound(id))?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Paused) {
            return Err(ExecutorError::NotRunnable { id, status: task.status });
        }

        info!(task_id = %id, name = %task.display_name(), "running single task");
        tokio::spawn(async move {
            let _guard = guard;
            let was_running = inner.running.swap(true, Ordering::SeqCst);
            inner.execute(task).await;
            if !was_running {
                inner.running.store(false, Ordering::SeqCst);
                inner.stopping.store(false, Ordering::SeqCst);
            }
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ExecutorState {
        self.inner.state()
    }

    pub fn current_task(&self) -> Option<Task> {
        self.inner.current_task()
    }

    pub async fn get_status(&self) -> Result<ExecutorStatus, ExecutorError> {
        let inner = &self.inner;
        let queue_stats = inner.queue.stats().await?;
        Ok(ExecutorStatus {
            is_running: inner.running.load(Ordering::SeqCst),
            is_paused: inner.paused.load(Ordering::SeqCst),
            is_stopping: inner.stopping.load(Ordering::SeqCst),
            state: inner.state(),
            status_text: inner.status.borrow().clone(),
            current_task: inner.current_task(),
            queue_stats,
        })
    }

    /// Status text changes, starting with the current one.
    pub fn subscribe_status(&self) -> watch::Receiver<String> {
        self.inner.status.subscribe()
    }
}

impl Inner {
    fn publish(&self, text: &str) {
        self.status.send_replace(text.to_owned());
    }

    fn state(&self) -> ExecutorState {
        if self.stopping.load(Ordering::SeqCst) {
            ExecutorState::Stopping
        } else if !self.running.load(Ordering::SeqCst) {
            ExecutorState::Stopped
        } else if self.paused.load(Ordering::SeqCst) {
            ExecutorState::Pausing
        } else {
            ExecutorState::Running
        }
    }

    fn current_task(&self) -> Option<Task> {
        self.current.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_current(&self, task: Option<Task>) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = task;
    }

    fn active(&self, epoch: u64) -> bool {
        self.running.load(Ordering::SeqCst)
            && !self.stopping.load(Ordering::SeqCst)
            && self.epoch.load(Ordering::SeqCst) == epoch
    }

    async fn run_loop(self: Arc<Self>, epoch: u64) {
        debug!(epoch, "executor loop entered");
        while self.active(epoch) {
            if self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(self.config.idle_poll).await;
                continue;
            }
            if self.host.is_busy().await {
                debug!("host busy with other work; waiting");
                tokio::time::sleep(self.config.busy_poll).await;
                continue;
            }

            let next = match self.pick_next().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    info!("queue drained");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "failed to read next task");
                    tokio::time::sleep(self.config.idle_poll).await;
                    continue;
                }
            };

            let _guard = Arc::clone(&self.execution).lock_owned().await;
            if !self.active(epoch) {
                break;
            }
            self.execute(next).await;
        }

        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.set_current(None);
            self.publish("finished");
            self.stopping.store(false, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
        }
        info!(epoch, "queue processing finished");
    }

    /// Paused work resumes ahead of fresh pending tasks.
    async fn pick_next(&self) -> Result<Option<Task>, QueueError> {
        if let Some(task) = self.queue.next_paused().await? {
            return Ok(Some(task));
        }
        self.queue.next_pending().await
    }

    async fn execute(&self, picked: Task) {
        let id = picked.id;
        let resuming = picked.status == TaskStatus::Paused;
        let started = Instant::now();

        if let Err(e) = self.run_task(id, resuming).await {
            error!(task_id = %id, error = %e, "task bookkeeping failed");
        }
        self.set_current(None);

        let elapsed = started.elapsed();
        if elapsed > self.config.warn_after {
            warn!(task_id = %id, elapsed_secs = elapsed.as_secs(), "task ran unusually long");
        }
    }

    async fn run_task(&self, id: Uuid, resuming: bool) -> Result<(), QueueError> {
        if !self.queue.set_running(id).await? {
            warn!(task_id = %id, "task left the queue before it could run");
            return Ok(());
        }
        let Some(task) = self.queue.get_task(id, Detail::Full).await? else {
            warn!(task_id = %id, "task vanished before it could run");
            return Ok(());
        };
        self.set_current(Some(task.clone()));
        info!(task_id = %id, name = %task.display_name(), resuming, "executing task");

        let overrides = effective_overrides(&task.params, &task.checkpoint);
        let strategy = restore_strategy_for(task.capture_format);
        let mut request = match strategy.create_request(task.task_type, &task.params, &overrides) {
            Ok(request) => request,
            Err(e) => {
                let text = failure_text(&e);
                warn!(task_id = %id, error = %text, "could not rebuild request");
                self.queue.set_failed(id, &text).await?;
                return Ok(());
            }
        };
        if resuming && task.original_n_iter > task.completed_iterations {
            request.n_iter = task.original_n_iter - task.completed_iterations;
            debug!(task_id = %id, remaining = request.n_iter, "resuming with remaining iterations");
        }

        let subfolder = self.config.output_subfolder.clone();
        let checkpoint = task.checkpoint.clone();
        let stored = task.script_args.clone();
        let task_type = task.task_type;
        let job = move |host: &dyn HostEngine| {
            let _settings = SettingsOverride::apply(host, &overrides);
            let _subfolder = OutputSubfolderOverride::apply(host, subfolder.as_deref());
            switch_checkpoint_if_needed(host, &checkpoint);
            let defaults = host.script_defaults(task_type);
            request.script_args = merge_script_args(&stored, &defaults).into_iter().map(LiveArg::Json).collect();
            let outcome = host.generate(request);
            HostRun {
                outcome,
                interrupted: host.interrupted(),
                stopping_generation: host.stopping_generation(),
            }
        };

        match self.host.call(job).await {
            Ok(run) => self.record(&task, run).await,
            Err(e) => self.record_failure(&task, &e, false).await,
        }
    }

    async fn record(&self, task: &Task, run: HostRun) -> Result<(), QueueError> {
        let generated = match run.outcome {
            Ok(generated) => generated,
            Err(e) => return self.record_failure(task, &e, run.interrupted).await,
        };
        let id = task.id;
        let mut images = task.result_images.clone();
        let produced = generated.images.len();
        images.extend(generated.images);
        let info = Some(generated.info).filter(|i| !i.is_empty());

        if self.stopping.load(Ordering::SeqCst) || run.interrupted {
            self.queue.set_stopped(id, images, info).await?;
            self.stopping.store(false, Ordering::SeqCst);
            self.publish("stopped");
            info!(task_id = %id, produced, "task stopped");
            return Ok(());
        }

        if self.paused.load(Ordering::SeqCst) && run.stopping_generation {
            if self.config.advanced_pause {
                let original = if task.original_n_iter > 0 { task.original_n_iter } else { task.n_iter() };
                let finished = u32::try_from(produced).unwrap_or(u32::MAX) / task.batch_size().max(1);
                let completed = task.completed_iterations.saturating_add(finished).min(original);
                if completed < original {
                    self.queue.set_paused(id, images, info, completed, original).await?;
                    self.publish("paused");
                    info!(task_id = %id, completed, original, "task paused");
                    return Ok(());
                }
            } else {
                self.queue.set_completed(id, images, info).await?;
                self.publish("paused");
                info!(task_id = %id, produced, "task completed; queue paused");
                return Ok(());
            }
        }

        self.queue.set_completed(id, images, info).await?;
        info!(task_id = %id, produced, "task completed");
        Ok(())
    }

    async fn record_failure(&self, task: &Task, e: &HostError, interrupted: bool) -> Result<(), QueueError> {
        let id = task.id;
        if self.stopping.load(Ordering::SeqCst) || interrupted {
            self.queue.set_stopped(id, task.result_images.clone(), None).await?;
            self.stopping.store(false, Ordering::SeqCst);
            self.publish("stopped");
            info!(task_id = %id, "task stopped during generation");
            return Ok(());
        }
        let text = failure_text(e);
        error!(task_id = %id, error = %text, "task failed");
        self.queue.set_failed(id, &text).await?;
        Ok(())
    }
}

/// An error's message followed by its source chain.
fn failure_text(e: &(dyn StdError + 'static)) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
