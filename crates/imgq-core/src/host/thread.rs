//! Dedicated OS thread for host calls that are bound to one thread.
//!
//! Jobs are boxed closures sent over a bounded channel and answered over a
//! oneshot. The thread runs until every [`HostThread`] handle is dropped.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::{HostEngine, HostError};

const JOB_QUEUE_DEPTH: usize = 16;

type Job = Box<dyn FnOnce(&dyn HostEngine) + Send>;

/// Handle to the host thread. Cheap to clone.
#[derive(Clone)]
pub struct HostThread {
    host: Arc<dyn HostEngine>,
    jobs: mpsc::Sender<Job>,
}

impl std::fmt::Debug for HostThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostThread").finish_non_exhaustive()
    }
}

impl HostThread {
    /// Spawn the `imgq-host` thread serving `host`.
    pub fn spawn(host: Arc<dyn HostEngine>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(JOB_QUEUE_DEPTH);
        let worker = Arc::clone(&host);

        std::thread::Builder::new()
            .name("imgq-host".into())
            .spawn(move || {
                info!("host thread started");
                while let Some(job) = rx.blocking_recv() {
                    job(worker.as_ref());
                }
                debug!("host thread exiting");
            })?;

        Ok(Self { host, jobs: tx })
    }

    /// Run `f` on the host thread and wait for its result.
    ///
    /// A panic inside `f` is caught and returned as [`HostError::Panicked`];
    /// the thread keeps serving later jobs.
    pub async fn call<F, R>(&self, f: F) -> Result<R, HostError>
    where
        F: FnOnce(&dyn HostEngine) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |host| {
            let outcome = catch_unwind(AssertUnwindSafe(|| f(host)))
                .map_err(|payload| HostError::Panicked(panic_message(payload.as_ref())));
            // Caller may have gone away; nothing to report to.
            let _ = tx.send(outcome);
        });
        self.jobs.send(job).await.map_err(|_| HostError::Disconnected)?;
        rx.await.map_err(|_| HostError::Disconnected)?
    }

    /// Abort whatever the host is generating. Safe while `generate` is in flight.
    pub async fn interrupt(&self) {
        self.off_thread(|host| host.interrupt()).await;
    }

    /// Ask the host to stop after the current image.
    pub async fn stop_generating(&self) {
        self.off_thread(|host| host.stop_generating()).await;
    }

    pub async fn is_busy(&self) -> bool {
        self.off_thread(|host| host.is_busy()).await.unwrap_or(false)
    }

    /// Calls that may block but are not bound to the host thread.
    async fn off_thread<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&dyn HostEngine) -> R + Send + 'static,
        R: Send + 'static,
    {
        let host = Arc::clone(&self.host);
        match tokio::task::spawn_blocking(move || f(host.as_ref())).await {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::error!(error = %e, "host call failed");
                None
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
