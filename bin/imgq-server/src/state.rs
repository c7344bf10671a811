//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use imgq_core::host::thread::HostThread;
use imgq_core::intercept::InterceptState;
use imgq_core::{Executor, QueueManager};

use crate::config::Config;

#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    pub queue: QueueManager,
    pub executor: Executor,
    /// Runs host calls that must stay on one thread.
    pub host: HostThread,
    pub intercept: Arc<InterceptState>,
}
