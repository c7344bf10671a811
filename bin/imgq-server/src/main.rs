//! imgq-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON when `IMGQ_LOG_JSON` is set).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Connect the WebUI host and start the host thread.
//! 5. Build the queue manager and executor; requeue tasks a crash left running.
//! 6. Build the Axum router and serve with graceful shutdown.

mod config;
mod error;
mod host;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use imgq_core::db::TaskStore;
use imgq_core::host::thread::HostThread;
use imgq_core::intercept::InterceptState;
use imgq_core::{Executor, QueueManager, SqliteStore};
use tracing::{info, warn};

use crate::config::Config;
use crate::host::webui::WebUiHost;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: IMGQ_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "imgq-server starting");

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = SqliteStore::connect(&cfg.database_url).await?;
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Host ────────────────────────────────────────────────────────────────
    let webui = WebUiHost::new(cfg.webui_url.clone(), cfg.output_dir.clone())?;
    let host = HostThread::spawn(Arc::new(webui))?;
    info!(webui_url = %cfg.webui_url, output_dir = %cfg.output_dir, "WebUI host ready");

    // ── 5. Queue and executor ──────────────────────────────────────────────────
    let requeued = store.requeue_running().await?;
    if requeued > 0 {
        warn!(requeued, "tasks left running by a previous run were reset to pending");
    }
    let queue = QueueManager::new(store);
    let executor = Executor::new(queue.clone(), host.clone(), cfg.executor());

    let state = Arc::new(AppState {
        intercept: Arc::new(InterceptState::new(cfg.intercept_timeout())),
        config: Arc::new(cfg.clone()),
        queue,
        executor: executor.clone(),
        host,
    });

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if executor.stop().await {
        // Let the interrupted task record its outcome before the runtime goes.
        for _ in 0..50 {
            if executor.current_task().is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        info!("executor stopped");
    }
    info!("imgq-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
