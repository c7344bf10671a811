//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

use imgq_core::ExecutorConfig;

/// Runtime configuration for imgq-server.
///
/// Every field has a default so the server starts without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:7870"`).
    pub bind_address: String,

    /// SQLite database URL (default: `"sqlite://imgq.db"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated list of allowed CORS origins; `None` allows any.
    pub cors_allowed_origins: Option<String>,

    pub enable_swagger: bool,

    /// Base URL of the WebUI whose API runs the generations.
    pub webui_url: String,

    /// Where result images are written.
    pub output_dir: String,

    pub advanced_pause: bool,
    pub execution_warn_secs: u64,

    /// strftime template for a per-run output subfolder.
    pub output_subfolder: Option<String>,

    /// Capture new tasks with the reflective strategy.
    pub dynamic_capture: bool,

    /// Extension titles whose arguments are stored as "use default".
    pub skip_scripts: Vec<String>,

    pub intercept_timeout_secs: u64,
    pub idle_poll_ms: u64,
    pub busy_poll_ms: u64,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("IMGQ_BIND", "0.0.0.0:7870"),
            database_url: env_or("IMGQ_DATABASE_URL", "sqlite://imgq.db"),
            log_level: env_or("IMGQ_LOG", "info"),
            log_json: flag("IMGQ_LOG_JSON", false),
            cors_allowed_origins: std::env::var("IMGQ_CORS_ORIGINS").ok().filter(|s| !s.trim().is_empty()),
            enable_swagger: flag("IMGQ_ENABLE_SWAGGER", true),
            webui_url: env_or("IMGQ_WEBUI_URL", "http://127.0.0.1:7860"),
            output_dir: env_or("IMGQ_OUTPUT_DIR", "outputs"),
            advanced_pause: flag("IMGQ_ADVANCED_PAUSE", false),
            execution_warn_secs: parse_env("IMGQ_EXECUTION_WARN_SECS", 600),
            output_subfolder: std::env::var("IMGQ_OUTPUT_SUBFOLDER").ok().filter(|s| !s.trim().is_empty()),
            dynamic_capture: flag("IMGQ_DYNAMIC_CAPTURE", false),
            skip_scripts: list(&env_or("IMGQ_SKIP_SCRIPTS", "controlnet")),
            intercept_timeout_secs: parse_env("IMGQ_INTERCEPT_TIMEOUT_SECS", 10),
            idle_poll_ms: parse_env("IMGQ_IDLE_POLL_MS", 500),
            busy_poll_ms: parse_env("IMGQ_BUSY_POLL_MS", 1000),
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            advanced_pause: self.advanced_pause,
            warn_after: Duration::from_secs(self.execution_warn_secs),
            output_subfolder: self.output_subfolder.clone(),
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            busy_poll: Duration::from_millis(self.busy_poll_ms),
        }
    }

    pub fn intercept_timeout(&self) -> Duration {
        Duration::from_secs(self.intercept_timeout_secs)
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
