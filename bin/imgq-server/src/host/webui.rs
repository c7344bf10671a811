//! [`HostEngine`] backed by a running WebUI's HTTP API.
//!
//! Calls arrive on the host thread or a blocking pool thread, never on a
//! runtime worker, so each one drives its async request with
//! [`Handle::block_on`]. Every `n_iter` iteration is its own HTTP call, which
//! lets `stop_generating` take effect between iterations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Local;
use imgq_core::host::overrides::DIRECTORY_PATTERN_KEY;
use imgq_core::{GenerationRequest, Generated, HostEngine, HostError, TaskType};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct Progress {
    #[serde(default)]
    state: ProgressState,
}

#[derive(Debug, Default, Deserialize)]
struct ProgressState {
    #[serde(default)]
    job_count: i64,
}

#[derive(Debug, Deserialize)]
struct SdModel {
    title: String,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    info: String,
}

pub struct WebUiHost {
    client: reqwest::Client,
    base_url: String,
    output_dir: PathBuf,
    runtime: Handle,
    interrupted: AtomicBool,
    stopping: AtomicBool,
    generating: AtomicBool,
    /// Settings this host applies itself instead of forwarding.
    local: Mutex<HashMap<String, Value>>,
    counter: AtomicU64,
}

impl WebUiHost {
    /// Must be called from inside a tokio runtime.
    pub fn new(base_url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| HostError::request("failed to build HTTP client", e))?;
        let mut local = HashMap::new();
        local.insert(DIRECTORY_PATTERN_KEY.to_owned(), json!(""));
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            output_dir: output_dir.into(),
            runtime: Handle::current(),
            interrupted: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            generating: AtomicBool::new(false),
            local: Mutex::new(local),
            counter: AtomicU64::new(0),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/sdapi/v1/{path}", self.base_url)
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, HostError> {
        let url = self.url(path);
        self.runtime.block_on(async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| HostError::request(format!("GET {url} failed"), e))?;
            resp.json::<T>()
                .await
                .map_err(|e| HostError::request(format!("GET {url} returned an unexpected body"), e))
        })
    }

    fn post<T: serde::de::DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, HostError> {
        let url = self.url(path);
        self.runtime.block_on(async {
            let resp = self
                .client
                .post(&url)
                .json(body)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| HostError::request(format!("POST {url} failed"), e))?;
            resp.json::<T>()
                .await
                .map_err(|e| HostError::request(format!("POST {url} returned an unexpected body"), e))
        })
    }

    fn options(&self) -> Result<serde_json::Map<String, Value>, HostError> {
        self.get("options")
    }

    fn local_setting(&self, key: &str) -> Option<Value> {
        self.local.lock().unwrap_or_else(|p| p.into_inner()).get(key).cloned()
    }

    /// Directory for the next image: the output root plus the expanded
    /// directory pattern.
    fn target_dir(&self) -> PathBuf {
        let pattern = self
            .local_setting(DIRECTORY_PATTERN_KEY)
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        self.output_dir.join(expand_pattern(&pattern, &Local::now().format("%Y-%m-%d").to_string()))
    }

    fn save_images(&self, encoded: &[String], seed: i64) -> Result<Vec<String>, HostError> {
        let dir = self.target_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| HostError::request(format!("cannot create {}", dir.display()), e))?;
        encoded
            .iter()
            .map(|b64| {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                let path = dir.join(format!("{n:05}-{seed}.png"));
                write_image(&path, b64)?;
                Ok(path.to_string_lossy().into_owned())
            })
            .collect()
    }
}

impl HostEngine for WebUiHost {
    fn is_busy(&self) -> bool {
        if self.generating.load(Ordering::SeqCst) {
            return false;
        }
        match self.get::<Progress>("progress?skip_current_image=true") {
            Ok(p) => p.state.job_count > 0,
            Err(e) => {
                warn!(error = %e, "could not read WebUI progress");
                false
            }
        }
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Err(e) = self.post::<Value>("interrupt", &json!({})) {
            warn!(error = %e, "failed to send interrupt to WebUI");
        }
    }

    fn stop_generating(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn stopping_generation(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn current_checkpoint(&self) -> String {
        match self.options() {
            Ok(opts) => opts.get("sd_model_checkpoint").and_then(Value::as_str).unwrap_or_default().to_owned(),
            Err(e) => {
                warn!(error = %e, "could not read current checkpoint");
                String::new()
            }
        }
    }

    fn load_checkpoint(&self, name: &str) -> Result<bool, HostError> {
        let models: Vec<SdModel> = self.get("sd-models")?;
        let Some(model) = models.into_iter().find(|m| m.title.contains(name)) else {
            return Ok(false);
        };
        info!(checkpoint = %model.title, "loading checkpoint");
        self.post::<Value>("options", &json!({ "sd_model_checkpoint": model.title }))?;
        Ok(true)
    }

    fn setting(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.local_setting(key) {
            return Some(v);
        }
        match self.options() {
            Ok(mut opts) => opts.remove(key),
            Err(e) => {
                warn!(key, error = %e, "could not read WebUI option");
                None
            }
        }
    }

    fn set_setting(&self, key: &str, value: Value) -> Result<(), HostError> {
        {
            let mut local = self.local.lock().unwrap_or_else(|p| p.into_inner());
            if local.contains_key(key) {
                local.insert(key.to_owned(), value);
                return Ok(());
            }
        }
        self.post::<Value>("options", &json!({ key: value }))?;
        Ok(())
    }

    fn refresh_vae(&self) -> Result<(), HostError> {
        self.post::<Value>("refresh-vae", &json!({}))?;
        Ok(())
    }

    fn script_defaults(&self, _task_type: TaskType) -> Vec<Value> {
        // The HTTP API fills in extension defaults on its own.
        Vec::new()
    }

    fn generate(&self, request: GenerationRequest) -> Result<Generated, HostError> {
        self.interrupted.store(false, Ordering::SeqCst);
        self.stopping.store(false, Ordering::SeqCst);
        self.generating.store(true, Ordering::SeqCst);
        let outcome = self.run_iterations(request);
        self.generating.store(false, Ordering::SeqCst);
        outcome
    }
}

impl WebUiHost {
    fn run_iterations(&self, request: GenerationRequest) -> Result<Generated, HostError> {
        let endpoint = request.task_type().as_str();
        let mut body = serde_json::to_value(&request)
            .map_err(|e| HostError::request("request did not serialise", e))?;
        if let Value::Object(map) = &mut body {
            map.insert("n_iter".into(), json!(1));
            map.insert("send_images".into(), json!(true));
            map.insert("save_images".into(), json!(false));
            let values = request.script_values();
            if !values.is_empty() {
                map.insert("script_args".into(), Value::Array(values));
            }
            if request.task_type() == TaskType::Img2Img {
                let images = request
                    .init_images
                    .iter()
                    .map(|p| read_image(Path::new(p)))
                    .collect::<Result<Vec<_>, _>>()?;
                map.insert("init_images".into(), json!(images));
                if let Some(mask) = &request.mask_path {
                    map.insert("mask".into(), json!(read_image(Path::new(mask))?));
                }
            }
            map.remove("mask_path");
        }

        let mut images = Vec::new();
        let mut info = String::new();
        for iteration in 0..request.n_iter.max(1) {
            if self.interrupted() || self.stopping_generation() {
                debug!(iteration, "stopping between iterations");
                break;
            }
            let seed = if request.seed >= 0 { request.seed + i64::from(iteration) * i64::from(request.batch_size) } else { -1 };
            if let Value::Object(map) = &mut body {
                map.insert("seed".into(), json!(seed));
            }
            let resp: GenerationResponse = self.post(endpoint, &body)?;
            images.extend(self.save_images(&resp.images, seed)?);
            info = resp.info;
        }
        Ok(Generated { images, info })
    }
}

/// Expand the directory pattern. `[date]` becomes `date`; other bracketed
/// tokens are dropped.
fn expand_pattern(pattern: &str, date: &str) -> PathBuf {
    let expanded = pattern.replace("[date]", date);
    let mut out = String::with_capacity(expanded.len());
    let mut depth = 0usize;
    for c in expanded.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect()
}

fn read_image(path: &Path) -> Result<String, HostError> {
    let bytes = std::fs::read(path).map_err(|e| HostError::request(format!("cannot read {}", path.display()), e))?;
    Ok(STANDARD.encode(bytes))
}

fn write_image(path: &Path, encoded: &str) -> Result<(), HostError> {
    // Some WebUI versions prefix a data URL header.
    let payload = encoded.split_once(',').map_or(encoded, |(_, data)| data);
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| HostError::request("image was not valid base64", e))?;
    std::fs::write(path, bytes).map_err(|e| HostError::request(format!("cannot write {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_expansion() {
        assert_eq!(expand_pattern("[date]/batch", "2026-10-19"), PathBuf::from("2026-10-19").join("batch"));
        assert_eq!(expand_pattern("", "d"), PathBuf::new());
        assert_eq!(expand_pattern("[seed]-x/../y", "d"), PathBuf::from("-x").join("y"));
    }

    #[test]
    fn images_round_trip_through_disk() {
        let dir = std::env::temp_dir().join(format!("imgq-webui-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("a.png");

        write_image(&path, &format!("data:image/png;base64,{}", STANDARD.encode(b"png bytes"))).expect("write");
        assert_eq!(std::fs::read(&path).expect("read"), b"png bytes");
        assert_eq!(read_image(&path).expect("encode"), STANDARD.encode(b"png bytes"));
        assert!(write_image(&dir.join("b.png"), "!!not base64!!").is_err());

        std::fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[tokio::test]
    async fn local_pattern_never_reaches_the_api() {
        let host = WebUiHost::new("http://127.0.0.1:1", "out").expect("host");
        let host = tokio::task::spawn_blocking(move || {
            host.set_setting(DIRECTORY_PATTERN_KEY, json!("[date]/run")).expect("local set");
            host
        })
        .await
        .expect("join");
        assert_eq!(host.local_setting(DIRECTORY_PATTERN_KEY), Some(json!("[date]/run")));
    }
}
