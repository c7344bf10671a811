//! Turning live generation requests into storable parameters and back.
//!
//! Two interchangeable strategies exist. [`fixed::FixedFields`] names every
//! field it stores; [`reflective::Reflective`] stores whatever the request
//! serialises to, so fields added by newer hosts survive without code
//! changes. Which one restores a task is recorded per task as its
//! [`CaptureFormat`].
//!
//! Both produce parameter maps that [`extract_display_info`] can read.

pub mod fixed;
pub mod reflective;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::CaptureError;
use crate::host::overrides::{CHECKPOINT_KEY, VAE_KEY, VAE_MODULES_KEY};
use crate::host::{GenerationRequest, HostEngine, ScriptInfo};
use crate::script_args::{LiveArg, ScriptArg};
use crate::task::{CaptureFormat, Params, TaskType};

/// Settings that change the output of a generation.
pub const ESSENTIAL_SETTINGS: [&str; 10] = [
    "sd_vae",
    "CLIP_stop_at_last_layers",
    "eta_noise_seed_delta",
    "randn_source",
    "eta_ancestral",
    "eta_ddim",
    "s_churn",
    "s_tmin",
    "s_tmax",
    "s_noise",
];

const QUICKSETTINGS_KEY: &str = "quicksettings_list";

/// Parameter keys with a slot of their own in every capture format.
pub(crate) const SHARED_KEYS: [&str; 5] = [
    "ui_settings",
    "override_settings",
    "extra_generation_params",
    "init_images",
    "mask_path",
];

/// Host state read at capture time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSnapshot {
    pub checkpoint: String,
    pub settings: Params,
    pub scripts: Vec<ScriptInfo>,
}

impl HostSnapshot {
    /// Read the checkpoint, every capturable setting and the script ranges.
    /// Must run on the host thread.
    pub fn read(host: &dyn HostEngine, task_type: TaskType) -> Self {
        let mut settings = Params::new();
        if let Some(quick) = host.setting(QUICKSETTINGS_KEY) {
            settings.insert(QUICKSETTINGS_KEY.to_owned(), quick);
        }
        let mut keys: BTreeSet<String> = ESSENTIAL_SETTINGS.iter().map(|k| (*k).to_owned()).collect();
        keys.extend(quicksettings(&settings));
        keys.insert(VAE_MODULES_KEY.to_owned());
        for key in keys {
            if let Some(value) = host.setting(&key) {
                settings.insert(key, value);
            }
        }
        Self {
            checkpoint: host.current_checkpoint(),
            settings,
            scripts: host.scripts(task_type),
        }
    }
}

/// Result of a capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured {
    pub task_type: TaskType,
    pub params: Params,
    pub script_args: Vec<ScriptArg>,
    pub checkpoint: String,
    pub capture_format: CaptureFormat,
}

/// Live request -> storable parameters.
pub trait CaptureStrategy: Send + Sync {
    fn format(&self) -> CaptureFormat;

    /// Generation fields of the request, without the shared keys.
    fn core_params(&self, request: &GenerationRequest) -> Params;

    /// Full capture: core fields plus settings, images and extension args.
    ///
    /// Arguments owned by an extension whose title contains any of
    /// `skip_titles` (case-insensitive) are stored as `UseDefault`.
    fn capture(
        &self,
        request: &GenerationRequest,
        snapshot: &HostSnapshot,
        skip_titles: &[String],
    ) -> Captured {
        let mut params = self.core_params(request);

        params.insert(
            "ui_settings".into(),
            Value::Object(ui_settings(snapshot, &request.override_settings)),
        );
        if !request.init_images.is_empty() {
            params.insert("init_images".into(), json!(request.init_images));
        }
        if let Some(mask) = &request.mask_path {
            params.insert("mask_path".into(), json!(mask));
        }
        if !request.override_settings.is_empty() {
            params.insert("override_settings".into(), Value::Object(request.override_settings.clone()));
        }
        if !request.extra_generation_params.is_empty() {
            params.insert(
                "extra_generation_params".into(),
                Value::Object(request.extra_generation_params.clone()),
            );
        }

        Captured {
            task_type: request.task_type(),
            params,
            script_args: capture_script_args(&request.script_args, &snapshot.scripts, skip_titles),
            checkpoint: snapshot.checkpoint.clone(),
            capture_format: self.format(),
        }
    }
}

/// Stored parameters -> live request.
pub trait RestoreStrategy: Send + Sync {
    /// Rebuild a request for `task_type`. `overrides` become the request's
    /// `override_settings`. Extension arguments are left empty.
    fn create_request(
        &self,
        task_type: TaskType,
        params: &Params,
        overrides: &Params,
    ) -> Result<GenerationRequest, CaptureError>;

    fn extract_display_info(&self, params: &Params) -> Result<DisplayInfo, CaptureError> {
        extract_display_info(params)
    }
}

pub fn capture_strategy_for(format: CaptureFormat) -> &'static dyn CaptureStrategy {
    match format {
        CaptureFormat::Legacy => &fixed::FixedFields,
        CaptureFormat::Dynamic => &reflective::Reflective,
    }
}

pub fn restore_strategy_for(format: CaptureFormat) -> &'static dyn RestoreStrategy {
    match format {
        CaptureFormat::Legacy => &fixed::FixedFields,
        CaptureFormat::Dynamic => &reflective::Reflective,
    }
}

/// Settings that run with a task: its UI settings, then its own overrides,
/// then the checkpoint it was queued with.
pub fn effective_overrides(params: &Params, checkpoint: &str) -> Params {
    let mut merged = object(params.get("ui_settings"));
    merged.extend(object(params.get("override_settings")));
    if !checkpoint.is_empty() {
        merged.insert(CHECKPOINT_KEY.to_owned(), json!(checkpoint));
    }
    merged
}

fn ui_settings(snapshot: &HostSnapshot, request_overrides: &Params) -> Params {
    let mut keys: BTreeSet<String> = ESSENTIAL_SETTINGS.iter().map(|k| (*k).to_owned()).collect();
    keys.extend(quicksettings(&snapshot.settings));

    let mut captured = Params::new();
    for key in keys {
        if key == CHECKPOINT_KEY || key == VAE_MODULES_KEY || request_overrides.contains_key(&key) {
            continue;
        }
        if let Some(value) = snapshot.settings.get(&key) {
            captured.insert(key, value.clone());
        }
    }
    let modules = match snapshot.settings.get(VAE_MODULES_KEY) {
        Some(v @ Value::Array(_)) => v.clone(),
        _ => json!([]),
    };
    captured.insert(VAE_MODULES_KEY.to_owned(), modules);
    captured
}

fn quicksettings(settings: &Params) -> Vec<String> {
    settings
        .get(QUICKSETTINGS_KEY)
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).map(str::to_owned).collect())
        .unwrap_or_default()
}

/// Degrade live extension arguments to their storable form.
pub fn capture_script_args(live: &[LiveArg], scripts: &[ScriptInfo], skip_titles: &[String]) -> Vec<ScriptArg> {
    let skipped: Vec<&ScriptInfo> = scripts
        .iter()
        .filter(|s| {
            let title = s.title.to_lowercase();
            skip_titles
                .iter()
                .any(|t| !t.is_empty() && title.contains(&t.to_lowercase()))
        })
        .collect();
    for script in &skipped {
        debug!(title = %script.title, from = script.args_from, to = script.args_to, "storing extension args as defaults");
    }

    live.iter()
        .enumerate()
        .map(|(slot, arg)| {
            if skipped.iter().any(|s| s.owns(slot)) {
                ScriptArg::UseDefault
            } else {
                arg.to_stored()
            }
        })
        .collect()
}

// ── display info ──────────────────────────────────────────────────────────────

/// Summary fields shown next to a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub vae: String,
    pub sampler_name: String,
    pub scheduler: String,
    pub width: u32,
    pub height: u32,
    pub enable_hr: bool,
    pub upscaled_width: u32,
    pub upscaled_height: u32,
    pub batch_size: u32,
    pub n_iter: u32,
}

pub const DISPLAY_INFO_FIELDS: [&str; 10] = [
    "vae",
    "sampler_name",
    "scheduler",
    "width",
    "height",
    "enable_hr",
    "upscaled_width",
    "upscaled_height",
    "batch_size",
    "n_iter",
];

/// Check that `raw` has every display field, then decode it.
pub fn validate_display_info(raw: &Params) -> Result<DisplayInfo, CaptureError> {
    let missing: Vec<&'static str> = DISPLAY_INFO_FIELDS
        .iter()
        .copied()
        .filter(|f| !raw.contains_key(*f))
        .collect();
    if !missing.is_empty() {
        return Err(CaptureError::InvalidDisplayInfo { missing });
    }
    Ok(serde_json::from_value(Value::Object(raw.clone()))?)
}

/// Pull the display summary out of stored parameters of either format.
pub fn extract_display_info(params: &Params) -> Result<DisplayInfo, CaptureError> {
    let ui = object(params.get("ui_settings"));
    let overrides = object(params.get("override_settings"));

    let width = u32_param(params, "width", 512);
    let height = u32_param(params, "height", 512);
    let enable_hr = params.get("enable_hr").and_then(Value::as_bool).unwrap_or(false);
    let (mut upscaled_width, mut upscaled_height) = (0, 0);
    if enable_hr {
        let rx = u32_param(params, "hr_resize_x", 0);
        let ry = u32_param(params, "hr_resize_y", 0);
        let scale = params.get("hr_scale").and_then(Value::as_f64).unwrap_or(2.0);
        if rx > 0 && ry > 0 {
            (upscaled_width, upscaled_height) = (rx, ry);
        } else if scale > 0.0 {
            upscaled_width = (f64::from(width) * scale) as u32;
            upscaled_height = (f64::from(height) * scale) as u32;
        }
    }

    let mut raw = Params::new();
    raw.insert("vae".into(), json!(vae_name(&ui, &overrides)));
    raw.insert("sampler_name".into(), json!(str_param(params, "sampler_name")));
    raw.insert("scheduler".into(), json!(str_param(params, "scheduler")));
    raw.insert("width".into(), json!(width));
    raw.insert("height".into(), json!(height));
    raw.insert("enable_hr".into(), json!(enable_hr));
    raw.insert("upscaled_width".into(), json!(upscaled_width));
    raw.insert("upscaled_height".into(), json!(upscaled_height));
    raw.insert("batch_size".into(), json!(u32_param(params, "batch_size", 1)));
    raw.insert("n_iter".into(), json!(u32_param(params, "n_iter", 1)));
    validate_display_info(&raw)
}

/// VAE file name: a VAE-looking module, else the first module, else the
/// `sd_vae` setting.
fn vae_name(ui: &Params, overrides: &Params) -> String {
    let modules: Vec<&str> = ui
        .get(VAE_MODULES_KEY)
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).filter(|m| !m.is_empty()).collect())
        .unwrap_or_default();

    let from_modules = modules
        .iter()
        .find(|m| m.to_lowercase().contains("vae"))
        .or_else(|| modules.first())
        .map(|m| file_name(m));

    let name = from_modules.unwrap_or_else(|| {
        [overrides.get(VAE_KEY), ui.get(VAE_KEY)]
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .find(|v| !v.is_empty())
            .unwrap_or_default()
            .to_owned()
    });
    match name.as_str() {
        "Automatic" | "None" => String::new(),
        _ => name,
    }
}

fn file_name(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_owned()
}

// ── param readers shared by the strategies ────────────────────────────────────

pub(crate) fn object(value: Option<&Value>) -> Params {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Params::new(),
    }
}

pub(crate) fn str_param(params: &Params, key: &str) -> String {
    params.get(key).and_then(Value::as_str).unwrap_or_default().to_owned()
}

pub(crate) fn u32_param(params: &Params, key: &str, default: u32) -> u32 {
    params
        .get(key)
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)))
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(default)
}
