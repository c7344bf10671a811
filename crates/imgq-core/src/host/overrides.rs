//! Scoped changes to host settings.
//!
//! Both guards restore what they changed when dropped, which covers normal
//! returns, early `?` returns and unwinding alike.

use std::fmt::Write as _;

use chrono::{DateTime, Local};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::HostEngine;
use crate::task::Params;

/// Checkpoint switching is handled by [`super::checkpoint`], never by a setting.
pub const CHECKPOINT_KEY: &str = "sd_model_checkpoint";
/// VAE and text-encoder files loaded alongside the checkpoint.
pub const VAE_MODULES_KEY: &str = "forge_additional_modules";
pub const VAE_KEY: &str = "sd_vae";
pub const DIRECTORY_PATTERN_KEY: &str = "directories_filename_pattern";

/// Applies per-task settings and puts the originals back on drop.
#[must_use = "settings are restored as soon as the guard is dropped"]
pub struct SettingsOverride<'h> {
    host: &'h dyn HostEngine,
    originals: Vec<(String, Value)>,
    vae_reloaded: bool,
}

impl<'h> SettingsOverride<'h> {
    /// Apply `overrides`.
    ///
    /// Keys the host does not know are skipped. The VAE module list is always
    /// replaced: a task that carries none runs with none.
    pub fn apply(host: &'h dyn HostEngine, overrides: &Params) -> Self {
        let mut originals = Vec::new();

        for (key, value) in overrides {
            if key == CHECKPOINT_KEY || key == VAE_MODULES_KEY {
                continue;
            }
            let Some(original) = host.setting(key) else {
                debug!(key = %key, "host has no such setting; skipped");
                continue;
            };
            match host.set_setting(key, value.clone()) {
                Ok(()) => originals.push((key.clone(), original)),
                Err(e) => warn!(key = %key, error = %e, "failed to apply setting"),
            }
        }

        let current_modules = module_list(host.setting(VAE_MODULES_KEY));
        let target_modules = module_list(overrides.get(VAE_MODULES_KEY).cloned());
        originals.push((VAE_MODULES_KEY.to_owned(), current_modules.clone()));

        let mut vae_reloaded = false;
        if target_modules != current_modules {
            match host.set_setting(VAE_MODULES_KEY, target_modules.clone()) {
                Ok(()) => {
                    info!(modules = %target_modules, "switched VAE modules");
                    vae_reloaded = true;
                }
                Err(e) => warn!(error = %e, "failed to switch VAE modules"),
            }
        }
        if overrides.get(VAE_KEY).and_then(Value::as_str).is_some_and(is_explicit_vae) {
            vae_reloaded = true;
        }
        if vae_reloaded {
            refresh_vae(host);
        }

        if !originals.is_empty() {
            debug!(count = originals.len(), "applied task settings");
        }
        Self { host, originals, vae_reloaded }
    }
}

impl Drop for SettingsOverride<'_> {
    fn drop(&mut self) {
        for (key, value) in self.originals.drain(..) {
            if let Err(e) = self.host.set_setting(&key, value) {
                warn!(key = %key, error = %e, "failed to restore setting");
            }
        }
        if self.vae_reloaded {
            refresh_vae(self.host);
        }
        debug!("restored task settings");
    }
}

/// Appends a dated subfolder to the host's output directory pattern.
#[must_use = "the pattern is restored as soon as the guard is dropped"]
pub struct OutputSubfolderOverride<'h> {
    host: &'h dyn HostEngine,
    original: Option<Value>,
}

impl<'h> OutputSubfolderOverride<'h> {
    /// No-op when `template` is empty or not a valid strftime template.
    pub fn apply(host: &'h dyn HostEngine, template: Option<&str>) -> Self {
        let inert = Self { host, original: None };
        let Some(subfolder) = template
            .filter(|t| !t.is_empty())
            .and_then(|t| format_subfolder(t, Local::now()))
        else {
            return inert;
        };

        let original = host.setting(DIRECTORY_PATTERN_KEY).unwrap_or_else(|| json!(""));
        let base = original.as_str().unwrap_or_default();
        let pattern = if base.is_empty() {
            subfolder
        } else {
            format!("{base}/{subfolder}")
        };

        match host.set_setting(DIRECTORY_PATTERN_KEY, Value::String(pattern.clone())) {
            Ok(()) => {
                info!(from = %base, to = %pattern, "output directory pattern");
                Self { host, original: Some(original) }
            }
            Err(e) => {
                warn!(error = %e, "failed to set output subfolder");
                inert
            }
        }
    }
}

impl Drop for OutputSubfolderOverride<'_> {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            if let Err(e) = self.host.set_setting(DIRECTORY_PATTERN_KEY, original) {
                warn!(error = %e, "failed to restore output directory pattern");
            }
        }
    }
}

/// Render a strftime template; `None` (with a warning) when it is invalid.
pub fn format_subfolder(template: &str, now: DateTime<Local>) -> Option<String> {
    let mut out = String::new();
    if write!(out, "{}", now.format(template)).is_err() {
        warn!(template, "invalid output subfolder template; ignoring it");
        return None;
    }
    (!out.is_empty()).then_some(out)
}

fn is_explicit_vae(name: &str) -> bool {
    !matches!(name, "" | "Automatic" | "None")
}

fn module_list(value: Option<Value>) -> Value {
    match value {
        Some(v @ Value::Array(_)) => v,
        _ => json!([]),
    }
}

fn refresh_vae(host: &dyn HostEngine) {
    if let Err(e) = host.refresh_vae() {
        warn!(error = %e, "failed to reload VAE");
    }
}
