//! Boundary to the image-generation host.
//!
//! The host is a black box that owns the model, the global settings and the
//! extension runner. It is synchronous and some of its calls are bound to a
//! single thread, so everything that touches host state goes through
//! [`thread::HostThread`]. Only [`HostEngine::interrupt`] and
//! [`HostEngine::stop_generating`] may be called from anywhere, because they
//! must reach a generation that is already in flight.

pub mod checkpoint;
pub mod overrides;
pub mod thread;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use crate::script_args::ScriptInfo;
use crate::script_args::LiveArg;
use crate::task::{Params, TaskType};

/// Errors raised by a host or by the host thread.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("{context}")]
    Request {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("host thread has shut down")]
    Disconnected,

    #[error("host job panicked: {0}")]
    Panicked(String),
}

impl HostError {
    pub fn request(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        HostError::Request { context: context.into(), source: Box::new(source) }
    }
}

/// A synchronous image-generation engine.
///
/// Every method except `interrupt`, `stop_generating`, `interrupted` and
/// `stopping_generation` is called on the host thread only.
pub trait HostEngine: Send + Sync + 'static {
    /// The host is generating for some other caller.
    fn is_busy(&self) -> bool;

    /// Abort the current generation as soon as possible.
    fn interrupt(&self);

    /// Finish the current image, then return what has been produced.
    fn stop_generating(&self);

    fn interrupted(&self) -> bool;

    fn stopping_generation(&self) -> bool;

    /// Title of the loaded checkpoint, e.g. `"sdxl_base.safetensors [31e35c80fc]"`.
    fn current_checkpoint(&self) -> String;

    /// Load the closest matching checkpoint. `Ok(false)` when the host knows
    /// no checkpoint by that name.
    fn load_checkpoint(&self, name: &str) -> Result<bool, HostError>;

    /// Current value of a host setting; `None` if the host has no such key.
    fn setting(&self, key: &str) -> Option<Value>;

    fn set_setting(&self, key: &str, value: Value) -> Result<(), HostError>;

    /// Reload VAE weights after the VAE settings changed.
    fn refresh_vae(&self) -> Result<(), HostError> {
        Ok(())
    }

    /// Live default value of every extension argument slot.
    fn script_defaults(&self, task_type: TaskType) -> Vec<Value>;

    /// Argument ranges of the installed extensions.
    fn scripts(&self, task_type: TaskType) -> Vec<ScriptInfo> {
        let _ = task_type;
        Vec::new()
    }

    /// Run a generation to completion. Clears both interruption flags when
    /// the job starts; returns whatever was produced if interrupted.
    fn generate(&self, request: GenerationRequest) -> Result<Generated, HostError>;
}

/// Images and infotext produced by one generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Generated {
    /// Paths of the saved images.
    pub images: Vec<String>,
    pub info: String,
}

/// A live generation request.
///
/// Unknown keys survive in `extra` so that parameters added by newer hosts
/// round-trip through storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    #[serde(alias = "prompt_styles")]
    pub styles: Vec<String>,
    pub seed: i64,
    pub subseed: i64,
    pub subseed_strength: f64,
    pub seed_resize_from_h: i64,
    pub seed_resize_from_w: i64,
    pub sampler_name: String,
    pub scheduler: String,
    pub batch_size: u32,
    pub n_iter: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub distilled_cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub restore_faces: bool,
    pub tiling: bool,
    pub do_not_save_samples: bool,
    pub do_not_save_grid: bool,

    // hires fix
    pub enable_hr: bool,
    pub denoising_strength: Option<f64>,
    pub hr_scale: f64,
    pub hr_upscaler: String,
    pub hr_second_pass_steps: u32,
    pub hr_resize_x: u32,
    pub hr_resize_y: u32,
    pub hr_checkpoint_name: Option<String>,
    pub hr_sampler_name: Option<String>,
    pub hr_scheduler: Option<String>,
    pub hr_prompt: String,
    pub hr_negative_prompt: String,
    pub hr_additional_modules: Vec<String>,
    pub hr_cfg: Option<f64>,
    pub hr_distilled_cfg: Option<f64>,

    // img2img
    /// Paths of the source images; non-empty means img2img.
    pub init_images: Vec<String>,
    pub mask_path: Option<String>,
    pub resize_mode: u32,
    pub image_cfg_scale: Option<f64>,
    pub mask_blur: u32,
    pub inpainting_fill: u32,
    pub inpaint_full_res: bool,
    pub inpaint_full_res_padding: u32,
    pub inpainting_mask_invert: u32,
    pub initial_noise_multiplier: Option<f64>,

    /// Settings applied for this request only.
    pub override_settings: Params,
    pub extra_generation_params: Params,

    /// Positional extension arguments. Not part of the serialised form.
    #[serde(skip)]
    pub script_args: Vec<LiveArg>,

    #[serde(flatten)]
    pub extra: Params,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            styles: Vec::new(),
            seed: -1,
            subseed: -1,
            subseed_strength: 0.0,
            seed_resize_from_h: -1,
            seed_resize_from_w: -1,
            sampler_name: "Euler".into(),
            scheduler: "automatic".into(),
            batch_size: 1,
            n_iter: 1,
            steps: 20,
            cfg_scale: 7.0,
            distilled_cfg_scale: 3.5,
            width: 512,
            height: 512,
            restore_faces: false,
            tiling: false,
            do_not_save_samples: false,
            do_not_save_grid: false,
            enable_hr: false,
            denoising_strength: None,
            hr_scale: 2.0,
            hr_upscaler: "Latent".into(),
            hr_second_pass_steps: 0,
            hr_resize_x: 0,
            hr_resize_y: 0,
            hr_checkpoint_name: None,
            hr_sampler_name: None,
            hr_scheduler: None,
            hr_prompt: String::new(),
            hr_negative_prompt: String::new(),
            hr_additional_modules: Vec::new(),
            hr_cfg: None,
            hr_distilled_cfg: None,
            init_images: Vec::new(),
            mask_path: None,
            resize_mode: 0,
            image_cfg_scale: None,
            mask_blur: 4,
            inpainting_fill: 0,
            inpaint_full_res: false,
            inpaint_full_res_padding: 32,
            inpainting_mask_invert: 0,
            initial_noise_multiplier: None,
            override_settings: Params::new(),
            extra_generation_params: Params::new(),
            script_args: Vec::new(),
            extra: Params::new(),
        }
    }
}

impl GenerationRequest {
    pub fn task_type(&self) -> TaskType {
        if self.init_images.is_empty() {
            TaskType::Txt2Img
        } else {
            TaskType::Img2Img
        }
    }

    /// Extension arguments as plain JSON; opaque values become `null`.
    pub fn script_values(&self) -> Vec<Value> {
        self.script_args
            .iter()
            .map(|arg| match arg {
                LiveArg::Json(v) => v.clone(),
                LiveArg::Opaque { .. } => Value::Null,
            })
            .collect()
    }
}
