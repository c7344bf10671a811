//! Explicit field list. Stable across host versions as long as the listed
//! fields keep their names; new host fields are not captured.

use serde_json::{Value, json};

use super::{CaptureStrategy, RestoreStrategy, object, str_param, u32_param};
use crate::error::CaptureError;
use crate::host::GenerationRequest;
use crate::task::{CaptureFormat, Params, TaskType};

#[derive(Debug, Clone, Copy, Default)]
pub struct FixedFields;

impl CaptureStrategy for FixedFields {
    fn format(&self) -> CaptureFormat {
        CaptureFormat::Legacy
    }

    fn core_params(&self, r: &GenerationRequest) -> Params {
        let mut p = into_params(json!({
            "prompt": r.prompt,
            "negative_prompt": r.negative_prompt,
            "styles": r.styles,
            "seed": r.seed,
            "subseed": r.subseed,
            "subseed_strength": r.subseed_strength,
            "seed_resize_from_h": r.seed_resize_from_h,
            "seed_resize_from_w": r.seed_resize_from_w,
            "sampler_name": r.sampler_name,
            "scheduler": r.scheduler,
            "batch_size": r.batch_size,
            "n_iter": r.n_iter,
            "steps": r.steps,
            "cfg_scale": r.cfg_scale,
            "distilled_cfg_scale": r.distilled_cfg_scale,
            "width": r.width,
            "height": r.height,
            "restore_faces": r.restore_faces,
            "tiling": r.tiling,
            "do_not_save_samples": r.do_not_save_samples,
            "do_not_save_grid": r.do_not_save_grid,
        }));

        if r.enable_hr {
            p.extend(into_params(json!({
                "enable_hr": true,
                "denoising_strength": r.denoising_strength.unwrap_or(0.7),
                "hr_scale": r.hr_scale,
                "hr_upscaler": r.hr_upscaler,
                "hr_second_pass_steps": r.hr_second_pass_steps,
                "hr_resize_x": r.hr_resize_x,
                "hr_resize_y": r.hr_resize_y,
                "hr_checkpoint_name": r.hr_checkpoint_name,
                "hr_sampler_name": r.hr_sampler_name,
                "hr_scheduler": r.hr_scheduler,
                "hr_prompt": r.hr_prompt,
                "hr_negative_prompt": r.hr_negative_prompt,
                "hr_additional_modules": r.hr_additional_modules,
                "hr_cfg": r.hr_cfg,
                "hr_distilled_cfg": r.hr_distilled_cfg,
            })));
        }

        if !r.init_images.is_empty() {
            p.extend(into_params(json!({
                "denoising_strength": r.denoising_strength.unwrap_or(0.75),
                "resize_mode": r.resize_mode,
                "image_cfg_scale": r.image_cfg_scale,
                "mask_blur": r.mask_blur,
                "inpainting_fill": r.inpainting_fill,
                "inpaint_full_res": r.inpaint_full_res,
                "inpaint_full_res_padding": r.inpaint_full_res_padding,
                "inpainting_mask_invert": r.inpainting_mask_invert,
                "initial_noise_multiplier": r.initial_noise_multiplier,
            })));
        }
        p
    }
}

impl RestoreStrategy for FixedFields {
    fn create_request(
        &self,
        task_type: TaskType,
        params: &Params,
        overrides: &Params,
    ) -> Result<GenerationRequest, CaptureError> {
        let d = GenerationRequest::default();
        let mut r = GenerationRequest {
            prompt: str_param(params, "prompt"),
            negative_prompt: str_param(params, "negative_prompt"),
            styles: strings(params, "styles").or_else(|| strings(params, "prompt_styles")).unwrap_or_default(),
            seed: i64_param(params, "seed", d.seed),
            subseed: i64_param(params, "subseed", d.subseed),
            subseed_strength: f64_param(params, "subseed_strength", d.subseed_strength),
            seed_resize_from_h: i64_param(params, "seed_resize_from_h", d.seed_resize_from_h),
            seed_resize_from_w: i64_param(params, "seed_resize_from_w", d.seed_resize_from_w),
            sampler_name: opt_str(params, "sampler_name").unwrap_or(d.sampler_name),
            scheduler: opt_str(params, "scheduler").unwrap_or(d.scheduler),
            batch_size: u32_param(params, "batch_size", 1),
            n_iter: u32_param(params, "n_iter", 1),
            steps: u32_param(params, "steps", 20),
            cfg_scale: f64_param(params, "cfg_scale", 7.0),
            distilled_cfg_scale: f64_param(params, "distilled_cfg_scale", 3.5),
            width: u32_param(params, "width", 512),
            height: u32_param(params, "height", 512),
            restore_faces: bool_param(params, "restore_faces", false),
            tiling: bool_param(params, "tiling", false),
            do_not_save_samples: bool_param(params, "do_not_save_samples", false),
            do_not_save_grid: bool_param(params, "do_not_save_grid", false),
            override_settings: overrides.clone(),
            extra_generation_params: object(params.get("extra_generation_params")),
            ..d
        };

        match task_type {
            TaskType::Txt2Img => {
                r.enable_hr = bool_param(params, "enable_hr", false);
                r.denoising_strength = Some(f64_param(params, "denoising_strength", 0.7));
                r.hr_scale = f64_param(params, "hr_scale", 2.0);
                r.hr_upscaler = opt_str(params, "hr_upscaler").unwrap_or_else(|| "Latent".into());
                r.hr_second_pass_steps = u32_param(params, "hr_second_pass_steps", 0);
                r.hr_resize_x = u32_param(params, "hr_resize_x", 0);
                r.hr_resize_y = u32_param(params, "hr_resize_y", 0);
                r.hr_checkpoint_name = opt_str(params, "hr_checkpoint_name");
                r.hr_sampler_name = opt_str(params, "hr_sampler_name");
                r.hr_scheduler = opt_str(params, "hr_scheduler");
                r.hr_prompt = str_param(params, "hr_prompt");
                r.hr_negative_prompt = str_param(params, "hr_negative_prompt");
                r.hr_additional_modules = strings(params, "hr_additional_modules").unwrap_or_default();
                r.hr_cfg = params.get("hr_cfg").and_then(Value::as_f64);
                r.hr_distilled_cfg = params.get("hr_distilled_cfg").and_then(Value::as_f64);
            }
            TaskType::Img2Img => {
                r.init_images = strings(params, "init_images").unwrap_or_default();
                if r.init_images.is_empty() {
                    return Err(CaptureError::MissingInitImages);
                }
                r.mask_path = opt_str(params, "mask_path");
                r.mask_blur = u32_param(params, "mask_blur", 4);
                r.inpainting_fill = u32_param(params, "inpainting_fill", 0);
                r.resize_mode = u32_param(params, "resize_mode", 0);
                r.denoising_strength = Some(f64_param(params, "denoising_strength", 0.75));
                r.image_cfg_scale = Some(f64_param(params, "image_cfg_scale", 1.5));
                r.inpaint_full_res = bool_param(params, "inpaint_full_res", false);
                r.inpaint_full_res_padding = u32_param(params, "inpaint_full_res_padding", 32);
                r.inpainting_mask_invert = u32_param(params, "inpainting_mask_invert", 0);
                r.initial_noise_multiplier = params.get("initial_noise_multiplier").and_then(Value::as_f64);
            }
        }
        Ok(r)
    }
}

fn into_params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

fn opt_str(params: &Params, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn strings(params: &Params, key: &str) -> Option<Vec<String>> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).map(str::to_owned).collect())
}

fn i64_param(params: &Params, key: &str, default: i64) -> i64 {
    params.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn f64_param(params: &Params, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn bool_param(params: &Params, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}
