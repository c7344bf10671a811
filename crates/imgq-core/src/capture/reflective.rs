//! Whatever the request serialises to.
//!
//! Lower confidence than [`super::fixed`]: every field, including ones this
//! crate does not know, is stored and replayed as-is.

use serde_json::Value;

use super::{CaptureStrategy, RestoreStrategy, SHARED_KEYS, object};
use crate::error::CaptureError;
use crate::host::GenerationRequest;
use crate::task::{CaptureFormat, Params, TaskType};

#[derive(Debug, Clone, Copy, Default)]
pub struct Reflective;

/// Keys that never take part in the reflective round trip.
fn skipped(key: &str, value: &Value) -> bool {
    key.starts_with('_') || value.is_null() || SHARED_KEYS.contains(&key)
}

impl CaptureStrategy for Reflective {
    fn format(&self) -> CaptureFormat {
        CaptureFormat::Dynamic
    }

    fn core_params(&self, request: &GenerationRequest) -> Params {
        match serde_json::to_value(request) {
            Ok(Value::Object(map)) => map.into_iter().filter(|(k, v)| !skipped(k, v)).collect(),
            Ok(_) => Params::new(),
            Err(e) => {
                tracing::warn!(error = %e, "request did not serialise; capturing nothing");
                Params::new()
            }
        }
    }
}

impl RestoreStrategy for Reflective {
    fn create_request(
        &self,
        task_type: TaskType,
        params: &Params,
        overrides: &Params,
    ) -> Result<GenerationRequest, CaptureError> {
        let mut merged = match serde_json::to_value(GenerationRequest::default())? {
            Value::Object(map) => map,
            _ => Params::new(),
        };
        for (key, value) in params {
            if !skipped(key, value) {
                merged.insert(key.clone(), value.clone());
            }
        }

        let mut request: GenerationRequest = serde_json::from_value(Value::Object(merged))?;
        request.override_settings = overrides.clone();
        request.extra_generation_params = object(params.get("extra_generation_params"));
        request.init_images = params
            .get("init_images")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default();
        request.mask_path = params.get("mask_path").and_then(Value::as_str).map(str::to_owned);

        match task_type {
            TaskType::Img2Img if request.init_images.is_empty() => Err(CaptureError::MissingInitImages),
            TaskType::Img2Img => Ok(request),
            TaskType::Txt2Img => {
                request.init_images.clear();
                request.mask_path = None;
                Ok(request)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::HostSnapshot;
    use serde_json::json;

    #[test]
    fn unknown_fields_round_trip() {
        let mut original = GenerationRequest { prompt: "moss".into(), steps: 12, ..Default::default() };
        original.extra.insert("pag_scale".into(), json!(3.0));
        original.extra.insert("_internal_cache".into(), json!("x"));

        let captured = Reflective.capture(&original, &HostSnapshot::default(), &[]);
        assert_eq!(captured.params["pag_scale"], json!(3.0));
        assert!(!captured.params.contains_key("_internal_cache"));
        assert!(!captured.params.contains_key("denoising_strength"), "nulls are dropped");

        let restored = Reflective
            .create_request(TaskType::Txt2Img, &captured.params, &Params::new())
            .expect("restore");
        assert_eq!(restored.prompt, "moss");
        assert_eq!(restored.steps, 12);
        assert_eq!(restored.extra.get("pag_scale"), Some(&json!(3.0)));
    }

    #[test]
    fn overrides_come_from_the_caller() {
        let params = match json!({"override_settings": {"sd_vae": "stored"}, "prompt": "p"}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        let overrides = match json!({"sd_vae": "effective"}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        let r = Reflective.create_request(TaskType::Txt2Img, &params, &overrides).expect("restore");
        assert_eq!(r.override_settings, overrides);
        assert!(!r.extra.contains_key("override_settings"));
    }

    #[test]
    fn img2img_needs_init_images() {
        let err = Reflective
            .create_request(TaskType::Img2Img, &Params::new(), &Params::new())
            .expect_err("missing images");
        assert!(matches!(err, CaptureError::MissingInitImages));
    }

    #[test]
    fn mistyped_field_is_reported() {
        let params = match json!({"steps": "many"}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        let err = Reflective
            .create_request(TaskType::Txt2Img, &params, &Params::new())
            .expect_err("bad type");
        assert!(matches!(err, CaptureError::InvalidParams(_)));
    }

    #[test]
    fn both_formats_feed_display_info() {
        let req = GenerationRequest { width: 640, height: 448, batch_size: 4, ..Default::default() };
        let dynamic = Reflective.capture(&req, &HostSnapshot::default(), &[]);
        let legacy = crate::capture::fixed::FixedFields.capture(&req, &HostSnapshot::default(), &[]);
        let a = Reflective.extract_display_info(&dynamic.params).expect("dynamic");
        let b = crate::capture::fixed::FixedFields.extract_display_info(&legacy.params).expect("legacy");
        assert_eq!(a, b);
        assert_eq!((a.width, a.height, a.batch_size), (640, 448, 4));
    }
}
