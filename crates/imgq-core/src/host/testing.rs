//! Scripted in-process host for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use super::{GenerationRequest, Generated, HostEngine, HostError, ScriptInfo};
use crate::task::TaskType;

/// What the next `generate` call does.
#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    /// Produce `batch_size * n_iter` images.
    Complete,
    /// Produce `iterations` iterations, then block until interrupted or told
    /// to stop generating, and return what was produced.
    Block { iterations: u32 },
    /// Block until interrupted, then fail.
    FailOnInterrupt,
    Fail(String),
    Panic(String),
}

pub(crate) struct FakeHost {
    settings: Mutex<HashMap<String, Value>>,
    checkpoint: Mutex<String>,
    known_checkpoints: Vec<String>,
    pub busy: AtomicBool,
    interrupted: AtomicBool,
    stopping: AtomicBool,
    generating: AtomicBool,
    pub vae_refreshes: AtomicUsize,
    pub checkpoint_loads: AtomicUsize,
    defaults: Vec<Value>,
    behaviors: Mutex<VecDeque<Behavior>>,
    requests: Mutex<Vec<GenerationRequest>>,
    merged_args: Mutex<Vec<Vec<Value>>>,
    /// Settings observed at the start of each generation.
    seen_settings: Mutex<Vec<HashMap<String, Value>>>,
    counter: AtomicUsize,
}

impl Default for FakeHost {
    fn default() -> Self {
        let settings = [
            ("sd_vae", json!("Automatic")),
            ("CLIP_stop_at_last_layers", json!(1)),
            ("eta_noise_seed_delta", json!(0)),
            ("forge_additional_modules", json!([])),
            ("directories_filename_pattern", json!("[date]")),
            ("quicksettings_list", json!(["sd_model_checkpoint", "sd_vae", "forge_preset"])),
            ("forge_preset", json!("sd")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
        Self {
            settings: Mutex::new(settings),
            checkpoint: Mutex::new("base.safetensors [0000]".into()),
            known_checkpoints: vec!["base.safetensors [0000]".into(), "flux1-dev.safetensors [abcd]".into()],
            busy: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            generating: AtomicBool::new(false),
            vae_refreshes: AtomicUsize::new(0),
            checkpoint_loads: AtomicUsize::new(0),
            defaults: vec![json!(1), json!(2), json!(3)],
            behaviors: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            merged_args: Mutex::new(Vec::new()),
            seen_settings: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }
}

impl FakeHost {
    pub fn push(&self, behavior: Behavior) {
        self.behaviors.lock().expect("lock").push_back(behavior);
    }

    pub fn generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().expect("lock").clone()
    }

    pub fn merged_args(&self) -> Vec<Vec<Value>> {
        self.merged_args.lock().expect("lock").clone()
    }

    pub fn seen_settings(&self) -> Vec<HashMap<String, Value>> {
        self.seen_settings.lock().expect("lock").clone()
    }

    pub fn setting_value(&self, key: &str) -> Option<Value> {
        self.settings.lock().expect("lock").get(key).cloned()
    }

    fn images(&self, count: u32) -> Vec<String> {
        (0..count)
            .map(|_| format!("out/{:05}.png", self.counter.fetch_add(1, Ordering::SeqCst)))
            .collect()
    }

    fn wait_for_signal(&self) {
        while !self.interrupted.load(Ordering::SeqCst) && !self.stopping.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

impl HostEngine for FakeHost {
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
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
        self.checkpoint.lock().expect("lock").clone()
    }

    fn load_checkpoint(&self, name: &str) -> Result<bool, HostError> {
        let found = self.known_checkpoints.iter().find(|c| c.contains(name)).cloned();
        match found {
            Some(title) => {
                self.checkpoint_loads.fetch_add(1, Ordering::SeqCst);
                *self.checkpoint.lock().expect("lock") = title;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn setting(&self, key: &str) -> Option<Value> {
        self.setting_value(key)
    }

    fn set_setting(&self, key: &str, value: Value) -> Result<(), HostError> {
        if key == "read_only" {
            return Err(HostError::Generation("read-only setting".into()));
        }
        self.settings.lock().expect("lock").insert(key.to_owned(), value);
        Ok(())
    }

    fn refresh_vae(&self) -> Result<(), HostError> {
        self.vae_refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn script_defaults(&self, _task_type: TaskType) -> Vec<Value> {
        self.defaults.clone()
    }

    fn scripts(&self, _task_type: TaskType) -> Vec<ScriptInfo> {
        vec![
            ScriptInfo { title: "Refiner".into(), args_from: 0, args_to: 2 },
            ScriptInfo { title: "ControlNet Integrated".into(), args_from: 2, args_to: 3 },
        ]
    }

    fn generate(&self, request: GenerationRequest) -> Result<Generated, HostError> {
        self.interrupted.store(false, Ordering::SeqCst);
        self.stopping.store(false, Ordering::SeqCst);
        self.generating.store(true, Ordering::SeqCst);
        self.seen_settings.lock().expect("lock").push(self.settings.lock().expect("lock").clone());
        self.merged_args.lock().expect("lock").push(request.script_values());
        let batch = request.batch_size.max(1);
        let n_iter = request.n_iter.max(1);
        self.requests.lock().expect("lock").push(request);

        let behavior = self.behaviors.lock().expect("lock").pop_front().unwrap_or(Behavior::Complete);
        let outcome = match behavior {
            Behavior::Complete => Ok(Generated { images: self.images(batch * n_iter), info: "Steps: 20".into() }),
            Behavior::Block { iterations } => {
                let images = self.images(batch * iterations);
                self.wait_for_signal();
                Ok(Generated { images, info: "partial".into() })
            }
            Behavior::FailOnInterrupt => {
                self.wait_for_signal();
                Err(HostError::Generation("interrupted mid-step".into()))
            }
            Behavior::Fail(msg) => Err(HostError::Generation(msg)),
            Behavior::Panic(msg) => {
                self.generating.store(false, Ordering::SeqCst);
                panic!("{msg}");
            }
        };
        self.generating.store(false, Ordering::SeqCst);
        outcome
    }
}
