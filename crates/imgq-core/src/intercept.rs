//! Single-slot rendezvous between "queue the next generate" and the
//! generate call that follows it.
//!
//! Arming the slot for a tab makes the next generate on that tab go to the
//! queue instead of running. The slot expires on its own: every read checks
//! the age and an expired slot reads as empty.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::task::TaskType;

#[derive(Debug, Default)]
struct Slot {
    active: bool,
    tab: Option<TaskType>,
    set_at: Option<Instant>,
    last_result: Option<String>,
}

/// Observed state of the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterceptView {
    pub active: bool,
    pub tab: Option<TaskType>,
}

#[derive(Debug)]
pub struct InterceptState {
    slot: Mutex<Slot>,
    timeout: Duration,
}

impl InterceptState {
    pub fn new(timeout: Duration) -> Self {
        Self { slot: Mutex::new(Slot::default()), timeout }
    }

    /// Arm the slot for `tab`, replacing any earlier arming.
    pub fn arm(&self, tab: TaskType) {
        let mut slot = self.lock();
        slot.active = true;
        slot.tab = Some(tab);
        slot.set_at = Some(Instant::now());
        info!(tab = %tab, "intercept armed");
    }

    /// Consume the slot if it is armed for `tab` and not expired.
    pub fn take(&self, tab: TaskType) -> bool {
        let mut slot = self.lock();
        self.expire(&mut slot);
        if slot.active && slot.tab == Some(tab) {
            slot.active = false;
            slot.tab = None;
            slot.set_at = None;
            true
        } else {
            false
        }
    }

    pub fn peek(&self) -> InterceptView {
        let mut slot = self.lock();
        self.expire(&mut slot);
        InterceptView { active: slot.active, tab: slot.tab }
    }

    pub fn clear(&self) {
        let mut slot = self.lock();
        slot.active = false;
        slot.tab = None;
        slot.set_at = None;
    }

    /// Message describing the last intercepted request, for the caller that armed it.
    pub fn set_last_result(&self, message: impl Into<String>) {
        self.lock().last_result = Some(message.into());
    }

    pub fn take_last_result(&self) -> Option<String> {
        self.lock().last_result.take()
    }

    fn expire(&self, slot: &mut Slot) {
        let expired = slot.set_at.is_some_and(|at| at.elapsed() > self.timeout);
        if slot.active && expired {
            debug!(tab = ?slot.tab, "intercept expired");
            slot.active = false;
            slot.tab = None;
            slot.set_at = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        // A panic while holding this lock cannot leave the slot half-written.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
