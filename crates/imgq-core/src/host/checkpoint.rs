use tracing::{debug, info, warn};

use super::HostEngine;

/// Load `target` unless it is already active. Returns whether a load happened.
///
/// Names match when either contains the other, so a bare file name matches
/// a title carrying a hash suffix. An unknown checkpoint or a failed load
/// leaves the current model in place.
pub fn switch_checkpoint_if_needed(host: &dyn HostEngine, target: &str) -> bool {
    if target.is_empty() {
        return false;
    }
    let current = host.current_checkpoint();
    if !current.is_empty() && (current.contains(target) || target.contains(current.as_str())) {
        debug!(checkpoint = %current, "checkpoint already loaded");
        return false;
    }

    info!(from = %current, to = %target, "switching checkpoint");
    match host.load_checkpoint(target) {
        Ok(true) => true,
        Ok(false) => {
            warn!(checkpoint = %target, "checkpoint not found; keeping current model");
            false
        }
        Err(e) => {
            warn!(checkpoint = %target, error = %e, "failed to switch checkpoint");
            false
        }
    }
}
