//! Backend reachability tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Represents the reachability of the time-series backend.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum HealthState {
    Reachable,
    Unreachable,
}

/// Tracks whether the backend answered the last interaction, and logs only
/// on state changes.
#[derive(Debug)]
pub struct BackendHealth {
    reachable: AtomicBool,
}

impl BackendHealth {
    pub fn new(initial_state: HealthState) -> Self {
        let health = Self {
            reachable: AtomicBool::new(initial_state == HealthState::Reachable),
        };
        health.update_gauge(initial_state == HealthState::Reachable);
        health
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    /// Returns `true` when this call flipped the state back to reachable.
    pub fn mark_success(&self, backend: &str) -> bool {
        let was_reachable = self.reachable.swap(true, Ordering::Relaxed);
        if !was_reachable {
            self.update_gauge(true);
            info!(backend, "Backend has RECOVERED and is now REACHABLE.");
        }
        !was_reachable
    }

    /// Returns `true` when this call flipped the state to unreachable.
    pub fn mark_failure(&self, backend: &str, reason: &str) -> bool {
        let was_reachable = self.reachable.swap(false, Ordering::Relaxed);
        if was_reachable {
            self.update_gauge(false);
            warn!(backend, reason, "Backend is now UNREACHABLE. Points go to the fallback log.");
        }
        was_reachable
    }

    fn update_gauge(&self, reachable: bool) {
        metrics::gauge!("backend_reachable").set(if reachable { 1.0 } else { 0.0 });
    }
}
