//! Per-generation request counters.

use serde::Serialize;

/// Counters for the current breaker generation. Cleared on every generation
/// change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    pub fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    pub fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    pub fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    pub fn clear(&mut self) {
        *self = Counts::default();
    }

    /// Failures over admitted requests, 0.0 when nothing was admitted.
    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}
