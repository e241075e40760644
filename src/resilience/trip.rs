//! Trip predicates: decide from the current [`Counts`] whether a closed
//! breaker should open.

use std::sync::Arc;

use crate::resilience::counts::Counts;

pub type TripPredicate = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Open after `threshold` failures in a row.
pub fn consecutive_failures(threshold: u32) -> TripPredicate {
    let threshold = threshold.max(1);
    Arc::new(move |c: &Counts| c.consecutive_failures >= threshold)
}

/// Open once at least `min_requests` were seen and the failure ratio reaches
/// `ratio`.
pub fn failure_rate(min_requests: u32, ratio: f64) -> TripPredicate {
    Arc::new(move |c: &Counts| c.requests >= min_requests && c.failure_rate() >= ratio)
}

/// Open once at least `min_requests` were seen and `failures` of them failed.
pub fn total_failures(min_requests: u32, failures: u32) -> TripPredicate {
    Arc::new(move |c: &Counts| c.requests >= min_requests && c.total_failures >= failures)
}

/// 10 failures out of at least 20 requests.
pub fn default_trip() -> TripPredicate {
    total_failures(20, 10)
}
