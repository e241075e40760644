//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define resilience metrics (admissions, breaker transitions, timeouts)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `resilience_requests_total` (counter): requests by method, status
//! - `resilience_request_duration_seconds` (histogram): latency distribution
//! - `resilience_admissions_total` (counter): limiter decisions by strategy, outcome
//! - `resilience_rate_limited_total` (counter): rejections by key type
//! - `resilience_breaker_transitions_total` (counter): by breaker, from, to
//! - `resilience_breaker_rejections_total` (counter): by breaker, reason
//! - `resilience_breaker_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `resilience_in_flight_requests` (gauge)
//! - `resilience_timeouts_total` (counter)
//! - `resilience_store_degraded_total` (counter): by failure policy
//! - `resilience_events_dropped_total` (counter)
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed, so library users and tests pay nothing
//! - Labels are bounded: breaker names come from route templates

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::limiter::Strategy;
use crate::resilience::circuit_breaker::BreakerState;

/// Install the Prometheus recorder and its scrape listener on `addr`.
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "resilience_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("resilience_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_admission(strategy: Strategy, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "rejected" };
    counter!(
        "resilience_admissions_total",
        "strategy" => strategy.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_rate_limited(key_type: &'static str) {
    counter!("resilience_rate_limited_total", "key_type" => key_type).increment(1);
}

fn state_value(state: BreakerState) -> f64 {
    match state {
        BreakerState::Closed => 0.0,
        BreakerState::HalfOpen => 1.0,
        BreakerState::Open => 2.0,
    }
}

pub fn record_breaker_transition(name: &str, from: BreakerState, to: BreakerState) {
    counter!(
        "resilience_breaker_transitions_total",
        "breaker" => name.to_string(),
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
    gauge!("resilience_breaker_state", "breaker" => name.to_string()).set(state_value(to));
}

pub fn record_breaker_rejection(name: &str, reason: &'static str) {
    counter!(
        "resilience_breaker_rejections_total",
        "breaker" => name.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_in_flight(count: usize) {
    gauge!("resilience_in_flight_requests").set(count as f64);
}

pub fn record_timeout() {
    counter!("resilience_timeouts_total").increment(1);
}

pub fn record_store_degraded(policy: &'static str) {
    counter!("resilience_store_degraded_total", "policy" => policy).increment(1);
}

pub fn record_event_dropped() {
    counter!("resilience_events_dropped_total").increment(1);
}
