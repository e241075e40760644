//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, windows > 0, ratios in (0, 1])
//! - Check cross-field requirements (redis needs a URL, admin needs a key)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ResilienceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{ResilienceConfig, StoreKind, TripPolicy, WindowConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

struct Errors(Vec<ValidationError>);

impl Errors {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

fn check_window(errors: &mut Errors, section: &str, w: &WindowConfig) {
    if w.window_ms == 0 {
        errors.push(format!("{}.window_ms", section), "must be greater than 0");
    }
    if w.limit == 0 {
        errors.push(format!("{}.limit", section), "must be greater than 0");
    }
}

fn check_trip(errors: &mut Errors, field: &str, trip: &TripPolicy) {
    match *trip {
        TripPolicy::FailureRate { ratio, .. } if !(ratio > 0.0 && ratio <= 1.0) => {
            errors.push(format!("{}.ratio", field), "must be in (0, 1]");
        }
        TripPolicy::ConsecutiveFailures { threshold: 0 } => {
            errors.push(format!("{}.threshold", field), "must be greater than 0");
        }
        TripPolicy::TotalFailures { failures: 0, .. } => {
            errors.push(format!("{}.failures", field), "must be greater than 0");
        }
        _ => {}
    }
}

pub fn validate_config(config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Errors(Vec::new());

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push("listener.bind_address", "must be a socket address like 0.0.0.0:8080");
    }

    if config.concurrency.enabled && config.concurrency.max_in_flight == 0 {
        errors.push("concurrency.max_in_flight", "must be greater than 0");
    }

    if config.timeouts.enabled && config.timeouts.request_ms == 0 {
        errors.push("timeouts.request_ms", "must be greater than 0");
    }

    let rl = &config.rate_limit;
    if !(rl.token_bucket.rate.is_finite() && rl.token_bucket.rate > 0.0) {
        errors.push("rate_limit.token_bucket.rate", "must be a positive number");
    }
    if rl.token_bucket.burst == 0 {
        errors.push("rate_limit.token_bucket.burst", "must be at least 1");
    }
    check_window(&mut errors, "rate_limit.sliding_window", &rl.sliding_window);
    check_window(&mut errors, "rate_limit.fixed_window", &rl.fixed_window);
    if rl.user_header.is_empty() {
        errors.push("rate_limit.user_header", "must not be empty");
    }
    if matches!(rl.custom_key_header.as_deref(), Some("")) {
        errors.push("rate_limit.custom_key_header", "must not be empty when set");
    }

    let cb = &config.circuit_breaker;
    if cb.name_prefix.is_empty() {
        errors.push("circuit_breaker.name_prefix", "must not be empty");
    }
    if cb.open_timeout_ms == 0 {
        errors.push("circuit_breaker.open_timeout_ms", "must be greater than 0");
    }
    check_trip(&mut errors, "circuit_breaker.trip", &cb.trip);
    for (name, o) in &cb.overrides {
        if o.open_timeout_ms == Some(0) {
            errors.push(format!("circuit_breaker.overrides.{}.open_timeout_ms", name), "must be greater than 0");
        }
        if let Some(trip) = &o.trip {
            check_trip(&mut errors, &format!("circuit_breaker.overrides.{}.trip", name), trip);
        }
    }

    if config.store.kind == StoreKind::Redis && config.store.url.as_deref().map_or(true, str::is_empty) {
        errors.push("store.url", "required when store.kind = \"redis\"");
    }
    if config.store.health_check_interval_ms == 0 {
        errors.push("store.health_check_interval_ms", "must be greater than 0");
    }

    let obs = &config.observability;
    if !matches!(obs.log_format.as_str(), "pretty" | "json") {
        errors.push("observability.log_format", "must be \"pretty\" or \"json\"");
    }
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push("observability.metrics_address", "must be a socket address");
    }
    if obs.event_buffer == 0 {
        errors.push("observability.event_buffer", "must be greater than 0");
    }

    if config.admin.enabled && config.admin.api_key.is_empty() {
        errors.push("admin.api_key", "required when admin is enabled");
    }

    if errors.0.is_empty() {
        Ok(())
    } else {
        Err(errors.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(validate_config(&ResilienceConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = ResilienceConfig::default();
        config.rate_limit.token_bucket.burst = 0;
        config.rate_limit.fixed_window.limit = 0;
        config.circuit_breaker.trip = TripPolicy::FailureRate {
            min_requests: 10,
            ratio: 1.5,
        };
        config.store.kind = StoreKind::Redis;
        config.admin.enabled = true;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "rate_limit.token_bucket.burst",
                "rate_limit.fixed_window.limit",
                "circuit_breaker.trip.ratio",
                "store.url",
                "admin.api_key",
            ]
        );
    }

    #[test]
    fn test_disabled_sections_not_range_checked() {
        let mut config = ResilienceConfig::default();
        config.concurrency.enabled = false;
        config.concurrency.max_in_flight = 0;
        config.timeouts.enabled = false;
        config.timeouts.request_ms = 0;
        assert!(validate_config(&config).is_ok());
    }
}
