//! Response annotation and rejection responses.
//!
//! # Responsibilities
//! - Surface breaker state and limiter decisions as response headers so
//!   clients can back off
//! - Map resilience rejections to JSON error responses
//!
//! # Design Decisions
//! - Rejections carry `Retry-After` whenever a useful value is known
//! - Header values are ASCII by construction; anything else is skipped,
//!   never a panic

use std::time::Duration;

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ResilienceError;
use crate::limiter::{Admitted, Denied};
use crate::resilience::BreakerStats;

pub const X_CIRCUIT_BREAKER_NAME: HeaderName = HeaderName::from_static("x-circuit-breaker-name");
pub const X_CIRCUIT_BREAKER_STATE: HeaderName = HeaderName::from_static("x-circuit-breaker-state");
pub const X_CIRCUIT_BREAKER_REQUESTS: HeaderName = HeaderName::from_static("x-circuit-breaker-requests");
pub const X_CIRCUIT_BREAKER_FAILURES: HeaderName = HeaderName::from_static("x-circuit-breaker-failures");
pub const X_RATELIMIT_LIMIT_TYPE: HeaderName = HeaderName::from_static("x-ratelimit-limit-type");
pub const X_RATELIMIT_KEY: HeaderName = HeaderName::from_static("x-ratelimit-key");
pub const X_RATELIMIT_STRATEGY: HeaderName = HeaderName::from_static("x-ratelimit-strategy");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_DEGRADED: HeaderName = HeaderName::from_static("x-ratelimit-degraded");

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

fn error_code(err: &ResilienceError) -> &'static str {
    match err {
        ResilienceError::AdmissionDenied { .. } => "rate_limited",
        ResilienceError::CircuitOpen(_) => "circuit_open",
        ResilienceError::HalfOpenCapacityExceeded(_) => "circuit_half_open",
        ResilienceError::ConcurrencyLimitReached(_) => "overloaded",
        ResilienceError::DeadlineExceeded(_) => "timeout",
        ResilienceError::DownstreamFailure(_) => "downstream_failure",
        ResilienceError::InfrastructureUnavailable(_) => "store_unavailable",
        ResilienceError::UnknownBreaker(_) => "not_found",
    }
}

/// Whole seconds, rounded up so clients never retry early.
fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

pub fn rejection_response(err: &ResilienceError, retry_after: Option<Duration>) -> Response {
    let retry_after_secs = retry_after.map(ceil_secs);
    let body = ErrorBody {
        error: error_code(err),
        message: err.to_string(),
        retry_after_secs,
    };
    let mut response = (err.status_code(), Json(body)).into_response();
    if let Some(secs) = retry_after_secs {
        response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

fn insert_str(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

pub fn annotate_breaker(headers: &mut HeaderMap, stats: &BreakerStats) {
    insert_str(headers, X_CIRCUIT_BREAKER_NAME, &stats.name);
    headers.insert(X_CIRCUIT_BREAKER_STATE, HeaderValue::from_static(stats.state.as_str()));
    headers.insert(X_CIRCUIT_BREAKER_REQUESTS, HeaderValue::from(stats.total_requests));
    headers.insert(X_CIRCUIT_BREAKER_FAILURES, HeaderValue::from(stats.failed_requests));
}

pub fn annotate_admission(headers: &mut HeaderMap, admitted: &Admitted) {
    headers.insert(X_RATELIMIT_STRATEGY, HeaderValue::from_static(admitted.strategy.as_str()));
    if let Some(remaining) = admitted.remaining {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(admitted.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    }
    if let Some(policy) = admitted.degraded {
        headers.insert(X_RATELIMIT_DEGRADED, HeaderValue::from_static(policy.as_str()));
    }
}

pub fn annotate_denial(headers: &mut HeaderMap, denied: &Denied) {
    headers.insert(X_RATELIMIT_LIMIT_TYPE, HeaderValue::from_static(denied.key.kind.as_str()));
    insert_str(headers, X_RATELIMIT_KEY, &denied.key.value);
    headers.insert(X_RATELIMIT_STRATEGY, HeaderValue::from_static(denied.strategy.as_str()));
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(denied.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
    if let Some(policy) = denied.degraded {
        headers.insert(X_RATELIMIT_DEGRADED, HeaderValue::from_static(policy.as_str()));
    }
}

/// Default answer for a rate-limited request.
pub fn too_many_requests(denied: &Denied) -> Response {
    let err = ResilienceError::AdmissionDenied {
        key: denied.key.value.clone(),
        strategy: denied.strategy,
    };
    let mut response = rejection_response(&err, None);
    annotate_denial(response.headers_mut(), denied);
    response
}
