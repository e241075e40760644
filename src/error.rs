//! Error taxonomy for the request path.
//!
//! Admission and breaker rejections are resolved inside the middleware and
//! never reach the business handler. Downstream failures are recorded and
//! passed through. Store outages degrade to the configured policy and only
//! surface here from administrative calls.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

use crate::limiter::Strategy;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("rate limit exceeded: {key} rejected by {strategy} limiter")]
    AdmissionDenied { key: String, strategy: Strategy },

    #[error("circuit breaker {0} is open")]
    CircuitOpen(String),

    #[error("circuit breaker {0} has no free half-open probe slots")]
    HalfOpenCapacityExceeded(String),

    #[error("too many requests in flight (max {0})")]
    ConcurrencyLimitReached(usize),

    #[error("request exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("downstream failure: {0}")]
    DownstreamFailure(String),

    #[error("counter store unavailable: {0}")]
    InfrastructureUnavailable(#[from] StoreError),

    #[error("no circuit breaker named {0}")]
    UnknownBreaker(String),
}

impl ResilienceError {
    /// HTTP status the caller sees for this outcome.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ResilienceError::AdmissionDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
            ResilienceError::CircuitOpen(_)
            | ResilienceError::HalfOpenCapacityExceeded(_)
            | ResilienceError::ConcurrencyLimitReached(_) => StatusCode::SERVICE_UNAVAILABLE,
            ResilienceError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            ResilienceError::DownstreamFailure(_) => StatusCode::BAD_GATEWAY,
            ResilienceError::InfrastructureUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ResilienceError::UnknownBreaker(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Whether retrying later, with no change in load, can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ResilienceError::UnknownBreaker(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let denied = ResilienceError::AdmissionDenied {
            key: "ip:10.0.0.1".into(),
            strategy: Strategy::Sliding,
        };
        assert_eq!(denied.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ResilienceError::CircuitOpen("api".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ResilienceError::HalfOpenCapacityExceeded("api".into()).status_code(),
            ResilienceError::CircuitOpen("api".into()).status_code()
        );
        assert_eq!(
            ResilienceError::DeadlineExceeded(Duration::from_secs(1)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert!(denied.is_retryable());
        assert!(!ResilienceError::UnknownBreaker("x".into()).is_retryable());
    }

    #[test]
    fn test_display_names_the_key() {
        let denied = ResilienceError::AdmissionDenied {
            key: "user:42".into(),
            strategy: Strategy::Fixed,
        };
        assert_eq!(
            denied.to_string(),
            "rate limit exceeded: user:42 rejected by fixed limiter"
        );
    }
}
