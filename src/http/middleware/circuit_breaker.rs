//! Per-route circuit breaker middleware.
//!
//! # Responsibilities
//! - Resolve the breaker for `{prefix}:{METHOD}:{route}`
//! - Fail fast with 503 and `Retry-After` while it is open
//! - Record the handler's outcome: 5xx, deadline expiry and panics are
//!   failures, everything else a success
//!
//! # Design Decisions
//! - The handler runs on its own task so a panic or an overrun is observed
//!   here instead of tearing down the connection
//! - Rejections are not outcomes; they never feed the trip predicate

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ResilienceError;
use crate::http::request::{breaker_name, is_skipped};
use crate::http::response::{annotate_breaker, rejection_response};
use crate::http::server::ResilienceState;
use crate::resilience::timeouts::{run_until, BoundedError, Deadline};
use crate::resilience::CircuitBreaker;

/// Suggested retry delay when an open breaker reports none.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

fn resolve(state: &ResilienceState, name: &str) -> Arc<CircuitBreaker> {
    state
        .breakers
        .get(name)
        .unwrap_or_else(|| state.breakers.get_or_create(state.config.circuit_breaker.settings_for(name)))
}

pub async fn circuit_breaker_middleware(
    State(state): State<ResilienceState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let config = &state.config.circuit_breaker;
    if !config.enabled || is_skipped(request.uri().path(), &config.skip_paths) {
        return next.run(request).await;
    }

    let name = breaker_name(&config.name_prefix, &request);
    let breaker = resolve(&state, &name);

    let ticket = match breaker.acquire() {
        Ok(ticket) => ticket,
        Err(rejection) => {
            let stats = breaker.stats();
            tracing::debug!(breaker = %name, state = %stats.state, "Circuit breaker rejected request");
            let retry_after = stats
                .retry_after_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            let mut response = rejection_response(&ResilienceError::from(rejection), Some(retry_after));
            annotate_breaker(response.headers_mut(), &stats);
            return response;
        }
    };

    let deadline = request.extensions().get::<Deadline>().copied();
    let outcome = match deadline {
        Some(deadline) => run_until(next.run(request), deadline, name.clone()).await,
        None => tokio::spawn(next.run(request)).await.map_err(|e| {
            if e.is_panic() {
                BoundedError::Panicked
            } else {
                BoundedError::Aborted
            }
        }),
    };

    let mut response = match outcome {
        Ok(response) => {
            let failed = response.status().is_server_error();
            if failed {
                tracing::debug!(breaker = %name, status = %response.status(), "Recording downstream failure");
            }
            ticket.record(!failed);
            response
        }
        Err(BoundedError::DeadlineExceeded(budget)) => {
            ticket.failure();
            rejection_response(&ResilienceError::DeadlineExceeded(budget), None)
        }
        Err(e) => {
            ticket.failure();
            tracing::error!(breaker = %name, error = %e, "Handler did not complete");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    };

    annotate_breaker(response.headers_mut(), &breaker.stats());
    response
}
