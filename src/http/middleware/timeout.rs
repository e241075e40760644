//! Request deadline middleware.
//!
//! Inserts a [`Deadline`] into the request extensions for inner layers and
//! answers 504 once it passes, without waiting for the handler to finish.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ResilienceError;
use crate::http::request::request_id;
use crate::http::response::rejection_response;
use crate::http::server::ResilienceState;
use crate::resilience::timeouts::{run_until, BoundedError, Deadline};

pub async fn timeout_middleware(
    State(state): State<ResilienceState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.timeouts.enabled {
        return next.run(request).await;
    }

    let deadline = Deadline::after(state.config.timeouts.request_timeout());
    request.extensions_mut().insert(deadline);
    let label = format!("{} {} [{}]", request.method(), request.uri().path(), request_id(&request));

    match run_until(next.run(request), deadline, label).await {
        Ok(response) => response,
        Err(BoundedError::DeadlineExceeded(budget)) => {
            rejection_response(&ResilienceError::DeadlineExceeded(budget), None)
        }
        Err(e) => {
            tracing::error!(error = %e, "Request task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
