//! Rate limiting middleware.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::http::request::{is_skipped, request_attributes, request_id};
use crate::http::response::{annotate_admission, too_many_requests};
use crate::http::server::ResilienceState;
use crate::limiter::Denied;

/// Builds the response for a rate-limited request.
pub type RejectionHandler = Arc<dyn Fn(&Denied) -> Response + Send + Sync>;

pub async fn rate_limit_middleware(
    State(state): State<ResilienceState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let config = &state.config.rate_limit;
    if !config.enabled || is_skipped(request.uri().path(), &config.skip_paths) {
        return next.run(request).await;
    }

    let attrs = request_attributes(
        &request,
        state.config.listener.trust_forwarded_for,
        &config.user_header,
        state.custom_key.as_ref(),
    );

    match state.dispatcher.check(&attrs).await {
        Ok(admitted) => {
            let mut response = next.run(request).await;
            annotate_admission(response.headers_mut(), &admitted);
            response
        }
        Err(denied) => {
            tracing::debug!(
                request_id = %request_id(&request),
                key = %denied.key.value,
                "Request rejected by rate limiter"
            );
            match &state.on_rejected {
                Some(handler) => handler(&denied),
                None => too_many_requests(&denied),
            }
        }
    }
}
