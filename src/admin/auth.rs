use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::http::server::ResilienceState;

pub async fn admin_auth_middleware(
    State(state): State<ResilienceState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let api_key = &state.config.admin.api_key;
    if api_key.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == api_key => Ok(next.run(request).await),
        _ => {
            tracing::warn!(path = %request.uri().path(), "Rejected unauthenticated admin request");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
