//! Request inspection.
//!
//! # Responsibilities
//! - Attach a request ID (generated unless the client sent one)
//! - Extract the attributes limiter keys are built from (client IP, user,
//!   route, custom key)
//! - Name the breaker guarding a route
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Route templates (`/users/{id}`) name breakers and API keys so one
//!   resource maps to one breaker regardless of path parameters
//! - `X-Forwarded-For` is only honoured when explicitly trusted

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, MatchedPath};
use axum::http::{HeaderName, Request};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use crate::limiter::RequestAttributes;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Authenticated user, inserted into request extensions by an upstream
/// auth layer. Takes precedence over the configured user header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

/// Produces the optional custom limiter key for a request.
pub type CustomKeyFn = Arc<dyn Fn(&Request<Body>) -> Option<String> + Send + Sync>;

/// Custom key taken from a request header, as `custom:{value}`.
pub fn header_key(header: &str) -> CustomKeyFn {
    let name = header.to_ascii_lowercase();
    Arc::new(move |req: &Request<Body>| {
        req.headers()
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| format!("custom:{}", v))
    })
}

/// Sets `x-request-id` when missing and copies it onto the response.
pub fn request_id_layers() -> (SetRequestIdLayer<MakeRequestUuid>, PropagateRequestIdLayer) {
    (
        SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid),
        PropagateRequestIdLayer::new(X_REQUEST_ID),
    )
}

pub fn request_id(req: &Request<Body>) -> &str {
    req.headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}

pub fn client_ip(req: &Request<Body>, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

pub fn user_id(req: &Request<Body>, header: &str) -> Option<String> {
    if let Some(UserId(id)) = req.extensions().get::<UserId>() {
        return Some(id.clone());
    }
    req.headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Matched route template, or the raw path when no route matched.
pub fn route_path(req: &Request<Body>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}

pub fn breaker_name(prefix: &str, req: &Request<Body>) -> String {
    format!("{}:{}:{}", prefix, req.method(), route_path(req))
}

/// Exact match, or prefix match for entries ending in `*`.
pub fn is_skipped(path: &str, skip_paths: &[String]) -> bool {
    skip_paths.iter().any(|p| match p.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => path == p,
    })
}

pub fn request_attributes(
    req: &Request<Body>,
    trust_forwarded_for: bool,
    user_header: &str,
    custom_key: Option<&CustomKeyFn>,
) -> RequestAttributes {
    RequestAttributes {
        client_ip: client_ip(req, trust_forwarded_for),
        user_id: user_id(req, user_header),
        method: req.method().to_string(),
        path: route_path(req),
        custom: custom_key.and_then(|f| f(req)),
    }
}
