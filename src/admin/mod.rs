//! Operational API.
//!
//! Breaker inspection and reset, rate-limit key inspection and reset, and a
//! status summary. Every route requires `Authorization: Bearer <api_key>`.
//! Breaker names contain `/`, so they are percent-encoded in the reset path.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::ResilienceState;

pub fn setup_admin_router(state: ResilienceState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/breakers/{name}/reset", post(reset_breaker))
        .route("/admin/limits", get(get_limits))
        .route("/admin/limits/stats", get(get_limit_stats))
        .route("/admin/limits/reset", post(reset_limit))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
