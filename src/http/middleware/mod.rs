//! Protective middleware chain.
//!
//! # Data Flow
//! ```text
//! Request
//!     → rate_limit.rs (every derived key must be admitted, else 429)
//!     → concurrency.rs (non-blocking in-flight slot, else 503)
//!     → timeout.rs (attach Deadline, 504 when it passes)
//!     → circuit_breaker.rs (per-route breaker, 503 while open;
//!                           5xx / timeout / panic recorded as failure)
//!     → business handler
//! ```
//!
//! # Design Decisions
//! - Order is fixed: cheap rejections first, nothing after a rejection runs
//! - Each layer is switched off independently through its config section
//! - All layers share one `ResilienceState`

pub mod circuit_breaker;
pub mod concurrency;
pub mod rate_limit;
pub mod timeout;

use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};

use crate::observability::metrics;

pub use circuit_breaker::circuit_breaker_middleware;
pub use concurrency::{concurrency_middleware, ConcurrencyGate};
pub use rate_limit::{rate_limit_middleware, RejectionHandler};
pub use timeout::timeout_middleware;

/// Request count and latency for everything the server answers, rejections
/// included.
pub async fn track_requests(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let response = next.run(request).await;
    metrics::record_request(&method, response.status().as_u16(), start);
    response
}
