//! HTTP integration subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, trace, metrics)
//!     → middleware/rate_limit.rs (dispatcher admission, 429)
//!     → middleware/concurrency.rs (in-flight gate, 503)
//!     → middleware/timeout.rs (request deadline, 504)
//!     → middleware/circuit_breaker.rs (per-route breaker, 503)
//!     → business handler
//!     → response.rs (breaker and quota headers)
//! ```

pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use request::{UserId, X_REQUEST_ID};
pub use server::{HttpServer, ResilienceState};
