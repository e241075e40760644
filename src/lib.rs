//! Resilience plane: circuit breakers, rate limiters and admission
//! middleware for axum services.

pub mod admin;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod limiter;
pub mod observability;
pub mod resilience;
pub mod store;

pub use config::ResilienceConfig;
pub use error::ResilienceError;
pub use http::{HttpServer, ResilienceState};
pub use lifecycle::Shutdown;
