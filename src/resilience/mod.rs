//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to a protected resource:
//!     → registry.rs (look up or create the named breaker)
//!     → circuit_breaker.rs (admit, or fail fast while open)
//!     → timeouts.rs (bound the call by the request deadline)
//!     → outcome fed back into counts.rs; trip.rs decides whether to open
//! ```
//!
//! # Design Decisions
//! - Per-resource breakers, created lazily and kept for the process lifetime
//! - Fail fast in Open state, no waiting
//! - A bounded number of probes in Half-Open
//! - Registry is an explicit object handed to the middleware, not a global

pub mod circuit_breaker;
pub mod counts;
pub mod registry;
pub mod timeouts;
pub mod trip;

pub use circuit_breaker::{
    BreakerSettings, BreakerState, BreakerStats, CallError, CircuitBreaker, Rejection, StateChange,
    Ticket,
};
pub use counts::Counts;
pub use registry::BreakerRegistry;
pub use timeouts::{BoundedError, Deadline};
