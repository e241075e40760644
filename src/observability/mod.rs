//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → events.rs (breaker / limiter / store events, async)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through the request span
//! - Metrics and events never block the request path

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{EventDrain, EventSink, ResilienceEvent};
