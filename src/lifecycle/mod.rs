//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → wait_for_signal() returns
//!
//! Shutdown (shutdown.rs):
//!     trigger() → listener stops accepting → in-flight requests drain
//!               → background tasks (health monitor, sweeper, event drain) exit
//! ```
//!
//! # Design Decisions
//! - One broadcast channel fans the shutdown out to every long-running task
//! - Tasks flush their state before returning (the event drain empties its queue)

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
