//! Shared counter store.
//!
//! # Data Flow
//! ```text
//! Distributed limiter decision:
//!     → CounterStore::sliding_window_admit / fixed_window_admit
//!       (one atomic server-side operation per decision)
//!     → Ok: decision is authoritative across all instances
//!     → Err: DegradationLatch logs once per incident,
//!            FailurePolicy picks the local answer
//!
//! Background:
//!     health.rs pings the store on an interval and clears the latch
//!     when it answers again
//! ```
//!
//! # Design Decisions
//! - Check-and-increment is never split into separate client calls
//! - Backends: memory.rs (single process, tests) and redis.rs (Lua scripts)
//! - Store outages never fail the request path; they degrade to a policy

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::events::{EventSink, ResilienceEvent};
use crate::observability::metrics;

pub mod health;
pub mod memory;
pub mod redis;

pub use health::StoreHealthMonitor;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("counter store unreachable: {0}")]
    Unavailable(String),
    #[error("unexpected reply from counter store: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of an atomic window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Events counted in the window after this decision.
    pub count: u64,
}

/// Atomic counter operations shared by every process instance.
///
/// Times are wall-clock offsets from the Unix epoch so all instances agree
/// on window boundaries.
#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    fn backend(&self) -> &'static str;

    /// Drop entries older than `now - window`, then admit iff
    /// `count + n <= limit`, recording `n` entries stamped `now` and
    /// refreshing the key's TTL to `window`. Atomic per key.
    async fn sliding_window_admit(
        &self,
        key: &str,
        now: Duration,
        window: Duration,
        limit: u64,
        n: u64,
    ) -> StoreResult<WindowDecision>;

    /// Entries stamped within `(now - window, now]`.
    async fn sliding_window_count(&self, key: &str, now: Duration, window: Duration) -> StoreResult<u64>;

    /// Admit iff `counter + n <= limit`, then increment by `n` and set the
    /// key to expire after `ttl`. Atomic per key.
    async fn fixed_window_admit(&self, key: &str, limit: u64, n: u64, ttl: Duration) -> StoreResult<WindowDecision>;

    /// Current counter value, 0 if absent or expired.
    async fn counter(&self, key: &str) -> StoreResult<u64>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Delete every key starting with `prefix`. Returns how many went.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;
}

/// What a distributed limiter answers while the store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit.
    #[default]
    Open,
    /// Deny.
    Closed,
}

impl FailurePolicy {
    pub fn admits(&self) -> bool {
        matches!(self, FailurePolicy::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Open => "open",
            FailurePolicy::Closed => "closed",
        }
    }
}

/// Tracks whether the store is currently failing so the outage is logged
/// once when it starts and once when it ends, not per request.
#[derive(Debug)]
pub struct DegradationLatch {
    policy: FailurePolicy,
    degraded: AtomicBool,
    incidents: AtomicU64,
    events: Option<EventSink>,
}

impl DegradationLatch {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            degraded: AtomicBool::new(false),
            incidents: AtomicU64::new(0),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn incidents(&self) -> u64 {
        self.incidents.load(Ordering::Relaxed)
    }

    /// Record a failed store call and return the policy's decision.
    pub fn on_failure(&self, err: &StoreError) -> bool {
        metrics::record_store_degraded(self.policy.as_str());
        if !self.degraded.swap(true, Ordering::AcqRel) {
            let incident = self.incidents.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::error!(
                error = %err,
                policy = self.policy.as_str(),
                incident,
                "Counter store unavailable, degrading rate limit decisions"
            );
            if let Some(events) = &self.events {
                events.publish(ResilienceEvent::StoreDegraded {
                    error: err.to_string(),
                    policy: self.policy,
                });
            }
        }
        self.policy.admits()
    }

    pub fn on_success(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!("Counter store reachable again");
            if let Some(events) = &self.events {
                events.publish(ResilienceEvent::StoreRecovered);
            }
        }
    }
}
