//! Rate limiting subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → dispatcher.rs (derive IP / user / API / custom keys)
//!     → manager.rs (pick the configured strategy)
//!     → token_bucket.rs | sliding_window.rs | fixed_window.rs
//!       (every key must be admitted; first rejection stops the walk)
//! ```
//!
//! # Design Decisions
//! - Token bucket is in-process and smooths local bursts only
//! - Sliding and fixed windows count in the shared store so every instance
//!   sees the same numbers
//! - A request for more permits than the limit is refused without touching
//!   limiter state
//! - Per-key request/allow/reject counters are observational only

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

pub mod dispatcher;
pub mod fixed_window;
pub mod manager;
pub mod sliding_window;
pub mod token_bucket;

pub use dispatcher::{Admitted, Denied, KeyKind, KeyRules, LimitKey, LimiterDispatcher, RequestAttributes};
pub use fixed_window::FixedWindowLimiter;
pub use manager::LimiterManager;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

/// Base pause between admission polls.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Admission algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Token,
    #[default]
    Sliding,
    Fixed,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::Token, Strategy::Sliding, Strategy::Fixed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Token => "token",
            Strategy::Sliding => "sliding",
            Strategy::Fixed => "fixed",
        }
    }

    /// Whether decisions come from the shared store.
    pub fn is_distributed(&self) -> bool {
        !matches!(self, Strategy::Token)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token" => Ok(Strategy::Token),
            "sliding" => Ok(Strategy::Sliding),
            "fixed" => Ok(Strategy::Fixed),
            other => Err(format!("unknown limiter strategy: {}", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("permit count must be at least 1")]
    InvalidPermits,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Observational view of one key. Never used for admission.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LimitStats {
    pub key: String,
    pub strategy: Strategy,
    pub limit: u64,
    pub requests: u64,
    pub allowed: u64,
    pub rejected: u64,
    pub last_request_unix_ms: Option<u64>,
    pub remaining_quota: u64,
    pub reset_unix_ms: Option<u64>,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// Largest number of permits one window (or a full bucket) can grant.
    fn limit(&self) -> u64;

    async fn allow(&self, key: &str) -> Result<bool, LimiterError> {
        self.allow_n(key, 1).await
    }

    async fn allow_n(&self, key: &str, n: u32) -> Result<bool, LimiterError>;

    async fn reset(&self, key: &str) -> Result<(), LimiterError>;

    async fn stats(&self, key: &str) -> Result<LimitStats, LimiterError>;

    /// Keys this limiter has seen and still tracks.
    fn keys(&self) -> Vec<String>;

    /// Poll `allow_n` until it admits or `max_wait` runs out.
    async fn wait_n(&self, key: &str, n: u32, max_wait: Duration) -> Result<bool, LimiterError> {
        if u64::from(n) > self.limit() {
            return Ok(false);
        }
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.allow_n(key, n).await? {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let jitter = Duration::from_millis(fastrand::u64(0..5));
            tokio::time::sleep((POLL_INTERVAL + jitter).min(deadline - now)).await;
        }
    }
}

pub(crate) fn check_permits(n: u32) -> Result<u64, LimiterError> {
    if n == 0 {
        Err(LimiterError::InvalidPermits)
    } else {
        Ok(u64::from(n))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct KeyCounters {
    pub requests: u64,
    pub allowed: u64,
    pub rejected: u64,
    pub last_request_unix_ms: Option<u64>,
}

/// Per-key observational counters shared by the strategies.
#[derive(Debug, Default)]
pub(crate) struct StatsTable {
    entries: DashMap<String, KeyCounters>,
}

impl StatsTable {
    pub fn record(&self, key: &str, n: u64, allowed: bool, now: Duration) {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        entry.requests += n;
        if allowed {
            entry.allowed += n;
        } else {
            entry.rejected += n;
        }
        entry.last_request_unix_ms = Some(now.as_millis() as u64);
    }

    pub fn get(&self, key: &str) -> KeyCounters {
        self.entries.get(key).map(|r| *r.value()).unwrap_or_default()
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop keys whose last request is older than `cutoff`. Returns how many went.
    pub fn evict_before(&self, cutoff: Duration) -> usize {
        let cutoff_ms = cutoff.as_millis() as u64;
        let mut evicted = 0;
        self.entries.retain(|_, c| {
            let stale = c.last_request_unix_ms.map_or(true, |t| t < cutoff_ms);
            evicted += usize::from(stale);
            !stale
        });
        evicted
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse_roundtrip() {
        for s in Strategy::ALL {
            assert_eq!(s.as_str().parse::<Strategy>().unwrap(), s);
        }
        assert!("leaky".parse::<Strategy>().is_err());
        assert!(!Strategy::Token.is_distributed());
        assert!(Strategy::Fixed.is_distributed());
    }

    #[test]
    fn test_zero_permits_rejected() {
        assert!(matches!(check_permits(0), Err(LimiterError::InvalidPermits)));
        assert_eq!(check_permits(3).unwrap(), 3);
    }

    #[test]
    fn test_stats_table() {
        let table = StatsTable::default();
        table.record("ip:1", 1, true, Duration::from_millis(5));
        table.record("ip:1", 2, false, Duration::from_millis(9));
        let c = table.get("ip:1");
        assert_eq!((c.requests, c.allowed, c.rejected), (3, 1, 2));
        assert_eq!(c.last_request_unix_ms, Some(9));
        assert_eq!(table.keys(), vec!["ip:1".to_string()]);
        table.remove("ip:1");
        assert_eq!(table.get("ip:1"), KeyCounters::default());
    }

    #[test]
    fn test_stats_table_evicts_stale_keys() {
        let table = StatsTable::default();
        table.record("ip:old", 1, true, Duration::from_millis(1_000));
        table.record("ip:new", 1, true, Duration::from_millis(5_000));

        assert_eq!(table.evict_before(Duration::from_millis(5_000)), 1);
        assert_eq!(table.keys(), vec!["ip:new".to_string()]);
        assert_eq!(table.evict_before(Duration::from_millis(5_000)), 0);
    }
}
