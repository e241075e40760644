//! Fixed window counter on the shared counter store.
//!
//! Time is cut into aligned windows (`floor(unix_ms / window) * window`) and
//! each key gets one counter per window. Cheap, but a client can land up to
//! `2 * limit` events across a boundary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{self, SharedClock};
use crate::limiter::{check_permits, LimitStats, LimiterError, RateLimiter, StatsTable, Strategy};
use crate::observability::metrics;
use crate::store::{CounterStore, DegradationLatch};

pub const KEY_PREFIX: &str = "rate_limit:fixed:";

#[derive(Debug)]
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    latch: Arc<DegradationLatch>,
    window: Duration,
    limit: u64,
    prefix: String,
    clock: SharedClock,
    stats: StatsTable,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, latch: Arc<DegradationLatch>, window: Duration, limit: u64) -> Self {
        Self {
            store,
            latch,
            window,
            limit,
            prefix: KEY_PREFIX.to_string(),
            clock: clock::system(),
            stats: StatsTable::default(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Forget stats for keys last seen in an earlier window.
    pub fn evict_idle(&self) -> usize {
        let start = self.window_start_ms(self.clock.unix_time());
        self.stats.evict_before(Duration::from_millis(start))
    }

    /// Start of the window containing `now`, in unix milliseconds.
    fn window_start_ms(&self, now: Duration) -> u64 {
        let window_ms = (self.window.as_millis() as u64).max(1);
        let now_ms = now.as_millis() as u64;
        now_ms - now_ms % window_ms
    }

    fn store_key(&self, key: &str, window_start_ms: u64) -> String {
        format!("{}{}:{}", self.prefix, key, window_start_ms)
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    fn strategy(&self) -> Strategy {
        Strategy::Fixed
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    async fn allow_n(&self, key: &str, n: u32) -> Result<bool, LimiterError> {
        let permits = check_permits(n)?;
        let now = self.clock.unix_time();

        let allowed = if permits > self.limit {
            false
        } else {
            let store_key = self.store_key(key, self.window_start_ms(now));
            match self
                .store
                .fixed_window_admit(&store_key, self.limit, permits, self.window)
                .await
            {
                Ok(decision) => {
                    self.latch.on_success();
                    decision.allowed
                }
                Err(e) => self.latch.on_failure(&e),
            }
        };

        self.stats.record(key, permits, allowed, now);
        metrics::record_admission(Strategy::Fixed, allowed);
        Ok(allowed)
    }

    /// Clears every window of `key`, not just the current one.
    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.store.delete_prefix(&format!("{}{}:", self.prefix, key)).await?;
        self.stats.remove(key);
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<LimitStats, LimiterError> {
        let now = self.clock.unix_time();
        let start = self.window_start_ms(now);
        let current = self.store.counter(&self.store_key(key, start)).await?;
        let counters = self.stats.get(key);
        Ok(LimitStats {
            key: key.to_string(),
            strategy: Strategy::Fixed,
            limit: self.limit,
            requests: counters.requests,
            allowed: counters.allowed,
            rejected: counters.rejected,
            last_request_unix_ms: counters.last_request_unix_ms,
            remaining_quota: self.limit.saturating_sub(current),
            reset_unix_ms: Some(start + self.window.as_millis() as u64),
        })
    }

    fn keys(&self) -> Vec<String> {
        self.stats.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{FailurePolicy, MemoryStore};

    fn limiter(limit: u64, window: Duration) -> (FixedWindowLimiter, Arc<ManualClock>) {
        // aligned to a window start
        let clock = Arc::new(ManualClock::starting_at(Duration::from_secs(1_700_000_000)));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let latch = Arc::new(DegradationLatch::new(FailurePolicy::Closed));
        let limiter = FixedWindowLimiter::new(store, latch, window, limit).with_clock(clock.clone());
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_counts_reset_per_window() {
        let (limiter, clock) = limiter(2, Duration::from_secs(60));
        assert!(limiter.allow("ip:1").await.unwrap());
        assert!(limiter.allow("ip:1").await.unwrap());
        assert!(!limiter.allow("ip:1").await.unwrap());

        clock.advance(Duration::from_secs(60));
        assert!(limiter.allow("ip:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_boundary_burst_is_bounded_by_twice_the_limit() {
        let (limiter, clock) = limiter(3, Duration::from_secs(1));

        clock.advance(Duration::from_millis(999));
        let mut admitted = 0;
        for _ in 0..5 {
            if limiter.allow("k").await.unwrap() {
                admitted += 1;
            }
        }
        clock.advance(Duration::from_millis(1));
        for _ in 0..5 {
            if limiter.allow("k").await.unwrap() {
                admitted += 1;
            }
        }

        // two full windows inside 1ms
        assert_eq!(admitted, 6);
        assert!(admitted <= 2 * limiter.limit());
    }

    #[tokio::test]
    async fn test_stats_and_reset_all_windows() {
        let (limiter, clock) = limiter(5, Duration::from_secs(10));
        limiter.allow_n("k", 2).await.unwrap();
        clock.advance(Duration::from_secs(10));
        limiter.allow_n("k", 4).await.unwrap();

        let stats = limiter.stats("k").await.unwrap();
        assert_eq!(stats.remaining_quota, 1);
        assert_eq!(stats.requests, 6);
        assert_eq!(stats.reset_unix_ms, Some(1_700_000_020_000));

        limiter.reset("k").await.unwrap();
        assert_eq!(limiter.stats("k").await.unwrap().remaining_quota, 5);
        assert!(limiter.keys().is_empty());
    }

    #[tokio::test]
    async fn test_similar_keys_do_not_share_reset() {
        let (limiter, _) = limiter(1, Duration::from_secs(10));
        limiter.allow("ip:10.0.0.1").await.unwrap();
        limiter.allow("ip:10.0.0.12").await.unwrap();

        limiter.reset("ip:10.0.0.1").await.unwrap();
        assert!(limiter.allow("ip:10.0.0.1").await.unwrap());
        assert!(!limiter.allow("ip:10.0.0.12").await.unwrap());
    }

    #[test]
    fn test_window_alignment() {
        let (limiter, _) = limiter(1, Duration::from_secs(60));
        assert_eq!(limiter.window_start_ms(Duration::from_millis(125_500)), 120_000);
        assert_eq!(limiter.store_key("user:9", 120_000), "rate_limit:fixed:user:9:120000");
    }

    #[tokio::test]
    async fn test_evict_idle_after_window_ends() {
        let (limiter, clock) = limiter(3, Duration::from_secs(60));
        limiter.allow("ip:1").await.unwrap();
        assert_eq!(limiter.evict_idle(), 0);

        clock.advance(Duration::from_secs(60));
        limiter.allow("ip:2").await.unwrap();
        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.keys(), vec!["ip:2".to_string()]);
    }
}
