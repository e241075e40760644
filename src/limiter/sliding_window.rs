//! Sliding window log on the shared counter store.
//!
//! A key admits `n` more events iff fewer than `limit - n + 1` were recorded
//! in the trailing `(now - window, now]`. The check and the insert are one
//! store operation, so concurrent instances never overshoot the limit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{self, SharedClock};
use crate::limiter::{check_permits, LimitStats, LimiterError, RateLimiter, StatsTable, Strategy};
use crate::observability::metrics;
use crate::store::{CounterStore, DegradationLatch};

pub const KEY_PREFIX: &str = "rate_limit:sliding:";

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    latch: Arc<DegradationLatch>,
    window: Duration,
    limit: u64,
    prefix: String,
    clock: SharedClock,
    stats: StatsTable,
}

impl SlidingWindowLimiter {
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

    /// Forget stats for keys with no request inside the current window.
    /// Their store entries have expired by then.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.unix_time();
        self.stats.evict_before(now.saturating_sub(self.window))
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn strategy(&self) -> Strategy {
        Strategy::Sliding
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
            match self
                .store
                .sliding_window_admit(&self.store_key(key), now, self.window, self.limit, permits)
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
        metrics::record_admission(Strategy::Sliding, allowed);
        Ok(allowed)
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.store.delete(&self.store_key(key)).await?;
        self.stats.remove(key);
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<LimitStats, LimiterError> {
        let now = self.clock.unix_time();
        let count = self
            .store
            .sliding_window_count(&self.store_key(key), now, self.window)
            .await?;
        let counters = self.stats.get(key);
        Ok(LimitStats {
            key: key.to_string(),
            strategy: Strategy::Sliding,
            limit: self.limit,
            requests: counters.requests,
            allowed: counters.allowed,
            rejected: counters.rejected,
            last_request_unix_ms: counters.last_request_unix_ms,
            remaining_quota: self.limit.saturating_sub(count),
            reset_unix_ms: Some((now + self.window).as_millis() as u64),
        })
    }

    fn keys(&self) -> Vec<String> {
        self.stats.keys()
    }
}
