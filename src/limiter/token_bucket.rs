//! In-process token bucket.
//!
//! Each key gets a bucket that starts full, refills continuously at `rate`
//! tokens per second and never holds more than `capacity`. Buckets live only
//! in this process; idle ones are swept so unbounded key sets do not grow
//! the map forever.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::{self, SharedClock};
use crate::limiter::{check_permits, LimitStats, LimiterError, RateLimiter, StatsTable, Strategy};
use crate::observability::metrics;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }

    /// Token count at `now` without touching the bucket.
    fn projected(&self, now: Instant, rate: f64, capacity: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * rate).min(capacity)
    }
}

#[derive(Debug)]
pub struct TokenBucketLimiter {
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    rate: f64,
    capacity: f64,
    clock: SharedClock,
    stats: StatsTable,
}

impl TokenBucketLimiter {
    /// `rate` tokens per second, at most `burst` stored.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::with_clock(rate, burst, clock::system())
    }

    pub fn with_clock(rate: f64, burst: u32, clock: SharedClock) -> Self {
        Self {
            buckets: DashMap::new(),
            rate,
            capacity: f64::from(burst),
            clock,
            stats: StatsTable::default(),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<Bucket>> {
        if let Some(existing) = self.buckets.get(key) {
            return existing.value().clone();
        }
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::full(self.capacity, now))))
            .value()
            .clone()
    }

    /// Drop buckets unused for at least `max_idle`. Returns how many went.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let mut evicted = Vec::new();
        self.buckets.retain(|key, bucket| {
            let idle = now.saturating_duration_since(bucket.lock().last_used);
            if idle >= max_idle {
                evicted.push(key.clone());
                false
            } else {
                true
            }
        });
        for key in &evicted {
            self.stats.remove(key);
        }
        evicted.len()
    }

    pub fn spawn_idle_sweeper(
        self: Arc<Self>,
        every: Duration,
        max_idle: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle(max_idle);
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = self.buckets.len(), "Evicted idle token buckets");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Token bucket sweeper stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    fn strategy(&self) -> Strategy {
        Strategy::Token
    }

    fn limit(&self) -> u64 {
        self.capacity as u64
    }

    async fn allow_n(&self, key: &str, n: u32) -> Result<bool, LimiterError> {
        let permits = check_permits(n)?;
        let wall = self.clock.unix_time();

        if permits as f64 > self.capacity {
            self.stats.record(key, permits, false, wall);
            metrics::record_admission(Strategy::Token, false);
            return Ok(false);
        }

        let now = self.clock.now();
        let bucket = self.bucket(key, now);
        let allowed = {
            let mut b = bucket.lock();
            b.refill(now, self.rate, self.capacity);
            b.last_used = now;
            if b.tokens >= permits as f64 {
                b.tokens -= permits as f64;
                true
            } else {
                false
            }
        };

        self.stats.record(key, permits, allowed, wall);
        metrics::record_admission(Strategy::Token, allowed);
        Ok(allowed)
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.buckets.remove(key);
        self.stats.remove(key);
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<LimitStats, LimiterError> {
        let now = self.clock.now();
        let wall = self.clock.unix_time();
        let tokens = match self.buckets.get(key) {
            Some(bucket) => bucket.lock().projected(now, self.rate, self.capacity),
            None => self.capacity,
        };
        // a tiny rate can put "full" beyond what Duration holds
        let to_full = if self.rate > 0.0 {
            Duration::try_from_secs_f64((self.capacity - tokens).max(0.0) / self.rate).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        let reset_unix_ms = u64::try_from(wall.saturating_add(to_full).as_millis()).unwrap_or(u64::MAX);
        let counters = self.stats.get(key);
        Ok(LimitStats {
            key: key.to_string(),
            strategy: Strategy::Token,
            limit: self.limit(),
            requests: counters.requests,
            allowed: counters.allowed,
            rejected: counters.rejected,
            last_request_unix_ms: counters.last_request_unix_ms,
            remaining_quota: tokens.floor() as u64,
            reset_unix_ms: Some(reset_unix_ms),
        })
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.buckets.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(rate: f64, burst: u32) -> (TokenBucketLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(Duration::from_secs(1_700_000_000)));
        (TokenBucketLimiter::with_clock(rate, burst, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_burst_then_refill() {
        let (limiter, clock) = limiter(1.0, 5);

        for _ in 0..5 {
            assert!(limiter.allow("ip:10.0.0.1").await.unwrap());
        }
        assert!(!limiter.allow("ip:10.0.0.1").await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow("ip:10.0.0.1").await.unwrap());
        assert!(!limiter.allow("ip:10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_tokens_capped_at_capacity() {
        let (limiter, clock) = limiter(10.0, 3);
        assert!(limiter.allow("k").await.unwrap());

        clock.advance(Duration::from_secs(3_600));
        let stats = limiter.stats("k").await.unwrap();
        assert_eq!(stats.remaining_quota, 3);

        assert!(limiter.allow_n("k", 3).await.unwrap());
        assert!(!limiter.allow("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _) = limiter(1.0, 1);
        assert!(limiter.allow("a").await.unwrap());
        assert!(!limiter.allow("a").await.unwrap());
        assert!(limiter.allow("b").await.unwrap());
        assert_eq!(limiter.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_oversized_request_leaves_bucket_alone() {
        let (limiter, _) = limiter(1.0, 4);
        assert!(!limiter.allow_n("k", 5).await.unwrap());
        assert!(limiter.keys().is_empty());
        assert!(limiter.allow_n("k", 4).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_permits_is_an_error() {
        let (limiter, _) = limiter(1.0, 4);
        assert!(matches!(limiter.allow_n("k", 0).await, Err(LimiterError::InvalidPermits)));
    }

    #[tokio::test]
    async fn test_stats_and_reset() {
        let (limiter, _) = limiter(1.0, 2);
        limiter.allow("k").await.unwrap();
        limiter.allow("k").await.unwrap();
        limiter.allow("k").await.unwrap();

        let stats = limiter.stats("k").await.unwrap();
        assert_eq!((stats.requests, stats.allowed, stats.rejected), (3, 2, 1));
        assert_eq!(stats.remaining_quota, 0);
        assert_eq!(stats.limit, 2);

        limiter.reset("k").await.unwrap();
        let stats = limiter.stats("k").await.unwrap();
        assert_eq!(stats.requests, 0);
        assert_eq!(stats.remaining_quota, 2);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let (limiter, clock) = limiter(1.0, 2);
        limiter.allow("old").await.unwrap();
        clock.advance(Duration::from_secs(30));
        limiter.allow("fresh").await.unwrap();
        clock.advance(Duration::from_secs(30));

        assert_eq!(limiter.evict_idle(Duration::from_secs(60)), 1);
        assert_eq!(limiter.keys(), vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_n_polls_until_refill() {
        let limiter = TokenBucketLimiter::new(10.0, 1);
        assert!(limiter.allow("k").await.unwrap());
        assert!(limiter.wait_n("k", 1, Duration::from_secs(1)).await.unwrap());
        assert!(!limiter.wait_n("k", 2, Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_with_negligible_rate() {
        let clock = Arc::new(ManualClock::starting_at(Duration::from_secs(1_700_000_000)));
        let limiter = TokenBucketLimiter::with_clock(1e-300, 2, clock);
        assert!(limiter.allow("k").await.unwrap());

        let stats = limiter.stats("k").await.unwrap();
        assert_eq!(stats.remaining_quota, 1);
        assert_eq!(stats.reset_unix_ms, Some(u64::MAX));
    }
}
