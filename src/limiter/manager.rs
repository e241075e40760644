//! Strategy resolution.
//!
//! Owns one limiter per strategy and routes calls to the configured default
//! or to an explicitly requested one.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::config::schema::RateLimitConfig;
use crate::limiter::{
    FixedWindowLimiter, LimitStats, LimiterError, RateLimiter, SlidingWindowLimiter, Strategy, TokenBucketLimiter,
};
use crate::store::{CounterStore, DegradationLatch};

/// One active key as listed by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct KeyListing {
    pub strategy: Strategy,
    pub key: String,
}

#[derive(Debug)]
pub struct LimiterManager {
    token: Arc<TokenBucketLimiter>,
    sliding: Arc<SlidingWindowLimiter>,
    fixed: Arc<FixedWindowLimiter>,
    default_strategy: Strategy,
    latch: Arc<DegradationLatch>,
}

impl LimiterManager {
    pub fn new(
        token: Arc<TokenBucketLimiter>,
        sliding: Arc<SlidingWindowLimiter>,
        fixed: Arc<FixedWindowLimiter>,
        default_strategy: Strategy,
        latch: Arc<DegradationLatch>,
    ) -> Self {
        Self {
            token,
            sliding,
            fixed,
            default_strategy,
            latch,
        }
    }

    pub fn from_config(
        config: &RateLimitConfig,
        store: Arc<dyn CounterStore>,
        latch: Arc<DegradationLatch>,
        clock: SharedClock,
    ) -> Self {
        let token = TokenBucketLimiter::with_clock(config.token_bucket.rate, config.token_bucket.burst, clock.clone());
        let sliding = SlidingWindowLimiter::new(
            store.clone(),
            latch.clone(),
            config.sliding_window.window(),
            config.sliding_window.limit,
        )
        .with_clock(clock.clone());
        let fixed = FixedWindowLimiter::new(store, latch.clone(), config.fixed_window.window(), config.fixed_window.limit)
            .with_clock(clock);

        tracing::info!(
            strategy = %config.strategy,
            failure_policy = latch.policy().as_str(),
            "Rate limiters initialized"
        );

        Self::new(Arc::new(token), Arc::new(sliding), Arc::new(fixed), config.strategy, latch)
    }

    pub fn default_strategy(&self) -> Strategy {
        self.default_strategy
    }

    pub fn latch(&self) -> &Arc<DegradationLatch> {
        &self.latch
    }

    pub fn token_bucket(&self) -> &Arc<TokenBucketLimiter> {
        &self.token
    }

    pub fn limiter(&self, strategy: Strategy) -> &dyn RateLimiter {
        match strategy {
            Strategy::Token => self.token.as_ref(),
            Strategy::Sliding => self.sliding.as_ref(),
            Strategy::Fixed => self.fixed.as_ref(),
        }
    }

    pub async fn allow(&self, key: &str) -> Result<bool, LimiterError> {
        self.allow_with(self.default_strategy, key).await
    }

    pub async fn allow_with(&self, strategy: Strategy, key: &str) -> Result<bool, LimiterError> {
        self.limiter(strategy).allow(key).await
    }

    pub async fn stats(&self, strategy: Strategy, key: &str) -> Result<LimitStats, LimiterError> {
        self.limiter(strategy).stats(key).await
    }

    pub async fn reset(&self, strategy: Strategy, key: &str) -> Result<(), LimiterError> {
        self.limiter(strategy).reset(key).await?;
        tracing::info!(%strategy, key, "Rate limit key reset");
        Ok(())
    }

    /// Drop observational stats for window keys whose store state has
    /// expired. Token buckets are evicted by their own sweeper.
    pub fn evict_idle_stats(&self) -> usize {
        self.sliding.evict_idle() + self.fixed.evict_idle()
    }

    /// Run [`evict_idle_stats`](Self::evict_idle_stats) every `every` until
    /// `shutdown` fires.
    pub fn spawn_stats_sweeper(self: Arc<Self>, every: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle_stats();
                        if evicted > 0 {
                            tracing::debug!(evicted, "Evicted idle rate limit stats");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Every tracked key across all strategies.
    pub fn keys(&self) -> Vec<KeyListing> {
        Strategy::ALL
            .into_iter()
            .flat_map(|strategy| {
                self.limiter(strategy)
                    .keys()
                    .into_iter()
                    .map(move |key| KeyListing { strategy, key })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{FailurePolicy, MemoryStore};

    fn manager(strategy: Strategy) -> LimiterManager {
        manager_with_clock(strategy).0
    }

    fn manager_with_clock(strategy: Strategy) -> (LimiterManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(Duration::from_secs(1_700_000_000)));
        let mut config = RateLimitConfig::default();
        config.strategy = strategy;
        config.token_bucket.burst = 1;
        config.sliding_window.limit = 2;
        config.fixed_window.limit = 3;
        let manager = LimiterManager::from_config(
            &config,
            Arc::new(MemoryStore::with_clock(clock.clone())),
            Arc::new(DegradationLatch::new(FailurePolicy::Open)),
            clock.clone(),
        );
        (manager, clock)
    }

    #[tokio::test]
    async fn test_default_strategy_used_by_allow() {
        let manager = manager(Strategy::Fixed);
        for _ in 0..3 {
            assert!(manager.allow("k").await.unwrap());
        }
        assert!(!manager.allow("k").await.unwrap());
        // other strategies keep their own state
        assert!(manager.allow_with(Strategy::Token, "k").await.unwrap());
        assert!(manager.allow_with(Strategy::Sliding, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_listed_per_strategy() {
        let manager = manager(Strategy::Sliding);
        manager.allow("ip:1").await.unwrap();
        manager.allow_with(Strategy::Token, "user:2").await.unwrap();

        let keys: Vec<(Strategy, String)> = manager.keys().into_iter().map(|k| (k.strategy, k.key)).collect();
        assert_eq!(
            keys,
            vec![(Strategy::Token, "user:2".to_string()), (Strategy::Sliding, "ip:1".to_string())]
        );

        manager.reset(Strategy::Sliding, "ip:1").await.unwrap();
        assert_eq!(manager.keys().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_sweeper_forgets_expired_window_keys() {
        let (manager, clock) = manager_with_clock(Strategy::Sliding);
        let manager = Arc::new(manager);
        for i in 0..100 {
            manager.allow(&format!("ip:10.0.0.{}", i)).await.unwrap();
            manager.allow_with(Strategy::Fixed, &format!("ip:10.0.1.{}", i)).await.unwrap();
        }
        assert_eq!(manager.keys().len(), 200);

        let (tx, rx) = broadcast::channel(1);
        let sweeper = manager.clone().spawn_stats_sweeper(Duration::from_secs(1), rx);

        // both default windows are 60s
        clock.advance(Duration::from_secs(61));
        manager.allow("ip:fresh").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let keys: Vec<String> = manager.keys().into_iter().map(|k| k.key).collect();
        assert_eq!(keys, vec!["ip:fresh".to_string()]);

        tx.send(()).unwrap();
        sweeper.await.unwrap();
    }

    fn manager_with_limit(limit: u32) -> LimiterManager {
        let clock = Arc::new(ManualClock::starting_at(Duration::from_secs(1_700_000_000)));
        let mut config = RateLimitConfig::default();
        config.token_bucket.burst = limit;
        config.sliding_window.limit = u64::from(limit);
        config.fixed_window.limit = u64::from(limit);
        LimiterManager::from_config(
            &config,
            Arc::new(MemoryStore::with_clock(clock.clone())),
            Arc::new(DegradationLatch::new(FailurePolicy::Closed)),
            clock,
        )
    }

    #[tokio::test]
    async fn test_reset_twice_equals_once() {
        let manager = manager_with_limit(2);
        for strategy in Strategy::ALL {
            assert!(manager.allow_with(strategy, "ip:1").await.unwrap());
            assert!(manager.allow_with(strategy, "ip:1").await.unwrap());
            assert!(!manager.allow_with(strategy, "ip:1").await.unwrap());

            manager.reset(strategy, "ip:1").await.unwrap();
            let once = manager.stats(strategy, "ip:1").await.unwrap();
            manager.reset(strategy, "ip:1").await.unwrap();
            let twice = manager.stats(strategy, "ip:1").await.unwrap();

            assert_eq!(once.requests, 0, "{}", strategy);
            assert_eq!(twice.requests, once.requests, "{}", strategy);
            assert_eq!(twice.remaining_quota, once.remaining_quota, "{}", strategy);
            assert_eq!(twice.remaining_quota, 2, "{}", strategy);
            assert!(manager.allow_with(strategy, "ip:1").await.unwrap());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_admit_exactly_limit() {
        let manager = Arc::new(manager_with_limit(50));
        for strategy in Strategy::ALL {
            let callers: Vec<_> = (0..400)
                .map(|_| {
                    let manager = manager.clone();
                    tokio::spawn(async move { manager.allow_with(strategy, "ip:hot").await.unwrap() })
                })
                .collect();

            let mut admitted = 0;
            for caller in callers {
                if caller.await.unwrap() {
                    admitted += 1;
                }
            }
            assert_eq!(admitted, 50, "{}", strategy);

            let stats = manager.stats(strategy, "ip:hot").await.unwrap();
            assert_eq!((stats.allowed, stats.rejected), (50, 350), "{}", strategy);
        }
    }
}
