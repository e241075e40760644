//! In-process counter store.
//!
//! Each key is a DashMap entry; holding the entry's shard lock for the
//! whole check-and-increment gives the same per-key atomicity the Redis
//! scripts give across processes. Only coordinates within one process.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::{self, SharedClock};
use crate::store::{CounterStore, StoreError, StoreResult, WindowDecision};

#[derive(Debug)]
enum Slot {
    Counter { value: u64, expires_at: Duration },
    Timeline { stamps: VecDeque<Duration>, expires_at: Duration },
}

impl Slot {
    fn expires_at(&self) -> Duration {
        match self {
            Slot::Counter { expires_at, .. } | Slot::Timeline { expires_at, .. } => *expires_at,
        }
    }

    fn is_expired(&self, now: Duration) -> bool {
        self.expires_at() <= now
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    /// Live keys, expired ones excluded.
    pub fn len(&self) -> usize {
        let now = self.clock.unix_time();
        self.slots.iter().filter(|s| !s.value().is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys. Reads already ignore them; this only frees memory.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.unix_time();
        let mut purged = 0;
        self.slots.retain(|_, slot| {
            let expired = slot.is_expired(now);
            purged += usize::from(expired);
            !expired
        });
        purged
    }

    /// Periodically purge expired keys until `shutdown` fires.
    pub fn spawn_expiry_sweeper(self: Arc<Self>, every: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, remaining = self.slots.len(), "Purged expired counters");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn type_error(key: &str) -> StoreError {
    StoreError::Protocol(format!("key {} holds a different kind of value", key))
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        now: Duration,
        window: Duration,
        limit: u64,
        n: u64,
    ) -> StoreResult<WindowDecision> {
        let wall = self.clock.unix_time();
        let window_start = now.saturating_sub(window);

        let mut entry = self.slots.entry(key.to_string()).or_insert_with(|| Slot::Timeline {
            stamps: VecDeque::new(),
            expires_at: wall + window,
        });
        if entry.is_expired(wall) {
            *entry = Slot::Timeline {
                stamps: VecDeque::new(),
                expires_at: wall + window,
            };
        }

        let Slot::Timeline { stamps, expires_at } = &mut *entry else {
            return Err(type_error(key));
        };

        while stamps.front().is_some_and(|t| *t <= window_start) {
            stamps.pop_front();
        }

        let current = stamps.len() as u64;
        if current + n <= limit {
            for _ in 0..n {
                stamps.push_back(now);
            }
            *expires_at = wall + window;
            Ok(WindowDecision {
                allowed: true,
                count: current + n,
            })
        } else {
            Ok(WindowDecision {
                allowed: false,
                count: current,
            })
        }
    }

    async fn sliding_window_count(&self, key: &str, now: Duration, window: Duration) -> StoreResult<u64> {
        let wall = self.clock.unix_time();
        let window_start = now.saturating_sub(window);
        match self.slots.get(key) {
            Some(slot) if !slot.is_expired(wall) => match &*slot {
                Slot::Timeline { stamps, .. } => Ok(stamps
                    .iter()
                    .filter(|t| **t > window_start && **t <= now)
                    .count() as u64),
                Slot::Counter { .. } => Err(type_error(key)),
            },
            _ => Ok(0),
        }
    }

    async fn fixed_window_admit(&self, key: &str, limit: u64, n: u64, ttl: Duration) -> StoreResult<WindowDecision> {
        let wall = self.clock.unix_time();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(wall) {
                    occupied.insert(Slot::Counter {
                        value: 0,
                        expires_at: wall + ttl,
                    });
                }
                let Slot::Counter { value, expires_at } = occupied.get_mut() else {
                    return Err(type_error(key));
                };
                if *value + n <= limit {
                    *value += n;
                    *expires_at = wall + ttl;
                    Ok(WindowDecision {
                        allowed: true,
                        count: *value,
                    })
                } else {
                    Ok(WindowDecision {
                        allowed: false,
                        count: *value,
                    })
                }
            }
            Entry::Vacant(vacant) => {
                if n <= limit {
                    vacant.insert(Slot::Counter {
                        value: n,
                        expires_at: wall + ttl,
                    });
                    Ok(WindowDecision { allowed: true, count: n })
                } else {
                    Ok(WindowDecision { allowed: false, count: 0 })
                }
            }
        }
    }

    async fn counter(&self, key: &str) -> StoreResult<u64> {
        let wall = self.clock.unix_time();
        match self.slots.get(key) {
            Some(slot) if !slot.is_expired(wall) => match &*slot {
                Slot::Counter { value, .. } => Ok(*value),
                Slot::Timeline { .. } => Err(type_error(key)),
            },
            _ => Ok(0),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.slots.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        // counted inside retain; len() races with concurrent inserts
        let mut removed = 0u64;
        self.slots.retain(|k, _| {
            let matched = k.starts_with(prefix);
            removed += u64::from(matched);
            !matched
        });
        Ok(removed)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(Duration::from_secs(1_000)));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_fixed_counter_expires_with_ttl() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(60);
        assert!(store.fixed_window_admit("k", 2, 2, ttl).await.unwrap().allowed);
        assert!(!store.fixed_window_admit("k", 2, 1, ttl).await.unwrap().allowed);
        assert_eq!(store.counter("k").await.unwrap(), 2);

        clock.advance(Duration::from_secs(60));
        assert_eq!(store.counter("k").await.unwrap(), 0);
        assert!(store.fixed_window_admit("k", 2, 1, ttl).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_rejection_does_not_increment() {
        let (store, _) = store();
        let ttl = Duration::from_secs(1);
        let d = store.fixed_window_admit("k", 3, 5, ttl).await.unwrap();
        assert_eq!(d, WindowDecision { allowed: false, count: 0 });
        assert_eq!(store.counter("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sliding_drops_old_entries() {
        let (store, clock) = store();
        let window = Duration::from_secs(1);
        let t0 = clock.unix_time();
        for _ in 0..3 {
            assert!(store.sliding_window_admit("s", t0, window, 3, 1).await.unwrap().allowed);
        }
        assert!(!store.sliding_window_admit("s", t0, window, 3, 1).await.unwrap().allowed);
        assert_eq!(store.sliding_window_count("s", t0, window).await.unwrap(), 3);

        let later = t0 + Duration::from_millis(1_100);
        assert_eq!(store.sliding_window_count("s", later, window).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_protocol_error() {
        let (store, clock) = store();
        store.fixed_window_admit("k", 5, 1, Duration::from_secs(5)).await.unwrap();
        let err = store
            .sliding_window_admit("k", clock.unix_time(), Duration::from_secs(1), 5, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_delete_prefix_and_purge() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(10);
        store.fixed_window_admit("rl:ip:1:100", 5, 1, ttl).await.unwrap();
        store.fixed_window_admit("rl:ip:1:160", 5, 1, ttl).await.unwrap();
        store.fixed_window_admit("rl:ip:2:100", 5, 1, ttl).await.unwrap();

        assert_eq!(store.delete_prefix("rl:ip:1:").await.unwrap(), 2);
        assert_eq!(store.len(), 1);

        clock.advance(ttl);
        assert!(store.is_empty());
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweeps_under_concurrent_inserts() {
        let (store, _) = store();
        let store = Arc::new(store);
        let ttl = Duration::from_secs(60);

        let writers: Vec<_> = (0..3)
            .map(|w| {
                let store = store.clone();
                tokio::spawn(async move {
                    for i in 0..2_000 {
                        store.fixed_window_admit(&format!("w{}:{}", w, i), 5, 1, ttl).await.unwrap();
                    }
                })
            })
            .collect();

        let sweeper = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..2_000 {
                    assert_eq!(store.delete_prefix("nomatch:").await.unwrap(), 0);
                    assert_eq!(store.purge_expired(), 0);
                    tokio::task::yield_now().await;
                }
            })
        };

        for w in writers {
            w.await.unwrap();
        }
        sweeper.await.unwrap();
        assert_eq!(store.len(), 6_000);
        assert_eq!(store.delete_prefix("w1:").await.unwrap(), 2_000);
    }
}
