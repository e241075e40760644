//! Named breaker registry.
//!
//! One registry is built at startup and shared by reference with the
//! middleware and admin handlers. Creation is first-writer-wins: asking for
//! an existing name returns the existing breaker and ignores the settings
//! passed in.

use std::sync::Arc;

use dashmap::DashMap;

use crate::clock::{self, SharedClock};
use crate::error::ResilienceError;
use crate::observability::events::{EventSink, ResilienceEvent};
use crate::resilience::circuit_breaker::{
    BreakerSettings, BreakerStats, CircuitBreaker, StateChange, StateChangeHook,
};

pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: SharedClock,
    /// Installed on breakers whose settings carry no hook of their own.
    default_hook: Option<StateChangeHook>,
    events: Option<EventSink>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            clock,
            default_hook: None,
            events: None,
        }
    }

    pub fn with_state_change_hook(mut self, hook: StateChangeHook) -> Self {
        self.default_hook = Some(hook);
        self
    }

    /// Publish transitions and resets to `events`. Transitions go through
    /// the default hook, so an explicit hook set earlier takes precedence.
    pub fn with_events(mut self, events: EventSink) -> Self {
        if self.default_hook.is_none() {
            let sink = events.clone();
            self.default_hook = Some(Arc::new(move |change: &StateChange| {
                sink.publish(ResilienceEvent::BreakerTransition {
                    breaker: change.name.clone(),
                    from: change.from,
                    to: change.to,
                });
            }));
        }
        self.events = Some(events);
        self
    }

    /// Return the breaker registered under `settings.name`, creating it from
    /// `settings` if absent.
    pub fn get_or_create(&self, settings: BreakerSettings) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(&settings.name) {
            return existing.clone();
        }

        self.breakers
            .entry(settings.name.clone())
            .or_insert_with(|| {
                let mut settings = settings;
                if settings.on_state_change.is_none() {
                    settings.on_state_change = self.default_hook.clone();
                }
                tracing::debug!(breaker = %settings.name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::with_clock(settings, self.clock.clone()))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Stats for every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerStats> {
        // Collect first so no shard lock is held while breakers lock.
        let all: Vec<Arc<CircuitBreaker>> = self.breakers.iter().map(|r| r.value().clone()).collect();
        let mut stats: Vec<BreakerStats> = all.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Force-reset a named breaker.
    pub fn reset(&self, name: &str) -> Result<BreakerStats, ResilienceError> {
        let breaker = self
            .get(name)
            .ok_or_else(|| ResilienceError::UnknownBreaker(name.to_string()))?;
        breaker.reset();
        if let Some(events) = &self.events {
            events.publish(ResilienceEvent::BreakerReset {
                breaker: name.to_string(),
            });
        }
        Ok(breaker.stats())
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::BreakerState;
    use crate::resilience::trip;
    use std::time::Duration;

    #[test]
    fn test_first_writer_wins() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create(
            BreakerSettings::new("orders").open_timeout(Duration::from_secs(5)),
        );
        let b = registry.get_or_create(
            BreakerSettings::new("orders").open_timeout(Duration::from_secs(500)),
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.settings().open_timeout, Duration::from_secs(5));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_creation_yields_one_instance() {
        let registry = Arc::new(BreakerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = registry.clone();
                std::thread::spawn(move || r.get_or_create(BreakerSettings::new("shared")))
            })
            .collect();
        let breakers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for b in &breakers[1..] {
            assert!(Arc::ptr_eq(&breakers[0], b));
        }
    }

    #[test]
    fn test_reset_by_name() {
        let registry = BreakerRegistry::new();
        let cb = registry.get_or_create(
            BreakerSettings::new("payments").trip(trip::consecutive_failures(1)),
        );
        let _ = cb.call(|| Err::<(), _>("down"));
        assert_eq!(cb.state(), BreakerState::Open);

        let stats = registry.reset("payments").unwrap();
        assert_eq!(stats.state, BreakerState::Closed);
        assert!(matches!(
            registry.reset("nope"),
            Err(ResilienceError::UnknownBreaker(_))
        ));
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = BreakerRegistry::new();
        registry.get_or_create(BreakerSettings::new("b"));
        registry.get_or_create(BreakerSettings::new("a"));
        let names: Vec<_> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_default_hook_installed() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let h = hits.clone();
        let registry = BreakerRegistry::new().with_state_change_hook(Arc::new(move |_: &StateChange| {
            h.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        let cb = registry.get_or_create(
            BreakerSettings::new("x").trip(trip::consecutive_failures(1)),
        );
        let _ = cb.call(|| Err::<(), _>(()));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_published() {
        let (sink, mut drain) = EventSink::channel(8);
        let registry = BreakerRegistry::new().with_events(sink);
        let cb = registry.get_or_create(
            BreakerSettings::new("events").trip(trip::consecutive_failures(1)),
        );
        let _ = cb.call(|| Err::<(), _>(()));
        registry.reset("events").unwrap();

        assert_eq!(
            drain.try_next(),
            Some(ResilienceEvent::BreakerTransition {
                breaker: "events".into(),
                from: BreakerState::Closed,
                to: BreakerState::Open,
            })
        );
        assert_eq!(
            drain.try_next(),
            Some(ResilienceEvent::BreakerTransition {
                breaker: "events".into(),
                from: BreakerState::Open,
                to: BreakerState::Closed,
            })
        );
        assert_eq!(
            drain.try_next(),
            Some(ResilienceEvent::BreakerReset { breaker: "events".into() })
        );
    }
}
