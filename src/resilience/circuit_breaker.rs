//! Circuit breaker for downstream protection.
//!
//! # States
//! - Closed: normal operation, calls pass through and are counted
//! - Open: downstream assumed down, calls fail fast
//! - Half-Open: a bounded number of probe calls test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open:      trip predicate holds after a recorded failure
//! Open → Half-Open:   first admission check at or after the open timeout
//! Half-Open → Closed: max_half_open_requests consecutive successes
//! Half-Open → Open:   any failure (timeout restarts)
//! ```
//!
//! # Design Decisions
//! - One mutex guards state, counts, generation and expiry together
//! - No background timer: Open → Half-Open happens lazily on the next
//!   admission check, which means [`CircuitBreaker::state`] may itself
//!   perform that transition
//! - Every admitted call carries the generation it entered with; an outcome
//!   reported against a stale generation (after a reset or rollover) is
//!   dropped rather than applied to the fresh counters
//! - A call that never reports an outcome (panic, cancellation) counts as a
//!   failure

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::clock::{self, SharedClock};
use crate::error::ResilienceError;
use crate::observability::metrics;
use crate::resilience::counts::Counts;
use crate::resilience::trip::{self, TripPredicate};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::HalfOpen => "HALF_OPEN",
            BreakerState::Open => "OPEN",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state transition, handed to the state-change hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub name: String,
    pub from: BreakerState,
    pub to: BreakerState,
}

pub type StateChangeHook = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Immutable breaker configuration.
#[derive(Clone)]
pub struct BreakerSettings {
    pub name: String,
    /// Probe calls admitted while half-open, and the consecutive successes
    /// needed to close again.
    pub max_half_open_requests: u32,
    /// Closed-state counting window. Zero keeps counting forever.
    pub interval: Duration,
    /// Time spent open before probing.
    pub open_timeout: Duration,
    pub trip: TripPredicate,
    pub on_state_change: Option<StateChangeHook>,
}

impl BreakerSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_half_open_requests: 1,
            interval: Duration::ZERO,
            open_timeout: Duration::from_secs(60),
            trip: trip::default_trip(),
            on_state_change: None,
        }
    }

    pub fn max_half_open_requests(mut self, n: u32) -> Self {
        self.max_half_open_requests = n;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn trip(mut self, trip: TripPredicate) -> Self {
        self.trip = trip;
        self
    }

    pub fn on_state_change(mut self, hook: StateChangeHook) -> Self {
        self.on_state_change = Some(hook);
        self
    }
}

impl fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("name", &self.name)
            .field("max_half_open_requests", &self.max_half_open_requests)
            .field("interval", &self.interval)
            .field("open_timeout", &self.open_timeout)
            .finish_non_exhaustive()
    }
}

/// Why a call was refused without running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("circuit breaker {0} is open")]
    Open(String),
    #[error("circuit breaker {0} has no free half-open probe slots")]
    HalfOpenFull(String),
}

impl From<Rejection> for ResilienceError {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::Open(name) => ResilienceError::CircuitOpen(name),
            Rejection::HalfOpenFull(name) => ResilienceError::HalfOpenCapacityExceeded(name),
        }
    }
}

/// Result of a guarded call: either the breaker refused it, or it ran and
/// returned its own error unchanged.
#[derive(Debug)]
pub enum CallError<E> {
    Rejected(Rejection),
    Inner(E),
}

impl<E> CallError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Inner(e) => Some(e),
            CallError::Rejected(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Rejected(r) => write!(f, "{}", r),
            CallError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Rejected(r) => Some(r),
            CallError::Inner(e) => Some(e),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub generation: u64,
    pub total_requests: u32,
    pub successful_requests: u32,
    pub failed_requests: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub failure_rate: f64,
    pub open_timeout_ms: u64,
    /// Time left until the next probe is allowed; only set while open.
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// A named circuit breaker.
pub struct CircuitBreaker {
    settings: BreakerSettings,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self::with_clock(settings, clock::system())
    }

    pub fn with_clock(mut settings: BreakerSettings, clock: SharedClock) -> Self {
        settings.max_half_open_requests = settings.max_half_open_requests.max(1);
        let now = clock.now();
        let expiry = closed_expiry(&settings, now);
        Self {
            settings,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Ask for admission and get a ticket that must be settled with the
    /// call's outcome. Dropping an unsettled ticket records a failure.
    pub fn acquire(self: &Arc<Self>) -> Result<Ticket, Rejection> {
        let generation = self.before_request()?;
        Ok(Ticket {
            breaker: Arc::clone(self),
            generation,
            settled: false,
        })
    }

    fn enter(&self) -> Result<Ticket<&Self>, Rejection> {
        let generation = self.before_request()?;
        Ok(Ticket {
            breaker: self,
            generation,
            settled: false,
        })
    }

    /// Run `f` if admitted. An `Err` from `f` counts as a failure.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.call_classified(f, |res| res.is_err())
    }

    /// Like [`call`](Self::call) but `is_failure` decides what counts as a
    /// failure, e.g. an `Ok` carrying a 5xx status.
    pub fn call_classified<T, E, F, C>(&self, f: F, is_failure: C) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        C: FnOnce(&Result<T, E>) -> bool,
    {
        let ticket = self.enter().map_err(CallError::Rejected)?;
        let res = f();
        ticket.record(!is_failure(&res));
        res.map_err(CallError::Inner)
    }

    /// Unit-returning form of [`call`](Self::call).
    pub fn execute<E, F>(&self, f: F) -> Result<(), CallError<E>>
    where
        F: FnOnce() -> Result<(), E>,
    {
        self.call(f)
    }

    /// Async form of [`call`](Self::call). If the future is dropped before
    /// completing the call is recorded as a failure.
    pub async fn call_async<T, E, Fut>(&self, fut: Fut) -> Result<T, CallError<E>>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let ticket = self.enter().map_err(CallError::Rejected)?;
        let res = fut.await;
        ticket.record(res.is_ok());
        res.map_err(CallError::Inner)
    }

    /// Current state. Note that this may move an expired Open breaker to
    /// Half-Open, or roll a Closed breaker's counting window.
    pub fn state(&self) -> BreakerState {
        let mut changes = Vec::new();
        let state = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            self.current_state(&mut inner, now, &mut changes);
            inner.state
        };
        self.notify(changes);
        state
    }

    pub fn stats(&self) -> BreakerStats {
        let mut changes = Vec::new();
        let stats = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            self.current_state(&mut inner, now, &mut changes);

            let retry_after_ms = match (inner.state, inner.expiry) {
                (BreakerState::Open, Some(expiry)) => {
                    Some(expiry.saturating_duration_since(now).as_millis() as u64)
                }
                _ => None,
            };

            BreakerStats {
                name: self.settings.name.clone(),
                state: inner.state,
                generation: inner.generation,
                total_requests: inner.counts.requests,
                successful_requests: inner.counts.total_successes,
                failed_requests: inner.counts.total_failures,
                consecutive_successes: inner.counts.consecutive_successes,
                consecutive_failures: inner.counts.consecutive_failures,
                failure_rate: inner.counts.failure_rate(),
                open_timeout_ms: self.settings.open_timeout.as_millis() as u64,
                retry_after_ms,
            }
        };
        self.notify(changes);
        stats
    }

    /// Force Closed, clear counts and start a new generation. Outcomes of
    /// calls admitted before the reset are discarded when they arrive.
    pub fn reset(&self) {
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            if inner.state == BreakerState::Closed {
                self.new_generation(&mut inner, now);
            } else {
                self.set_state(&mut inner, BreakerState::Closed, now, &mut changes);
            }
        }
        tracing::info!(breaker = %self.settings.name, "Circuit breaker reset");
        self.notify(changes);
    }

    fn before_request(&self) -> Result<u64, Rejection> {
        let mut changes = Vec::new();
        let res = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            self.current_state(&mut inner, now, &mut changes);

            match inner.state {
                BreakerState::Open => Err(Rejection::Open(self.settings.name.clone())),
                BreakerState::HalfOpen
                    if inner.counts.requests >= self.settings.max_half_open_requests =>
                {
                    Err(Rejection::HalfOpenFull(self.settings.name.clone()))
                }
                _ => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            }
        };
        self.notify(changes);

        if let Err(ref rejection) = res {
            let reason = match rejection {
                Rejection::Open(_) => "open",
                Rejection::HalfOpenFull(_) => "half_open_full",
            };
            metrics::record_breaker_rejection(&self.settings.name, reason);
        }
        res
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            self.current_state(&mut inner, now, &mut changes);
            if inner.generation != before {
                tracing::trace!(
                    breaker = %self.settings.name,
                    entered = before,
                    current = inner.generation,
                    "Discarding outcome from stale generation"
                );
            } else if success {
                self.on_success(&mut inner, now, &mut changes);
            } else {
                self.on_failure(&mut inner, now, &mut changes);
            }
        }
        self.notify(changes);
    }

    fn on_success(&self, inner: &mut Inner, now: Instant, changes: &mut Vec<StateChange>) {
        match inner.state {
            BreakerState::Closed => inner.counts.on_success(),
            BreakerState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.settings.max_half_open_requests {
                    self.set_state(inner, BreakerState::Closed, now, changes);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut Inner, now: Instant, changes: &mut Vec<StateChange>) {
        match inner.state {
            BreakerState::Closed => {
                inner.counts.on_failure();
                if (self.settings.trip)(&inner.counts) {
                    self.set_state(inner, BreakerState::Open, now, changes);
                }
            }
            BreakerState::HalfOpen => self.set_state(inner, BreakerState::Open, now, changes),
            BreakerState::Open => {}
        }
    }

    fn current_state(&self, inner: &mut Inner, now: Instant, changes: &mut Vec<StateChange>) {
        match (inner.state, inner.expiry) {
            (BreakerState::Closed, Some(expiry)) if expiry <= now => {
                self.new_generation(inner, now);
            }
            (BreakerState::Open, Some(expiry)) if expiry <= now => {
                self.set_state(inner, BreakerState::HalfOpen, now, changes);
            }
            _ => {}
        }
    }

    fn set_state(
        &self,
        inner: &mut Inner,
        to: BreakerState,
        now: Instant,
        changes: &mut Vec<StateChange>,
    ) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        self.new_generation(inner, now);
        changes.push(StateChange {
            name: self.settings.name.clone(),
            from,
            to,
        });
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts.clear();
        inner.expiry = match inner.state {
            BreakerState::Closed => closed_expiry(&self.settings, now),
            BreakerState::Open => Some(now + self.settings.open_timeout),
            BreakerState::HalfOpen => None,
        };
    }

    /// Runs outside the lock so hooks may call back into the breaker.
    fn notify(&self, changes: Vec<StateChange>) {
        for change in changes {
            tracing::warn!(
                breaker = %change.name,
                from = %change.from,
                to = %change.to,
                "Circuit breaker state changed"
            );
            metrics::record_breaker_transition(&change.name, change.from, change.to);
            if let Some(hook) = &self.settings.on_state_change {
                hook(&change);
            }
        }
    }
}

fn closed_expiry(settings: &BreakerSettings, now: Instant) -> Option<Instant> {
    if settings.interval.is_zero() {
        None
    } else {
        Some(now + settings.interval)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.settings.name)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .finish()
    }
}

/// Admission granted by a breaker. Settle it with [`Ticket::success`],
/// [`Ticket::failure`] or [`Ticket::record`]; dropping it unsettled records
/// a failure, which also covers panics unwinding through the caller.
#[must_use = "an unsettled ticket records a failure when dropped"]
pub struct Ticket<B = Arc<CircuitBreaker>>
where
    B: Deref<Target = CircuitBreaker>,
{
    breaker: B,
    generation: u64,
    settled: bool,
}

impl<B: Deref<Target = CircuitBreaker>> Ticket<B> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn record(mut self, success: bool) {
        self.settled = true;
        self.breaker.after_request(self.generation, success);
    }

    pub fn success(self) {
        self.record(true)
    }

    pub fn failure(self) {
        self.record(false)
    }
}

impl<B: Deref<Target = CircuitBreaker>> Drop for Ticket<B> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.after_request(self.generation, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(settings: BreakerSettings) -> (Arc<CircuitBreaker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cb = Arc::new(CircuitBreaker::with_clock(settings, clock.clone()));
        (cb, clock)
    }

    fn fail(cb: &CircuitBreaker) {
        let _ = cb.call(|| Err::<(), _>("boom"));
    }

    fn succeed(cb: &CircuitBreaker) {
        let _ = cb.call(|| Ok::<_, &str>(()));
    }

    fn rate_settings() -> BreakerSettings {
        BreakerSettings::new("api:GET:/users")
            .trip(trip::failure_rate(10, 0.5))
            .open_timeout(Duration::from_secs(30))
            .max_half_open_requests(3)
    }

    #[test]
    fn test_trips_on_fifth_failure_of_ten() {
        let (cb, _) = breaker(rate_settings());
        for _ in 0..5 {
            succeed(&cb);
        }
        for i in 0..5 {
            assert_eq!(cb.state(), BreakerState::Closed, "still closed before failure {}", i + 1);
            fail(&cb);
        }
        assert_eq!(cb.state(), BreakerState::Open);

        let invoked = AtomicUsize::new(0);
        let res = cb.call(|| {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        });
        assert!(matches!(res, Err(CallError::Rejected(Rejection::Open(_)))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_open_until_timeout_then_probe() {
        let (cb, clock) = breaker(
            BreakerSettings::new("db")
                .trip(trip::consecutive_failures(1))
                .open_timeout(Duration::from_secs(10)),
        );
        fail(&cb);
        assert_eq!(cb.state(), BreakerState::Open);

        clock.advance(Duration::from_millis(9_999));
        assert!(cb.call(|| Ok::<_, &str>(())).unwrap_err().is_rejected());

        clock.advance(Duration::from_millis(1));
        let invoked = AtomicUsize::new(0);
        let res = cb.call(|| {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(7)
        });
        assert_eq!(res.unwrap(), 7);
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        // max_half_open_requests defaults to one probe, so the success closes it
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_closes_after_consecutive_successes() {
        let (cb, clock) = breaker(rate_settings().trip(trip::consecutive_failures(1)));
        fail(&cb);
        clock.advance(Duration::from_secs(30));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        succeed(&cb);
        succeed(&cb);
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        succeed(&cb);
        assert_eq!(cb.state(), BreakerState::Closed);

        let stats = cb.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.consecutive_successes, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_and_restarts_timeout() {
        let (cb, clock) = breaker(rate_settings().trip(trip::consecutive_failures(1)));
        fail(&cb);
        clock.advance(Duration::from_secs(30));
        succeed(&cb);
        fail(&cb);
        assert_eq!(cb.state(), BreakerState::Open);

        let stats = cb.stats();
        assert_eq!(stats.retry_after_ms, Some(30_000));

        clock.advance(Duration::from_secs(29));
        assert_eq!(cb.state(), BreakerState::Open);
        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_capacity() {
        let (cb, clock) = breaker(rate_settings().trip(trip::consecutive_failures(1)));
        fail(&cb);
        clock.advance(Duration::from_secs(30));

        let probes: Vec<_> = (0..3).map(|_| cb.acquire().unwrap()).collect();
        match cb.acquire() {
            Err(Rejection::HalfOpenFull(name)) => assert_eq!(name, "api:GET:/users"),
            _ => panic!("expected half-open capacity rejection"),
        }
        for p in probes {
            p.success();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_closed_window_rolls_over() {
        let (cb, clock) = breaker(
            BreakerSettings::new("cache")
                .interval(Duration::from_secs(60))
                .trip(trip::total_failures(1, 3)),
        );
        fail(&cb);
        fail(&cb);
        clock.advance(Duration::from_secs(61));
        let gen_before = cb.stats().generation;
        fail(&cb);
        let stats = cb.stats();
        assert_eq!(stats.state, BreakerState::Closed);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.generation, gen_before);
    }

    #[test]
    fn test_stale_outcome_discarded_after_reset() {
        let (cb, _) = breaker(rate_settings().trip(trip::consecutive_failures(1)));
        let ticket = cb.acquire().unwrap();
        let entered = ticket.generation();
        cb.reset();
        ticket.failure();

        let stats = cb.stats();
        assert_eq!(stats.state, BreakerState::Closed);
        assert_eq!(stats.failed_requests, 0);
        assert!(stats.generation > entered);
    }

    #[test]
    fn test_reset_twice_equals_once() {
        let (cb, _) = breaker(rate_settings().trip(trip::consecutive_failures(1)));
        fail(&cb);
        assert_eq!(cb.state(), BreakerState::Open);

        cb.reset();
        let once = cb.stats();
        cb.reset();
        let twice = cb.stats();
        assert_eq!(once.state, BreakerState::Closed);
        assert_eq!(twice.state, once.state);
        assert_eq!(twice.total_requests, once.total_requests);
        assert_eq!(twice.failed_requests, once.failed_requests);
        assert_eq!(twice.retry_after_ms, None);
    }

    #[test]
    fn test_panic_is_recorded_as_failure() {
        let (cb, _) = breaker(rate_settings().trip(trip::consecutive_failures(1)));
        let cb2 = cb.clone();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _ = cb2.call(|| -> Result<(), &str> { panic!("handler exploded") });
        }));
        assert!(res.is_err());
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_classified_failure() {
        let (cb, _) = breaker(rate_settings().trip(trip::consecutive_failures(2)));
        for _ in 0..2 {
            let res = cb.call_classified(|| Ok::<u16, ()>(503), |r| matches!(r, Ok(s) if *s >= 500));
            assert_eq!(res.unwrap(), 503);
        }
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_state_change_hook_sees_transitions() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (cb, clock) = breaker(
            rate_settings()
                .trip(trip::consecutive_failures(1))
                .max_half_open_requests(1)
                .on_state_change(Arc::new(move |c: &StateChange| sink.lock().push((c.from, c.to)))),
        );
        fail(&cb);
        clock.advance(Duration::from_secs(30));
        succeed(&cb);

        assert_eq!(
            *seen.lock(),
            vec![
                (BreakerState::Closed, BreakerState::Open),
                (BreakerState::Open, BreakerState::HalfOpen),
                (BreakerState::HalfOpen, BreakerState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_call_async_passes_error_through() {
        let (cb, _) = breaker(rate_settings());
        let res: Result<(), CallError<String>> = cb.call_async(async { Err("down".to_string()) }).await;
        match res {
            Err(CallError::Inner(e)) => assert_eq!(e, "down"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cb.stats().failed_requests, 1);
    }
}
