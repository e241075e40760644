//! Time sources.
//!
//! Breakers and the token bucket read monotonic time; the shared-store
//! strategies need wall-clock time so that every process instance agrees on
//! window boundaries. Both go through [`Clock`] so tests can drive virtual
//! time with [`ManualClock`] instead of sleeping.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// A source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant. Never goes backwards.
    fn now(&self) -> Instant;

    /// Wall-clock time since the Unix epoch.
    fn unix_time(&self) -> Duration;
}

pub type SharedClock = Arc<dyn Clock>;

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_time(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Convenience constructor for the default shared clock.
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    unix_origin: Duration,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Start at the current real time.
    pub fn new() -> Self {
        Self::starting_at(SystemClock.unix_time())
    }

    /// Start at a fixed wall-clock time, handy for window-boundary tests.
    pub fn starting_at(unix_time: Duration) -> Self {
        Self {
            origin: Instant::now(),
            unix_origin: unix_time,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn unix_time(&self) -> Duration {
        self.unix_origin + *self.offset.lock()
    }
}
