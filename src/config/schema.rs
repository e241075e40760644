//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the control
//! plane. All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limiter::Strategy;
use crate::resilience::circuit_breaker::BreakerSettings;
use crate::resilience::trip::{self, TripPredicate};
use crate::store::FailurePolicy;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Listener configuration (bind address, client IP source).
    pub listener: ListenerConfig,

    /// In-flight request cap.
    pub concurrency: ConcurrencyConfig,

    /// Per-request deadline.
    pub timeouts: TimeoutConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker configuration.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Shared counter store for the distributed limiters.
    pub store: StoreConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Take the client IP from the first `X-Forwarded-For` entry.
    /// Only safe behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            trust_forwarded_for: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub enabled: bool,

    /// Requests allowed in flight at once; the rest get 503 immediately.
    pub max_in_flight: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_in_flight: 1000,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub enabled: bool,

    /// Total time budget per request in milliseconds.
    pub request_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

/// Which request attributes become limiter keys.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyRulesConfig {
    pub ip: bool,
    pub user: bool,
    pub api: bool,
}

impl Default for KeyRulesConfig {
    fn default() -> Self {
        Self {
            ip: true,
            user: false,
            api: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    /// Tokens added per second.
    pub rate: f64,

    /// Bucket capacity.
    pub burst: u32,

    /// Buckets untouched this long are dropped. 0 disables the sweeper.
    pub idle_eviction_secs: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            rate: 100.0,
            burst: 200,
            idle_eviction_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowConfig {
    pub window_ms: u64,
    pub limit: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            limit: 1000,
        }
    }
}

impl WindowConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Strategy applied to every derived key.
    pub strategy: Strategy,

    pub keys: KeyRulesConfig,

    /// Header whose value becomes an extra `custom:` key.
    pub custom_key_header: Option<String>,

    /// Header carrying an authenticated user id when no upstream layer
    /// inserted one.
    pub user_header: String,

    /// Paths (exact or trailing `*` prefix) that bypass limiting.
    pub skip_paths: Vec<String>,

    /// Distributed strategy decision while the store is unreachable.
    pub failure_policy: FailurePolicy,

    /// Poll for up to this long before rejecting. 0 rejects immediately.
    pub max_wait_ms: u64,

    /// Emit `X-RateLimit-Remaining` / `X-RateLimit-Limit`.
    pub quota_headers: bool,

    pub token_bucket: TokenBucketConfig,
    pub sliding_window: WindowConfig,
    pub fixed_window: WindowConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: Strategy::Sliding,
            keys: KeyRulesConfig::default(),
            custom_key_header: None,
            user_header: "x-user-id".to_string(),
            skip_paths: default_skip_paths(),
            failure_policy: FailurePolicy::Open,
            max_wait_ms: 0,
            quota_headers: true,
            token_bucket: TokenBucketConfig::default(),
            sliding_window: WindowConfig::default(),
            fixed_window: WindowConfig::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

fn default_skip_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

/// When a breaker trips.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripPolicy {
    /// Failure ratio over at least `min_requests` in the current window.
    FailureRate { min_requests: u32, ratio: f64 },
    ConsecutiveFailures { threshold: u32 },
    TotalFailures { min_requests: u32, failures: u32 },
}

impl Default for TripPolicy {
    fn default() -> Self {
        TripPolicy::FailureRate {
            min_requests: 10,
            ratio: 0.5,
        }
    }
}

impl TripPolicy {
    pub fn predicate(&self) -> TripPredicate {
        match *self {
            TripPolicy::FailureRate { min_requests, ratio } => trip::failure_rate(min_requests, ratio),
            TripPolicy::ConsecutiveFailures { threshold } => trip::consecutive_failures(threshold),
            TripPolicy::TotalFailures { min_requests, failures } => trip::total_failures(min_requests, failures),
        }
    }
}

/// Per-breaker settings. Overrides fall back to the section defaults for
/// any field left out.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerOverride {
    pub max_half_open_requests: Option<u32>,
    pub interval_ms: Option<u64>,
    pub open_timeout_ms: Option<u64>,
    pub trip: Option<TripPolicy>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Breakers are named `{name_prefix}:{METHOD}:{path}`.
    pub name_prefix: String,

    pub max_half_open_requests: u32,

    /// Closed-state counting window. 0 never clears counts while closed.
    pub interval_ms: u64,

    /// Time spent open before probing.
    pub open_timeout_ms: u64,

    pub trip: TripPolicy,

    pub skip_paths: Vec<String>,

    /// Keyed by full breaker name.
    pub overrides: BTreeMap<String, BreakerOverride>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name_prefix: "api".to_string(),
            max_half_open_requests: 10,
            interval_ms: 60_000,
            open_timeout_ms: 120_000,
            trip: TripPolicy::default(),
            skip_paths: default_skip_paths(),
            overrides: BTreeMap::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Settings for the breaker named `name`, section defaults overlaid with
    /// any override registered under that name.
    pub fn settings_for(&self, name: &str) -> BreakerSettings {
        let o = self.overrides.get(name).cloned().unwrap_or_default();
        let trip = o.trip.as_ref().unwrap_or(&self.trip).predicate();
        BreakerSettings::new(name)
            .max_half_open_requests(o.max_half_open_requests.unwrap_or(self.max_half_open_requests))
            .interval(Duration::from_millis(o.interval_ms.unwrap_or(self.interval_ms)))
            .open_timeout(Duration::from_millis(o.open_timeout_ms.unwrap_or(self.open_timeout_ms)))
            .trip(trip)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,

    /// Redis connection URL, required when `kind = "redis"`.
    pub url: Option<String>,

    pub health_check_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            url: None,
            health_check_interval_ms: 5_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    pub log_level: String,

    /// "pretty" or "json".
    pub log_format: String,

    pub metrics_enabled: bool,

    /// Prometheus scrape listener.
    pub metrics_address: String,

    /// Capacity of the resilience event channel.
    pub event_buffer: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,

    /// Bearer key required on every admin request.
    pub api_key: String,
}
