//! Multi-key admission.
//!
//! Derives the enabled keys for a request and checks them in a fixed order
//! (IP, user, API, custom). A request is admitted only when every key is;
//! the first rejection stops the walk, so later keys are not consumed.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::schema::KeyRulesConfig;
use crate::limiter::{LimiterManager, Strategy};
use crate::observability::events::{EventSink, ResilienceEvent};
use crate::observability::metrics;
use crate::store::FailurePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KeyKind {
    Ip,
    User,
    Api,
    Custom,
}

impl KeyKind {
    /// Value of the `X-RateLimit-Limit-Type` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Ip => "IP",
            KeyKind::User => "User",
            KeyKind::Api => "API",
            KeyKind::Custom => "Custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitKey {
    pub kind: KeyKind,
    pub value: String,
}

impl LimitKey {
    pub fn ip(ip: IpAddr) -> Self {
        Self {
            kind: KeyKind::Ip,
            value: format!("ip:{}", ip),
        }
    }

    pub fn user(id: &str) -> Self {
        Self {
            kind: KeyKind::User,
            value: format!("user:{}", id),
        }
    }

    pub fn api(method: &str, path: &str) -> Self {
        Self {
            kind: KeyKind::Api,
            value: format!("api:{}:{}", method, path),
        }
    }

    pub fn custom(value: impl Into<String>) -> Self {
        Self {
            kind: KeyKind::Custom,
            value: value.into(),
        }
    }
}

/// What the dispatcher knows about a request.
#[derive(Debug, Clone, Default)]
pub struct RequestAttributes {
    pub client_ip: Option<IpAddr>,
    pub user_id: Option<String>,
    pub method: String,
    pub path: String,
    pub custom: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyRules {
    pub ip: bool,
    pub user: bool,
    pub api: bool,
}

impl From<&KeyRulesConfig> for KeyRules {
    fn from(c: &KeyRulesConfig) -> Self {
        Self {
            ip: c.ip,
            user: c.user,
            api: c.api,
        }
    }
}

impl KeyRules {
    /// Enabled keys in check order. Attributes that are absent yield no key;
    /// the custom key is used whenever one was produced.
    pub fn keys(&self, attrs: &RequestAttributes) -> Vec<LimitKey> {
        let mut keys = Vec::with_capacity(4);
        if self.ip {
            if let Some(ip) = attrs.client_ip {
                keys.push(LimitKey::ip(ip));
            }
        }
        if self.user {
            if let Some(user) = attrs.user_id.as_deref().filter(|u| !u.is_empty()) {
                keys.push(LimitKey::user(user));
            }
        }
        if self.api {
            keys.push(LimitKey::api(&attrs.method, &attrs.path));
        }
        if let Some(custom) = attrs.custom.as_deref().filter(|c| !c.is_empty()) {
            keys.push(LimitKey::custom(custom));
        }
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub strategy: Strategy,
    pub limit: u64,
    /// Smallest remaining quota across checked keys, when requested.
    pub remaining: Option<u64>,
    /// Set while decisions come from the failure policy instead of the store.
    pub degraded: Option<FailurePolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied {
    pub key: LimitKey,
    pub strategy: Strategy,
    pub limit: u64,
    pub degraded: Option<FailurePolicy>,
}

#[derive(Debug)]
pub struct LimiterDispatcher {
    manager: Arc<LimiterManager>,
    rules: KeyRules,
    strategy: Strategy,
    max_wait: Duration,
    quota_hints: bool,
    events: Option<EventSink>,
}

impl LimiterDispatcher {
    pub fn new(manager: Arc<LimiterManager>, rules: KeyRules) -> Self {
        let strategy = manager.default_strategy();
        Self {
            manager,
            rules,
            strategy,
            max_wait: Duration::ZERO,
            quota_hints: false,
            events: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Look up remaining quota after admission.
    pub fn with_quota_hints(mut self, enabled: bool) -> Self {
        self.quota_hints = enabled;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn manager(&self) -> &Arc<LimiterManager> {
        &self.manager
    }

    pub fn rules(&self) -> KeyRules {
        self.rules
    }

    fn degraded(&self) -> Option<FailurePolicy> {
        let latch = self.manager.latch();
        (self.strategy.is_distributed() && latch.is_degraded()).then(|| latch.policy())
    }

    pub async fn check(&self, attrs: &RequestAttributes) -> Result<Admitted, Denied> {
        let limiter = self.manager.limiter(self.strategy);
        let keys = self.rules.keys(attrs);
        let mut remaining: Option<u64> = None;

        for key in &keys {
            let verdict = if self.max_wait.is_zero() {
                limiter.allow(&key.value).await
            } else {
                limiter.wait_n(&key.value, 1, self.max_wait).await
            };

            match verdict {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        key = %key.value,
                        key_type = key.kind.as_str(),
                        strategy = %self.strategy,
                        "Rate limit exceeded"
                    );
                    metrics::record_rate_limited(key.kind.as_str());
                    if let Some(events) = &self.events {
                        events.publish(ResilienceEvent::AdmissionDenied {
                            key: key.value.clone(),
                            key_type: key.kind.as_str(),
                            strategy: self.strategy,
                        });
                    }
                    return Err(Denied {
                        key: key.clone(),
                        strategy: self.strategy,
                        limit: limiter.limit(),
                        degraded: self.degraded(),
                    });
                }
                Err(e) => {
                    // only reachable through a bad permit count; never block on it
                    tracing::error!(key = %key.value, error = %e, "Rate limiter error, skipping key");
                    continue;
                }
            }

            if self.quota_hints {
                if let Ok(stats) = limiter.stats(&key.value).await {
                    remaining = Some(remaining.map_or(stats.remaining_quota, |r| r.min(stats.remaining_quota)));
                }
            }
        }

        Ok(Admitted {
            strategy: self.strategy,
            limit: limiter.limit(),
            remaining,
            degraded: self.degraded(),
        })
    }
}
