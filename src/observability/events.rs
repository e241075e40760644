//! Asynchronous resilience event sink.
//!
//! Breakers, limiters and the store latch publish events without waiting:
//! `publish` is a `try_send` on a bounded channel, and a full channel drops
//! the event (counted in `resilience_events_dropped_total`). A drain task
//! turns each event into a structured log record under the
//! `resilience::events` target.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::limiter::Strategy;
use crate::observability::metrics;
use crate::resilience::circuit_breaker::BreakerState;
use crate::store::FailurePolicy;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    BreakerTransition {
        breaker: String,
        from: BreakerState,
        to: BreakerState,
    },
    BreakerReset {
        breaker: String,
    },
    AdmissionDenied {
        key: String,
        key_type: &'static str,
        strategy: Strategy,
    },
    StoreDegraded {
        error: String,
        policy: FailurePolicy,
    },
    StoreRecovered,
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ResilienceEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (EventSink, EventDrain) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EventSink { tx }, EventDrain { rx })
    }

    /// Never blocks. Drops the event when the drain is behind or gone.
    pub fn publish(&self, event: ResilienceEvent) {
        if self.tx.try_send(event).is_err() {
            metrics::record_event_dropped();
        }
    }
}

pub struct EventDrain {
    rx: mpsc::Receiver<ResilienceEvent>,
}

impl EventDrain {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => emit(&event),
                    None => break,
                },
                _ = shutdown.recv() => {
                    // flush what is already queued
                    while let Ok(event) = self.rx.try_recv() {
                        emit(&event);
                    }
                    break;
                }
            }
        }
        tracing::debug!("Resilience event drain stopped");
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<ResilienceEvent> {
        self.rx.try_recv().ok()
    }
}

fn emit(event: &ResilienceEvent) {
    let payload = serde_json::to_string(event).unwrap_or_default();
    match event {
        ResilienceEvent::BreakerTransition { breaker, from, to } => {
            tracing::info!(target: "resilience::events", %breaker, %from, %to, payload, "breaker_transition");
        }
        ResilienceEvent::BreakerReset { breaker } => {
            tracing::info!(target: "resilience::events", %breaker, payload, "breaker_reset");
        }
        ResilienceEvent::AdmissionDenied { key, key_type, strategy } => {
            tracing::info!(target: "resilience::events", %key, key_type, %strategy, payload, "admission_denied");
        }
        ResilienceEvent::StoreDegraded { error, policy } => {
            tracing::info!(target: "resilience::events", %error, policy = policy.as_str(), payload, "store_degraded");
        }
        ResilienceEvent::StoreRecovered => {
            tracing::info!(target: "resilience::events", payload, "store_recovered");
        }
    }
}
