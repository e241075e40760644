//! In-flight request cap.
//!
//! A slot is taken with `try_acquire`, never awaited: when the server is
//! full the request is refused at once instead of queueing behind others.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ResilienceError;
use crate::http::response::rejection_response;
use crate::http::server::ResilienceState;
use crate::observability::metrics;

#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencyGate {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    pub fn try_enter(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn in_flight(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

pub async fn concurrency_middleware(
    State(state): State<ResilienceState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.concurrency.enabled {
        return next.run(request).await;
    }

    let Some(permit) = state.gate.try_enter() else {
        tracing::warn!(
            max_in_flight = state.gate.max(),
            path = %request.uri().path(),
            "Concurrency limit reached, rejecting request"
        );
        return rejection_response(
            &ResilienceError::ConcurrencyLimitReached(state.gate.max()),
            Some(Duration::from_secs(1)),
        );
    };
    metrics::record_in_flight(state.gate.in_flight());

    let response = next.run(request).await;

    // released with the response even if abandoned work is still running
    drop(permit);
    metrics::record_in_flight(state.gate.in_flight());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_counts_permits() {
        let gate = ConcurrencyGate::new(2);
        let a = gate.try_enter().unwrap();
        let _b = gate.try_enter().unwrap();
        assert_eq!(gate.in_flight(), 2);
        assert!(gate.try_enter().is_none());
        drop(a);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_enter().is_some());
    }
}
