//! Deadline enforcement.
//!
//! # Responsibilities
//! - Attach a deadline to a request
//! - Run the guarded work on its own task and stop waiting at the deadline
//! - Keep observing late work so its completion is still logged
//!
//! # Design Decisions
//! - Uses Tokio's timer; the deadline is an absolute instant so nested
//!   layers agree on when time is up
//! - Late work is not cancelled, only abandoned by the caller
//! - Timed-out requests return 504 Gateway Timeout

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::observability::metrics;

/// Absolute deadline carried in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at: Instant,
    pub budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BoundedError {
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("guarded task panicked")]
    Panicked,
    #[error("guarded task was cancelled")]
    Aborted,
}

/// Spawn `fut` and wait for it until `deadline`.
///
/// On expiry the task keeps running in the background and a watcher logs
/// its eventual completion under `label`.
pub async fn run_until<F>(fut: F, deadline: Deadline, label: String) -> Result<F::Output, BoundedError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let mut handle = tokio::spawn(fut);

    match tokio::time::timeout_at(deadline.at, &mut handle).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) if e.is_panic() => {
            tracing::error!(task = %label, "Guarded task panicked");
            Err(BoundedError::Panicked)
        }
        Ok(Err(_)) => Err(BoundedError::Aborted),
        Err(_) => {
            metrics::record_timeout();
            tracing::warn!(task = %label, budget = ?deadline.budget, "Deadline exceeded");
            let started_late = Instant::now();
            tokio::spawn(async move {
                match handle.await {
                    Ok(_) => tracing::debug!(
                        task = %label,
                        overrun = ?started_late.elapsed(),
                        "Abandoned task completed after deadline"
                    ),
                    Err(e) if e.is_panic() => {
                        tracing::warn!(task = %label, "Abandoned task panicked after deadline")
                    }
                    Err(_) => {}
                }
            });
            Err(BoundedError::DeadlineExceeded(deadline.budget))
        }
    }
}
