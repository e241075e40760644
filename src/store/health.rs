//! Counter store health checking.
//!
//! # Responsibilities
//! - Periodically ping the store
//! - Flip the shared degradation latch so outages are logged once and
//!   recovery is noticed even when no request hits a distributed limiter

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use crate::store::{CounterStore, DegradationLatch};

pub struct StoreHealthMonitor {
    store: Arc<dyn CounterStore>,
    latch: Arc<DegradationLatch>,
    interval: Duration,
}

impl StoreHealthMonitor {
    pub fn new(store: Arc<dyn CounterStore>, latch: Arc<DegradationLatch>, interval: Duration) -> Self {
        Self { store, latch, interval }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            backend = self.store.backend(),
            interval = ?self.interval,
            "Counter store health monitor starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Counter store health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One probe. Returns whether the store answered.
    pub async fn check_once(&self) -> bool {
        // A hung store must not stall the loop past its own interval.
        match time::timeout(self.interval, self.store.ping()).await {
            Ok(Ok(())) => {
                self.latch.on_success();
                true
            }
            Ok(Err(e)) => {
                self.latch.on_failure(&e);
                false
            }
            Err(_) => {
                self.latch.on_failure(&crate::store::StoreError::Unavailable("ping timed out".into()));
                false
            }
        }
    }
}
