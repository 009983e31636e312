//! Reconciliation scheduler.
//!
//! Drives one cleanup tick immediately on startup and then every
//! `STACK_SCHEDULER_INTERVAL`, until the shutdown signal fires. A panic
//! inside a tick is contained to that tick; the loop keeps running.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::service::StackService;

/// Periodic driver for [`StackService::cleanup_expired_and_orphaned`].
pub struct ReconcileScheduler {
    interval: Duration,
    service: Arc<StackService>,
}

impl ReconcileScheduler {
    pub fn new(interval: Duration, service: Arc<StackService>) -> Self {
        Self { interval, service }
    }

    /// Run until the shutdown receiver fires. The current tick is allowed to
    /// finish; the next one never starts.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval = ?self.interval, "reconcile scheduler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately on the first tick, which gives us the
        // startup sweep for free.

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("reconcile scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    Self::tick(Arc::clone(&self.service)).await;
                }
            }
        }
    }

    async fn tick(service: Arc<StackService>) {
        let handle = tokio::spawn(async move {
            service.cleanup_expired_and_orphaned().await;
        });

        if let Err(err) = handle.await {
            if err.is_panic() {
                error!("reconcile tick panicked, loop continues");
            }
        }
    }
}
