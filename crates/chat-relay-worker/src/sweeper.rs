use crate::metrics::RelayMetrics;
use crate::retry::RetryPolicy;
use chat_relay_persistence::WorkQueueStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Returns items whose lease has expired to the pending set.
///
/// This is the only path by which a processing item is retried.
pub struct LeaseSweeper {
    queue: Arc<WorkQueueStore>,
    metrics: Arc<RelayMetrics>,
    interval: Duration,
    lease_timeout: Duration,
    store_retry: RetryPolicy,
}

impl LeaseSweeper {
    pub fn new(
        queue: Arc<WorkQueueStore>,
        metrics: Arc<RelayMetrics>,
        interval: Duration,
        lease_timeout: Duration,
        store_retry: RetryPolicy,
    ) -> Self {
        LeaseSweeper {
            queue,
            metrics,
            interval,
            lease_timeout,
            store_retry,
        }
    }

    /// One sweep. Returns the number of reclaimed items.
    pub async fn tick(&self) -> usize {
        let reclaimed = match self
            .store_retry
            .retry("reset_stuck", || async { self.queue.reset_stuck(self.lease_timeout) })
            .await
        {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                if e.is_exhausted() {
                    self.metrics.inc_exhausted("reset_stuck");
                }
                error!(error = %e, "Lease sweep failed");
                0
            }
        };

        if reclaimed > 0 {
            self.metrics.items_reclaimed.inc_by(reclaimed as u64);
            info!(reclaimed, lease_timeout = ?self.lease_timeout, "Reclaimed expired leases");
        }

        match self.queue.stats() {
            Ok(stats) => {
                self.metrics.update_queue_depth(&stats);
                debug!(
                    pending = stats.pending,
                    processing = stats.processing,
                    processed = stats.processed,
                    error = stats.error,
                    "Queue depth"
                );
            }
            Err(e) => error!(error = %e, "Failed to read queue stats"),
        }

        reclaimed
    }

    /// Sweep on a fixed interval. The first sweep runs immediately, which
    /// recovers items left behind by a previous crash.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, lease_timeout = ?self.lease_timeout, "Lease sweeper started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Lease sweeper stopped");
    }
}
