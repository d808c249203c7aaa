use crate::executor::WorkExecutor;
use crate::metrics::RelayMetrics;
use crate::retry::{RetryError, RetryPolicy};
use chat_relay_core::{WorkItem, WorkStatus};
use chat_relay_persistence::{PersistenceError, WorkQueueStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Claims eligible items and runs them on a bounded pool of worker tasks.
///
/// A slot is taken before claiming, so when every slot is busy the loop
/// stops claiming and items wait in the queue rather than in memory.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<WorkQueueStore>,
    executor: Arc<WorkExecutor>,
    metrics: Arc<RelayMetrics>,
    concurrency: usize,
    idle_sleep: Duration,
    drain_timeout: Duration,
    store_retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<WorkQueueStore>,
        executor: Arc<WorkExecutor>,
        metrics: Arc<RelayMetrics>,
        concurrency: usize,
        idle_sleep: Duration,
        drain_timeout: Duration,
        store_retry: RetryPolicy,
    ) -> Self {
        Dispatcher {
            queue,
            executor,
            metrics,
            concurrency: concurrency.max(1),
            idle_sleep,
            drain_timeout,
            store_retry,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(concurrency = self.concurrency, "Dispatch loop started");

        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();

        loop {
            while let Some(joined) = workers.try_join_next() {
                log_join_error(joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim().await {
                Some(item) => {
                    let dispatcher = self.clone();
                    workers.spawn(async move { dispatcher.process(item, permit).await });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_sleep) => {}
                    }
                }
            }
        }

        self.drain(workers).await;
        info!("Dispatch loop stopped");
    }

    async fn claim(&self) -> Option<WorkItem> {
        match self
            .store_retry
            .retry("claim_next", || async { self.queue.claim_next() })
            .await
        {
            Ok(Some(item)) => {
                self.metrics.items_claimed.inc();
                debug!(
                    item_id = item.id,
                    chat_id = item.chat_id,
                    source_seq = item.source_seq,
                    "Dispatching work item"
                );
                Some(item)
            }
            Ok(None) => None,
            Err(e) => {
                if e.is_exhausted() {
                    self.metrics.inc_exhausted("claim_next");
                }
                error!(error = %e, "Failed to claim work item");
                None
            }
        }
    }

    /// Run one claimed item to a terminal status. The slot is held until
    /// the status is written.
    async fn process(&self, item: WorkItem, _permit: OwnedSemaphorePermit) {
        let lease = item.lease();
        let (item_id, chat_id) = (item.id, item.chat_id);

        let started = Instant::now();
        let status = match self.executor.execute(item).await {
            Ok(()) => WorkStatus::Processed,
            Err(e) => {
                warn!(item_id, chat_id, error = %e, "Work item failed");
                WorkStatus::Error
            }
        };
        self.metrics
            .handler_duration
            .observe(started.elapsed().as_secs_f64());

        let result = self
            .store_retry
            .retry("finish", || async { self.queue.finish(lease, status) })
            .await;

        match result {
            Ok(_) => {
                self.metrics.inc_finished(status);
                info!(item_id, chat_id, status = %status, "Work item finished");
            }
            Err(RetryError::Permanent(PersistenceError::StaleLease { epoch, .. })) => {
                warn!(
                    item_id,
                    chat_id,
                    epoch,
                    "Lease expired before the item finished; it will be redelivered"
                );
            }
            Err(e) => {
                if e.is_exhausted() {
                    self.metrics.inc_exhausted("finish");
                }
                error!(item_id, chat_id, error = %e, "Failed to record work item status");
            }
        }
    }

    /// Wait for in-flight items, up to the drain timeout. Anything still
    /// running after that stays processing until the sweeper reclaims it.
    async fn drain(&self, mut workers: JoinSet<()>) {
        if workers.is_empty() {
            return;
        }

        info!(in_flight = workers.len(), "Waiting for in-flight work items");

        let deadline = tokio::time::sleep(self.drain_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(joined) => log_join_error(joined),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(remaining = workers.len(), "Drain timed out, abandoning in-flight items");
                    workers.abort_all();
                    break;
                }
            }
        }
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Worker task failed");
    }
}
