use crate::metrics::RelayMetrics;
use crate::retry::{RetryError, RetryPolicy};
use crate::source::MessageSource;
use chat_relay_core::Update;
use chat_relay_persistence::{PersistenceError, WorkQueueStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Long-polls the message source and enqueues every update it returns.
///
/// The resume cursor is always read back from the queue, so a restart picks
/// up after the last update that was durably enqueued.
pub struct Ingestor {
    source: Arc<dyn MessageSource>,
    queue: Arc<WorkQueueStore>,
    metrics: Arc<RelayMetrics>,
    poll_timeout_secs: u64,
    poll_interval: Duration,
    source_retry: RetryPolicy,
    store_retry: RetryPolicy,
}

impl Ingestor {
    pub fn new(
        source: Arc<dyn MessageSource>,
        queue: Arc<WorkQueueStore>,
        metrics: Arc<RelayMetrics>,
        poll_timeout_secs: u64,
        poll_interval: Duration,
        source_retry: RetryPolicy,
        store_retry: RetryPolicy,
    ) -> Self {
        Ingestor {
            source,
            queue,
            metrics,
            poll_timeout_secs,
            poll_interval,
            source_retry,
            store_retry,
        }
    }

    /// One poll cycle. Returns the number of newly enqueued items.
    pub async fn poll_once(&self) -> usize {
        let cursor = match self
            .store_retry
            .retry("max_source_seq", || async { self.queue.max_source_seq() })
            .await
        {
            Ok(cursor) => cursor,
            Err(e) => {
                self.record_failure("max_source_seq", &e);
                error!(error = %e, "Could not read resume cursor, skipping poll");
                return 0;
            }
        };

        let updates = match self
            .source_retry
            .retry("fetch_updates", || {
                self.source.fetch_updates(cursor, self.poll_timeout_secs)
            })
            .await
        {
            Ok(updates) => updates,
            Err(e) => {
                self.record_failure("fetch_updates", &e);
                error!(cursor, error = %e, "Polling the message source failed");
                return 0;
            }
        };

        let mut enqueued = 0;
        for update in updates {
            if self.enqueue(&update).await {
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            info!(enqueued, cursor, "Ingested updates");
        }
        enqueued
    }

    async fn enqueue(&self, update: &Update) -> bool {
        let source_seq = update.update_id;
        let chat_id = update.chat_id();

        let payload = match update.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(source_seq, error = %e, "Could not encode update");
                return false;
            }
        };

        let result = self
            .store_retry
            .retry("enqueue", || async {
                self.queue.enqueue(source_seq, chat_id, payload.clone())
            })
            .await;

        match result {
            Ok(item_id) => {
                self.metrics.updates_ingested.inc();
                debug!(item_id, source_seq, chat_id, "Update enqueued");
                true
            }
            Err(RetryError::Permanent(PersistenceError::DuplicateSourceSeq(_))) => {
                self.metrics.updates_duplicate.inc();
                debug!(source_seq, "Update already enqueued");
                false
            }
            Err(e) => {
                self.record_failure("enqueue", &e);
                error!(source_seq, chat_id, error = %e, "Failed to enqueue update");
                false
            }
        }
    }

    fn record_failure<E: std::fmt::Display>(&self, op: &str, error: &RetryError<E>) {
        if error.is_exhausted() {
            self.metrics.inc_exhausted(op);
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(poll_timeout_secs = self.poll_timeout_secs, "Ingestion loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.poll_once() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Ingestion loop stopped");
    }
}
