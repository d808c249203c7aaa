use crate::completion::CompletionClient;
use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::executor::WorkExecutor;
use crate::handler::{ChatHandler, WorkHandler};
use crate::ingest::Ingestor;
use crate::metrics::RelayMetrics;
use crate::retry::RetryPolicy;
use crate::source::MessageSource;
use crate::sweeper::LeaseSweeper;
use chat_relay_persistence::{Storage, WorkQueueStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The three long-running loops, sharing nothing but the queue
pub struct Relay {
    ingestor: Ingestor,
    dispatcher: Dispatcher,
    sweeper: LeaseSweeper,
}

impl Relay {
    /// Wire the relay with the chat handler
    pub fn new(
        config: &RelayConfig,
        storage: &Storage,
        source: Arc<dyn MessageSource>,
        completion: Arc<dyn CompletionClient>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let handler = ChatHandler::new(config, source.clone(), completion, storage.context.clone());
        Self::with_handler(config, storage.queue.clone(), source, Arc::new(handler), metrics)
    }

    /// Wire the relay around an arbitrary work handler
    pub fn with_handler(
        config: &RelayConfig,
        queue: Arc<WorkQueueStore>,
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn WorkHandler>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let retry = &config.retry;
        let store_retry = RetryPolicy::from_config(retry, retry.store_attempts);
        let source_retry = RetryPolicy::from_config(retry, retry.source_attempts);

        let ingestor = Ingestor::new(
            source,
            queue.clone(),
            metrics.clone(),
            config.source.poll_timeout_secs,
            config.source.poll_interval(),
            source_retry,
            store_retry,
        );

        let executor = Arc::new(WorkExecutor::new(handler, config.dispatch.handler_timeout()));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            executor,
            metrics.clone(),
            config.dispatch.concurrency,
            config.dispatch.idle_sleep(),
            config.dispatch.graceful_shutdown_timeout(),
            store_retry,
        );

        let sweeper = LeaseSweeper::new(
            queue,
            metrics,
            config.sweeper.interval(),
            config.sweeper.lease_timeout(),
            store_retry,
        );

        Relay {
            ingestor,
            dispatcher,
            sweeper,
        }
    }

    /// Run until `shutdown` is cancelled, then let in-flight items drain
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Relay starting");

        tokio::join!(
            self.ingestor.run(shutdown.clone()),
            self.dispatcher.run(shutdown.clone()),
            self.sweeper.run(shutdown.clone()),
        );

        info!("Relay stopped");
    }
}
