use crate::handler::{HandlerError, WorkHandler};
use chat_relay_core::WorkItem;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error};

/// Runs the handler for one item with a deadline and panic recovery
pub struct WorkExecutor {
    handler: Arc<dyn WorkHandler>,
    timeout: Duration,
}

impl WorkExecutor {
    pub fn new(handler: Arc<dyn WorkHandler>, timeout: Duration) -> Self {
        WorkExecutor { handler, timeout }
    }

    /// Execute the handler on its own task. A timeout, or dropping this
    /// future, aborts that task; a panic is reported as an error instead of
    /// unwinding into the caller.
    pub async fn execute(&self, item: WorkItem) -> Result<(), HandlerError> {
        let item_id = item.id;
        let handler = self.handler.clone();

        debug!(item_id, timeout = ?self.timeout, "Executing work item");

        let mut task = AbortOnDropHandle::new(tokio::spawn(async move { handler.handle(&item).await }));

        match timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => {
                error!(item_id, "Handler panicked");
                Err(HandlerError::Panicked)
            }
            Ok(Err(_)) => Err(HandlerError::Cancelled),
            Err(_) => {
                error!(item_id, timeout = ?self.timeout, "Handler timed out");
                Err(HandlerError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SleepHandler(Duration);

    #[async_trait]
    impl WorkHandler for SleepHandler {
        async fn handle(&self, _item: &WorkItem) -> Result<(), HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl WorkHandler for PanicHandler {
        async fn handle(&self, item: &WorkItem) -> Result<(), HandlerError> {
            panic!("boom on item {}", item.id);
        }
    }

    fn item() -> WorkItem {
        WorkItem::new(1, 1, 1, b"{}".to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_executor_success() {
        let executor = WorkExecutor::new(Arc::new(SleepHandler(Duration::from_millis(1))), Duration::from_secs(5));
        assert!(executor.execute(item()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_timeout() {
        let executor = WorkExecutor::new(Arc::new(SleepHandler(Duration::from_secs(60))), Duration::from_secs(1));

        let result = executor.execute(item()).await;
        assert!(matches!(result, Err(HandlerError::Timeout(d)) if d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_executor_recovers_from_panic() {
        let executor = WorkExecutor::new(Arc::new(PanicHandler), Duration::from_secs(5));

        let result = executor.execute(item()).await;
        assert!(matches!(result, Err(HandlerError::Panicked)));
    }
}
