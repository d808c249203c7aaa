pub mod completion;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod handler;
pub mod ingest;
pub mod metrics;
pub mod relay;
pub mod retry;
pub mod source;
pub mod sweeper;

pub use completion::{Completion, CompletionClient, OpenAiClient};
pub use config::RelayConfig;
pub use dispatch::Dispatcher;
pub use error::ClientError;
pub use executor::WorkExecutor;
pub use handler::{ChatHandler, Command, HandlerError, WorkHandler};
pub use ingest::Ingestor;
pub use metrics::RelayMetrics;
pub use relay::Relay;
pub use retry::{RetryError, RetryPolicy, Retryable};
pub use source::{MessageSource, TelegramClient};
pub use sweeper::LeaseSweeper;
