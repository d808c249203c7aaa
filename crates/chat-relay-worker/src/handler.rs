use crate::completion::CompletionClient;
use crate::config::RelayConfig;
use crate::error::ClientError;
use crate::retry::{RetryError, RetryPolicy};
use crate::source::MessageSource;
use async_trait::async_trait;
use chat_relay_core::{ChatId, ChatMessage, Message, RelayError, Update, WorkItem};
use chat_relay_persistence::{ContextStore, PersistenceError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const WELCOME_TEXT: &str = "Welcome to the bot!";
const HELP_TEXT: &str = "Here is a list of available commands:\n\
    /start - Start the bot\n\
    /help - Show help message\n\
    /about - Show the current model\n\
    /clear - Forget this conversation";
const CLEARED_TEXT: &str = "Conversation history cleared.";
const UNKNOWN_COMMAND_TEXT: &str =
    "Sorry, I didn't understand that command. Type /help for a list of available commands.";
const EMPTY_MESSAGE_TEXT: &str = "That doesn't look like a valid message to me, try again";

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Undecodable payload: {0}")]
    Payload(#[from] RelayError),

    #[error("Message has no text")]
    EmptyMessage,

    #[error("Client call failed: {0}")]
    Client(#[from] RetryError<ClientError>),

    #[error("Context store failed: {0}")]
    Context(#[from] RetryError<PersistenceError>),

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("Handler panicked")]
    Panicked,

    #[error("Handler was cancelled")]
    Cancelled,
}

/// Business logic run for each claimed work item.
///
/// A re-delivered item runs the handler again, so side effects may repeat.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    About,
    Clear,
    Unknown,
}

impl Command {
    /// `None` unless the text is a slash command. Matching ignores case and
    /// a trailing `@botname`.
    pub fn parse(text: &str) -> Option<Command> {
        let word = text.trim().split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);

        Some(match name.to_ascii_lowercase().as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "about" => Command::About,
            "clear" => Command::Clear,
            _ => Command::Unknown,
        })
    }
}

/// Routes commands and relays plain text to the completion API, keeping
/// per-chat conversation history.
pub struct ChatHandler {
    source: Arc<dyn MessageSource>,
    completion: Arc<dyn CompletionClient>,
    context: Arc<ContextStore>,
    model: String,
    pricing_per_1k_tokens: HashMap<String, f64>,
    source_retry: RetryPolicy,
    completion_retry: RetryPolicy,
    store_retry: RetryPolicy,
}

impl ChatHandler {
    pub fn new(
        config: &RelayConfig,
        source: Arc<dyn MessageSource>,
        completion: Arc<dyn CompletionClient>,
        context: Arc<ContextStore>,
    ) -> Self {
        ChatHandler {
            source,
            completion,
            context,
            model: config.completion.model.clone(),
            pricing_per_1k_tokens: config.completion.pricing_per_1k_tokens.clone(),
            source_retry: RetryPolicy::from_config(&config.retry, config.retry.source_attempts),
            completion_retry: RetryPolicy::from_config(&config.retry, config.retry.completion_attempts),
            store_retry: RetryPolicy::from_config(&config.retry, config.retry.store_attempts),
        }
    }

    async fn reply(&self, chat_id: ChatId, text: &str) -> Result<(), HandlerError> {
        self.source_retry
            .retry("send_reply", || self.source.send_reply(chat_id, text))
            .await?;
        Ok(())
    }

    async fn handle_command(&self, command: Command, chat_id: ChatId) -> Result<(), HandlerError> {
        debug!(chat_id, ?command, "Handling command");

        match command {
            Command::Start => self.reply(chat_id, WELCOME_TEXT).await,
            Command::Help => self.reply(chat_id, HELP_TEXT).await,
            Command::About => {
                let model_id = self
                    .completion_retry
                    .retry("model_id", || self.completion.model_id(&self.model))
                    .await?;
                self.reply(chat_id, &format!("Current GPT model ID: {}", model_id))
                    .await
            }
            Command::Clear => {
                self.store_retry
                    .retry("context_clear", || async { self.context.clear(chat_id) })
                    .await?;
                self.reply(chat_id, CLEARED_TEXT).await
            }
            Command::Unknown => self.reply(chat_id, UNKNOWN_COMMAND_TEXT).await,
        }
    }

    async fn handle_text(&self, chat_id: ChatId, text: &str) -> Result<(), HandlerError> {
        let mut history = self
            .store_retry
            .retry("context_get", || async { self.context.get(chat_id) })
            .await?;
        history.push(ChatMessage::user(text));

        let completion = self
            .completion_retry
            .retry("complete", || self.completion.complete(&self.model, &history))
            .await?;

        self.reply(chat_id, &completion.reply).await?;

        // History only advances once the user has seen the answer
        history.push(ChatMessage::assistant(completion.reply));
        self.store_retry
            .retry("context_put", || async { self.context.put(chat_id, &history) })
            .await?;

        let usage = completion.usage;
        match self.pricing_per_1k_tokens.get(&self.model) {
            Some(price) => info!(
                chat_id,
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                cost_usd = usage.total_tokens as f64 / 1000.0 * price,
                "Completion delivered"
            ),
            None => info!(
                chat_id,
                model = %self.model,
                total_tokens = usage.total_tokens,
                "Completion delivered (no pricing for model)"
            ),
        }

        Ok(())
    }

    async fn handle_message(&self, message: &Message) -> Result<(), HandlerError> {
        let chat_id = message.chat.id;

        let text = match message.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => text,
            _ => {
                warn!(chat_id, message_id = message.message_id, "Message has no text");
                self.reply(chat_id, EMPTY_MESSAGE_TEXT).await?;
                return Err(HandlerError::EmptyMessage);
            }
        };

        match Command::parse(text) {
            Some(command) => self.handle_command(command, chat_id).await,
            None => self.handle_text(chat_id, text).await,
        }
    }
}

#[async_trait]
impl WorkHandler for ChatHandler {
    async fn handle(&self, item: &WorkItem) -> Result<(), HandlerError> {
        let update = Update::from_payload(&item.payload)?;

        match update.message() {
            Some(message) => self.handle_message(message).await,
            None => {
                debug!(item_id = item.id, source_seq = item.source_seq, "Update carries no message");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;
    use chat_relay_core::{Chat, ConversationHistory, SourceSeq, TokenUsage};
    use chat_relay_persistence::{Storage, StorageConfig};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSource {
        sent: Mutex<Vec<(ChatId, String)>>,
    }

    #[async_trait]
    impl MessageSource for RecordingSource {
        async fn fetch_updates(&self, _after: SourceSeq, _timeout_secs: u64) -> Result<Vec<Update>, ClientError> {
            Ok(Vec::new())
        }

        async fn send_reply(&self, chat_id: ChatId, text: &str) -> Result<(), ClientError> {
            self.sent.lock().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct EchoCompletion {
        fail: AtomicBool,
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl CompletionClient for EchoCompletion {
        async fn complete(&self, _model: &str, history: &ConversationHistory) -> Result<Completion, ClientError> {
            self.seen.lock().push(history.len());
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::Status {
                    status: 400,
                    body: "bad request".to_string(),
                });
            }
            let last = history.messages().last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(Completion {
                reply: format!("echo: {}", last),
                usage: TokenUsage {
                    prompt_tokens: 5,
                    completion_tokens: 5,
                    total_tokens: 10,
                },
            })
        }

        async fn model_id(&self, model: &str) -> Result<String, ClientError> {
            Ok(format!("{}-0613", model))
        }
    }

    struct Fixture {
        _dir: TempDir,
        source: Arc<RecordingSource>,
        completion: Arc<EchoCompletion>,
        context: Arc<ContextStore>,
        handler: ChatHandler,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            max_history_messages: 10,
        })
        .unwrap();

        let mut config = RelayConfig::default();
        config.retry.base_delay_ms = 1;

        let source = Arc::new(RecordingSource::default());
        let completion = Arc::new(EchoCompletion::default());
        let handler = ChatHandler::new(&config, source.clone(), completion.clone(), storage.context.clone());

        Fixture {
            _dir: dir,
            source,
            completion,
            context: storage.context,
            handler,
        }
    }

    fn item(chat_id: ChatId, text: Option<&str>) -> WorkItem {
        let update = Update {
            update_id: 1,
            message: Some(Message {
                message_id: 1,
                text: text.map(str::to_string),
                chat: Chat { id: chat_id },
                from: None,
            }),
            edited_message: None,
        };
        WorkItem::new(1, 1, chat_id, update.to_payload().unwrap()).unwrap()
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/HELP"), Some(Command::Help));
        assert_eq!(Command::parse("/about@relay_bot"), Some(Command::About));
        assert_eq!(Command::parse("  /clear now"), Some(Command::Clear));
        assert_eq!(Command::parse("/weather"), Some(Command::Unknown));
        assert_eq!(Command::parse("hello /start"), None);
        assert_eq!(Command::parse("plain text"), None);
    }

    #[tokio::test]
    async fn test_text_is_relayed_and_history_kept() {
        let f = fixture();

        f.handler.handle(&item(7, Some("first"))).await.unwrap();
        f.handler.handle(&item(7, Some("second"))).await.unwrap();

        let sent = f.source.sent.lock().clone();
        assert_eq!(sent, vec![(7, "echo: first".to_string()), (7, "echo: second".to_string())]);

        // Second request carried the first exchange plus the new question
        assert_eq!(*f.completion.seen.lock(), vec![1, 3]);
        assert_eq!(f.context.get(7).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_completion_leaves_history_untouched() {
        let f = fixture();
        f.completion.fail.store(true, Ordering::SeqCst);

        let result = f.handler.handle(&item(7, Some("hello"))).await;
        assert!(matches!(result, Err(HandlerError::Client(RetryError::Permanent(_)))));
        assert!(f.context.get(7).unwrap().is_empty());
        assert!(f.source.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_text_replies_and_fails() {
        let f = fixture();

        let result = f.handler.handle(&item(3, None)).await;
        assert!(matches!(result, Err(HandlerError::EmptyMessage)));
        assert_eq!(f.source.sent.lock()[0], (3, EMPTY_MESSAGE_TEXT.to_string()));
    }

    #[tokio::test]
    async fn test_clear_forgets_history() {
        let f = fixture();

        f.handler.handle(&item(9, Some("remember me"))).await.unwrap();
        assert!(!f.context.get(9).unwrap().is_empty());

        f.handler.handle(&item(9, Some("/clear"))).await.unwrap();
        assert!(f.context.get(9).unwrap().is_empty());
        assert_eq!(f.source.sent.lock().last().unwrap().1, CLEARED_TEXT);
    }

    #[tokio::test]
    async fn test_about_reports_model() {
        let f = fixture();

        f.handler.handle(&item(4, Some("/about"))).await.unwrap();
        assert_eq!(
            f.source.sent.lock()[0].1,
            "Current GPT model ID: gpt-3.5-turbo-0613"
        );
    }

    #[tokio::test]
    async fn test_update_without_message_is_ok() {
        let f = fixture();
        let update = Update {
            update_id: 2,
            message: None,
            edited_message: None,
        };
        let item = WorkItem::new(2, 2, 0, update.to_payload().unwrap()).unwrap();

        f.handler.handle(&item).await.unwrap();
        assert!(f.source.sent.lock().is_empty());
    }
}
