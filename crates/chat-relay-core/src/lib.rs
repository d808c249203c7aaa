mod item;
mod update;
mod conversation;
mod error;

pub use item::{WorkItem, WorkStatus, ItemId, ChatId, SourceSeq, Lease};
pub use update::{Update, Message, Chat, User, UNROUTED_CHAT};
pub use conversation::{ChatMessage, Role, ConversationHistory, TokenUsage};
pub use error::{RelayError, Result};

pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024; // 1MB
