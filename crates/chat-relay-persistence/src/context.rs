use crate::db::CF_CHAT_CONTEXT;
use crate::keys::encode_i64;
use crate::{PersistenceError, Result};
use chat_relay_core::{ChatId, ConversationHistory};
use rocksdb::{ColumnFamily, DB};
use std::sync::Arc;
use tracing::debug;

/// Per-chat conversation history, stored as JSON
pub struct ContextStore {
    db: Arc<DB>,
    max_messages: usize,
}

impl ContextStore {
    pub(crate) fn new(db: Arc<DB>, max_messages: usize) -> Self {
        ContextStore { db, max_messages }
    }

    /// History for a chat, empty if none was stored
    pub fn get(&self, chat_id: ChatId) -> Result<ConversationHistory> {
        match self.db.get_cf(self.cf()?, encode_i64(chat_id))? {
            Some(value) => Ok(serde_json::from_slice(&value)?),
            None => Ok(ConversationHistory::new()),
        }
    }

    /// Replace a chat's history, keeping only the most recent messages
    pub fn put(&self, chat_id: ChatId, history: &ConversationHistory) -> Result<()> {
        let mut history = history.clone();
        history.truncate_front(self.max_messages);

        let value = serde_json::to_vec(&history)?;
        self.db.put_cf(self.cf()?, encode_i64(chat_id), value)?;

        debug!(chat_id, messages = history.len(), "Stored conversation history");
        Ok(())
    }

    pub fn clear(&self, chat_id: ChatId) -> Result<()> {
        self.db.delete_cf(self.cf()?, encode_i64(chat_id))?;
        debug!(chat_id, "Cleared conversation history");
        Ok(())
    }

    fn cf(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_CHAT_CONTEXT)
            .ok_or_else(|| PersistenceError::Corrupt("Chat context CF not found".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use crate::{Storage, StorageConfig};
    use chat_relay_core::{ChatMessage, ConversationHistory};
    use tempfile::TempDir;

    #[test]
    fn test_get_put_clear() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_history_messages: 3,
        })
        .unwrap();
        let context = storage.context;

        assert!(context.get(5).unwrap().is_empty());

        let mut history = ConversationHistory::new();
        for i in 0..4 {
            history.push(ChatMessage::user(format!("q{}", i)));
        }
        context.put(5, &history).unwrap();

        let stored = context.get(5).unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored.messages()[0].content, "q1");

        // Other chats are unaffected
        assert!(context.get(-5).unwrap().is_empty());

        context.clear(5).unwrap();
        assert!(context.get(5).unwrap().is_empty());
    }
}
