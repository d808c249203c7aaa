use crate::{ChatId, RelayError, Result, SourceSeq};
use serde::{Deserialize, Serialize};

/// Chat used for updates that carry no message (callbacks, member changes).
/// They still enter the queue so the resume cursor advances past them.
pub const UNROUTED_CHAT: ChatId = 0;

/// An update as delivered by the long-poll message source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: SourceSeq,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    pub chat: Chat,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,

    #[serde(default)]
    pub is_bot: bool,

    #[serde(default)]
    pub first_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Update {
    /// The message this update is about, new or edited
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref().or(self.edited_message.as_ref())
    }

    pub fn chat_id(&self) -> ChatId {
        self.message().map(|m| m.chat.id).unwrap_or(UNROUTED_CHAT)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(RelayError::from)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(RelayError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_text_message() {
        let raw = r#"{
            "update_id": 815,
            "message": {
                "message_id": 7,
                "text": "hello",
                "chat": {"id": -1001},
                "from": {"id": 5, "is_bot": false, "first_name": "Ada"}
            }
        }"#;

        let update = Update::from_payload(raw.as_bytes()).unwrap();
        assert_eq!(update.update_id, 815);
        assert_eq!(update.chat_id(), -1001);
        assert_eq!(update.message().unwrap().text.as_deref(), Some("hello"));
    }

    #[test]
    fn test_update_without_message_is_unrouted() {
        let update = Update::from_payload(br#"{"update_id": 3, "callback_query": {"id": "x"}}"#).unwrap();
        assert!(update.message().is_none());
        assert_eq!(update.chat_id(), UNROUTED_CHAT);
    }

    #[test]
    fn test_edited_message_routes_to_its_chat() {
        let update = Update {
            update_id: 9,
            message: None,
            edited_message: Some(Message {
                message_id: 1,
                text: Some("fixed typo".to_string()),
                chat: Chat { id: 77 },
                from: None,
            }),
        };

        let decoded = Update::from_payload(&update.to_payload().unwrap()).unwrap();
        assert_eq!(decoded.chat_id(), 77);
        assert_eq!(decoded, update);
    }
}
