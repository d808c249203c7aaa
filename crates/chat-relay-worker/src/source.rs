use crate::config::SourceConfig;
use crate::error::ClientError;
use async_trait::async_trait;
use chat_relay_core::{ChatId, SourceSeq, Update};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Long-poll message source and reply channel
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Updates with a sequence strictly greater than `after`
    async fn fetch_updates(&self, after: SourceSeq, timeout_secs: u64) -> Result<Vec<Update>, ClientError>;

    async fn send_reply(&self, chat_id: ChatId, text: &str) -> Result<(), ClientError>;
}

/// Telegram Bot API client
pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Serialize)]
struct GetUpdatesRequest {
    offset: SourceSeq,
    timeout: u64,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: ChatId,
    text: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramClient {
    pub fn new(config: &SourceConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(TelegramClient {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
        })
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let url = format!("{}/bot{}/{}", self.api_base, self.token, method);
        let resp = self.http.post(&url).json(body).timeout(timeout).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: ApiResponse<T> = resp.json().await?;
        match (envelope.ok, envelope.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(ClientError::Api(
                envelope.description.unwrap_or_else(|| format!("{} failed", method)),
            )),
        }
    }
}

#[async_trait]
impl MessageSource for TelegramClient {
    async fn fetch_updates(&self, after: SourceSeq, timeout_secs: u64) -> Result<Vec<Update>, ClientError> {
        let request = GetUpdatesRequest {
            offset: after + 1,
            timeout: timeout_secs,
        };
        // Leave the server room to answer an idle long poll
        let deadline = Duration::from_secs(timeout_secs + 10);

        let updates: Vec<Update> = self.call("getUpdates", &request, deadline).await?;
        debug!(after, count = updates.len(), "Fetched updates");
        Ok(updates)
    }

    async fn send_reply(&self, chat_id: ChatId, text: &str) -> Result<(), ClientError> {
        let request = SendMessageRequest { chat_id, text };
        let _: serde_json::Value = self
            .call("sendMessage", &request, Duration::from_secs(15))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> TelegramClient {
        let config = SourceConfig {
            api_base: server.uri(),
            bot_token: "42:secret".to_string(),
            ..SourceConfig::default()
        };
        TelegramClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_updates_asks_for_next_offset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot42:secret/getUpdates"))
            .and(body_partial_json(serde_json::json!({"offset": 11, "timeout": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": [
                    {"update_id": 11, "message": {"message_id": 1, "text": "hi", "chat": {"id": 42}}},
                    {"update_id": 12}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let updates = client(&server).await.fetch_updates(10, 0).await.unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].chat_id(), 42);
        assert_eq!(updates[1].update_id, 12);
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client(&server).await.send_reply(42, "hello").await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, ClientError::Status { status: 429, .. }));
    }

    #[tokio::test]
    async fn test_api_rejection_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot42:secret/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": false,
                "description": "Bad Request: chat not found"
            })))
            .mount(&server)
            .await;

        let err = client(&server).await.send_reply(7, "hello").await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("chat not found"));
    }
}
