use crate::config::CompletionConfig;
use crate::error::ClientError;
use async_trait::async_trait;
use chat_relay_core::{ChatMessage, ConversationHistory, TokenUsage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A model reply and what it cost
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub reply: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, model: &str, history: &ConversationHistory) -> Result<Completion, ClientError>;

    /// Canonical id of a model, as reported by the API
    async fn model_id(&self, model: &str) -> Result<String, ClientError>;
}

/// OpenAI chat completions client
pub struct OpenAiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    organization: Option<String>,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: TokenUsage,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ModelResponse {
    id: String,
}

impl OpenAiClient {
    pub fn new(config: &CompletionConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(OpenAiClient {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            organization: config.organization.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .request(method, format!("{}/v1/{}", self.api_base, endpoint))
            .bearer_auth(&self.api_key);
        if let Some(org) = &self.organization {
            request = request.header("OpenAI-Organization", org);
        }
        request
    }

    async fn read<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T, ClientError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, model: &str, history: &ConversationHistory) -> Result<Completion, ClientError> {
        let body = ChatCompletionRequest {
            model,
            messages: history.messages(),
        };
        let resp = self
            .request(reqwest::Method::POST, "chat/completions")
            .json(&body)
            .send()
            .await?;

        let response: ChatCompletionResponse = Self::read(resp).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or(ClientError::EmptyCompletion)?;

        Ok(Completion {
            reply: choice.message.content,
            usage: response.usage,
        })
    }

    async fn model_id(&self, model: &str) -> Result<String, ClientError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("models/{}", model))
            .send()
            .await?;

        let response: ModelResponse = Self::read(resp).await?;
        Ok(response.id)
    }
}
