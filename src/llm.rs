//! Client for a hosted OpenAI-compatible chat-completion API.
//!
//! Defaults target Groq (`llama-3.1-8b-instant`). Request and response
//! bodies are typed; anything that does not parse is a
//! [`Error::Schema`], and every transport or HTTP failure is
//! [`Error::LlmUnavailable`]. Nothing is retried here: the caller decides
//! whether to offer the user another attempt.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Something that can answer a list of chat messages.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

pub struct ChatClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl ChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config: config.clone(),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let api_key = match self.config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key,
            _ => {
                return Err(Error::LlmUnavailable(
                    "no API key configured; set API_KEY".to_string(),
                ))
            }
        };

        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::LlmUnavailable(format!(
                        "no response within {}s",
                        self.config.timeout_secs
                    ))
                } else {
                    Error::LlmUnavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ApiErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            tracing::warn!(%status, "chat completion failed");
            return Err(Error::LlmUnavailable(format!("{}: {}", status, detail.trim())));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                Error::LlmUnavailable(e.to_string())
            } else {
                Error::Schema {
                    service: "chat completion",
                    detail: e.to_string(),
                }
            }
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| Error::Schema {
                service: "chat completion",
                detail: "response contained no answer".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> LlmConfig {
        LlmConfig {
            base_url: server.uri(),
            api_key: Some("gsk-test".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn returns_the_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer gsk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "llama-3.1-8b-instant",
                "max_tokens": 1500,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatClient::new(&config(&server)).unwrap();
        let answer = client.complete(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(answer, "Hello!");
    }

    #[tokio::test]
    async fn missing_key_fails_without_a_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut cfg = config(&server);
        cfg.api_key = Some("  ".into());
        let client = ChatClient::new(&cfg).unwrap();
        assert!(matches!(
            client.complete(&[ChatMessage::user("hi")]).await,
            Err(Error::LlmUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn api_errors_are_unavailable_with_the_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "Rate limit reached", "type": "tokens"}
            })))
            .mount(&server)
            .await;

        let client = ChatClient::new(&config(&server)).unwrap();
        let err = client
            .complete(&[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LlmUnavailable(_)));
        assert!(err.to_string().contains("Rate limit reached"));
    }

    #[tokio::test]
    async fn timeout_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let mut cfg = config(&server);
        cfg.timeout_secs = 1;
        let client = ChatClient::new(&cfg).unwrap();
        assert!(matches!(
            client.complete(&[ChatMessage::user("hi")]).await,
            Err(Error::LlmUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn unexpected_shape_is_a_schema_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let client = ChatClient::new(&config(&server)).unwrap();
        assert!(matches!(
            client.complete(&[ChatMessage::user("hi")]).await,
            Err(Error::Schema { .. })
        ));
    }
}
