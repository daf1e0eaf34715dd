//! OpenAI-compatible chat-completions adapter used for summarization.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use crate::ChatCompletion;
use crate::ChatMessage;
use crate::ChatResponse;
use crate::CompactorErr;

const MAX_RETRIES: u64 = 4;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL up to (not including) `/chat/completions`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct OpenAiChatClient {
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl OpenAiChatClient {
    pub fn new(config: OpenAiConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, http }
    }
}

#[async_trait]
impl ChatCompletion for OpenAiChatClient {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<ChatResponse, CompactorErr> {
        let payload = json!({
            "model": self.config.model,
            "messages": messages
                .iter()
                .map(|message| json!({ "role": message.role, "content": message.content }))
                .collect::<Vec<_>>(),
            "stream": false,
            "temperature": temperature,
        });
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut request = self.http.post(&url).json(&payload);
            if let Some(api_key) = &self.config.api_key {
                request = request.bearer_auth(api_key);
            }
            let response = request.send().await;

            match response {
                Ok(response) if response.status().is_success() => {
                    let body: serde_json::Value = response.json().await?;
                    let content = body
                        .get("choices")
                        .and_then(|choices| choices.get(0))
                        .and_then(|choice| choice.get("message"))
                        .and_then(|message| message.get("content"))
                        .and_then(|content| content.as_str())
                        .ok_or_else(|| {
                            CompactorErr::MalformedResponse(
                                "missing choices[0].message.content".to_string(),
                            )
                        })?;
                    return Ok(ChatResponse {
                        content: content.to_string(),
                    });
                }
                Ok(response) => {
                    let status = response.status();
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let body = response.text().await.unwrap_or_default();
                        return Err(CompactorErr::UnexpectedStatus(status, body));
                    }
                    if attempt > MAX_RETRIES {
                        return Err(CompactorErr::RetryLimit(status));
                    }
                    let delay = backoff(attempt);
                    debug!("retrying chat completion after {delay:?} (status {status})");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if attempt > MAX_RETRIES {
                        return Err(err.into());
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }
}

/// Exponential back-off schedule: 200ms → 400ms → 800ms → 1600ms, jittered.
fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << (attempt - 1));
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((base_delay_ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::body_partial_json;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn client_for(server: &MockServer) -> OpenAiChatClient {
        OpenAiChatClient::new(OpenAiConfig {
            base_url: server.uri(),
            api_key: Some("test-key".to_string()),
            model: "summarizer".to_string(),
            timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn extracts_the_completion_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(
                serde_json::json!({ "model": "summarizer", "stream": false }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [ { "message": { "role": "assistant", "content": "a summary" } } ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let response = client
            .chat_completion(&[ChatMessage::new("user", "summarize")], 0.3)
            .await
            .expect("completion");
        assert_eq!(response.content, "a summary");
    }

    #[tokio::test]
    async fn non_retryable_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .chat_completion(&[ChatMessage::new("user", "summarize")], 0.3)
            .await
            .expect_err("must fail");
        assert!(
            matches!(err, CompactorErr::UnexpectedStatus(status, _) if status == 400),
            "err = {err}"
        );
    }

    #[tokio::test]
    async fn malformed_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .chat_completion(&[ChatMessage::new("user", "summarize")], 0.3)
            .await
            .expect_err("must fail");
        assert!(matches!(err, CompactorErr::MalformedResponse(_)), "err = {err}");
    }
}
