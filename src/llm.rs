//! OpenAI-compatible chat completions client.
//!
//! Both pipeline stages (extraction and matching) go through the
//! [`ChatCompletion`] trait so tests can swap in a canned implementation.

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Pause before retrying a transient transport failure.
const RETRY_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// One round trip to a chat model: system prompt plus user message in,
/// assistant text out.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// HTTP client for a `/chat/completions` endpoint.
pub struct ChatClient {
    client: reqwest::Client,
    config: LlmConfig,
}

enum RequestFailure {
    /// Worth one more attempt: timeouts, connect errors, 5xx answers.
    Transient(String),
    Permanent(String),
}

impl RequestFailure {
    fn into_message(self) -> String {
        match self {
            RequestFailure::Transient(msg) | RequestFailure::Permanent(msg) => msg,
        }
    }
}

impl ChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Llm(e.to_string()))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    async fn send(
        &self,
        url: &str,
        request: &ChatRequest,
    ) -> std::result::Result<String, RequestFailure> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    RequestFailure::Transient(e.to_string())
                } else {
                    RequestFailure::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("chat API error {status}: {body}");
            return Err(if status.is_server_error() {
                RequestFailure::Transient(msg)
            } else {
                RequestFailure::Permanent(msg)
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| RequestFailure::Permanent(e.to_string()))?;
        chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| RequestFailure::Permanent("empty chat response".to_string()))
    }
}

#[async_trait]
impl ChatCompletion for ChatClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: 0.0,
        };
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.send(&url, &request).await {
                Ok(content) => return Ok(content),
                Err(RequestFailure::Transient(msg)) if attempt <= self.config.retries => {
                    warn!(error = %msg, attempt, "transient chat failure, retrying");
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(failure) => return Err(Error::Llm(failure.into_message())),
            }
        }
    }
}

/// Strip markdown fences and surrounding prose from a model answer,
/// leaving just the outermost JSON object.
///
/// Models occasionally wrap the payload in ```` ```json ```` fences or
/// prepend reasoning text despite instructions.
pub fn clean_payload(content: &str) -> std::result::Result<&str, String> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    extract_json_object(trimmed)
}

/// Extract the outermost JSON object from a string that may contain
/// surrounding text.
fn extract_json_object(s: &str) -> std::result::Result<&str, String> {
    let start = s
        .find('{')
        .ok_or_else(|| "no '{' found in chat response".to_string())?;
    let end = s
        .rfind('}')
        .ok_or_else(|| "no '}' found in chat response".to_string())?;
    if end <= start {
        return Err("malformed JSON in chat response".to_string());
    }
    Ok(&s[start..=end])
}
