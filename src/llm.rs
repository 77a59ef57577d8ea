//! LLM text-generation service and the adapter the relay calls per chunk.
//!
//! [`LlmService`] is the seam between the relay and the outside world: the
//! production implementation talks to an OpenAI-compatible chat completions
//! endpoint, tests plug in deterministic doubles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::ServiceConfig;
use crate::error::RelayError;

/// Failure of one generation call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned HTTP {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("empty completion")]
    EmptyCompletion,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

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
}

/// Body of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub n: u32,
    pub stop: Option<Vec<String>>,
}

#[async_trait]
pub trait LlmService: Send + Sync {
    /// Run one completion and return the generated text.
    async fn generate(&self, request: &ChatRequest) -> Result<String, ServiceError>;
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: ProviderErrorDetail,
}

#[derive(Deserialize)]
struct ProviderErrorDetail {
    message: String,
}

/// Extract `choices[0].message.content` from a completion body.
fn parse_completion(body: &str) -> Result<String, ServiceError> {
    let response: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::MalformedResponse(e.to_string()))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or(ServiceError::EmptyCompletion)
}

/// Best-effort error message from a non-success response body.
fn provider_message(body: &str) -> String {
    serde_json::from_str::<ProviderErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.chars().take(200).collect())
}

/// Chat completions over HTTP with bearer authentication.
pub struct OpenAiChatService {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
}

impl OpenAiChatService {
    pub fn new(config: &ServiceConfig, api_key: String) -> Result<Self, RelayError> {
        let endpoint = config.endpoint()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RelayError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl LlmService for OpenAiChatService {
    async fn generate(&self, request: &ChatRequest) -> Result<String, ServiceError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::Timeout(Duration::ZERO)
                } else {
                    ServiceError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ServiceError::Provider {
                status: status.as_u16(),
                message: provider_message(&body),
            });
        }
        parse_completion(&body)
    }
}

/// Wraps an [`LlmService`] with the relay's fixed generation settings, a
/// per-call timeout and optional retry.
#[derive(Clone)]
pub struct QueryAdapter {
    service: Arc<dyn LlmService>,
    config: ServiceConfig,
}

impl QueryAdapter {
    pub fn new(service: Arc<dyn LlmService>, config: ServiceConfig) -> Self {
        Self { service, config }
    }

    /// Build the request sent for one chunk. The user message is the
    /// preamble, a blank line, then the chunk; an empty preamble sends the
    /// chunk alone.
    pub fn request_for(&self, chunk: &str) -> ChatRequest {
        let preamble = &self.config.user_preamble;
        let user = if preamble.is_empty() {
            chunk.to_string()
        } else {
            format!("{preamble}\n\n{chunk}")
        };
        ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage::system(self.config.system_prompt.clone()),
                ChatMessage::user(user),
            ],
            max_tokens: self.config.max_tokens,
            top_p: self.config.top_p,
            temperature: self.config.temperature,
            n: 1,
            stop: None,
        }
    }

    /// Query the service for one chunk and return the trimmed answer.
    ///
    /// Makes `1 + max_retries` attempts with exponential backoff between
    /// them (250ms, 500ms, ...); the last error is returned.
    pub async fn query(&self, chunk: &str) -> Result<String, ServiceError> {
        let request = self.request_for(chunk);
        let timeout = self.config.request_timeout();
        let attempts = self.config.max_retries.saturating_add(1);

        let mut last_error = ServiceError::EmptyCompletion;
        for attempt in 1..=attempts {
            let result = match tokio::time::timeout(timeout, self.service.generate(&request)).await
            {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(ServiceError::Timeout(_))) | Err(_) => Err(ServiceError::Timeout(timeout)),
                Ok(Err(e)) => Err(e),
            };
            match result {
                Ok(text) => {
                    let text = text.trim();
                    if text.is_empty() {
                        last_error = ServiceError::EmptyCompletion;
                    } else {
                        debug!(attempt, chars = text.chars().count(), "service answered");
                        return Ok(text.to_string());
                    }
                }
                Err(e) => last_error = e,
            }
            if attempt < attempts {
                let delay = Duration::from_millis(250 * (1u64 << (attempt - 1).min(6)));
                warn!(attempt, error = %last_error, ?delay, "service call failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_error)
    }
}
