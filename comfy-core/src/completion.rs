//! Upstream chat-completion client.
//!
//! `CompletionBackend` is the seam the relay depends on. The production
//! implementation talks to Groq's OpenAI-compatible endpoint with `stream: true`
//! and hands the response body to the decode stage in [`crate::sse`].
//! Nothing here retries: a failed request is reported once and the caller decides.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CompletionSettings;
use crate::models::Role;
use crate::sse::{decode_event_stream, UpstreamEvent};

/// Characters of an upstream error body kept in error messages.
pub const ERROR_EXCERPT_CHARS: usize = 100;

pub type FragmentStream =
    Pin<Box<dyn Stream<Item = Result<UpstreamEvent, CompletionError>> + Send>>;

// ============================================================================
// CompletionBackend trait
// ============================================================================

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Open a streamed completion. Fails before any byte is read if the request
    /// cannot be sent or the upstream answers with a non-success status.
    async fn stream_chat(&self, request: &CompletionRequest)
        -> Result<FragmentStream, CompletionError>;

    fn model(&self) -> &str;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream API error: {code}. Message: {message}")]
    Api { code: u16, message: String },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Stream read error: {0}")]
    Stream(String),
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Resolved client configuration (settings plus the API key from the environment).
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl CompletionConfig {
    pub fn from_settings(settings: &CompletionSettings) -> Self {
        let api_key = std::env::var(&settings.api_key_env).unwrap_or_default();
        Self {
            api_key,
            model: settings.model.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Create the completion backend from configuration.
pub fn create_backend(
    settings: &CompletionSettings,
) -> Result<Box<dyn CompletionBackend>, CompletionError> {
    let config = CompletionConfig::from_settings(settings);
    if config.api_key.is_empty() {
        tracing::warn!(
            env = %settings.api_key_env,
            "Completion API key not set; chat requests will fail until it is provided"
        );
    }
    Ok(Box::new(GroqCompletionClient::new(config)?))
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

// ============================================================================
// GroqCompletionClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct GroqCompletionClient {
    client: Client,
    config: CompletionConfig,
}

impl GroqCompletionClient {
    pub fn new(config: CompletionConfig) -> Result<Self, CompletionError> {
        // Only the connect phase is bounded; a whole-request timeout would cut long replies.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, config })
    }

    /// Create a client with a custom base URL (for testing / self-hosted gateways)
    pub fn with_base_url(
        mut config: CompletionConfig,
        base_url: String,
    ) -> Result<Self, CompletionError> {
        config.base_url = base_url.trim_end_matches('/').to_string();
        Self::new(config)
    }
}

#[async_trait]
impl CompletionBackend for GroqCompletionClient {
    async fn stream_chat(
        &self,
        request: &CompletionRequest,
    ) -> Result<FragmentStream, CompletionError> {
        if self.config.api_key.is_empty() {
            return Err(CompletionError::MissingApiKey);
        }

        let url = format!("{}/chat/completions", self.config.base_url);
        let body = ChatCompletionBody {
            model: &self.config.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
        };

        tracing::debug!(
            model = %self.config.model,
            messages = request.messages.len(),
            "Opening streamed completion"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|d| d.message)
                .unwrap_or(error_body);
            let message: String = message.chars().take(ERROR_EXCERPT_CHARS).collect();

            tracing::error!(code = status.as_u16(), message = %message, "Completion API error");

            return Err(CompletionError::Api {
                code: status.as_u16(),
                message,
            });
        }

        Ok(decode_event_stream(response.bytes_stream()))
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn name(&self) -> &str {
        "groq"
    }
}

// ============================================================================
// TESTS
// ============================================================================
