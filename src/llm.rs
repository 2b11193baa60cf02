//! Language model abstraction
//!
//! The orchestrator only sees [`ModelClient`]: an opaque function from the
//! ordered history and available tools to one [`AiResponse`](crate::history::AiResponse).

mod error;
mod openai;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use openai::OpenAIClient;
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for model providers
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Invoke the model once. Faults are reported, never papered over.
    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        (**self).invoke(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

/// Logging wrapper for model clients
pub struct LoggingClient<M> {
    inner: M,
}

impl<M: ModelClient> LoggingClient<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<M: ModelClient> ModelClient for LoggingClient<M> {
    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.invoke(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(response) => {
                tracing::info!(
                    model = %self.inner.model_id(),
                    duration_ms = %duration.as_millis(),
                    history_len = request.messages.len(),
                    tool_calls = response.message.tool_calls.len(),
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    "Model call completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.inner.model_id(),
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.is_retryable(),
                    "Model call failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

/// Model configuration from the environment
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    /// Alternate OpenAI-compatible endpoint base, e.g. a gateway
    pub base_url: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

pub const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_TEMPERATURE: f32 = 0.7;

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            base_url: std::env::var("OPENAI_BASE_URL").ok().filter(|u| !u.is_empty()),
            model: std::env::var("TURNSTILE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            temperature: std::env::var("TURNSTILE_TEMPERATURE")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(DEFAULT_TEMPERATURE),
            system_prompt: std::env::var("TURNSTILE_SYSTEM_PROMPT").ok(),
        }
    }
}
