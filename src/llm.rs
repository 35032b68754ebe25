//! Generative and moderation service abstraction
//!
//! The generation coordinator only sees the traits here; concrete providers
//! are picked from configuration at startup.

mod anthropic;
mod error;
mod moderation;
mod types;

pub use anthropic::AnthropicService;
pub use error::{LlmError, LlmErrorKind};
pub use moderation::{BlocklistModeration, OpenAiModeration};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Generative text service
#[async_trait]
pub trait GenerativeService: Send + Sync {
    /// Produce raw output for a request
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError>;

    fn model_id(&self) -> &str;
}

/// Safety classifier for generated text
#[async_trait]
pub trait ModerationService: Send + Sync {
    async fn check(&self, text: &str) -> Result<ModerationResult, LlmError>;

    fn name(&self) -> &str;
}

/// Provider credentials read from the environment
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub gateway: Option<String>,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            gateway: std::env::var("LLM_GATEWAY").ok(),
            model: std::env::var("CHATFLOW_MODEL").ok(),
        }
    }

    /// Generative service for this configuration, wrapped for logging
    pub fn generative_service(&self) -> Arc<dyn GenerativeService> {
        let inner: Arc<dyn GenerativeService> = match &self.anthropic_api_key {
            Some(key) => Arc::new(AnthropicService::new(
                key.clone(),
                self.model.as_deref(),
                self.gateway.as_deref(),
            )),
            None => {
                tracing::warn!("ANTHROPIC_API_KEY not set, generation requests will fail");
                Arc::new(UnavailableService)
            }
        };
        Arc::new(LoggingService::new(inner))
    }

    /// Remote moderation when a key is configured, local blocklist otherwise
    pub fn moderation_service(&self) -> Arc<dyn ModerationService> {
        match &self.openai_api_key {
            Some(key) => Arc::new(OpenAiModeration::new(key.clone(), self.gateway.as_deref())),
            None => {
                tracing::info!("OPENAI_API_KEY not set, using local blocklist moderation");
                Arc::new(BlocklistModeration::with_defaults())
            }
        }
    }
}

/// Stand-in when no provider is configured; every call fails non-retryably
pub struct UnavailableService;

#[async_trait]
impl GenerativeService for UnavailableService {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, LlmError> {
        Err(LlmError::auth("No generative service configured"))
    }

    fn model_id(&self) -> &str {
        "unavailable"
    }
}

/// Logging wrapper for generative services
pub struct LoggingService {
    inner: Arc<dyn GenerativeService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn GenerativeService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl GenerativeService for LoggingService {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.generate(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(output) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    output_chars = output.len(),
                    reinforcements = request.reinforcements.len(),
                    "Generation request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    kind = e.kind.as_str(),
                    retryable = e.kind.is_retryable(),
                    "Generation request failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
