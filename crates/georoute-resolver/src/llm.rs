//! LLM-backed classifier.
//!
//! The classifier renders a system + user prompt per stage and hands it to a
//! [`CompletionProvider`]. HTTP providers live in `providers` behind the
//! `openai` / `anthropic` / `local` features.

use crate::classifier::{Classifier, ClassifierError, ClassifyRequest};
use crate::prompts;
use async_trait::async_trait;
use std::sync::Arc;

// ============================================================================
// Provider interface
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    /// Ask for a JSON object response where the provider supports it.
    pub json_mode: bool,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("network error: {0}")]
    Network(String),
}

impl From<LlmError> for ClassifierError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Api(msg) | LlmError::Network(msg) => ClassifierError::Unavailable(msg),
            LlmError::RateLimited { retry_after_ms } => ClassifierError::RateLimited { retry_after_ms },
            LlmError::InvalidResponse(msg) => ClassifierError::InvalidResponse(msg),
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;

    fn model(&self) -> String;
}

// ============================================================================
// Configuration
// ============================================================================

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const OPENAI_BASE_URL_ENV: &str = "OPENAI_BASE_URL";
pub const OPENAI_MODEL_ENV: &str = "OPENAI_MODEL";
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const ANTHROPIC_MODEL_ENV: &str = "ANTHROPIC_MODEL";
pub const LOCAL_LLM_URL_ENV: &str = "LOCAL_LLM_URL";
pub const LOCAL_LLM_MODEL_ENV: &str = "LOCAL_LLM_MODEL";

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-latest";
const DEFAULT_LOCAL_MODEL: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Local,
}

/// LLM connection settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no LLM provider configured; set {OPENAI_API_KEY_ENV}, {ANTHROPIC_API_KEY_ENV} or {LOCAL_LLM_URL_ENV}")]
    NoProviderConfigured,
    #[error("invalid LLM configuration: {0}")]
    Invalid(String),
}

impl LlmConfig {
    /// Pick a provider from the environment: OpenAI, then Anthropic, then a
    /// local OpenAI-compatible endpoint.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`LlmConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(key) = var(OPENAI_API_KEY_ENV) {
            return Ok(Self {
                provider: Provider::OpenAi,
                api_key: key,
                model: var(OPENAI_MODEL_ENV).unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
                base_url: var(OPENAI_BASE_URL_ENV),
                timeout_secs: 60,
            });
        }

        if let Some(key) = var(ANTHROPIC_API_KEY_ENV) {
            return Ok(Self {
                provider: Provider::Anthropic,
                api_key: key,
                model: var(ANTHROPIC_MODEL_ENV).unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
                base_url: None,
                timeout_secs: 60,
            });
        }

        if let Some(url) = var(LOCAL_LLM_URL_ENV) {
            return Ok(Self {
                provider: Provider::Local,
                api_key: String::new(),
                model: var(LOCAL_LLM_MODEL_ENV).unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string()),
                base_url: Some(url),
                timeout_secs: 120,
            });
        }

        Err(ConfigError::NoProviderConfigured)
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// [`Classifier`] that asks a chat-completion model.
pub struct LlmClassifier {
    provider: Arc<dyn CompletionProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmClassifier {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            provider,
            temperature: 0.0,
            max_tokens: 1024,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, request: &ClassifyRequest) -> Result<String, ClassifierError> {
        let (system, user) = prompts::render(request);
        let completion = CompletionRequest {
            messages: vec![Message::system(system), Message::user(user)],
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            json_mode: true,
        };

        let response = self.provider.complete(&completion).await?;
        tracing::debug!(
            stage = %request.stage,
            model = %response.model,
            prompt_tokens = response.prompt_tokens,
            completion_tokens = response.completion_tokens,
            "classifier completion"
        );
        Ok(response.content)
    }

    fn model_name(&self) -> String {
        self.provider.model()
    }
}
