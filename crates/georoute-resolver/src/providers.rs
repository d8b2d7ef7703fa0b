//! HTTP completion providers: OpenAI-compatible chat completions (also used
//! for local vLLM / Ollama endpoints) and Anthropic messages.

use crate::llm::{
    CompletionProvider, CompletionRequest, CompletionResponse, ConfigError, LlmConfig, LlmError,
    Provider, Role,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

fn http_client(config: &LlmConfig) -> Result<Client, ConfigError> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| ConfigError::Invalid(format!("failed to create HTTP client: {e}")))
}

async fn read_json(response: Response) -> Result<Value, LlmError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60);
        return Err(LlmError::RateLimited {
            retry_after_ms: retry_after * 1000,
        });
    }
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        return Err(LlmError::Api(format!("{status}: {error_text}")));
    }
    response
        .json()
        .await
        .map_err(|e| LlmError::InvalidResponse(e.to_string()))
}

// ============================================================================
// OpenAI-compatible
// ============================================================================

pub struct OpenAiClient {
    client: Client,
    config: LlmConfig,
    url: String,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> Result<Self, ConfigError> {
        let url = match (config.provider, config.base_url.as_deref()) {
            (Provider::Local, Some(base)) => format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            (Provider::Local, None) => {
                return Err(ConfigError::Invalid("local provider needs a base URL".into()))
            }
            (_, base) => format!(
                "{}/chat/completions",
                base.unwrap_or(OPENAI_BASE_URL).trim_end_matches('/')
            ),
        };
        Ok(Self {
            client: http_client(&config)?,
            config,
            url,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut call = self.client.post(&self.url).json(&body);
        if !self.config.api_key.is_empty() {
            call = call.bearer_auth(&self.config.api_key);
        }
        let response = call.send().await.map_err(|e| LlmError::Network(e.to_string()))?;
        let data = read_json(response).await?;

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".into()))?
            .to_string();

        Ok(CompletionResponse {
            content,
            model: data["model"].as_str().unwrap_or(&self.config.model).to_string(),
            prompt_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as usize,
            completion_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0) as usize,
        })
    }

    fn model(&self) -> String {
        self.config.model.clone()
    }
}

// ============================================================================
// Anthropic
// ============================================================================

pub struct AnthropicClient {
    client: Client,
    config: LlmConfig,
}

impl AnthropicClient {
    pub fn new(config: LlmConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: http_client(&config)?,
            config,
        })
    }
}

#[async_trait]
impl CompletionProvider for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(1024),
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }

        let url = self.config.base_url.as_deref().unwrap_or(ANTHROPIC_URL);
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;
        let data = read_json(response).await?;

        let content = data["content"][0]["text"]
            .as_str()
            .ok_or_else(|| LlmError::InvalidResponse("missing content[0].text".into()))?
            .to_string();

        Ok(CompletionResponse {
            content,
            model: self.config.model.clone(),
            prompt_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0) as usize,
            completion_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0) as usize,
        })
    }

    fn model(&self) -> String {
        self.config.model.clone()
    }
}

// ============================================================================
// Unified client
// ============================================================================

/// Dispatches to the provider named by the configuration.
pub enum UnifiedClient {
    OpenAi(OpenAiClient),
    Anthropic(AnthropicClient),
}

impl UnifiedClient {
    pub fn from_config(config: LlmConfig) -> Result<Self, ConfigError> {
        match config.provider {
            Provider::OpenAi | Provider::Local => Ok(Self::OpenAi(OpenAiClient::new(config)?)),
            Provider::Anthropic => Ok(Self::Anthropic(AnthropicClient::new(config)?)),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_config(LlmConfig::from_env()?)
    }
}

#[async_trait]
impl CompletionProvider for UnifiedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match self {
            Self::OpenAi(c) => c.complete(request).await,
            Self::Anthropic(c) => c.complete(request).await,
        }
    }

    fn model(&self) -> String {
        match self {
            Self::OpenAi(c) => c.model(),
            Self::Anthropic(c) => c.model(),
        }
    }
}
