use crate::config::GenerationConfig;
use crate::utils::error::ApiError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Generation endpoint contract, used for answer synthesis and entity
/// extraction.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, messages: Vec<ChatMessage>) -> Result<String, ApiError>;
}

/// OpenAI-shaped `/v1/chat/completions` client.
pub struct HttpGenerationProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: usize,
    temperature: f32,
}

impl HttpGenerationProvider {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    async fn generate(&self, messages: Vec<ChatMessage>) -> Result<String, ApiError> {
        if messages.is_empty() {
            return Err(ApiError::InvalidArgument(
                "generation requires at least one message".to_string(),
            ));
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut builder = self.client.post(&url);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::ProviderUnavailable(format!("generation endpoint: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::ProviderUnavailable(format!(
                "generation API error ({status}): {body}"
            )));
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            ApiError::ProviderContractViolation(format!(
                "generation response not in expected shape: {e}"
            ))
        })?;

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                ApiError::ProviderContractViolation(
                    "generation response contained no choices".to_string(),
                )
            })?;

        debug!(chars = content.len(), "Generation completed");
        Ok(content)
    }
}
