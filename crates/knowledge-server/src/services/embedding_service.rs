use crate::config::EmbeddingConfig;
use crate::resilience::ResiliencePipeline;
use crate::services::embedding_cache::EmbeddingCache;
use crate::utils::error::ApiError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// The raw provider contract: fixed-dimension vectors for non-blank text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError>;
}

/// OpenAI-shaped `/v1/embeddings` endpoint client.
pub struct HttpEmbeddingProvider {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
    api_key: Option<String>,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        if text.trim().is_empty() {
            return Err(ApiError::InvalidArgument(
                "cannot embed empty or whitespace-only text".to_string(),
            ));
        }

        let url = format!("{}/v1/embeddings", self.base_url);
        let request = EmbeddingRequest {
            input: text.to_string(),
            model: self.model.clone(),
        };

        let mut builder = self.client.post(&url);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::ProviderUnavailable(format!("embedding endpoint: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::ProviderUnavailable(format!(
                "embedding API error ({status}): {body}"
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ApiError::ProviderContractViolation(format!(
                "embedding response not in expected shape: {e}"
            )))?;

        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| {
                ApiError::ProviderContractViolation(
                    "embedding response contained no data".to_string(),
                )
            })?;

        // A wrong dimension corrupts the index; treat it as fatal rather
        // than storing vectors that can never match.
        if embedding.len() != self.dimension {
            return Err(ApiError::ProviderContractViolation(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        Ok(embedding)
    }
}

/// Resilient, cached embedding facade used by the indexer and the query
/// pipeline: cache -> resilience pipeline -> provider.
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    pipeline: Arc<ResiliencePipeline>,
    batch_size: usize,
    pub dimension: usize,
}

impl EmbeddingService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<EmbeddingCache>,
        pipeline: Arc<ResiliencePipeline>,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            pipeline,
            batch_size: config.batch_size.max(1),
            dimension: config.dimension,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        if text.trim().is_empty() {
            return Err(ApiError::InvalidArgument(
                "cannot embed empty or whitespace-only text".to_string(),
            ));
        }

        if let Some(cached) = self.cache.try_get(text) {
            return Ok(cached);
        }

        let start = Instant::now();
        let embedding = self
            .pipeline
            .execute("embed", || self.provider.embed(text))
            .await?;
        debug!(
            exec_ms = start.elapsed().as_millis() as u64,
            chars = text.len(),
            "Generated embedding"
        );

        self.cache.set(text, embedding.clone());
        Ok(embedding)
    }

    /// Batch embedding with order preserved. Concurrency is bounded by the
    /// configured batch size so a large document cannot flood the provider.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        use futures::future::join_all;

        debug!(
            count = texts.len(),
            batch_size = self.batch_size,
            "Generating batch embeddings"
        );

        let mut results = Vec::with_capacity(texts.len());
        for window in texts.chunks(self.batch_size) {
            let futures: Vec<_> = window.iter().map(|text| self.embed(text)).collect();
            for outcome in join_all(futures).await {
                match outcome {
                    Ok(embedding) => results.push(embedding),
                    Err(err) => {
                        warn!(error = %err, "Batch embedding failed");
                        return Err(err);
                    }
                }
            }
        }

        Ok(results)
    }
}
