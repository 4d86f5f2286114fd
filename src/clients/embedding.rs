//! Embedding generator client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::storage::RetryPolicy;

use super::llm::CallError;

/// Texts per upstream call. Larger inputs are split transparently and the
/// results rejoined in order.
pub const MAX_BATCH: usize = 100;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dimension(&self) -> usize;

    /// Embeds a batch, preserving input order. Output length always equals
    /// input length.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| CoreError::embedding("provider returned an empty batch"))
    }
}

// ── HTTP provider ──────────────────────────────────────────────────────

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model_name: String,
    dimension: usize,
    retry: RetryPolicy,
}

impl HttpEmbeddingProvider {
    pub fn new(
        endpoint: &str,
        api_key: &str,
        model_name: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::internal(format!("failed to build embedding client: {e}")))?;
        Ok(HttpEmbeddingProvider {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model_name: model_name.to_string(),
            dimension,
            retry: RetryPolicy::external_ai(),
        })
    }

    async fn embed_page(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        #[derive(Serialize)]
        struct EmbedRequest<'a> {
            model: &'a str,
            input: &'a [String],
        }
        #[derive(Deserialize)]
        struct EmbedResponse {
            embeddings: Vec<Vec<f32>>,
        }

        let url = format!("{}/v1/embeddings", self.endpoint);
        let response: EmbedResponse = self
            .retry
            .run("embeddings", CallError::is_transient, || async {
                let response = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&EmbedRequest {
                        model: &self.model_name,
                        input: texts,
                    })
                    .send()
                    .await
                    .map_err(|e| {
                        if e.is_timeout() {
                            CallError::Fatal(CoreError::deadline("embedding call"))
                        } else {
                            CallError::Transient(format!("embedding transport failure: {e}"))
                        }
                    })?;
                let status = response.status();
                if status.is_success() {
                    return response.json::<EmbedResponse>().await.map_err(|e| {
                        CallError::Fatal(CoreError::embedding(format!(
                            "malformed embedding response: {e}"
                        )))
                    });
                }
                let detail = response.text().await.unwrap_or_default();
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    Err(CallError::Transient(format!("embedding {status}: {detail}")))
                } else {
                    Err(CallError::Fatal(CoreError::embedding(format!(
                        "embedding service rejected call ({status}): {detail}"
                    ))))
                }
            })
            .await
            .map_err(CallError::into_embedding_error)?;

        if response.embeddings.len() != texts.len() {
            return Err(CoreError::embedding(format!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        for vector in &response.embeddings {
            if vector.len() != self.dimension {
                return Err(CoreError::embedding(format!(
                    "embedding dimension mismatch: expected {}, received {}",
                    self.dimension,
                    vector.len()
                )));
            }
        }
        Ok(response.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut vectors = Vec::with_capacity(texts.len());
        for page in texts.chunks(MAX_BATCH) {
            vectors.extend(self.embed_page(page).await?);
        }
        Ok(vectors)
    }
}

// ── Mock provider ──────────────────────────────────────────────────────

/// Deterministic embedding provider for tests and keyless local runs.
///
/// The first 26 dimensions are a letter-frequency histogram, the rest are
/// hashed byte-trigram buckets; the vector is L2-normalized. Texts sharing
/// vocabulary land close together, which is enough signal for relevance
/// assertions without a model in the loop.
#[derive(Debug, Clone)]
pub struct MockEmbeddingProvider {
    model_name: String,
    dimension: usize,
}

impl MockEmbeddingProvider {
    pub fn new() -> Self {
        Self::with_dimension(32)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        MockEmbeddingProvider {
            model_name: "mock-embedder".to_string(),
            dimension: dimension.max(27),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();

        for c in lower.chars() {
            if c.is_ascii_lowercase() {
                vector[(c as usize) - ('a' as usize)] += 1.0;
            }
        }

        let extra = self.dimension - 26;
        if extra > 0 {
            let bytes = lower.as_bytes();
            for window in bytes.windows(3) {
                let mut hash = 0usize;
                for &b in window {
                    hash = hash.wrapping_mul(31).wrapping_add(b as usize);
                }
                vector[26 + hash % extra] += 1.0;
            }
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}
