//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two backends:
//! - **[`RemoteProvider`]** — calls an OpenAI-compatible `/v1/embeddings`
//!   endpoint with batching, retry, and backoff.
//! - **[`HashedProvider`]** — deterministic token-hash vectors; no network.
//!   Useful for local development and tests where real semantics are not
//!   needed but idempotent rebuilds are.
//!
//! Providers are resolved per collection through a [`ProviderFactory`]: a
//! collection names its embedding model, and the factory hands back the
//! provider that serves it.
//!
//! # Retry Strategy
//!
//! The remote provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;

use crate::config::EmbeddingConfig;

/// Failure from an embedding backend. All variants are transient from the
/// pipeline's point of view: the document stays retryable.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    Dims { expected: usize, got: usize },
}

/// One embedding backend serving one model.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedError>;
}

/// Resolves a provider for a collection's embedding model.
pub trait ProviderFactory: Send + Sync {
    fn provider_for(&self, model: &str) -> Result<Arc<dyn EmbeddingProvider>>;
}

/// Factory backed by `[embedding]` config: every model name is served by
/// the configured backend kind.
pub struct ConfigProviderFactory {
    config: EmbeddingConfig,
}

impl ConfigProviderFactory {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self { config }
    }
}

impl ProviderFactory for ConfigProviderFactory {
    fn provider_for(&self, model: &str) -> Result<Arc<dyn EmbeddingProvider>> {
        match self.config.provider.as_str() {
            "remote" => Ok(Arc::new(RemoteProvider::new(&self.config, model)?)),
            "hashed" => Ok(Arc::new(HashedProvider::new(
                model,
                self.config.dims.unwrap_or(HashedProvider::DEFAULT_DIMS),
            ))),
            other => bail!("Unknown embedding provider: {}", other),
        }
    }
}

/// Split `texts` at the configured batch size and concatenate the results.
pub async fn embed_in_batches(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
    let batch_size = batch_size.max(1);
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        let mut vectors = provider.embed_batch(batch).await?;
        if vectors.len() != batch.len() {
            return Err(EmbedError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                batch.len(),
                vectors.len()
            )));
        }
        out.append(&mut vectors);
    }
    Ok(out)
}

/// Embed a single query text.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> std::result::Result<Vec<f32>, EmbedError> {
    let results = provider.embed_batch(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| EmbedError::InvalidResponse("empty embedding response".to_string()))
}

// ============ Remote Provider ============

/// Known model dimensionalities; config `dims` overrides.
fn builtin_dims(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

/// Embedding provider calling an OpenAI-compatible embeddings endpoint.
pub struct RemoteProvider {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl RemoteProvider {
    /// # Errors
    ///
    /// Returns an error if dimensionality cannot be determined for `model`
    /// (neither built in nor set via `embedding.dims`).
    pub fn new(config: &EmbeddingConfig, model: &str) -> Result<Self> {
        let dims = config
            .dims
            .or_else(|| builtin_dims(model))
            .ok_or_else(|| {
                anyhow::anyhow!("embedding.dims required for unknown model {}", model)
            })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let api_key = std::env::var(&config.api_key_env).ok();
        Ok(Self {
            client,
            url: config.url.clone(),
            api_key,
            model: model.to_string(),
            dims,
            max_retries: config.max_retries,
        })
    }

    async fn request_once(
        &self,
        body: &serde_json::Value,
    ) -> std::result::Result<Vec<Vec<f32>>, RequestOutcome> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.map_err(|e| {
            RequestOutcome::Retry(EmbedError::Request(e.to_string()))
        })?;
        let status = response.status();

        if status.is_success() {
            let json: serde_json::Value = response.json().await.map_err(|e| {
                RequestOutcome::Retry(EmbedError::InvalidResponse(e.to_string()))
            })?;
            return parse_embeddings_response(&json, self.dims).map_err(RequestOutcome::Fail);
        }

        let body_text = response.text().await.unwrap_or_default();
        let err = EmbedError::Api {
            status: status.as_u16(),
            body: body_text,
        };
        // Rate limited or server error retries; other client errors do not.
        if status.as_u16() == 429 || status.is_server_error() {
            Err(RequestOutcome::Retry(err))
        } else {
            Err(RequestOutcome::Fail(err))
        }
    }
}

enum RequestOutcome {
    Retry(EmbedError),
    Fail(EmbedError),
}

#[async_trait]
impl EmbeddingProvider for RemoteProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            match self.request_once(&body).await {
                Ok(vectors) => return Ok(vectors),
                Err(RequestOutcome::Retry(e)) => {
                    tracing::warn!(attempt, error = %e, "embedding request failed, retrying");
                    last_err = Some(e);
                }
                Err(RequestOutcome::Fail(e)) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| EmbedError::Request("embedding failed after retries".to_string())))
    }
}

/// Extract `data[].embedding` arrays in order, validating dimensionality.
fn parse_embeddings_response(
    json: &serde_json::Value,
    dims: usize,
) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::InvalidResponse("missing data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::InvalidResponse("missing embedding".to_string()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if vec.len() != dims {
            return Err(EmbedError::Dims {
                expected: dims,
                got: vec.len(),
            });
        }
        embeddings.push(vec);
    }
    Ok(embeddings)
}

// ============ Hashed Provider ============

/// Deterministic bag-of-tokens embedding: each token hashes to one axis.
///
/// The same text always produces the same vector, which is what the
/// rebuild-idempotence guarantees lean on in tests.
pub struct HashedProvider {
    model: String,
    dims: usize,
}

impl HashedProvider {
    pub const DEFAULT_DIMS: usize = 256;

    pub fn new(model: &str, dims: usize) -> Self {
        Self {
            model: model.to_string(),
            dims: dims.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let axis = (fnv1a(token.to_ascii_lowercase().as_bytes()) % self.dims as u64) as usize;
            v[axis] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashedProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
