//! Concrete embedding providers and the content-hash embedding cache.
//!
//! Implementations of [`EmbeddingProvider`]:
//! - **[`DisabledProvider`]**: always fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` with batching, retry, and backoff.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed` endpoint.
//!
//! # Provider Selection
//!
//! ```rust
//! # use knowledge_harness::config::EmbeddingConfig;
//! # use knowledge_harness::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Responses are never patched up: a malformed or wrong-sized vector is an
//! error, not a zero-filled stand-in.

pub mod cache;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use knowledge_harness_core::embedding::{check_dims, EmbeddingProvider};
use knowledge_harness_core::EmbeddingError;

use crate::config::EmbeddingConfig;

pub use cache::EmbeddingCache;

/// Build the provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled Provider ============

/// A provider that refuses every request.
///
/// With this provider every chunk is keyword-indexed only, and semantic or
/// hybrid queries fail with `EmbeddingUnavailable`.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

// ============ Shared HTTP plumbing ============

struct HttpEndpoint {
    client: reqwest::Client,
    url: String,
    bearer: Option<String>,
    max_retries: u32,
    timeout_secs: u64,
    label: &'static str,
}

impl HttpEndpoint {
    fn new(
        config: &EmbeddingConfig,
        url: String,
        bearer: Option<String>,
        label: &'static str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url,
            bearer,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
            label,
        })
    }

    /// POST `body` with retry/backoff and return the parsed JSON response.
    async fn post_json(&self, body: &serde_json::Value) -> Result<serde_json::Value, EmbeddingError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&self.url).json(body);
            if let Some(token) = &self.bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json().await.map_err(|e| {
                            EmbeddingError::Provider(format!(
                                "{} returned an unreadable body: {}",
                                self.label, e
                            ))
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 {
                        last_err = Some(EmbeddingError::Quota(format!(
                            "{} API error {}: {}",
                            self.label, status, body_text
                        )));
                        continue;
                    }
                    if status.is_server_error() {
                        last_err = Some(EmbeddingError::Provider(format!(
                            "{} API error {}: {}",
                            self.label, status, body_text
                        )));
                        continue;
                    }

                    return Err(EmbeddingError::Provider(format!(
                        "{} API error {}: {}",
                        self.label, status, body_text
                    )));
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(EmbeddingError::Timeout(self.timeout_secs));
                }
                Err(e) => {
                    last_err = Some(EmbeddingError::Provider(format!(
                        "{} connection error ({}): {}",
                        self.label, self.url, e
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            EmbeddingError::Provider(format!("{} embedding failed after retries", self.label))
        }))
    }
}

fn parse_vector(value: &serde_json::Value, label: &str) -> Result<Vec<f32>, EmbeddingError> {
    value
        .as_array()
        .ok_or_else(|| EmbeddingError::Provider(format!("{label}: embedding is not an array")))?
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                EmbeddingError::Provider(format!("{label}: embedding holds a non-number"))
            })
        })
        .collect()
}

fn check_batch(
    vectors: Vec<Vec<f32>>,
    expected_len: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if vectors.len() != expected_len {
        return Err(EmbeddingError::Provider(format!(
            "expected {} embeddings, got {}",
            expected_len,
            vectors.len()
        )));
    }
    for v in &vectors {
        check_dims(dims, v)?;
    }
    Ok(vectors)
}

async fn first_of_batch<P: EmbeddingProvider + ?Sized>(
    provider: &P,
    text: &str,
) -> Result<Vec<f32>, EmbeddingError> {
    provider
        .embed_batch(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| EmbeddingError::Provider("empty embedding response".to_string()))
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API (or a compatible endpoint via `url`).
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    endpoint: HttpEndpoint,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        let endpoint = HttpEndpoint::new(
            config,
            format!("{}/v1/embeddings", base.trim_end_matches('/')),
            Some(api_key),
            "OpenAI",
        )?;
        Ok(Self {
            model,
            dims,
            endpoint,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        first_of_batch(self, text).await
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self.endpoint.post_json(&body).await?;
        check_batch(parse_openai_response(&json)?, texts.len(), self.dims)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::Provider("OpenAI response missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| EmbeddingError::Provider("OpenAI response missing embedding".into()))?;
        indexed.push((index, parse_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    endpoint: HttpEndpoint,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let endpoint = HttpEndpoint::new(
            config,
            format!("{}/api/embed", base.trim_end_matches('/')),
            None,
            "Ollama",
        )?;
        Ok(Self {
            model,
            dims,
            endpoint,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        first_of_batch(self, text).await
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self.endpoint.post_json(&body).await?;
        check_batch(parse_ollama_response(&json)?, texts.len(), self.dims)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbeddingError::Provider("Ollama response missing embeddings array".into()))?
        .iter()
        .map(|e| parse_vector(e, "Ollama"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_disabled_provider_always_fails() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.dims(), 0);
        assert!(matches!(
            provider.embed("hello").await,
            Err(EmbeddingError::Disabled)
        ));
    }

    #[test]
    fn test_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "nope".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_rejects_non_numbers() {
        let json = json!({ "embeddings": [[0.5, "x"]] });
        assert!(parse_ollama_response(&json).is_err());
        assert!(parse_openai_response(&json!({})).is_err());
    }

    #[test]
    fn test_check_batch_rejects_wrong_shape() {
        assert!(check_batch(vec![vec![1.0, 2.0]], 2, 2).is_err());
        assert!(matches!(
            check_batch(vec![vec![1.0, 2.0, 3.0]], 1, 2),
            Err(EmbeddingError::Dimension { .. })
        ));
        assert!(check_batch(vec![vec![1.0, 2.0]], 1, 2).is_ok());
    }
}
