//! Embedding service client.
//!
//! Defines the [`Embedder`] collaborator interface plus an HTTP
//! implementation with batching, retry, and backoff.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 401/403 → configuration error, fail immediately
//! - other HTTP 4xx → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{RelayError, Result};

/// Embedding collaborator: text in, vector out.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| RelayError::TransientFetch("empty embedding response".into()))
    }
}

/// HTTP embedding client against a `POST {api_base}/embed` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    api_base: String,
    model: String,
    token: String,
    max_retries: u32,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .ok_or_else(|| RelayError::Configuration("embedding.api_base not set".into()))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| RelayError::Configuration("embedding.model not set".into()))?;
        let token = std::env::var(&config.token_env).map_err(|_| {
            RelayError::Configuration(format!("{} environment variable not set", config.token_env))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            api_base,
            model,
            token,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<RelayError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embed", self.api_base))
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            RelayError::TransientFetch(format!("embedding response body: {}", e))
                        })?;
                        return parse_embeddings_response(&json, texts.len());
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(RelayError::Configuration(format!(
                            "embedding service rejected credentials ({})",
                            status
                        )));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(RelayError::TransientFetch(format!(
                            "embedding service error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(RelayError::TransientFetch(format!(
                        "embedding service error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(RelayError::TransientFetch(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| RelayError::TransientFetch("embedding failed after retries".into())))
    }
}

/// Parse an `{"embeddings": [[f32, ...], ...]}` response body.
///
/// Non-numeric vector elements decay to `0.0`; a missing or short
/// `embeddings` array is an error so the caller never upserts vectors
/// misaligned with their chunk ids.
fn parse_embeddings_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            RelayError::TransientFetch("invalid embedding response: missing embeddings array".into())
        })?;

    if embeddings.len() != expected {
        return Err(RelayError::TransientFetch(format!(
            "invalid embedding response: expected {} vectors, got {}",
            expected,
            embeddings.len()
        )));
    }

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| {
                RelayError::TransientFetch("invalid embedding response: vector is not an array".into())
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}
