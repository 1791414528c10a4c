//! Binary asset upload lifecycle.
//!
//! Uploads opaque binaries to the inference-time asset host and tracks
//! provider expiry. An uploaded URI is reused only while inside the
//! configured reuse window, which stays shorter than the provider's hard
//! expiry; once the window elapses the asset is re-uploaded even if the
//! old URI might still resolve, so a bundle can never carry a URI that
//! the provider deletes mid-request.
//!
//! Uploads go through a semaphore permit held for the full upload and
//! poll scope; the permit is released on every path, success or not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use crate::config::AssetConfig;
use crate::error::{RelayError, Result};
use crate::models::UploadedAsset;

/// Provider-side processing state of an uploaded asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    Processing,
    Active,
    Failed,
}

/// Result of an upload call: the provider URI plus its initial state.
#[derive(Debug, Clone)]
pub struct AssetUploadResponse {
    pub uri: String,
    pub state: AssetState,
}

/// Asset host collaborator interface.
#[async_trait]
pub trait AssetHost: Send + Sync {
    async fn upload(&self, bytes: &[u8], name: &str, mime_type: &str)
        -> Result<AssetUploadResponse>;
    async fn poll_state(&self, uri: &str) -> Result<AssetState>;
}

/// Upload manager with reuse-window caching and processing polls.
pub struct BinaryAssetUploadManager {
    host: Arc<dyn AssetHost>,
    reuse_window: chrono::Duration,
    poll_interval: Duration,
    max_polls: u32,
    uploads: Arc<Semaphore>,
    cache: Mutex<HashMap<String, UploadedAsset>>,
}

impl BinaryAssetUploadManager {
    pub fn new(host: Arc<dyn AssetHost>, config: &AssetConfig) -> Self {
        Self {
            host,
            reuse_window: chrono::Duration::seconds(config.reuse_window_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls,
            uploads: Arc::new(Semaphore::new(config.max_concurrent_uploads.max(1))),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Return a cached asset while inside the reuse window; otherwise
    /// upload, wait out provider-side processing, and cache the result.
    pub async fn get_or_upload(
        &self,
        source_id: &str,
        bytes: &[u8],
        name: &str,
        mime_type: &str,
    ) -> Result<UploadedAsset> {
        let now = Utc::now();
        {
            let cache = self.cache.lock().await;
            if let Some(asset) = cache.get(source_id) {
                if now - asset.uploaded_at < self.reuse_window {
                    debug!(file = name, uri = %asset.provider_uri, "reusing uploaded asset");
                    return Ok(asset.clone());
                }
            }
        }

        // Scratch upload slot; the permit drops on every exit path.
        let _permit = self
            .uploads
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RelayError::TransientFetch("upload slots closed".into()))?;

        let response = self.host.upload(bytes, name, mime_type).await?;
        let uri = response.uri.clone();
        self.await_active(&uri, name, response.state).await?;

        let asset = UploadedAsset {
            source_id: source_id.to_string(),
            provider_uri: uri,
            mime_type: mime_type.to_string(),
            uploaded_at: Utc::now(),
        };
        info!(file = name, uri = %asset.provider_uri, "asset uploaded");
        self.cache
            .lock()
            .await
            .insert(source_id.to_string(), asset.clone());
        Ok(asset)
    }

    async fn await_active(&self, uri: &str, name: &str, initial: AssetState) -> Result<()> {
        let mut state = initial;
        let mut polls = 0u32;
        loop {
            match state {
                AssetState::Active => return Ok(()),
                AssetState::Failed => {
                    return Err(RelayError::ProviderProcessing {
                        file: name.to_string(),
                        reason: "asset host reported a terminal processing failure".into(),
                    })
                }
                AssetState::Processing => {
                    if polls >= self.max_polls {
                        return Err(RelayError::TransientFetch(format!(
                            "asset {} still processing after {} polls",
                            uri, polls
                        )));
                    }
                    polls += 1;
                    tokio::time::sleep(self.poll_interval).await;
                    state = self.host.poll_state(uri).await?;
                }
            }
        }
    }

    /// Drop every cached asset reference. Does not delete anything on
    /// the provider side; hard expiry takes care of that.
    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}

// ============ HTTP asset host ============

/// Asset host client against a file-upload REST API.
///
/// | Call | Endpoint |
/// |------|----------|
/// | `upload` | `POST {base}/files` (raw bytes body) |
/// | `poll_state` | `GET {base}/files/{uri}` |
pub struct HttpAssetHost {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl HttpAssetHost {
    pub fn new(config: &AssetConfig) -> Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .ok_or_else(|| RelayError::Configuration("assets.api_base not set".into()))?;
        let token = std::env::var(&config.token_env).map_err(|_| {
            RelayError::Configuration(format!("{} environment variable not set", config.token_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl AssetHost for HttpAssetHost {
    async fn upload(
        &self,
        bytes: &[u8],
        name: &str,
        mime_type: &str,
    ) -> Result<AssetUploadResponse> {
        let response = self
            .client
            .post(format!("{}/files", self.api_base))
            .bearer_auth(&self.token)
            .header("content-type", mime_type)
            .header("x-file-name", name)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RelayError::TransientFetch(format!(
                "asset upload returned {}",
                response.status()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))?;
        parse_upload_response(&json)
    }

    async fn poll_state(&self, uri: &str) -> Result<AssetState> {
        let response = self
            .client
            .get(format!("{}/files/{}", self.api_base, uri))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RelayError::TransientFetch(format!(
                "asset poll returned {}",
                response.status()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))?;
        Ok(parse_state(json.get("state")))
    }
}

/// Parse an upload response `{"uri": ..., "state": ...}`.
///
/// A missing URI is an error; a missing or unknown state falls back to
/// `processing` so the poll loop decides the outcome.
fn parse_upload_response(json: &serde_json::Value) -> Result<AssetUploadResponse> {
    let uri = json
        .get("uri")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RelayError::TransientFetch("invalid upload response: missing uri".into()))?;
    Ok(AssetUploadResponse {
        uri: uri.to_string(),
        state: parse_state(json.get("state")),
    })
}

fn parse_state(value: Option<&serde_json::Value>) -> AssetState {
    match value.and_then(|v| v.as_str()) {
        Some(s) if s.eq_ignore_ascii_case("active") => AssetState::Active,
        Some(s) if s.eq_ignore_ascii_case("failed") => AssetState::Failed,
        _ => AssetState::Processing,
    }
}
