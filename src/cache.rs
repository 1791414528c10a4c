//! Cache tiers below the origin.
//!
//! L1 is an explicit in-process [`CacheState`] value with a defined
//! construction/reset lifecycle, injected into the coordinator. L2 is a
//! remote key-value store reached over REST; every L2 failure maps to
//! [`RelayError::CacheBackend`] and every call site degrades to a miss
//! or no-op, so the pipeline always falls through toward the next tier
//! instead of raising.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::KvConfig;
use crate::error::{RelayError, Result};
use crate::models::ContextSnapshot;

/// Process-local snapshot holder (the L1 tier).
///
/// Freshness is judged by the reader against the snapshot's own
/// `synced_at`; the state deliberately keeps expired snapshots around so
/// stale data can be served when the origin fails.
#[derive(Default)]
pub struct CacheState {
    snapshot: RwLock<Option<ContextSnapshot>>,
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self) -> Option<ContextSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn store(&self, snapshot: ContextSnapshot) {
        *self.snapshot.write().await = Some(snapshot);
    }

    pub async fn reset(&self) {
        *self.snapshot.write().await = None;
    }
}

/// Distributed key-value collaborator (the L2 tier).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Serialize a snapshot for the L2 blob.
pub fn encode_snapshot(snapshot: &ContextSnapshot) -> Result<String> {
    serde_json::to_string(snapshot).map_err(|e| RelayError::CacheBackend(e.to_string()))
}

/// Deserialize an L2 blob. Garbage decodes as a miss at the call site.
pub fn decode_snapshot(blob: &str) -> Result<ContextSnapshot> {
    serde_json::from_str(blob).map_err(|e| RelayError::CacheBackend(e.to_string()))
}

// ============ HTTP key-value client ============

/// Key-value client against a Redis-compatible REST API.
///
/// | Call | Endpoint |
/// |------|----------|
/// | `get` | `GET {url}/get/{key}` |
/// | `set` | `POST {url}/set/{key}?EX={ttl}` (value as body) |
/// | `delete` | `POST {url}/del/{key}` |
pub struct HttpKvStore {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpKvStore {
    pub fn new(config: &KvConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| RelayError::Configuration("kv.url not set".into()))?;
        let token = std::env::var(&config.token_env).map_err(|_| {
            RelayError::Configuration(format!("{} environment variable not set", config.token_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl KeyValueStore for HttpKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(format!("{}/get/{}", self.url, key))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| RelayError::CacheBackend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::CacheBackend(format!(
                "kv get returned {}",
                response.status()
            )));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RelayError::CacheBackend(e.to_string()))?;
        Ok(parse_kv_result(&json))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/set/{}?EX={}", self.url, key, ttl_secs))
            .bearer_auth(&self.token)
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| RelayError::CacheBackend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::CacheBackend(format!(
                "kv set returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/del/{}", self.url, key))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| RelayError::CacheBackend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::CacheBackend(format!(
                "kv del returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Parse a `{"result": <string|null>}` payload. Anything else logs and
/// reads as a miss.
fn parse_kv_result(json: &serde_json::Value) -> Option<String> {
    match json.get("result") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Null) | None => None,
        Some(other) => {
            warn!(kind = %value_kind(other), "unexpected kv result type; treating as miss");
            None
        }
    }
}

fn value_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
