use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub origin: OriginConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub assets: AssetConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Role name → allowed folder tags (or the `*` wildcard token).
    #[serde(default)]
    pub roles: std::collections::HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OriginConfig {
    /// Base URL of the origin document API.
    pub api_base: String,
    /// Identifier of the root folder to sync.
    pub root_id: String,
    #[serde(default = "default_origin_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_origin_token_env() -> String {
    "ORIGIN_API_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Freshness window for the text-context snapshot, both tiers.
    #[serde(default = "default_context_ttl_secs")]
    pub context_ttl_secs: i64,
    /// KV-side expiry for the L2 blob. Kept well above the freshness
    /// window so stale data stays retrievable when the origin fails.
    #[serde(default = "default_kv_ttl_secs")]
    pub kv_ttl_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            context_ttl_secs: default_context_ttl_secs(),
            kv_ttl_secs: default_kv_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_context_ttl_secs() -> i64 {
    3600
}
fn default_kv_ttl_secs() -> u64 {
    86_400
}
fn default_key_prefix() -> String {
    "ctxr:v1".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KvConfig {
    /// REST endpoint of the distributed key-value store. Absent = the
    /// L2 tier is disabled and the pipeline runs L1 + L3 only.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_kv_token_env")]
    pub token_env: String,
    #[serde(default = "default_kv_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_kv_token_env() -> String {
    "KV_REST_TOKEN".to_string()
}
fn default_kv_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssetConfig {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_asset_token_env")]
    pub token_env: String,
    /// Reuse window for uploaded assets. One hour under the provider's
    /// 48 h hard expiry so a reused URI can never race its deletion.
    #[serde(default = "default_reuse_window_secs")]
    pub reuse_window_secs: i64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            token_env: default_asset_token_env(),
            reuse_window_secs: default_reuse_window_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_asset_token_env() -> String {
    "ASSET_API_TOKEN".to_string()
}
fn default_reuse_window_secs() -> i64 {
    47 * 3600
}
fn default_poll_interval_ms() -> u64 {
    1500
}
fn default_max_polls() -> u32 {
    20
}
fn default_max_concurrent_uploads() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_embed_token_env")]
    pub token_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            model: None,
            token_env: default_embed_token_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embed_token_env() -> String {
    "EMBEDDING_API_TOKEN".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_index_token_env")]
    pub token_env: String,
    /// Vectors per upsert request.
    #[serde(default = "default_upsert_batch")]
    pub upsert_batch: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            token_env: default_index_token_env(),
            upsert_batch: default_upsert_batch(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_index_token_env() -> String {
    "VECTOR_INDEX_TOKEN".to_string()
}
fn default_upsert_batch() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target character budget per chunk.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Fixed-length suffix of a closed chunk seeded into the next one.
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    3200
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Diversification cap: accepted chunks per source file.
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
    /// Stop accepting matches once this many chunks are collected.
    #[serde(default = "default_target_chunk_total")]
    pub target_chunk_total: usize,
    /// Accessible text documents at or below this size are appended in
    /// full when retrieval did not already surface them.
    #[serde(default = "default_small_doc_max_chars")]
    pub small_doc_max_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
            target_chunk_total: default_target_chunk_total(),
            small_doc_max_chars: default_small_doc_max_chars(),
        }
    }
}

fn default_top_k() -> usize {
    24
}
fn default_min_score() -> f64 {
    0.35
}
fn default_max_chunks_per_doc() -> usize {
    3
}
fn default_target_chunk_total() -> usize {
    12
}
fn default_small_doc_max_chars() -> usize {
    1200
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.api_base.is_some()
    }
}

impl KvConfig {
    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.origin.root_id.trim().is_empty() {
        anyhow::bail!("origin.root_id must not be empty");
    }

    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be smaller than chunking.max_chars");
    }

    if !(0.0..=1.0).contains(&config.retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [0.0, 1.0]");
    }

    if config.retrieval.max_chunks_per_doc == 0 {
        anyhow::bail!("retrieval.max_chunks_per_doc must be >= 1");
    }

    if config.cache.context_ttl_secs <= 0 {
        anyhow::bail!("cache.context_ttl_secs must be > 0");
    }

    if config.assets.reuse_window_secs <= 0 {
        anyhow::bail!("assets.reuse_window_secs must be > 0");
    }

    // Embedding and index tiers are optional but only make sense together.
    if config.index.api_base.is_some() && !config.embedding.is_enabled() {
        anyhow::bail!("index.api_base requires embedding.api_base to be set");
    }

    Ok(config)
}
