//! Vector index synchronization and scored retrieval.
//!
//! [`VectorIndexer::sync`] keeps the external index aligned with the
//! current document set: every text document is chunked, embedded in
//! batches, upserted in fixed-size batches, and stored chunks whose
//! source vanished are garbage-collected by scanning the index.
//!
//! [`VectorIndexer::query`] embeds the query, filters by folder tag,
//! drops low-relevance matches, and diversifies so one long document
//! cannot crowd out the rest. Block assembly (including the full-text
//! fallback and the small-document append) is pure and lives in
//! [`assemble_context_block`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::chunk::chunk_document;
use crate::config::{ChunkingConfig, EmbeddingConfig, IndexConfig, RetrievalConfig};
use crate::embedding::Embedder;
use crate::error::{RelayError, Result};
use crate::models::{
    Chunk, ChunkMetadata, FolderScope, RetrievedMatch, SnapshotDocument, SourceDocument, SyncStats,
};

/// A vector plus its chunk payload, as stored in the index.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// One page of an index id scan.
#[derive(Debug, Clone, Default)]
pub struct IdPage {
    pub ids: Vec<String>,
    pub next: Option<String>,
}

/// Vector index collaborator interface.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()>;
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        folder_filter: Option<&BTreeSet<String>>,
    ) -> Result<Vec<RetrievedMatch>>;
    async fn list_ids(&self, cursor: Option<String>) -> Result<IdPage>;
    async fn delete(&self, ids: &[String]) -> Result<()>;
}

/// Keeps the index in sync and serves scored retrieval.
pub struct VectorIndexer {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    chunking: ChunkingConfig,
    embed_batch: usize,
    upsert_batch: usize,
}

impl VectorIndexer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        chunking: ChunkingConfig,
        embedding: &EmbeddingConfig,
        index_cfg: &IndexConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            chunking,
            embed_batch: embedding.batch_size.max(1),
            upsert_batch: index_cfg.upsert_batch.max(1),
        }
    }

    /// Chunk, embed, and upsert every text document, then delete stored
    /// chunks whose source id is no longer present.
    pub async fn sync(&self, documents: &[SourceDocument]) -> Result<SyncStats> {
        let text_docs: Vec<&SourceDocument> = documents.iter().filter(|d| d.is_text()).collect();
        let chunks: Vec<Chunk> = text_docs
            .iter()
            .flat_map(|d| chunk_document(d, &self.chunking))
            .collect();

        let stats = SyncStats {
            file_count: text_docs.len(),
            chunk_count: chunks.len(),
        };

        for batch in chunks.chunks(self.embed_batch) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;

            let points: Vec<VectorPoint> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| VectorPoint {
                    id: chunk.id.clone(),
                    vector,
                    text: chunk.text.clone(),
                    metadata: chunk.metadata.clone(),
                })
                .collect();

            for upsert in points.chunks(self.upsert_batch) {
                self.index.upsert(upsert).await?;
            }
        }

        let live: HashSet<&str> = documents.iter().map(|d| d.id.as_str()).collect();
        let removed = self.collect_orphans(&live).await?;
        if !removed.is_empty() {
            info!(count = removed.len(), "deleting orphaned chunks");
            for batch in removed.chunks(self.upsert_batch) {
                self.index.delete(batch).await?;
            }
        }

        info!(
            files = stats.file_count,
            chunks = stats.chunk_count,
            "vector index synced"
        );
        Ok(stats)
    }

    /// Scan the index and return ids whose source document is gone.
    async fn collect_orphans(&self, live: &HashSet<&str>) -> Result<Vec<String>> {
        let mut orphans = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.index.list_ids(cursor).await?;
            for id in page.ids {
                match source_of(&id) {
                    Some(source) if live.contains(source) => {}
                    _ => orphans.push(id),
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(orphans)
    }

    /// Embed the query and return thresholded, diversified matches.
    /// An empty result means the caller should fall back to full text.
    pub async fn query(
        &self,
        text: &str,
        scope: &FolderScope,
        cfg: &RetrievalConfig,
    ) -> Result<Vec<RetrievedMatch>> {
        let vector = self.embedder.embed(text).await?;
        let filter = match scope {
            FolderScope::Wildcard => None,
            FolderScope::Folders(set) => Some(set),
        };
        let raw = self.index.query(&vector, cfg.top_k, filter).await?;

        let mut matches: Vec<RetrievedMatch> = raw
            .into_iter()
            .filter(|m| m.score >= cfg.min_score)
            .collect();
        // Deterministic order: score desc, then id for ties.
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        let diversified = diversify(matches, cfg.max_chunks_per_doc, cfg.target_chunk_total);
        debug!(count = diversified.len(), "retrieval matches accepted");
        Ok(diversified)
    }
}

/// `"{source_id}:{index}"` → source id. Ids written by other tooling
/// (no separator) have no source and are treated as orphans.
fn source_of(chunk_id: &str) -> Option<&str> {
    chunk_id.rsplit_once(':').map(|(source, _)| source)
}

/// Cap accepted chunks per source file and stop at the target total.
fn diversify(matches: Vec<RetrievedMatch>, per_doc: usize, target_total: usize) -> Vec<RetrievedMatch> {
    let mut per_source: HashMap<String, usize> = HashMap::new();
    let mut accepted = Vec::new();
    for m in matches {
        if accepted.len() >= target_total {
            break;
        }
        let seen = per_source.entry(m.metadata.source_id.clone()).or_insert(0);
        if *seen >= per_doc {
            continue;
        }
        *seen += 1;
        accepted.push(m);
    }
    accepted
}

// ============ Context block assembly ============

/// Assemble the retrieval-backed text block.
///
/// With no surviving matches the block is the full concatenated text of
/// the accessible documents. Otherwise matched chunks are rendered in
/// score order, and any accessible text document at or below the
/// small-document threshold that retrieval did not surface is appended
/// in full — short reference material ranks poorly by similarity but is
/// too important to omit.
pub fn assemble_context_block(
    matches: &[RetrievedMatch],
    accessible: &[&SnapshotDocument],
    cfg: &RetrievalConfig,
) -> String {
    if matches.is_empty() {
        return full_text_block(accessible);
    }

    let mut sections = Vec::new();
    let mut surfaced: HashSet<&str> = HashSet::new();
    for m in matches {
        surfaced.insert(m.metadata.source_id.as_str());
        sections.push(render_section(&m.metadata.file_name, &m.text));
    }

    for doc in accessible {
        let Some(text) = doc.text.as_deref() else {
            continue;
        };
        if surfaced.contains(doc.source_id.as_str()) {
            continue;
        }
        if text.chars().count() <= cfg.small_doc_max_chars {
            sections.push(render_section(&doc.file_name, text));
        }
    }

    sections.join("\n\n")
}

/// Full concatenated text of the accessible documents, in sync order.
pub fn full_text_block(accessible: &[&SnapshotDocument]) -> String {
    accessible
        .iter()
        .filter_map(|doc| {
            doc.text
                .as_deref()
                .map(|text| render_section(&doc.file_name, text))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_section(file_name: &str, text: &str) -> String {
    format!("--- {} ---\n{}", file_name, text.trim())
}

// ============ HTTP vector index ============

/// Vector index client against a REST API.
///
/// | Call | Endpoint |
/// |------|----------|
/// | `upsert` | `POST {base}/vectors/upsert` |
/// | `query` | `POST {base}/query` |
/// | `list_ids` | `GET {base}/vectors/list` |
/// | `delete` | `POST {base}/vectors/delete` |
pub struct HttpVectorIndex {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl HttpVectorIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .ok_or_else(|| RelayError::Configuration("index.api_base not set".into()))?;
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

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::TransientFetch(format!(
                "vector index returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        let vectors: Vec<serde_json::Value> = points
            .iter()
            .map(|p| {
                serde_json::json!({
                    "id": p.id,
                    "values": p.vector,
                    "metadata": {
                        "folder_tag": p.metadata.folder_tag,
                        "file_name": p.metadata.file_name,
                        "source_id": p.metadata.source_id,
                        "chunk_index": p.metadata.chunk_index,
                        "text": p.text,
                    },
                })
            })
            .collect();
        self.post("/vectors/upsert", serde_json::json!({ "vectors": vectors }))
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        folder_filter: Option<&BTreeSet<String>>,
    ) -> Result<Vec<RetrievedMatch>> {
        let mut body = serde_json::json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
        });
        if let Some(folders) = folder_filter {
            body["filter"] = serde_json::json!({ "folder_tag": { "$in": folders } });
        }
        let json = self.post("/query", body).await?;
        Ok(parse_query_matches(&json))
    }

    async fn list_ids(&self, cursor: Option<String>) -> Result<IdPage> {
        let mut url = format!("{}/vectors/list", self.api_base);
        if let Some(cursor) = cursor {
            url.push_str(&format!("?paginationToken={}", cursor));
        }
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::TransientFetch(format!(
                "vector index returned {}",
                response.status()
            )));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))?;
        Ok(parse_id_page(&json))
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.post("/vectors/delete", serde_json::json!({ "ids": ids }))
            .await?;
        Ok(())
    }
}

/// Parse query matches. Entries without an id or metadata are dropped;
/// a missing score decays to `0.0` and thus falls to the relevance
/// threshold.
fn parse_query_matches(json: &serde_json::Value) -> Vec<RetrievedMatch> {
    let Some(items) = json.get("matches").and_then(|m| m.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|v| v.as_str())?;
            let score = item.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let meta = item.get("metadata")?;
            let metadata = ChunkMetadata {
                folder_tag: meta
                    .get("folder_tag")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                file_name: meta
                    .get("file_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("(unnamed)")
                    .to_string(),
                source_id: meta.get("source_id").and_then(|v| v.as_str())?.to_string(),
                chunk_index: meta.get("chunk_index").and_then(|v| v.as_i64()).unwrap_or(0),
            };
            let text = meta
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(RetrievedMatch {
                chunk_id: id.to_string(),
                score,
                text,
                metadata,
            })
        })
        .collect()
}

fn parse_id_page(json: &serde_json::Value) -> IdPage {
    let ids = json
        .get("vectors")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("id").and_then(|v| v.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let next = json
        .get("pagination")
        .and_then(|p| p.get("next"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    IdPage { ids, next }
}
