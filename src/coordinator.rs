//! Tiered cache coordination.
//!
//! Orchestrates the full `get_context` path: L1 process memory → L2
//! distributed key-value store → L3 origin derivation, with a
//! process-local single-flight registry so N concurrent cold callers
//! trigger at most one origin fetch in this process. The registry does
//! not span processes; two instances hitting a simultaneous cold cache
//! may each fetch once — a bounded inefficiency, not a correctness
//! problem, because L2 writes are whole-value overwrites carrying their
//! own freshness timestamp.
//!
//! Failure semantics: an origin failure with no cached snapshot yields
//! an empty bundle and `not_synced`; with any stale snapshot present,
//! stale data is preferred over failure. L2 problems never propagate —
//! the tier degrades to a miss or no-op.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::assets::BinaryAssetUploadManager;
use crate::cache::{decode_snapshot, encode_snapshot, CacheState, KeyValueStore};
use crate::config::{CacheConfig, RetrievalConfig};
use crate::error::{RelayError, Result};
use crate::index::{assemble_context_block, full_text_block, VectorIndexer};
use crate::models::{
    AssetRef, ContextBundle, ContextSnapshot, ContextStatus, DocumentContent, FolderScope,
    SnapshotDocument, SourceDocument, SyncState, SyncStats,
};
use crate::origin::OriginFetchAdapter;

/// Bound on a single L2 round-trip before it degrades to a miss/no-op.
const KV_OP_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on the retrieval path before it degrades to full-text fallback.
const RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(20);

type FetchOutcome = Result<ContextSnapshot>;

/// Process-local registry of in-flight origin fetches, keyed by cache
/// key. The first caller installs a shared cell and runs the fetch;
/// concurrent callers await the same cell instead of issuing new work.
#[derive(Default)]
struct InflightRegistry {
    cells: std::sync::Mutex<HashMap<String, Arc<OnceCell<FetchOutcome>>>>,
}

impl InflightRegistry {
    fn cell(&self, key: &str) -> Arc<OnceCell<FetchOutcome>> {
        self.cells
            .lock()
            .expect("inflight registry poisoned")
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Remove the entry once its fetch settled, so the next miss starts
    /// a fresh fetch. Safe to call from every coalesced caller.
    fn settle(&self, key: &str, cell: &Arc<OnceCell<FetchOutcome>>) {
        let mut map = self.cells.lock().expect("inflight registry poisoned");
        if let Some(existing) = map.get(key) {
            if Arc::ptr_eq(existing, cell) {
                map.remove(key);
            }
        }
    }

    fn is_busy(&self) -> bool {
        !self
            .cells
            .lock()
            .expect("inflight registry poisoned")
            .is_empty()
    }
}

/// The coordinator assembling, caching, and serving context bundles.
pub struct TieredCacheCoordinator {
    adapter: OriginFetchAdapter,
    assets: Option<BinaryAssetUploadManager>,
    indexer: Option<VectorIndexer>,
    kv: Option<Arc<dyn KeyValueStore>>,
    l1: CacheState,
    inflight: InflightRegistry,
    cache_key: String,
    cache_cfg: CacheConfig,
    retrieval_cfg: RetrievalConfig,
}

impl TieredCacheCoordinator {
    pub fn new(
        adapter: OriginFetchAdapter,
        assets: Option<BinaryAssetUploadManager>,
        indexer: Option<VectorIndexer>,
        kv: Option<Arc<dyn KeyValueStore>>,
        cache_key: String,
        cache_cfg: CacheConfig,
        retrieval_cfg: RetrievalConfig,
    ) -> Self {
        Self {
            adapter,
            assets,
            indexer,
            kv,
            l1: CacheState::new(),
            inflight: InflightRegistry::default(),
            cache_key,
            cache_cfg,
            retrieval_cfg,
        }
    }

    /// Assemble the context bundle for a folder scope. Never fails:
    /// document-source problems degrade to an empty or stale bundle.
    pub async fn get_context(&self, scope: &FolderScope) -> ContextBundle {
        match self.current_snapshot(false).await {
            Some(snapshot) => bundle_from(&snapshot, scope),
            None => ContextBundle::default(),
        }
    }

    /// Retrieval-backed context block for a question: vector query with
    /// score thresholding and per-document diversification, falling back
    /// to the full concatenated text when nothing clears the threshold
    /// or the vector backend is unavailable.
    pub async fn retrieve(&self, question: &str, scope: &FolderScope) -> ContextBundle {
        let Some(snapshot) = self.current_snapshot(false).await else {
            return ContextBundle::default();
        };
        let accessible: Vec<&SnapshotDocument> = snapshot
            .documents
            .iter()
            .filter(|d| scope.allows(&d.folder_tag))
            .collect();

        let matches = match &self.indexer {
            Some(indexer) => {
                match with_timeout(
                    RETRIEVAL_TIMEOUT,
                    "vector retrieval",
                    indexer.query(question, scope, &self.retrieval_cfg),
                )
                .await
                {
                    Ok(matches) => matches,
                    Err(err) => {
                        warn!(error = %err, "retrieval failed; falling back to full text");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let mut bundle = bundle_from(&snapshot, scope);
        bundle.text_block = assemble_context_block(&matches, &accessible, &self.retrieval_cfg);
        bundle
    }

    /// Current pipeline state for operators and health probes.
    pub async fn get_status(&self) -> ContextStatus {
        if let Some(snapshot) = self.l1.load().await {
            return status_from(&snapshot);
        }
        if let Some(snapshot) = self.read_l2().await {
            self.l1.store(snapshot.clone()).await;
            return status_from(&snapshot);
        }
        ContextStatus {
            state: if self.inflight.is_busy() {
                SyncState::Loading
            } else {
                SyncState::NotSynced
            },
            file_count: 0,
            file_names: Vec::new(),
            last_synced: None,
        }
    }

    /// Force a fresh origin derivation, coalescing with any fetch that
    /// is already in flight. Returns the resulting status.
    pub async fn trigger_sync(&self) -> Result<ContextStatus> {
        match self.current_snapshot(true).await {
            Some(_) => Ok(self.get_status().await),
            None => Err(RelayError::TransientFetch(
                "origin sync failed and no cached snapshot exists".into(),
            )),
        }
    }

    /// Re-chunk, re-embed, and re-upsert everything in the current
    /// snapshot, fetching from origin if no snapshot is cached.
    pub async fn trigger_index_rebuild(&self) -> Result<SyncStats> {
        let indexer = self
            .indexer
            .as_ref()
            .ok_or_else(|| RelayError::Configuration("vector index is not configured".into()))?;
        let snapshot = self
            .current_snapshot(false)
            .await
            .ok_or_else(|| RelayError::TransientFetch("no snapshot available to index".into()))?;

        let documents: Vec<SourceDocument> = snapshot.documents.iter().map(as_source).collect();
        indexer.sync(&documents).await
    }

    /// Reset L1 and delete the L2 entry. The next request re-derives
    /// from origin.
    pub async fn clear_cache(&self) {
        self.l1.reset().await;
        if let Some(kv) = &self.kv {
            let outcome = with_timeout(KV_OP_TIMEOUT, "kv delete", kv.delete(&self.cache_key)).await;
            if let Err(err) = outcome {
                warn!(error = %err, "l2 delete failed; entry expires by ttl");
            }
        }
        info!("context cache cleared");
    }

    // ---- tier walk ----

    /// Resolve a snapshot through the tiers. `force` skips the
    /// freshness checks (but still coalesces concurrent fetches).
    /// Returns `None` only when the origin fails and no snapshot — not
    /// even a stale one — exists anywhere.
    async fn current_snapshot(&self, force: bool) -> Option<ContextSnapshot> {
        let now = Utc::now();
        let l1_snapshot = self.l1.load().await;

        if !force {
            if let Some(snapshot) = &l1_snapshot {
                if snapshot.age_secs(now) < self.cache_cfg.context_ttl_secs {
                    debug!("l1 hit");
                    return Some(snapshot.clone());
                }
            }
        }

        let l2_snapshot = if force { None } else { self.read_l2().await };
        if let Some(snapshot) = &l2_snapshot {
            if snapshot.age_secs(now) < self.cache_cfg.context_ttl_secs {
                debug!("l2 hit; hydrating l1");
                self.l1.store(snapshot.clone()).await;
                return Some(snapshot.clone());
            }
        }

        // Cold or stale everywhere: derive from origin, single-flight.
        let cell = self.inflight.cell(&self.cache_key);
        let outcome = cell
            .get_or_init(|| self.refresh_from_origin())
            .await
            .clone();
        self.inflight.settle(&self.cache_key, &cell);

        match outcome {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                let stale = l1_snapshot.or(l2_snapshot);
                match stale {
                    Some(snapshot) => {
                        warn!(error = %err, "origin refresh failed; serving stale snapshot");
                        Some(snapshot)
                    }
                    None => {
                        warn!(error = %err, "origin refresh failed with no cached snapshot");
                        None
                    }
                }
            }
        }
    }

    /// The L3 derivation: fetch and classify the origin tree, upload
    /// binaries, sync the vector index, then populate L1 synchronously
    /// and write L2 before returning (process memory may not survive to
    /// the next invocation).
    async fn refresh_from_origin(&self) -> FetchOutcome {
        let documents = self.adapter.fetch_all().await?;

        let mut snapshot_docs = Vec::with_capacity(documents.len());
        for doc in &documents {
            match &doc.content {
                DocumentContent::Text(text) => snapshot_docs.push(SnapshotDocument {
                    source_id: doc.id.clone(),
                    file_name: doc.name.clone(),
                    folder_tag: doc.folder_tag.clone(),
                    text: Some(text.clone()),
                    asset: None,
                }),
                DocumentContent::Binary(bytes) => {
                    let Some(assets) = &self.assets else {
                        warn!(file = %doc.name, "asset host not configured; skipping binary");
                        continue;
                    };
                    match assets
                        .get_or_upload(&doc.id, bytes, &doc.name, &doc.mime_type)
                        .await
                    {
                        Ok(asset) => snapshot_docs.push(SnapshotDocument {
                            source_id: doc.id.clone(),
                            file_name: doc.name.clone(),
                            folder_tag: doc.folder_tag.clone(),
                            text: None,
                            asset: Some(asset),
                        }),
                        Err(err) => {
                            // Isolated to this file; the sync continues.
                            warn!(file = %doc.name, error = %err, "asset upload failed; skipping binary");
                        }
                    }
                }
            }
        }

        if let Some(indexer) = &self.indexer {
            if let Err(err) = indexer.sync(&documents).await {
                // The bundle is derivable without the index; retrieval
                // degrades to full text until the next refresh.
                warn!(error = %err, "vector index sync failed; continuing without index");
            }
        }

        let snapshot = ContextSnapshot {
            documents: snapshot_docs,
            synced_at: Utc::now(),
        };

        self.l1.store(snapshot.clone()).await;
        self.write_l2(&snapshot).await;

        info!(files = snapshot.documents.len(), "context snapshot refreshed");
        Ok(snapshot)
    }

    async fn read_l2(&self) -> Option<ContextSnapshot> {
        let kv = self.kv.as_ref()?;
        let blob = match with_timeout(KV_OP_TIMEOUT, "kv get", kv.get(&self.cache_key)).await {
            Ok(blob) => blob?,
            Err(err) => {
                warn!(error = %err, "l2 read failed; treating as miss");
                return None;
            }
        };
        match decode_snapshot(&blob) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(error = %err, "l2 blob undecodable; treating as miss");
                None
            }
        }
    }

    async fn write_l2(&self, snapshot: &ContextSnapshot) {
        let Some(kv) = &self.kv else { return };
        let blob = match encode_snapshot(snapshot) {
            Ok(blob) => blob,
            Err(err) => {
                warn!(error = %err, "snapshot encoding failed; skipping l2 write");
                return;
            }
        };
        let outcome = with_timeout(
            KV_OP_TIMEOUT,
            "kv set",
            kv.set(&self.cache_key, &blob, self.cache_cfg.kv_ttl_secs),
        )
        .await;
        if let Err(err) = outcome {
            warn!(error = %err, "l2 write failed; next process pays a cold fetch");
        }
    }
}

/// Scope-filtered view over a snapshot.
fn bundle_from(snapshot: &ContextSnapshot, scope: &FolderScope) -> ContextBundle {
    let accessible: Vec<&SnapshotDocument> = snapshot
        .documents
        .iter()
        .filter(|d| scope.allows(&d.folder_tag))
        .collect();

    let text_block = full_text_block(&accessible);
    let binary_asset_refs = accessible
        .iter()
        .filter_map(|d| {
            d.asset.as_ref().map(|asset| AssetRef {
                provider_uri: asset.provider_uri.clone(),
                mime_type: asset.mime_type.clone(),
                file_name: d.file_name.clone(),
            })
        })
        .collect();
    let source_file_names = accessible.iter().map(|d| d.file_name.clone()).collect();

    ContextBundle {
        text_block,
        binary_asset_refs,
        source_file_names,
    }
}

fn status_from(snapshot: &ContextSnapshot) -> ContextStatus {
    ContextStatus {
        state: SyncState::Synced,
        file_count: snapshot.documents.len(),
        file_names: snapshot
            .documents
            .iter()
            .map(|d| d.file_name.clone())
            .collect(),
        last_synced: Some(snapshot.synced_at),
    }
}

/// Rebuild a [`SourceDocument`] view from a snapshot entry, for index
/// resyncs that should not refetch the origin. Binary payloads are not
/// retained in snapshots; an empty body stands in, which is fine because
/// only the id participates in orphan collection.
fn as_source(doc: &SnapshotDocument) -> SourceDocument {
    SourceDocument {
        id: doc.source_id.clone(),
        name: doc.file_name.clone(),
        mime_type: match &doc.text {
            Some(_) => "text/plain".to_string(),
            None => doc
                .asset
                .as_ref()
                .map(|a| a.mime_type.clone())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        },
        folder_tag: doc.folder_tag.clone(),
        content: match &doc.text {
            Some(text) => DocumentContent::Text(text.clone()),
            None => DocumentContent::Binary(Vec::new()),
        },
    }
}

/// Bound a collaborator call; expiry resolves to a transient error the
/// caller maps to its safe default, so slow dependencies degrade
/// gracefully instead of failing the request.
async fn with_timeout<T>(
    duration: Duration,
    label: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::TransientFetch(format!("{} timed out", label))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UploadedAsset;
    use chrono::Duration as ChronoDuration;

    fn snapshot_with_docs() -> ContextSnapshot {
        ContextSnapshot {
            documents: vec![
                SnapshotDocument {
                    source_id: "pub-doc".into(),
                    file_name: "welcome.md".into(),
                    folder_tag: "public".into(),
                    text: Some("Welcome text".into()),
                    asset: None,
                },
                SnapshotDocument {
                    source_id: "staff-doc".into(),
                    file_name: "roster.md".into(),
                    folder_tag: "staff".into(),
                    text: Some("Roster text".into()),
                    asset: None,
                },
                SnapshotDocument {
                    source_id: "staff-img".into(),
                    file_name: "badge.png".into(),
                    folder_tag: "staff".into(),
                    text: None,
                    asset: Some(UploadedAsset {
                        source_id: "staff-img".into(),
                        provider_uri: "assets/badge".into(),
                        mime_type: "image/png".into(),
                        uploaded_at: Utc::now(),
                    }),
                },
            ],
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn wildcard_scope_returns_everything() {
        let bundle = bundle_from(&snapshot_with_docs(), &FolderScope::Wildcard);
        assert_eq!(bundle.source_file_names.len(), 3);
        assert!(bundle.text_block.contains("Welcome text"));
        assert!(bundle.text_block.contains("Roster text"));
        assert_eq!(bundle.binary_asset_refs.len(), 1);
    }

    #[test]
    fn public_scope_excludes_other_folders() {
        let scope = FolderScope::from_folders(["public"]);
        let bundle = bundle_from(&snapshot_with_docs(), &scope);
        assert_eq!(bundle.source_file_names, vec!["welcome.md"]);
        assert!(bundle.text_block.contains("Welcome text"));
        assert!(!bundle.text_block.contains("Roster text"));
        assert!(bundle.binary_asset_refs.is_empty());
    }

    #[test]
    fn snapshot_freshness_uses_synced_at() {
        let mut snapshot = snapshot_with_docs();
        snapshot.synced_at = Utc::now() - ChronoDuration::seconds(7200);
        assert!(snapshot.age_secs(Utc::now()) >= 7200);
    }

    #[test]
    fn as_source_preserves_ids_for_orphan_collection() {
        let snapshot = snapshot_with_docs();
        let docs: Vec<SourceDocument> = snapshot.documents.iter().map(as_source).collect();
        assert_eq!(docs.len(), 3);
        assert!(docs.iter().any(|d| d.id == "staff-img" && !d.is_text()));
        assert!(docs.iter().any(|d| d.id == "pub-doc" && d.is_text()));
    }

    #[tokio::test]
    async fn with_timeout_resolves_to_transient_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(42)
        };
        let result = with_timeout(Duration::from_millis(5), "slow op", slow).await;
        assert!(matches!(result, Err(RelayError::TransientFetch(_))));
    }
}
