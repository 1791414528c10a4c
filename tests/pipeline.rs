//! End-to-end pipeline tests over in-memory collaborators.
//!
//! Exercises the tiered cache walk, single-flight de-duplication, scope
//! filtering, degradation paths, and the retrieval fallback without any
//! network dependency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use context_relay::assets::{AssetHost, AssetState, AssetUploadResponse, BinaryAssetUploadManager};
use context_relay::cache::KeyValueStore;
use context_relay::config::{
    AssetConfig, CacheConfig, ChunkingConfig, EmbeddingConfig, IndexConfig, RetrievalConfig,
};
use context_relay::coordinator::TieredCacheCoordinator;
use context_relay::embedding::Embedder;
use context_relay::error::{RelayError, Result};
use context_relay::index::{IdPage, VectorIndex, VectorIndexer, VectorPoint};
use context_relay::models::{FolderScope, RetrievedMatch, SyncState};
use context_relay::origin::{DocumentOrigin, OriginEntry, MIME_FOLDER};

// ---- fakes ----

struct FakeOrigin {
    listings: HashMap<String, Vec<OriginEntry>>,
    texts: HashMap<String, String>,
    fail: AtomicBool,
    root_lists: AtomicUsize,
    list_delay: Duration,
}

impl FakeOrigin {
    fn tree() -> Self {
        let entry = |id: &str, name: &str, mime: &str| OriginEntry {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: mime.to_string(),
        };

        let mut listings = HashMap::new();
        listings.insert(
            "root".to_string(),
            vec![
                entry("welcome", "welcome.md", "text/markdown"),
                entry("staff-dir", "Staff", MIME_FOLDER),
            ],
        );
        listings.insert(
            "staff-dir".to_string(),
            vec![
                entry("roster", "roster.md", "text/markdown"),
                entry("badge", "badge.png", "image/png"),
            ],
        );

        let mut texts = HashMap::new();
        texts.insert("welcome".to_string(), "Welcome to the campus.".to_string());
        texts.insert("roster".to_string(), "Staff roster contents.".to_string());

        Self {
            listings,
            texts,
            fail: AtomicBool::new(false),
            root_lists: AtomicUsize::new(0),
            list_delay: Duration::from_millis(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }
}

#[async_trait]
impl DocumentOrigin for FakeOrigin {
    async fn list_children(&self, folder_id: &str) -> Result<Vec<OriginEntry>> {
        if folder_id == "root" {
            self.root_lists.fetch_add(1, Ordering::SeqCst);
        }
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::TransientFetch("origin unreachable".into()));
        }
        Ok(self.listings.get(folder_id).cloned().unwrap_or_default())
    }

    async fn read_text(&self, id: &str) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::TransientFetch("origin unreachable".into()));
        }
        Ok(self.texts.get(id).cloned().unwrap_or_default())
    }

    async fn read_bytes(&self, _id: &str) -> Result<Vec<u8>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::TransientFetch("origin unreachable".into()));
        }
        Ok(vec![0xFF; 8])
    }
}

#[derive(Default)]
struct FakeKv {
    values: Mutex<HashMap<String, String>>,
    fail: AtomicBool,
    deletes: AtomicUsize,
}

#[async_trait]
impl KeyValueStore for FakeKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::CacheBackend("kv down".into()));
        }
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl_secs: u64) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::CacheBackend("kv down".into()));
        }
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

struct CountingHost {
    uploads: AtomicUsize,
}

#[async_trait]
impl AssetHost for CountingHost {
    async fn upload(
        &self,
        _bytes: &[u8],
        _name: &str,
        _mime_type: &str,
    ) -> Result<AssetUploadResponse> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(AssetUploadResponse {
            uri: format!("assets/{}", n),
            state: AssetState::Active,
        })
    }

    async fn poll_state(&self, _uri: &str) -> Result<AssetState> {
        Ok(AssetState::Active)
    }
}

struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.0, 1.0]).collect())
    }
}

/// Index that accepts writes and returns a canned query result.
#[derive(Default)]
struct StubIndex {
    matches: Mutex<Vec<RetrievedMatch>>,
}

#[async_trait]
impl VectorIndex for StubIndex {
    async fn upsert(&self, _points: &[VectorPoint]) -> Result<()> {
        Ok(())
    }

    async fn query(
        &self,
        _vector: &[f32],
        _top_k: usize,
        _folder_filter: Option<&std::collections::BTreeSet<String>>,
    ) -> Result<Vec<RetrievedMatch>> {
        Ok(self.matches.lock().unwrap().clone())
    }

    async fn list_ids(&self, _cursor: Option<String>) -> Result<IdPage> {
        Ok(IdPage::default())
    }

    async fn delete(&self, _ids: &[String]) -> Result<()> {
        Ok(())
    }
}

// ---- wiring ----

struct Pipeline {
    origin: Arc<FakeOrigin>,
    kv: Option<Arc<FakeKv>>,
    host: Option<Arc<CountingHost>>,
    index: Option<Arc<StubIndex>>,
    ttl_secs: i64,
}

impl Pipeline {
    fn new(origin: FakeOrigin) -> Self {
        Self {
            origin: Arc::new(origin),
            kv: None,
            host: None,
            index: None,
            ttl_secs: 3600,
        }
    }

    fn with_kv(mut self, kv: Arc<FakeKv>) -> Self {
        self.kv = Some(kv);
        self
    }

    fn with_assets(mut self) -> Self {
        self.host = Some(Arc::new(CountingHost {
            uploads: AtomicUsize::new(0),
        }));
        self
    }

    fn with_index(mut self, index: Arc<StubIndex>) -> Self {
        self.index = Some(index);
        self
    }

    fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    fn build(&self) -> TieredCacheCoordinator {
        let adapter = context_relay::origin::OriginFetchAdapter::new(self.origin.clone(), "root");
        let assets = self.host.clone().map(|host| {
            BinaryAssetUploadManager::new(
                host,
                &AssetConfig {
                    reuse_window_secs: 47 * 3600,
                    poll_interval_ms: 1,
                    ..AssetConfig::default()
                },
            )
        });
        let indexer = self.index.clone().map(|index| {
            VectorIndexer::new(
                Arc::new(StubEmbedder),
                index,
                ChunkingConfig::default(),
                &EmbeddingConfig::default(),
                &IndexConfig::default(),
            )
        });
        let kv = self
            .kv
            .clone()
            .map(|kv| kv as Arc<dyn KeyValueStore>);

        TieredCacheCoordinator::new(
            adapter,
            assets,
            indexer,
            kv,
            "test:context:root".to_string(),
            CacheConfig {
                context_ttl_secs: self.ttl_secs,
                kv_ttl_secs: 86_400,
                key_prefix: "test".to_string(),
            },
            RetrievalConfig::default(),
        )
    }
}

// ---- tests ----

#[tokio::test]
async fn cold_cache_single_flight_fetches_once() {
    let pipeline = Pipeline::new(FakeOrigin::tree().with_delay(Duration::from_millis(50)));
    let coordinator = Arc::new(pipeline.build());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.get_context(&FolderScope::Wildcard).await
        }));
    }

    for handle in handles {
        let bundle = handle.await.unwrap();
        assert!(bundle.text_block.contains("Welcome to the campus."));
    }

    assert_eq!(pipeline.origin.root_lists.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn warm_l1_serves_without_origin_calls() {
    let pipeline = Pipeline::new(FakeOrigin::tree());
    let coordinator = pipeline.build();

    coordinator.get_context(&FolderScope::Wildcard).await;
    coordinator.get_context(&FolderScope::Wildcard).await;
    coordinator.get_context(&FolderScope::Wildcard).await;

    assert_eq!(pipeline.origin.root_lists.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn public_scope_excludes_tagged_documents() {
    let pipeline = Pipeline::new(FakeOrigin::tree());
    let coordinator = pipeline.build();

    let scope = FolderScope::from_folders(["public"]);
    let bundle = coordinator.get_context(&scope).await;

    assert_eq!(bundle.source_file_names, vec!["welcome.md"]);
    assert!(!bundle.text_block.contains("Staff roster contents."));

    let all = coordinator.get_context(&FolderScope::Wildcard).await;
    assert!(all.text_block.contains("Staff roster contents."));
}

#[tokio::test]
async fn origin_failure_with_no_cache_yields_empty_not_synced() {
    let origin = FakeOrigin::tree();
    origin.fail.store(true, Ordering::SeqCst);
    let coordinator = Pipeline::new(origin).build();

    let bundle = coordinator.get_context(&FolderScope::Wildcard).await;
    assert!(bundle.is_empty());

    let status = coordinator.get_status().await;
    assert_eq!(status.state, SyncState::NotSynced);
    assert_eq!(status.file_count, 0);
}

#[tokio::test]
async fn stale_snapshot_is_preferred_over_failure() {
    // Zero TTL: every snapshot is immediately stale.
    let pipeline = Pipeline::new(FakeOrigin::tree()).with_ttl(0);
    let coordinator = pipeline.build();

    let warm = coordinator.get_context(&FolderScope::Wildcard).await;
    assert!(!warm.is_empty());

    pipeline.origin.fail.store(true, Ordering::SeqCst);
    let stale = coordinator.get_context(&FolderScope::Wildcard).await;
    assert_eq!(stale, warm);
}

#[tokio::test]
async fn l2_snapshot_survives_a_process_restart() {
    let kv = Arc::new(FakeKv::default());

    let first = Pipeline::new(FakeOrigin::tree()).with_kv(kv.clone());
    first.build().get_context(&FolderScope::Wildcard).await;
    assert_eq!(first.origin.root_lists.load(Ordering::SeqCst), 1);

    // Fresh process: empty L1, broken origin. Only L2 can serve.
    let broken_origin = FakeOrigin::tree();
    broken_origin.fail.store(true, Ordering::SeqCst);
    let second = Pipeline::new(broken_origin).with_kv(kv);
    let bundle = second.build().get_context(&FolderScope::Wildcard).await;

    assert!(bundle.text_block.contains("Welcome to the campus."));
    assert_eq!(second.origin.root_lists.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn kv_outage_degrades_to_l1_and_origin() {
    let kv = Arc::new(FakeKv::default());
    kv.fail.store(true, Ordering::SeqCst);

    let pipeline = Pipeline::new(FakeOrigin::tree()).with_kv(kv);
    let coordinator = pipeline.build();

    let bundle = coordinator.get_context(&FolderScope::Wildcard).await;
    assert!(bundle.text_block.contains("Welcome to the campus."));

    // Still answers on the warm path.
    let again = coordinator.get_context(&FolderScope::Wildcard).await;
    assert_eq!(bundle, again);
    assert_eq!(pipeline.origin.root_lists.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clear_cache_forces_a_refetch_and_deletes_l2() {
    let kv = Arc::new(FakeKv::default());
    let pipeline = Pipeline::new(FakeOrigin::tree()).with_kv(kv.clone());
    let coordinator = pipeline.build();

    coordinator.get_context(&FolderScope::Wildcard).await;
    coordinator.clear_cache().await;

    assert_eq!(kv.deletes.load(Ordering::SeqCst), 1);
    assert!(kv.values.lock().unwrap().is_empty());

    coordinator.get_context(&FolderScope::Wildcard).await;
    assert_eq!(pipeline.origin.root_lists.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn trigger_sync_bypasses_fresh_caches() {
    let pipeline = Pipeline::new(FakeOrigin::tree());
    let coordinator = pipeline.build();

    coordinator.get_context(&FolderScope::Wildcard).await;
    let status = coordinator.trigger_sync().await.unwrap();

    assert_eq!(status.state, SyncState::Synced);
    assert_eq!(pipeline.origin.root_lists.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn trigger_sync_coalesces_with_an_inflight_fetch() {
    let pipeline = Pipeline::new(FakeOrigin::tree().with_delay(Duration::from_millis(60)));
    let coordinator = Arc::new(pipeline.build());

    let warm = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.get_context(&FolderScope::Wildcard).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let status = coordinator.trigger_sync().await.unwrap();
    assert_eq!(status.state, SyncState::Synced);
    warm.await.unwrap();

    // Both callers shared the fetch that was already in flight.
    assert_eq!(pipeline.origin.root_lists.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn binary_documents_become_asset_refs_and_reuse_uploads() {
    let pipeline = Pipeline::new(FakeOrigin::tree()).with_assets();
    let coordinator = pipeline.build();

    let bundle = coordinator.get_context(&FolderScope::Wildcard).await;
    assert_eq!(bundle.binary_asset_refs.len(), 1);
    assert_eq!(bundle.binary_asset_refs[0].file_name, "badge.png");

    // A forced re-sync inside the reuse window keeps the same URI.
    coordinator.trigger_sync().await.unwrap();
    let again = coordinator.get_context(&FolderScope::Wildcard).await;
    assert_eq!(
        again.binary_asset_refs[0].provider_uri,
        bundle.binary_asset_refs[0].provider_uri
    );
    assert_eq!(
        pipeline.host.as_ref().unwrap().uploads.load(Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn retrieval_with_no_matches_equals_full_text_fallback() {
    let index = Arc::new(StubIndex::default());
    let pipeline = Pipeline::new(FakeOrigin::tree()).with_index(index);
    let coordinator = pipeline.build();

    let scope = FolderScope::from_folders(["public"]);
    let full = coordinator.get_context(&scope).await;
    let retrieved = coordinator.retrieve("anything at all", &scope).await;

    assert_eq!(retrieved.text_block, full.text_block);
    assert_eq!(retrieved.source_file_names, full.source_file_names);
}

#[tokio::test]
async fn retrieval_matches_replace_the_full_text_block() {
    let index = Arc::new(StubIndex::default());
    *index.matches.lock().unwrap() = vec![RetrievedMatch {
        chunk_id: "welcome:0".to_string(),
        score: 0.92,
        text: "Welcome to the campus.".to_string(),
        metadata: context_relay::models::ChunkMetadata {
            folder_tag: "public".to_string(),
            file_name: "welcome.md".to_string(),
            source_id: "welcome".to_string(),
            chunk_index: 0,
        },
    }];
    let pipeline = Pipeline::new(FakeOrigin::tree()).with_index(index);
    let coordinator = pipeline.build();

    let bundle = coordinator.retrieve("campus welcome", &FolderScope::Wildcard).await;
    assert!(bundle.text_block.contains("Welcome to the campus."));
    // roster.md is large enough to rank on its own, small enough for the
    // small-document append; both behaviors funnel through assembly,
    // which is unit-tested — here we just confirm the matched chunk won.
    assert!(bundle.text_block.starts_with("--- welcome.md ---"));
}

#[tokio::test]
async fn status_reports_loading_only_while_a_fetch_is_in_flight() {
    let pipeline = Pipeline::new(FakeOrigin::tree().with_delay(Duration::from_millis(80)));
    let coordinator = Arc::new(pipeline.build());

    let background = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.get_context(&FolderScope::Wildcard).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mid_fetch = coordinator.get_status().await;
    assert_eq!(mid_fetch.state, SyncState::Loading);

    background.await.unwrap();
    let after = coordinator.get_status().await;
    assert_eq!(after.state, SyncState::Synced);
    // badge.png is dropped: no asset host is configured here.
    assert_eq!(after.file_count, 2);
}
