//! Core data models used throughout Context Relay.
//!
//! These types represent the documents, chunks, uploaded assets, and
//! context bundles that flow through the assembly and retrieval pipeline.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Folder tag assigned to files living directly under the origin root.
pub const PUBLIC_TAG: &str = "public";

/// Token in a role mapping that grants access to every folder.
pub const WILDCARD_TOKEN: &str = "*";

/// A document pulled from the origin store during one sync.
///
/// Superseded wholesale on the next sync; there is no partial update.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Origin-assigned identifier.
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Lowercased top-level subfolder name, or [`PUBLIC_TAG`] for
    /// root-level files. Inherited by all descendants.
    pub folder_tag: String,
    pub content: DocumentContent,
}

/// Materialized content of a [`SourceDocument`].
#[derive(Debug, Clone)]
pub enum DocumentContent {
    /// Natively text-exportable, or text extracted from a binary.
    Text(String),
    /// Opaque supported binary kept as bytes for asset upload.
    Binary(Vec<u8>),
}

impl SourceDocument {
    pub fn is_text(&self) -> bool {
        matches!(self.content, DocumentContent::Text(_))
    }

    /// Text content, or `None` for binary documents.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            DocumentContent::Text(t) => Some(t),
            DocumentContent::Binary(_) => None,
        }
    }
}

/// A chunk of a document's text, the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `"{source_id}:{chunk_index}"` — deterministic across syncs.
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Metadata carried alongside each chunk into the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub folder_tag: String,
    pub file_name: String,
    pub source_id: String,
    pub chunk_index: i64,
}

/// A binary asset uploaded to the inference-time asset host.
///
/// Reused only while inside the configured reuse window, which is kept
/// shorter than the provider's hard expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedAsset {
    pub source_id: String,
    pub provider_uri: String,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Per-document entry of a [`ContextSnapshot`].
///
/// Folder tags are retained here so that scoped requests can be served
/// from either cache tier without another origin fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub source_id: String,
    pub file_name: String,
    pub folder_tag: String,
    /// Present for text documents.
    pub text: Option<String>,
    /// Present for binary documents that were uploaded as assets.
    pub asset: Option<UploadedAsset>,
}

/// The materialized result of one origin derivation, held in L1 and
/// serialized as the L2 blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub documents: Vec<SnapshotDocument>,
    pub synced_at: DateTime<Utc>,
}

impl ContextSnapshot {
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.synced_at).num_seconds()
    }
}

/// The unit returned to callers from `get_context` and `retrieve`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextBundle {
    pub text_block: String,
    pub binary_asset_refs: Vec<AssetRef>,
    pub source_file_names: Vec<String>,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.text_block.is_empty() && self.binary_asset_refs.is_empty()
    }
}

/// Reference to an uploaded asset, handed to the generative-AI caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRef {
    pub provider_uri: String,
    pub mime_type: String,
    pub file_name: String,
}

/// Pipeline state reported by `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    NotSynced,
    Loading,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Synced => write!(f, "synced"),
            SyncState::NotSynced => write!(f, "not_synced"),
            SyncState::Loading => write!(f, "loading"),
        }
    }
}

/// Status summary for operators and health probes.
#[derive(Debug, Clone)]
pub struct ContextStatus {
    pub state: SyncState,
    pub file_count: usize,
    pub file_names: Vec<String>,
    pub last_synced: Option<DateTime<Utc>>,
}

/// Folder scope resolved from a caller's roles.
///
/// Tags are lowercased; membership checks are exact, never content-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderScope {
    /// Full access; no filtering applied.
    Wildcard,
    Folders(BTreeSet<String>),
}

impl FolderScope {
    /// Build a scope from raw folder names, lowercasing each.
    pub fn from_folders<I, S>(folders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        FolderScope::Folders(
            folders
                .into_iter()
                .map(|f| f.as_ref().trim().to_lowercase())
                .collect(),
        )
    }

    pub fn allows(&self, folder_tag: &str) -> bool {
        match self {
            FolderScope::Wildcard => true,
            FolderScope::Folders(set) => set.contains(&folder_tag.to_lowercase()),
        }
    }
}

/// Counts reported after a vector index sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub file_count: usize,
    pub chunk_count: usize,
}

/// A scored chunk returned from the vector retriever.
#[derive(Debug, Clone)]
pub struct RetrievedMatch {
    pub chunk_id: String,
    pub score: f64,
    pub text: String,
    pub metadata: ChunkMetadata,
}
