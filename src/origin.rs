//! Origin document store adapter.
//!
//! Walks the origin tree recursively, tags every file with its inherited
//! top-level folder, and classifies each leaf so the rest of the
//! pipeline only ever sees [`SourceDocument`]s:
//!
//! - natively text-exportable → exported as text
//! - text-extractable binary (PDF/OOXML) → extracted; falls back to
//!   opaque handling when extraction yields nothing
//! - opaque supported binary → kept as bytes for asset upload
//! - anything else → skipped with a warning
//!
//! A failure on one file is caught and skipped; the sync continues.
//! Raw origin payloads are only touched inside the `parse_*` functions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::OriginConfig;
use crate::error::{RelayError, Result};
use crate::extract;
use crate::models::{DocumentContent, SourceDocument, PUBLIC_TAG};

/// Folder marker in origin listings.
pub const MIME_FOLDER: &str = "application/vnd.folder";

/// Opaque binaries the asset host accepts.
const SUPPORTED_BINARY_MIMES: &[&str] = &[
    "application/pdf",
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/gif",
];

/// One entry of a folder listing.
#[derive(Debug, Clone)]
pub struct OriginEntry {
    pub id: String,
    pub name: String,
    pub mime_type: String,
}

impl OriginEntry {
    pub fn is_folder(&self) -> bool {
        self.mime_type == MIME_FOLDER
    }
}

/// Origin collaborator interface.
#[async_trait]
pub trait DocumentOrigin: Send + Sync {
    /// Immediate children of a folder (files and subfolders).
    async fn list_children(&self, folder_id: &str) -> Result<Vec<OriginEntry>>;
    /// Export a natively-text document as plain text.
    async fn read_text(&self, id: &str) -> Result<String>;
    /// Download a file's raw bytes.
    async fn read_bytes(&self, id: &str) -> Result<Vec<u8>>;
}

/// How a leaf is handled, decided purely from its content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NativeText,
    ExtractableBinary,
    OpaqueBinary,
    Unsupported,
}

pub fn classify(mime_type: &str) -> Classification {
    if mime_type.starts_with("text/")
        || mime_type == "application/json"
        || mime_type == "application/vnd.document"
    {
        Classification::NativeText
    } else if extract::is_extractable(mime_type) {
        Classification::ExtractableBinary
    } else if SUPPORTED_BINARY_MIMES.contains(&mime_type) {
        Classification::OpaqueBinary
    } else {
        Classification::Unsupported
    }
}

/// Recursive fetch over a [`DocumentOrigin`].
pub struct OriginFetchAdapter {
    origin: Arc<dyn DocumentOrigin>,
    root_id: String,
}

impl OriginFetchAdapter {
    pub fn new(origin: Arc<dyn DocumentOrigin>, root_id: impl Into<String>) -> Self {
        Self {
            origin,
            root_id: root_id.into(),
        }
    }

    /// List, classify, and materialize every supported document under
    /// the root. Folder tags are assigned at listing time: root files
    /// get the `public` sentinel, everything else inherits the
    /// lowercased name of its top-level subfolder.
    pub async fn fetch_all(&self) -> Result<Vec<SourceDocument>> {
        let mut documents = Vec::new();
        let mut pending: Vec<(String, String)> = Vec::new();

        for entry in self.origin.list_children(&self.root_id).await? {
            if entry.is_folder() {
                pending.push((entry.id, entry.name.trim().to_lowercase()));
            } else {
                self.materialize(&entry, PUBLIC_TAG, &mut documents).await;
            }
        }

        while let Some((folder_id, tag)) = pending.pop() {
            let children = match self.origin.list_children(&folder_id).await {
                Ok(children) => children,
                Err(err) => {
                    warn!(folder = %folder_id, error = %err, "folder listing failed; skipping subtree");
                    continue;
                }
            };
            for entry in children {
                if entry.is_folder() {
                    // Descendants keep the top-level tag.
                    pending.push((entry.id, tag.clone()));
                } else {
                    self.materialize(&entry, &tag, &mut documents).await;
                }
            }
        }

        debug!(count = documents.len(), "origin fetch complete");
        Ok(documents)
    }

    async fn materialize(&self, entry: &OriginEntry, tag: &str, out: &mut Vec<SourceDocument>) {
        match self.load_content(entry).await {
            Ok(Some(content)) => out.push(SourceDocument {
                id: entry.id.clone(),
                name: entry.name.clone(),
                mime_type: entry.mime_type.clone(),
                folder_tag: tag.to_string(),
                content,
            }),
            Ok(None) => {
                warn!(file = %entry.name, mime = %entry.mime_type, "unsupported content type; skipping");
            }
            Err(err) => {
                warn!(file = %entry.name, error = %err, "file fetch failed; skipping");
            }
        }
    }

    async fn load_content(&self, entry: &OriginEntry) -> Result<Option<DocumentContent>> {
        match classify(&entry.mime_type) {
            Classification::NativeText => {
                let text = self.origin.read_text(&entry.id).await?;
                Ok(Some(DocumentContent::Text(text)))
            }
            Classification::ExtractableBinary => {
                let bytes = self.origin.read_bytes(&entry.id).await?;
                match extract::extract_text(&bytes, &entry.mime_type) {
                    Ok(text) if !text.trim().is_empty() => Ok(Some(DocumentContent::Text(text))),
                    Ok(_) => {
                        // Nothing extractable (scanned PDF etc.); treat
                        // as an opaque asset if the host supports it.
                        if SUPPORTED_BINARY_MIMES.contains(&entry.mime_type.as_str()) {
                            Ok(Some(DocumentContent::Binary(bytes)))
                        } else {
                            Ok(None)
                        }
                    }
                    Err(e) => Err(RelayError::PerFileExtraction {
                        file: entry.name.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
            Classification::OpaqueBinary => {
                let bytes = self.origin.read_bytes(&entry.id).await?;
                Ok(Some(DocumentContent::Binary(bytes)))
            }
            Classification::Unsupported => Ok(None),
        }
    }
}

// ============ HTTP origin client ============

/// Origin client against a REST document API.
///
/// | Call | Endpoint |
/// |------|----------|
/// | `list_children` | `GET {base}/folders/{id}/children` |
/// | `read_text` | `GET {base}/files/{id}/export?format=text` |
/// | `read_bytes` | `GET {base}/files/{id}/content` |
pub struct HttpOrigin {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl HttpOrigin {
    pub fn new(config: &OriginConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            RelayError::Configuration(format!("{} environment variable not set", config.token_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get(&self, url: String) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::TransientFetch(format!(
                "origin returned {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl DocumentOrigin for HttpOrigin {
    async fn list_children(&self, folder_id: &str) -> Result<Vec<OriginEntry>> {
        let url = format!("{}/folders/{}/children", self.api_base, folder_id);
        let json: serde_json::Value = self
            .get(url)
            .await?
            .json()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))?;
        Ok(parse_listing(&json))
    }

    async fn read_text(&self, id: &str) -> Result<String> {
        let url = format!("{}/files/{}/export?format=text", self.api_base, id);
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))
    }

    async fn read_bytes(&self, id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/files/{}/content", self.api_base, id);
        let bytes = self
            .get(url)
            .await?
            .bytes()
            .await
            .map_err(|e| RelayError::TransientFetch(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Parse a folder listing payload.
///
/// Expected shape is `{"files": [{"id", "name", "mimeType"}, ...]}`.
/// Entries without an id are dropped; a missing name falls back to
/// `"(unnamed)"` and a missing mime type to `application/octet-stream`
/// (which classifies as unsupported and is skipped downstream).
fn parse_listing(json: &serde_json::Value) -> Vec<OriginEntry> {
    let Some(files) = json.get("files").and_then(|f| f.as_array()) else {
        return Vec::new();
    };

    files
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|v| v.as_str())?;
            let name = item
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("(unnamed)");
            let mime_type = item
                .get("mimeType")
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream");
            Some(OriginEntry {
                id: id.to_string(),
                name: name.to_string(),
                mime_type: mime_type.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn classification_covers_the_four_branches() {
        assert_eq!(classify("text/markdown"), Classification::NativeText);
        assert_eq!(classify("application/vnd.document"), Classification::NativeText);
        assert_eq!(classify("application/pdf"), Classification::ExtractableBinary);
        assert_eq!(classify("image/png"), Classification::OpaqueBinary);
        assert_eq!(classify("video/mp4"), Classification::Unsupported);
    }

    #[test]
    fn parse_listing_applies_fallbacks() {
        let json = serde_json::json!({
            "files": [
                { "id": "f1", "name": "notes.md", "mimeType": "text/markdown" },
                { "id": "f2" },
                { "name": "no-id.md", "mimeType": "text/markdown" },
            ]
        });
        let entries = parse_listing(&json);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "(unnamed)");
        assert_eq!(entries[1].mime_type, "application/octet-stream");
    }

    #[test]
    fn parse_listing_tolerates_malformed_payloads() {
        assert!(parse_listing(&serde_json::json!({})).is_empty());
        assert!(parse_listing(&serde_json::json!({ "files": "nope" })).is_empty());
        assert!(parse_listing(&serde_json::json!(null)).is_empty());
    }

    // ---- adapter walk over a fake origin ----

    struct FakeOrigin {
        listings: HashMap<String, Vec<OriginEntry>>,
        texts: HashMap<String, String>,
        failing_ids: Vec<String>,
    }

    #[async_trait]
    impl DocumentOrigin for FakeOrigin {
        async fn list_children(&self, folder_id: &str) -> Result<Vec<OriginEntry>> {
            Ok(self.listings.get(folder_id).cloned().unwrap_or_default())
        }

        async fn read_text(&self, id: &str) -> Result<String> {
            if self.failing_ids.iter().any(|f| f == id) {
                return Err(RelayError::TransientFetch("boom".into()));
            }
            Ok(self.texts.get(id).cloned().unwrap_or_default())
        }

        async fn read_bytes(&self, id: &str) -> Result<Vec<u8>> {
            if self.failing_ids.iter().any(|f| f == id) {
                return Err(RelayError::TransientFetch("boom".into()));
            }
            Ok(vec![0xAB; 4])
        }
    }

    fn entry(id: &str, name: &str, mime: &str) -> OriginEntry {
        OriginEntry {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: mime.to_string(),
        }
    }

    fn fake_tree() -> FakeOrigin {
        let mut listings = HashMap::new();
        listings.insert(
            "root".to_string(),
            vec![
                entry("welcome", "welcome.md", "text/markdown"),
                entry("staff-dir", "Staff", MIME_FOLDER),
                entry("movie", "intro.mp4", "video/mp4"),
            ],
        );
        listings.insert(
            "staff-dir".to_string(),
            vec![
                entry("roster", "roster.md", "text/markdown"),
                entry("nested-dir", "Archive", MIME_FOLDER),
                entry("badge", "badge.png", "image/png"),
            ],
        );
        listings.insert(
            "nested-dir".to_string(),
            vec![entry("old-notes", "old-notes.md", "text/markdown")],
        );

        let mut texts = HashMap::new();
        texts.insert("welcome".to_string(), "Welcome!".to_string());
        texts.insert("roster".to_string(), "Names".to_string());
        texts.insert("old-notes".to_string(), "Old".to_string());

        FakeOrigin {
            listings,
            texts,
            failing_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn folder_tags_are_inherited_from_the_top_level() {
        let adapter = OriginFetchAdapter::new(Arc::new(fake_tree()), "root");
        let docs = adapter.fetch_all().await.unwrap();

        let tag_of = |id: &str| {
            docs.iter()
                .find(|d| d.id == id)
                .map(|d| d.folder_tag.clone())
                .unwrap()
        };
        assert_eq!(tag_of("welcome"), "public");
        assert_eq!(tag_of("roster"), "staff");
        assert_eq!(tag_of("badge"), "staff");
        // Nested folder inherits the top-level tag, not its own name.
        assert_eq!(tag_of("old-notes"), "staff");
    }

    #[tokio::test]
    async fn unsupported_files_are_skipped() {
        let adapter = OriginFetchAdapter::new(Arc::new(fake_tree()), "root");
        let docs = adapter.fetch_all().await.unwrap();
        assert!(docs.iter().all(|d| d.id != "movie"));
        assert_eq!(docs.len(), 4);
    }

    #[tokio::test]
    async fn per_file_failure_does_not_abort_the_sync() {
        let mut origin = fake_tree();
        origin.failing_ids.push("roster".to_string());
        let adapter = OriginFetchAdapter::new(Arc::new(origin), "root");

        let docs = adapter.fetch_all().await.unwrap();
        assert!(docs.iter().all(|d| d.id != "roster"));
        assert!(docs.iter().any(|d| d.id == "welcome"));
        assert!(docs.iter().any(|d| d.id == "old-notes"));
    }

    #[tokio::test]
    async fn binary_files_carry_bytes() {
        let adapter = OriginFetchAdapter::new(Arc::new(fake_tree()), "root");
        let docs = adapter.fetch_all().await.unwrap();
        let badge = docs.iter().find(|d| d.id == "badge").unwrap();
        assert!(!badge.is_text());
        assert!(matches!(badge.content, DocumentContent::Binary(ref b) if b == &vec![0xAB; 4]));
    }
}
