//! Error taxonomy for the context pipeline.
//!
//! Errors are explicit values the coordinator branches on rather than
//! exceptions that short-circuit across tiers. Callers of the pipeline
//! never see a hard failure for document-source problems; each kind maps
//! to a defined degradation:
//!
//! | Kind | Degradation |
//! |------|-------------|
//! | [`RelayError::Configuration`] | immediate fallback to empty/default result, no retry |
//! | [`RelayError::TransientFetch`] | resolved by the next TTL-driven refresh |
//! | [`RelayError::PerFileExtraction`] | one document skipped, sync proceeds |
//! | [`RelayError::ProviderProcessing`] | that file's upload path only |
//! | [`RelayError::CacheBackend`] | tier degrades to a miss/no-op |

use thiserror::Error;

/// Pipeline error, cloneable so a single in-flight fetch outcome can be
/// shared with every coalesced caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Missing credentials or identifiers. Non-retryable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network or timeout failure on a collaborator call.
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    /// Extraction failed for a single document.
    #[error("extraction failed for {file}: {reason}")]
    PerFileExtraction { file: String, reason: String },

    /// The asset host reported a terminal processing failure.
    #[error("asset provider processing failed for {file}: {reason}")]
    ProviderProcessing { file: String, reason: String },

    /// The distributed cache tier is unreachable or returned garbage.
    #[error("cache backend unavailable: {0}")]
    CacheBackend(String),
}

impl RelayError {
    /// True when the error is scoped to one file and the surrounding
    /// sync should continue.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            RelayError::PerFileExtraction { .. } | RelayError::ProviderProcessing { .. }
        )
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
