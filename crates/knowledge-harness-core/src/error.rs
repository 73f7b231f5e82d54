//! Error taxonomy shared by every knowledge-base component.
//!
//! Callers must be able to tell "no matches" apart from "search failed",
//! so nothing in this crate collapses an error into an empty result.

use thiserror::Error;

/// Errors returned by knowledge-base operations.
#[derive(Debug, Error)]
pub enum KbError {
    /// Bad caller input: `k`, `fuzziness`, empty content, chunking params.
    #[error("validation error: {0}")]
    Validation(String),

    /// The source has a format no extraction plugin handles.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A supported format could not be turned into text.
    #[error("extraction failed for {source_name}: {reason}")]
    ExtractionFailed { source_name: String, reason: String },

    /// The embedding provider could not produce a vector.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Unknown document, version, or chunk.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Disk I/O or serialization failure while persisting state.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The operation was cancelled before it was committed.
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl KbError {
    pub fn validation(msg: impl Into<String>) -> Self {
        KbError::Validation(msg.into())
    }

    pub fn document_not_found(id: impl Into<String>) -> Self {
        KbError::NotFound {
            kind: "document",
            id: id.into(),
        }
    }

    pub fn version_not_found(id: &str, version: u32) -> Self {
        KbError::NotFound {
            kind: "version",
            id: format!("{}@v{}", id, version),
        }
    }

    /// Short machine-readable code, used by the HTTP error contract.
    pub fn code(&self) -> &'static str {
        match self {
            KbError::Validation(_) => "validation",
            KbError::UnsupportedFormat(_) => "unsupported_format",
            KbError::ExtractionFailed { .. } => "extraction_failed",
            KbError::EmbeddingUnavailable(_) => "embedding_unavailable",
            KbError::NotFound { .. } => "not_found",
            KbError::Persistence(_) => "persistence",
            KbError::Cancelled(_) => "cancelled",
        }
    }
}

/// Provider-level embedding failure.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,
    #[error("embedding request timed out after {0}s")]
    Timeout(u64),
    #[error("embedding quota exceeded: {0}")]
    Quota(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding provider error: {0}")]
    Provider(String),
}

impl From<EmbeddingError> for KbError {
    fn from(e: EmbeddingError) -> Self {
        KbError::EmbeddingUnavailable(e.to_string())
    }
}

pub type KbResult<T> = Result<T, KbError>;
