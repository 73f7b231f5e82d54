//! Core data models used throughout Knowledge Harness.
//!
//! These types represent the documents, chunks, search results, and version
//! snapshots that flow through the ingestion and retrieval pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form metadata attached to documents and chunks.
///
/// A `BTreeMap` keeps serialization and diffs deterministic.
pub type Metadata = BTreeMap<String, Value>;

/// Where a document's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Text,
    File,
    Url,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Text => "text",
            SourceType::File => "file",
            SourceType::Url => "url",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized document and the chunks of its current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_type: SourceType,
    pub source_name: String,
    /// Current full text.
    pub content: String,
    pub metadata: Metadata,
    /// Starts at 1; never reused for a given id.
    pub version: u32,
    pub chunks: Vec<DocumentChunk>,
    pub previous_version_refs: Vec<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Build a version-1 document with a fresh UUID and no chunks.
    pub fn new(
        source_type: SourceType,
        source_name: impl Into<String>,
        content: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_type,
            source_name: source_name.into(),
            content: content.into(),
            metadata,
            version: 1,
            chunks: Vec::new(),
            previous_version_refs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            source_type: self.source_type,
            source_name: self.source_name.clone(),
            version: self.version,
            chunk_count: self.chunks.len(),
            semantic_chunks: self.chunks.iter().filter(|c| c.indexed_semantic).count(),
            content_length: self.content.chars().count(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A bounded-length slice of a document's normalized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub chunk_index: usize,
    pub chunk_count: usize,
    /// SHA-256 of `content`; keys the embedding cache.
    pub hash: String,
    /// False when the embedding provider failed and the chunk lives only in
    /// the keyword index, pending backfill.
    pub indexed_semantic: bool,
    /// Inherited document metadata plus `source_name`, `source_type`, `version`.
    pub metadata: Metadata,
}

impl DocumentChunk {
    /// All chunk attributes flattened into one map, for filtering and for
    /// attributing a search hit back to its document.
    pub fn metadata_view(&self) -> Metadata {
        let mut view = self.metadata.clone();
        view.insert("document_id".into(), Value::from(self.document_id.clone()));
        view.insert("chunk_index".into(), Value::from(self.chunk_index as u64));
        view.insert("chunk_count".into(), Value::from(self.chunk_count as u64));
        view.insert("indexed_semantic".into(), Value::from(self.indexed_semantic));
        view
    }
}

/// Lightweight listing entry returned by `list_documents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub source_type: SourceType,
    pub source_name: String,
    pub version: u32,
    pub chunk_count: usize,
    pub semantic_chunks: usize,
    pub content_length: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata equality constraints applied to search candidates.
///
/// Every key must be present in the candidate's metadata with an equal
/// value. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(pub BTreeMap<String, Value>);

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn document(id: impl Into<String>) -> Self {
        Self::new().with("document_id", id.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.0
            .iter()
            .all(|(k, v)| metadata.get(k).is_some_and(|m| m == v))
    }
}

/// A search hit with enough context to attribute it without a second lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub source_name: String,
    pub content: String,
    pub metadata: Metadata,
    /// Fused score; nominally `[0, 1]` but not hard-bounded.
    pub score: f64,
    /// Component scores, when the chunk was a candidate in that index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f64>,
}

/// Immutable copy of a document's content and metadata at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub document_id: String,
    pub version: u32,
    pub source_type: SourceType,
    pub source_name: String,
    pub content: String,
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_from: Option<u32>,
}

impl VersionSnapshot {
    pub fn from_document(doc: &Document, rollback_from: Option<u32>) -> Self {
        Self {
            document_id: doc.id.clone(),
            version: doc.version,
            source_type: doc.source_type,
            source_name: doc.source_name.clone(),
            content: doc.content.clone(),
            metadata: doc.metadata.clone(),
            timestamp: doc.updated_at,
            rollback_from,
        }
    }
}

/// One line of a document's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub content_length: usize,
    pub rollback_from: Option<u32>,
    pub current: bool,
}

/// Metadata key-level differences between two versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataDiff {
    pub added: Metadata,
    pub removed: Metadata,
    /// key → `{ "from": old, "to": new }`
    pub changed: BTreeMap<String, ValueChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChange {
    pub from: Value,
    pub to: Value,
}

/// Content statistics between two versions. No textual line diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDiff {
    pub length_from: usize,
    pub length_to: usize,
    pub length_delta: i64,
    pub words_from: usize,
    pub words_to: usize,
    pub word_delta: i64,
    pub identical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub document_id: String,
    pub from_version: u32,
    pub to_version: u32,
    pub metadata: MetadataDiff,
    pub content: ContentDiff,
}
