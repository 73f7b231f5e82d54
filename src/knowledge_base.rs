//! The knowledge-base facade: ingestion, retrieval, and version history
//! composed over one on-disk directory.
//!
//! # Concurrency
//!
//! - Readers take an `Arc` to the published [`KbState`] under a short read
//!   lock and then work lock-free, so a query sees either the state before
//!   a mutation or after it, never a mix.
//! - Mutations of one document id are serialized by a per-id async mutex.
//! - Every mutation commits copy-on-write under the commit lock: clone the
//!   published state, apply the full delta, persist it, and only then swap
//!   the pointer. A failed persist leaves the published state untouched.
//! - Embedding runs before the commit lock is taken, on a bounded pool of
//!   `embedding.concurrency` in-flight provider calls, each under
//!   `embedding.timeout_secs`.
//!
//! # Degraded indexing
//!
//! When the provider fails for a chunk, the chunk is still keyword-indexed,
//! its `indexed_semantic` flag stays `false`, and a warning is logged.
//! [`KnowledgeBase::backfill_embeddings`] retries those chunks later.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use knowledge_harness_core::embedding::{check_dims, EmbeddingProvider};
use knowledge_harness_core::hybrid::{HybridQuery, HybridRetriever, RetrievalMode};
use knowledge_harness_core::keyword_index::{tokenize, KeywordIndex};
use knowledge_harness_core::models::{
    Document, DocumentChunk, DocumentSummary, Metadata, MetadataFilter, ScoredChunk, VersionDiff,
    VersionInfo, VersionSnapshot,
};
use knowledge_harness_core::vector_index::VectorIndex;
use knowledge_harness_core::version::{snapshot_to_document, VersionStore};
use knowledge_harness_core::{EmbeddingError, KbError, KbResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::embedding::EmbeddingCache;
use crate::persist::{chunk_metadata, Delta, Snapshot, Storage};
use crate::processor::{DocumentProcessor, Source};

/// Chunks sent to the provider per request.
const EMBED_BATCH: usize = 16;

/// Immutable published view of every index.
#[derive(Debug, Clone, Default)]
struct KbState {
    documents: HashMap<String, Arc<Document>>,
    /// chunk id → (document id, position in `chunks`)
    chunk_owner: HashMap<String, (String, usize)>,
    vectors: VectorIndex,
    keywords: KeywordIndex,
    versions: VersionStore,
}

impl KbState {
    fn chunk(&self, chunk_id: &str) -> Option<&DocumentChunk> {
        let (doc_id, idx) = self.chunk_owner.get(chunk_id)?;
        self.documents.get(doc_id)?.chunks.get(*idx)
    }

    /// Remove a document and every one of its chunks from both indexes.
    fn unindex(&mut self, document_id: &str) -> Option<Arc<Document>> {
        let old = self.documents.remove(document_id)?;
        for chunk in &old.chunks {
            self.keywords.delete(&chunk.id);
            self.vectors.delete(&chunk.id);
            self.chunk_owner.remove(&chunk.id);
        }
        Some(old)
    }

    /// Replace the indexed chunk set of `doc.id` with `doc.chunks`.
    ///
    /// Chunks with an entry in `vectors` go into both indexes; the rest are
    /// keyword-only with `indexed_semantic = false`.
    fn index(
        &mut self,
        mut doc: Document,
        vectors: &HashMap<String, Arc<[f32]>>,
    ) -> KbResult<Arc<Document>> {
        self.unindex(&doc.id);
        for (idx, chunk) in doc.chunks.iter_mut().enumerate() {
            chunk.indexed_semantic = vectors.contains_key(&chunk.id);
            if let Some(vector) = vectors.get(&chunk.id) {
                self.vectors
                    .add_shared(&chunk.id, vector.clone(), chunk.metadata_view())?;
            }
            self.keywords
                .add(&chunk.id, &chunk.content, chunk.metadata_view());
            self.chunk_owner
                .insert(chunk.id.clone(), (doc.id.clone(), idx));
        }
        let doc = Arc::new(doc);
        self.documents.insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    fn rebuild_keywords(&mut self) {
        let mut keywords = KeywordIndex::new();
        for doc in self.documents.values() {
            for chunk in &doc.chunks {
                keywords.add(&chunk.id, &chunk.content, chunk.metadata_view());
            }
        }
        self.keywords = keywords;
    }
}

/// A search request. `k` and `fuzziness` default to the `[retrieval]` config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub fuzziness: Option<i64>,
    #[serde(default)]
    pub filter: MetadataFilter,
    /// In hybrid mode, fall back to keyword scores when the query cannot be
    /// embedded instead of failing with `EmbeddingUnavailable`.
    #[serde(default)]
    pub allow_keyword_fallback: bool,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn fuzziness(mut self, fuzziness: i64) -> Self {
        self.fuzziness = Some(fuzziness);
        self
    }

    pub fn filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn allow_keyword_fallback(mut self, allow: bool) -> Self {
        self.allow_keyword_fallback = allow;
        self
    }
}

/// Result of indexing one document version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub version: u32,
    pub chunk_count: usize,
    pub semantic_chunks: usize,
    pub keyword_only_chunks: usize,
    /// First provider error when some chunks fell back to keyword-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<IngestOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchItemError>,
}

/// Per-source results of [`KnowledgeBase::ingest_batch`], in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub documents: usize,
    pub chunks_embedded: usize,
    pub chunks_failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub documents: usize,
    pub chunks: usize,
    pub keyword_tokens: usize,
    pub vector_entries: usize,
    pub reclaimed_slots: usize,
    pub pruned_cache_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbStats {
    pub documents: usize,
    pub chunks: usize,
    pub semantic_chunks: usize,
    pub keyword_only_chunks: usize,
    pub keyword_tokens: usize,
    pub vector_entries: usize,
    pub vector_slots: usize,
    pub vector_dims: Option<usize>,
    pub version_snapshots: usize,
    pub cache_entries: usize,
    pub embedding_model: String,
}

struct CacheSlot {
    cache: EmbeddingCache,
    dirty: bool,
}

struct Embedded {
    vectors: HashMap<String, Arc<[f32]>>,
    error: Option<String>,
}

/// A held per-document lock. Dropping it, including when the owning future
/// is cancelled, forgets the map entry once nobody else waits on it.
struct DocumentGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    document_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DocumentGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.document_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct KnowledgeBase {
    config: Config,
    processor: DocumentProcessor,
    provider: Arc<dyn EmbeddingProvider>,
    storage: Storage,
    state: RwLock<Arc<KbState>>,
    commit_lock: Mutex<()>,
    doc_locks: DashMap<String, Arc<Mutex<()>>>,
    cache: StdMutex<CacheSlot>,
    embed_permits: Arc<Semaphore>,
}

impl KnowledgeBase {
    /// Open (or create) the knowledge base under `config.storage.dir`.
    ///
    /// Vectors are restored from the embedding cache; chunks whose vector
    /// cannot be recovered are flagged `indexed_semantic = false` for
    /// [`backfill_embeddings`](Self::backfill_embeddings).
    pub fn open(config: Config, provider: Arc<dyn EmbeddingProvider>) -> KbResult<Self> {
        config
            .validate()
            .map_err(|e| KbError::Validation(format!("{e:#}")))?;
        let processor = DocumentProcessor::new(&config)?;
        let storage = Storage::open(&config.storage.dir)?;
        let loaded = storage.load()?;

        let cache = if config.embedding.cache {
            EmbeddingCache::adopt(loaded.cache, provider.model_name(), provider.dims())
        } else {
            EmbeddingCache::new(provider.model_name(), provider.dims())
        };

        let mut state = KbState {
            versions: loaded.versions,
            ..KbState::default()
        };
        let documents = reconcile(loaded.documents, &mut state.versions, &processor)?;

        let mut lost_vectors = 0usize;
        for (id, mut doc) in documents {
            for (idx, chunk) in doc.chunks.iter_mut().enumerate() {
                match cache.get(&chunk.hash) {
                    Some(vector) => {
                        chunk.indexed_semantic = true;
                        state
                            .vectors
                            .add_shared(&chunk.id, vector.clone(), chunk.metadata_view())?;
                    }
                    None => {
                        if chunk.indexed_semantic {
                            lost_vectors += 1;
                        }
                        chunk.indexed_semantic = false;
                    }
                }
                state.chunk_owner.insert(chunk.id.clone(), (id.clone(), idx));
            }
            state.documents.insert(id, Arc::new(doc));
        }
        if lost_vectors > 0 {
            tracing::warn!(
                chunks = lost_vectors,
                "vectors not recoverable from the embedding cache; run backfill"
            );
        }

        match loaded.postings {
            Some(postings) if postings_consistent(&postings, &state) => {
                state.keywords = KeywordIndex::from_postings(
                    postings,
                    chunk_metadata(state.documents.values().map(|d| d.as_ref())),
                );
            }
            Some(_) => {
                tracing::warn!("keyword_index.json does not match stored chunks; rebuilding");
                state.rebuild_keywords();
            }
            None => state.rebuild_keywords(),
        }

        tracing::info!(
            dir = %config.storage.dir.display(),
            documents = state.documents.len(),
            chunks = state.chunk_owner.len(),
            model = provider.model_name(),
            "knowledge base opened"
        );

        let permits = Arc::new(Semaphore::new(config.embedding.concurrency));
        Ok(Self {
            config,
            processor,
            provider,
            storage,
            state: RwLock::new(Arc::new(state)),
            commit_lock: Mutex::new(()),
            doc_locks: DashMap::new(),
            cache: StdMutex::new(CacheSlot { cache, dirty: false }),
            embed_permits: permits,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn processor(&self) -> &DocumentProcessor {
        &self.processor
    }

    // ============ Mutations ============

    /// Index a new document and record its first snapshot. Returns its id.
    ///
    /// The document's chunks are recomputed from its content. An id that
    /// already exists is a `Validation` error; use
    /// [`update_document`](Self::update_document) instead.
    pub async fn add_document(&self, doc: Document) -> KbResult<String> {
        Ok(self.ingest_document(doc, None).await?.document_id)
    }

    /// [`add_document`](Self::add_document) with the full indexing outcome.
    pub async fn ingest_document(
        &self,
        mut doc: Document,
        cancel: Option<&CancellationToken>,
    ) -> KbResult<IngestOutcome> {
        self.processor.rechunk(&mut doc)?;
        self.insert_new(doc, cancel).await
    }

    /// Process `source` and add the result as a new document.
    pub async fn add_source(&self, source: &Source, metadata: Metadata) -> KbResult<IngestOutcome> {
        self.add_source_cancellable(source, metadata, &CancellationToken::new())
            .await
    }

    pub async fn add_source_cancellable(
        &self,
        source: &Source,
        metadata: Metadata,
        cancel: &CancellationToken,
    ) -> KbResult<IngestOutcome> {
        let doc = self.processor.process(source, metadata).await?;
        self.insert_new(doc, Some(cancel)).await
    }

    pub async fn add_document_cancellable(
        &self,
        doc: Document,
        cancel: &CancellationToken,
    ) -> KbResult<IngestOutcome> {
        self.ingest_document(doc, Some(cancel)).await
    }

    async fn insert_new(
        &self,
        doc: Document,
        cancel: Option<&CancellationToken>,
    ) -> KbResult<IngestOutcome> {
        if doc.id.trim().is_empty() {
            return Err(KbError::validation("document id must not be empty"));
        }
        if doc.version == 0 {
            return Err(KbError::validation("document version must be >= 1"));
        }
        require_content(&doc.content)?;

        let id = doc.id.clone();
        let guard = self.lock_document(&id).await;
        let result = async {
            if self.current().versions.contains(&id) {
                return Err(KbError::validation(format!(
                    "document {} already exists; use update",
                    id
                )));
            }
            let embedded = self.embed_chunks(&doc.chunks, cancel).await?;
            let outcome = self
                .commit(cancel, |state, delta| {
                    let doc = state.index(doc, &embedded.vectors)?;
                    delta.new_snapshots.push(state.versions.add_version(&doc)?);
                    Ok(outcome_for(&doc, &embedded))
                })
                .await?;
            log_outcome("document added", &outcome);
            Ok(outcome)
        }
        .await;
        drop(guard);
        result
    }

    /// Replace a document's content, creating `version + 1`.
    pub async fn update_document(&self, document_id: &str, new_content: &str) -> KbResult<Document> {
        self.update_document_with(document_id, new_content, None, None)
            .await
    }

    /// Update content and optionally metadata; `None` keeps the current metadata.
    pub async fn update_document_with(
        &self,
        document_id: &str,
        new_content: &str,
        metadata: Option<Metadata>,
        cancel: Option<&CancellationToken>,
    ) -> KbResult<Document> {
        require_content(new_content)?;
        let guard = self.lock_document(document_id).await;
        let result = async {
            let current = self.live_document(document_id)?;
            let metadata = metadata.unwrap_or_else(|| current.metadata.clone());
            let next = self
                .processor
                .with_content(&current, new_content, metadata)?;
            let (doc, outcome) = self.replace_version(next, None, cancel).await?;
            log_outcome("document updated", &outcome);
            Ok(doc)
        }
        .await;
        drop(guard);
        result
    }

    /// Restore `target_version`'s content and metadata as a new version.
    ///
    /// History is only appended: `target_version` stays addressable and the
    /// new version carries `rollback_from = target_version`.
    pub async fn rollback_document(&self, document_id: &str, target_version: u32) -> KbResult<Document> {
        let guard = self.lock_document(document_id).await;
        let result = async {
            let current = self.live_document(document_id)?;
            let target = self
                .current()
                .versions
                .get_version(document_id, Some(target_version))?
                .clone();

            let mut base = (*current).clone();
            base.source_type = target.source_type;
            base.source_name = target.source_name.clone();
            let next = self
                .processor
                .with_content(&base, &target.content, target.metadata.clone())?;

            let (doc, outcome) = self
                .replace_version(next, Some(target_version), None)
                .await?;
            tracing::info!(
                document_id,
                from = target_version,
                version = outcome.version,
                "document rolled back"
            );
            Ok(doc)
        }
        .await;
        drop(guard);
        result
    }

    /// Embed and commit `next` as the new current version of its id.
    async fn replace_version(
        &self,
        next: Document,
        rollback_from: Option<u32>,
        cancel: Option<&CancellationToken>,
    ) -> KbResult<(Document, IngestOutcome)> {
        let embedded = self.embed_chunks(&next.chunks, cancel).await?;
        self.commit(cancel, |state, delta| {
            let snapshot = match rollback_from {
                Some(target) => state.versions.rollback(&next.id, target, next.updated_at)?,
                None => state.versions.add_version(&next)?,
            };
            if snapshot.version != next.version {
                return Err(KbError::validation(format!(
                    "document {} changed concurrently (expected version {}, history is at {})",
                    next.id, next.version, snapshot.version
                )));
            }
            delta.new_snapshots.push(snapshot);
            let doc = state.index(next, &embedded.vectors)?;
            let outcome = outcome_for(&doc, &embedded);
            Ok(((*doc).clone(), outcome))
        })
        .await
    }

    /// Remove a document, its chunks, and its whole history.
    ///
    /// Returns `false` when the id is unknown.
    pub async fn delete_document(&self, document_id: &str) -> KbResult<bool> {
        let guard = self.lock_document(document_id).await;
        let result = async {
            let state = self.current();
            if !state.documents.contains_key(document_id) && !state.versions.contains(document_id)
            {
                return Ok(false);
            }
            drop(state);

            let chunks = self
                .commit(None, |state, delta| {
                    let chunks = state
                        .unindex(document_id)
                        .map(|d| d.chunks.len())
                        .unwrap_or(0);
                    let versions: Vec<u32> = state
                        .versions
                        .snapshots(document_id)
                        .map(|s| s.version)
                        .collect();
                    state.versions.delete_document(document_id);
                    state.vectors.maybe_compact();
                    delta.removed.push((document_id.to_string(), versions));
                    Ok(chunks)
                })
                .await?;
            tracing::info!(document_id, chunks, "document deleted");
            Ok(true)
        }
        .await;
        drop(guard);
        result
    }

    // ============ Reads ============

    /// Current document, or a historical version rebuilt from its snapshot.
    ///
    /// Historical versions are not indexed, so they come back without chunks.
    pub fn get_document(&self, document_id: &str, version: Option<u32>) -> KbResult<Document> {
        let state = self.current();
        let doc = state
            .documents
            .get(document_id)
            .ok_or_else(|| KbError::document_not_found(document_id))?;
        match version {
            None => Ok((**doc).clone()),
            Some(v) if v == doc.version => Ok((**doc).clone()),
            Some(v) => {
                let snapshot = state.versions.get_version(document_id, Some(v))?;
                Ok(snapshot_to_document(&state.versions, snapshot))
            }
        }
    }

    /// Summaries of every current document, oldest first.
    pub fn list_documents(&self) -> Vec<DocumentSummary> {
        let state = self.current();
        let mut summaries: Vec<DocumentSummary> =
            state.documents.values().map(|d| d.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub fn compare_versions(&self, document_id: &str, v1: u32, v2: u32) -> KbResult<VersionDiff> {
        self.current().versions.compare_versions(document_id, v1, v2)
    }

    pub fn history(&self, document_id: &str) -> KbResult<Vec<VersionInfo>> {
        self.current().versions.history(document_id)
    }

    /// Hybrid search. Errors are returned, never turned into an empty result.
    pub async fn query(&self, req: &QueryRequest) -> KbResult<Vec<ScoredChunk>> {
        let started = Instant::now();
        let k = req.k.unwrap_or(self.config.retrieval.default_k);
        let fuzziness = req
            .fuzziness
            .unwrap_or(self.config.retrieval.default_fuzziness);

        if k == 0 {
            return Err(KbError::validation("k must be >= 1"));
        }
        if k > self.config.retrieval.max_k {
            return Err(KbError::validation(format!(
                "k must be <= {}, got {}",
                self.config.retrieval.max_k, k
            )));
        }
        if req.text.trim().is_empty() {
            return Err(KbError::validation("query text must not be empty"));
        }
        let mode = RetrievalMode::from_fuzziness(fuzziness)?;

        let query_vector = if mode.needs_vector() {
            match self.embed_query(&req.text).await {
                Ok(v) => Some(v),
                Err(e)
                    if req.allow_keyword_fallback
                        && matches!(mode, RetrievalMode::Hybrid { .. }) =>
                {
                    tracing::warn!(error = %e, "query embedding failed; using keyword scores only");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let state = self.current();
        let hybrid = HybridQuery {
            text: &req.text,
            query_vector: query_vector.as_deref(),
            k,
            fuzziness,
            filter: &req.filter,
            allow_keyword_fallback: req.allow_keyword_fallback,
        };
        let results = HybridRetriever::new(&state.vectors, &state.keywords)
            .query(&hybrid, |id| state.chunk(id))?;

        tracing::debug!(
            k,
            fuzziness,
            results = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query"
        );
        Ok(results)
    }

    // ============ Batch & maintenance ============

    /// Ingest many sources concurrently (`ingest.concurrency`).
    ///
    /// Each source succeeds or fails on its own; one bad input never aborts
    /// the others. `metadata` is attached to every document.
    pub async fn ingest_batch(
        self: &Arc<Self>,
        sources: Vec<Source>,
        metadata: Metadata,
    ) -> BatchReport {
        self.ingest_batch_cancellable(sources, metadata, &CancellationToken::new())
            .await
    }

    pub async fn ingest_batch_cancellable(
        self: &Arc<Self>,
        sources: Vec<Source>,
        metadata: Metadata,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let permits = Arc::new(Semaphore::new(self.config.ingest.concurrency));
        let mut set = JoinSet::new();
        let labels: Vec<String> = sources.iter().map(Source::label).collect();

        for (position, source) in sources.into_iter().enumerate() {
            let kb = Arc::clone(self);
            let permits = permits.clone();
            let cancel = cancel.clone();
            let metadata = metadata.clone();
            set.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        kb.add_source_cancellable(&source, metadata, &cancel)
                            .await
                    }
                    Err(_) => Err(KbError::Cancelled("ingest pool closed".to_string())),
                };
                (position, result)
            });
        }

        let mut results: Vec<Option<KbResult<IngestOutcome>>> =
            (0..labels.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((position, result)) => results[position] = Some(result),
                Err(e) => tracing::error!(error = %e, "ingest task failed"),
            }
        }

        let mut report = BatchReport::default();
        for (source, result) in labels.into_iter().zip(results) {
            let result = result
                .unwrap_or_else(|| Err(KbError::Cancelled("ingest task aborted".to_string())));
            match result {
                Ok(outcome) => {
                    report.succeeded += 1;
                    report.items.push(BatchItem {
                        source,
                        outcome: Some(outcome),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "batch item failed");
                    report.failed += 1;
                    report.items.push(BatchItem {
                        source,
                        outcome: None,
                        error: Some(BatchItemError {
                            code: e.code().to_string(),
                            message: e.to_string(),
                        }),
                    });
                }
            }
        }
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "batch ingestion finished"
        );
        report
    }

    /// Retry embedding for every chunk with `indexed_semantic = false`.
    pub async fn backfill_embeddings(&self) -> KbResult<BackfillReport> {
        let pending: Vec<String> = self
            .current()
            .documents
            .values()
            .filter(|d| d.chunks.iter().any(|c| !c.indexed_semantic))
            .map(|d| d.id.clone())
            .collect();

        let mut report = BackfillReport::default();
        for id in pending {
            let guard = self.lock_document(&id).await;
            let result = self.backfill_document(&id, &mut report).await;
            drop(guard);
            result?;
        }
        tracing::info!(
            documents = report.documents,
            embedded = report.chunks_embedded,
            failed = report.chunks_failed,
            "backfill finished"
        );
        Ok(report)
    }

    async fn backfill_document(&self, id: &str, report: &mut BackfillReport) -> KbResult<()> {
        let Some(doc) = self.current().documents.get(id).cloned() else {
            return Ok(());
        };
        let todo: Vec<DocumentChunk> = doc
            .chunks
            .iter()
            .filter(|c| !c.indexed_semantic)
            .cloned()
            .collect();
        if todo.is_empty() {
            return Ok(());
        }

        let embedded = self.embed_chunks(&todo, None).await?;
        report.chunks_failed += todo.len() - embedded.vectors.len();
        if let Some(e) = embedded.error {
            report.last_error = Some(e);
        }
        if embedded.vectors.is_empty() {
            return Ok(());
        }

        let vectors = embedded.vectors;
        let embedded_count = self
            .commit(None, |state, _delta| {
                let mut doc = state
                    .documents
                    .get(id)
                    .map(|d| (**d).clone())
                    .ok_or_else(|| KbError::document_not_found(id))?;
                let mut count = 0;
                for chunk in doc.chunks.iter_mut() {
                    if let Some(vector) = vectors.get(&chunk.id) {
                        chunk.indexed_semantic = true;
                        state
                            .vectors
                            .add_shared(&chunk.id, vector.clone(), chunk.metadata_view())?;
                        state
                            .keywords
                            .add(&chunk.id, &chunk.content, chunk.metadata_view());
                        count += 1;
                    }
                }
                state.documents.insert(id.to_string(), Arc::new(doc));
                Ok(count)
            })
            .await?;
        report.documents += 1;
        report.chunks_embedded += embedded_count;
        Ok(())
    }

    /// Rebuild the keyword index from stored chunks, compact the vector
    /// index, and prune cache entries no live chunk uses.
    pub async fn rebuild_indexes(&self) -> KbResult<RebuildReport> {
        let (mut report, live_hashes) = self
            .commit(None, |state, _delta| {
                let slots_before = state.vectors.capacity_slots();
                state.rebuild_keywords();
                state.vectors.rebuild();
                let live: Vec<String> = state
                    .documents
                    .values()
                    .flat_map(|d| d.chunks.iter().map(|c| c.hash.clone()))
                    .collect();
                let report = RebuildReport {
                    documents: state.documents.len(),
                    chunks: state.chunk_owner.len(),
                    keyword_tokens: state.keywords.token_count(),
                    vector_entries: state.vectors.len(),
                    reclaimed_slots: slots_before.saturating_sub(state.vectors.capacity_slots()),
                    pruned_cache_entries: 0,
                };
                Ok((report, live))
            })
            .await?;

        let pruned = {
            let mut slot = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            let pruned = slot
                .cache
                .retain_hashes(live_hashes.iter().map(String::as_str));
            slot.dirty |= pruned > 0;
            pruned
        };
        if pruned > 0 {
            self.flush_cache().await?;
        }
        report.pruned_cache_entries = pruned;
        tracing::info!(?report, "indexes rebuilt");
        Ok(report)
    }

    pub fn stats(&self) -> KbStats {
        let state = self.current();
        let chunks = state.chunk_owner.len();
        let semantic_chunks = state
            .documents
            .values()
            .flat_map(|d| d.chunks.iter())
            .filter(|c| c.indexed_semantic)
            .count();
        let cache_entries = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cache
            .len();
        KbStats {
            documents: state.documents.len(),
            chunks,
            semantic_chunks,
            keyword_only_chunks: chunks - semantic_chunks,
            keyword_tokens: state.keywords.token_count(),
            vector_entries: state.vectors.len(),
            vector_slots: state.vectors.capacity_slots(),
            vector_dims: state.vectors.dims(),
            version_snapshots: state.versions.total_snapshots(),
            cache_entries,
            embedding_model: self.provider.model_name().to_string(),
        }
    }

    // ============ Internals ============

    fn current(&self) -> Arc<KbState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn live_document(&self, document_id: &str) -> KbResult<Arc<Document>> {
        self.current()
            .documents
            .get(document_id)
            .cloned()
            .ok_or_else(|| KbError::document_not_found(document_id))
    }

    async fn lock_document(&self, document_id: &str) -> DocumentGuard<'_> {
        let lock = self
            .doc_locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        DocumentGuard {
            locks: &self.doc_locks,
            document_id: document_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Clone the published state, apply `f`, persist, then publish.
    async fn commit<T, F>(&self, cancel: Option<&CancellationToken>, f: F) -> KbResult<T>
    where
        F: FnOnce(&mut KbState, &mut Delta) -> KbResult<T>,
    {
        let _guard = self.commit_lock.lock().await;
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(KbError::Cancelled(
                "cancelled before commit; nothing was published".to_string(),
            ));
        }

        let mut next = (*self.current()).clone();
        let mut delta = Delta::default();
        let out = f(&mut next, &mut delta)?;
        let next = Arc::new(next);

        let cache = {
            let slot = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            (slot.dirty && self.config.embedding.cache).then(|| slot.cache.clone())
        };
        let cache_written = cache.is_some();

        let storage = self.storage.clone();
        let to_save = next.clone();
        tokio::task::spawn_blocking(move || {
            let snapshot = Snapshot {
                documents: to_save
                    .documents
                    .iter()
                    .map(|(id, d)| (id.as_str(), d.as_ref()))
                    .collect(),
                postings: to_save.keywords.posting_lists().collect(),
                version_index: to_save.versions.index(),
            };
            // Cache entries are content-addressed, so they may land ahead of the commit.
            if let Some(cache) = cache {
                storage.save_cache(&cache)?;
            }
            storage.save(&snapshot, &delta)
        })
        .await
        .map_err(|e| KbError::Persistence(format!("persist task failed: {e}")))??;

        if cache_written {
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .dirty = false;
        }
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(out)
    }

    async fn flush_cache(&self) -> KbResult<()> {
        if !self.config.embedding.cache {
            return Ok(());
        }
        let _guard = self.commit_lock.lock().await;
        let cache = {
            let slot = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            slot.cache.clone()
        };
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.save_cache(&cache))
            .await
            .map_err(|e| KbError::Persistence(format!("persist task failed: {e}")))??;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dirty = false;
        Ok(())
    }

    fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.config.embedding.timeout_secs)
    }

    async fn embed_query(&self, text: &str) -> KbResult<Vec<f32>> {
        let timeout = self.embed_timeout();
        let vector = match tokio::time::timeout(timeout, self.provider.embed(text)).await {
            Ok(result) => result?,
            Err(_) => return Err(EmbeddingError::Timeout(timeout.as_secs()).into()),
        };
        check_dims(self.provider.dims(), &vector)?;
        Ok(vector)
    }

    /// Embed `chunks` through the cache and the bounded worker pool.
    ///
    /// Provider failures are not errors here: failed chunks are simply
    /// missing from the result. Only cancellation aborts.
    async fn embed_chunks(
        &self,
        chunks: &[DocumentChunk],
        cancel: Option<&CancellationToken>,
    ) -> KbResult<Embedded> {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(KbError::Cancelled("cancelled before embedding".to_string()));
        }

        let mut vectors = HashMap::new();
        let mut misses: Vec<(String, String, String)> = Vec::new();
        {
            let slot = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            for chunk in chunks {
                match slot.cache.get(&chunk.hash) {
                    Some(v) => {
                        vectors.insert(chunk.id.clone(), v.clone());
                    }
                    None => misses.push((chunk.id.clone(), chunk.hash.clone(), chunk.content.clone())),
                }
            }
        }

        let index_dims = self.current().vectors.dims();
        let timeout = self.embed_timeout();
        let mut set = JoinSet::new();
        for batch in misses.chunks(EMBED_BATCH) {
            let batch = batch.to_vec();
            let provider = self.provider.clone();
            let permits = self.embed_permits.clone();
            set.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return (
                            batch,
                            Err(EmbeddingError::Provider("embedding pool closed".to_string())),
                        )
                    }
                };
                let texts: Vec<String> = batch.iter().map(|(_, _, text)| text.clone()).collect();
                let result = match tokio::time::timeout(timeout, provider.embed_batch(&texts)).await
                {
                    Ok(r) => r,
                    Err(_) => Err(EmbeddingError::Timeout(timeout.as_secs())),
                };
                (batch, result)
            });
        }

        let mut error: Option<String> = None;
        loop {
            let next = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        set.abort_all();
                        return Err(KbError::Cancelled(
                            "cancelled during embedding; nothing was published".to_string(),
                        ));
                    }
                    next = set.join_next() => next,
                },
                None => set.join_next().await,
            };
            let Some(joined) = next else { break };

            let (batch, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error.get_or_insert_with(|| format!("embedding task failed: {e}"));
                    continue;
                }
            };
            let checked = result.and_then(|vs| {
                if vs.len() != batch.len() {
                    return Err(EmbeddingError::Provider(format!(
                        "expected {} embeddings, got {}",
                        batch.len(),
                        vs.len()
                    )));
                }
                for v in &vs {
                    check_dims(self.provider.dims(), v)?;
                    if let Some(d) = index_dims {
                        check_dims(d, v)?;
                    }
                }
                Ok(vs)
            });
            match checked {
                Ok(vs) => {
                    let mut slot = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                    for ((chunk_id, hash, _), v) in batch.into_iter().zip(vs) {
                        let v: Arc<[f32]> = v.into();
                        slot.cache.insert_shared(hash, v.clone());
                        vectors.insert(chunk_id, v);
                    }
                    slot.dirty = true;
                }
                Err(e) => {
                    error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        let failed = chunks.len() - vectors.len();
        if failed > 0 {
            tracing::warn!(
                failed,
                total = chunks.len(),
                error = error.as_deref().unwrap_or("unknown"),
                "embedding unavailable; chunks indexed by keyword only"
            );
        }
        Ok(Embedded { vectors, error })
    }
}

fn require_content(content: &str) -> KbResult<()> {
    if content.trim().is_empty() {
        return Err(KbError::validation("document content must not be empty"));
    }
    Ok(())
}

fn outcome_for(doc: &Document, embedded: &Embedded) -> IngestOutcome {
    let semantic = doc.chunks.iter().filter(|c| c.indexed_semantic).count();
    let keyword_only = doc.chunks.len() - semantic;
    IngestOutcome {
        document_id: doc.id.clone(),
        version: doc.version,
        chunk_count: doc.chunks.len(),
        semantic_chunks: semantic,
        keyword_only_chunks: keyword_only,
        embedding_error: (keyword_only > 0)
            .then(|| embedded.error.clone())
            .flatten(),
    }
}

fn log_outcome(message: &str, outcome: &IngestOutcome) {
    tracing::info!(
        document_id = %outcome.document_id,
        version = outcome.version,
        chunks = outcome.chunk_count,
        keyword_only = outcome.keyword_only_chunks,
        "{}",
        message
    );
}

/// Bring `documents.json` and the version history back into agreement after
/// a crash between their writes.
///
/// - history behind the document: the document's version is appended
/// - history ahead of the document, or a document missing entirely: the
///   document is restored from its newest snapshot and re-chunked
fn reconcile(
    mut documents: BTreeMap<String, Document>,
    versions: &mut VersionStore,
    processor: &DocumentProcessor,
) -> KbResult<BTreeMap<String, Document>> {
    for (id, doc) in documents.iter() {
        match versions.current_version(id) {
            Some(v) if v >= doc.version => {}
            behind => {
                tracing::warn!(document_id = %id, history = ?behind, version = doc.version, "version history behind document; appending snapshot");
                versions.append(VersionSnapshot::from_document(doc, None))?;
            }
        }
    }

    let ahead: Vec<String> = versions
        .document_ids()
        .into_iter()
        .filter(|id| {
            documents
                .get(id.as_str())
                .map_or(true, |d| versions.current_version(id) > Some(d.version))
        })
        .cloned()
        .collect();
    for id in ahead {
        let snapshot = versions.get_version(&id, None)?;
        tracing::warn!(document_id = %id, version = snapshot.version, "document behind version history; restoring from snapshot");
        let mut doc = snapshot_to_document(versions, snapshot);
        processor.rechunk(&mut doc)?;
        documents.insert(id, doc);
    }
    Ok(documents)
}

/// Persisted postings agree with the stored chunks: every posting names a
/// live chunk and every chunk with tokens has at least one posting.
fn postings_consistent(postings: &BTreeMap<String, Vec<String>>, state: &KbState) -> bool {
    let mut seen = HashSet::new();
    for ids in postings.values() {
        for id in ids {
            if !state.chunk_owner.contains_key(id) {
                return false;
            }
            seen.insert(id.as_str());
        }
    }
    state
        .documents
        .values()
        .flat_map(|d| d.chunks.iter())
        .all(|c| seen.contains(c.id.as_str()) || tokenize(&c.content).is_empty())
}
