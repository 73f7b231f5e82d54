//! Hybrid retrieval: weighted fusion of keyword and semantic scores.
//!
//! The caller tunes the blend with an integer `fuzziness` in `[0, 100]`:
//!
//! | fuzziness | behaviour |
//! |-----------|-----------|
//! | `0` | keyword index only |
//! | `100` | vector index only |
//! | otherwise | `fused = (f/100) × semantic + (1 - f/100) × keyword` |
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch `k × 2` candidates from each index independently.
//! 2. Index both sets by chunk id; a chunk missing from one set scores 0 there.
//! 3. Fuse with the weights above.
//! 4. Sort by fused score (desc), then chunk id (asc).
//! 5. Truncate to `k`.
//!
//! Keyword scores (`matches / distinct query tokens`) and semantic scores
//! (cosine similarity) live on different, informally chosen scales. The
//! formula is kept as-is for compatibility; it is not a calibrated scheme.

use std::collections::HashMap;

use crate::error::{KbError, KbResult};
use crate::keyword_index::{KeywordHit, KeywordIndex};
use crate::models::{DocumentChunk, MetadataFilter, ScoredChunk};
use crate::vector_index::{VectorHit, VectorIndex};

pub const MIN_FUZZINESS: i64 = 0;
pub const MAX_FUZZINESS: i64 = 100;

/// How a query is routed, derived from `fuzziness`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetrievalMode {
    Keyword,
    Semantic,
    Hybrid { semantic_weight: f64 },
}

impl RetrievalMode {
    /// Validate `fuzziness` and derive the mode. Out-of-range values are an
    /// error, never clamped.
    pub fn from_fuzziness(fuzziness: i64) -> KbResult<Self> {
        if !(MIN_FUZZINESS..=MAX_FUZZINESS).contains(&fuzziness) {
            return Err(KbError::validation(format!(
                "fuzziness must be in [{}, {}], got {}",
                MIN_FUZZINESS, MAX_FUZZINESS, fuzziness
            )));
        }
        Ok(match fuzziness {
            MIN_FUZZINESS => RetrievalMode::Keyword,
            MAX_FUZZINESS => RetrievalMode::Semantic,
            f => RetrievalMode::Hybrid {
                semantic_weight: f as f64 / 100.0,
            },
        })
    }

    /// Whether answering needs a query embedding.
    pub fn needs_vector(&self) -> bool {
        !matches!(self, RetrievalMode::Keyword)
    }
}

/// Inputs for a single retrieval.
#[derive(Debug, Clone)]
pub struct HybridQuery<'a> {
    pub text: &'a str,
    /// Required for semantic and hybrid modes.
    pub query_vector: Option<&'a [f32]>,
    pub k: usize,
    pub fuzziness: i64,
    pub filter: &'a MetadataFilter,
    /// In hybrid mode, score with keywords only when the query vector is
    /// missing instead of failing.
    pub allow_keyword_fallback: bool,
}

/// A fused candidate before it is resolved to chunk content.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub chunk_id: String,
    pub score: f64,
    pub keyword_score: Option<f64>,
    pub semantic_score: Option<f64>,
}

/// Fuse semantic and keyword candidates under `fuzziness`.
///
/// Pure function over already-retrieved hits; exposed so the formula can be
/// checked against synthetic scores.
///
/// ```rust
/// use knowledge_harness_core::hybrid::fuse;
/// use knowledge_harness_core::keyword_index::KeywordHit;
/// use knowledge_harness_core::vector_index::VectorHit;
///
/// let sem = vec![VectorHit { chunk_id: "c".into(), score: 0.8, metadata: Default::default() }];
/// let kw = vec![KeywordHit { chunk_id: "c".into(), score: 0.4 }];
/// let fused = fuse(&sem, &kw, 60, 5).unwrap();
/// assert!((fused[0].score - 0.64).abs() < 1e-9);
/// ```
pub fn fuse(
    semantic: &[VectorHit],
    keyword: &[KeywordHit],
    fuzziness: i64,
    k: usize,
) -> KbResult<Vec<FusedHit>> {
    let (semantic_weight, keyword_weight) = match RetrievalMode::from_fuzziness(fuzziness)? {
        RetrievalMode::Keyword => (0.0, 1.0),
        RetrievalMode::Semantic => (1.0, 0.0),
        RetrievalMode::Hybrid { semantic_weight } => (semantic_weight, 1.0 - semantic_weight),
    };

    let mut merged: HashMap<&str, (Option<f64>, Option<f64>)> = HashMap::new();
    for hit in semantic {
        merged.entry(hit.chunk_id.as_str()).or_default().1 = Some(hit.score);
    }
    for hit in keyword {
        merged.entry(hit.chunk_id.as_str()).or_default().0 = Some(hit.score);
    }

    let mut fused: Vec<FusedHit> = merged
        .into_iter()
        .map(|(chunk_id, (kw, sem))| FusedHit {
            chunk_id: chunk_id.to_string(),
            score: semantic_weight * sem.unwrap_or(0.0) + keyword_weight * kw.unwrap_or(0.0),
            keyword_score: kw,
            semantic_score: sem,
        })
        .collect();

    sort_hits(&mut fused);
    fused.truncate(k);
    Ok(fused)
}

fn sort_hits(hits: &mut [FusedHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Read-only view over both indexes for one query.
pub struct HybridRetriever<'a> {
    vectors: &'a VectorIndex,
    keywords: &'a KeywordIndex,
}

impl<'a> HybridRetriever<'a> {
    pub fn new(vectors: &'a VectorIndex, keywords: &'a KeywordIndex) -> Self {
        Self { vectors, keywords }
    }

    /// Retrieve fused candidates (no chunk content).
    pub fn retrieve(&self, q: &HybridQuery<'_>) -> KbResult<Vec<FusedHit>> {
        if q.k == 0 {
            return Err(KbError::validation("k must be >= 1"));
        }
        if q.text.trim().is_empty() {
            return Err(KbError::validation("query text must not be empty"));
        }
        let mode = RetrievalMode::from_fuzziness(q.fuzziness)?;

        match mode {
            RetrievalMode::Keyword => {
                let kw = self.keywords.query(q.text, q.k, q.filter)?;
                fuse(&[], &kw, q.fuzziness, q.k)
            }
            RetrievalMode::Semantic => {
                let vector = q.query_vector.ok_or_else(|| {
                    KbError::EmbeddingUnavailable(
                        "semantic search requires a query embedding".to_string(),
                    )
                })?;
                let sem = self.vectors.query(vector, q.k, q.filter)?;
                fuse(&sem, &[], q.fuzziness, q.k)
            }
            RetrievalMode::Hybrid { .. } => {
                let fetch = q.k.saturating_mul(2);
                let kw = self.keywords.query(q.text, fetch, q.filter)?;
                let sem = match q.query_vector {
                    Some(vector) => self.vectors.query(vector, fetch, q.filter)?,
                    None if q.allow_keyword_fallback => Vec::new(),
                    None => {
                        return Err(KbError::EmbeddingUnavailable(
                            "hybrid search requires a query embedding".to_string(),
                        ))
                    }
                };
                fuse(&sem, &kw, q.fuzziness, q.k)
            }
        }
    }

    /// Retrieve and resolve hits to full [`ScoredChunk`]s via `lookup`.
    ///
    /// Hits whose chunk `lookup` cannot resolve are dropped.
    pub fn query<'c, F>(&self, q: &HybridQuery<'_>, lookup: F) -> KbResult<Vec<ScoredChunk>>
    where
        F: Fn(&str) -> Option<&'c DocumentChunk>,
    {
        let hits = self.retrieve(q)?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let chunk = lookup(&hit.chunk_id)?;
                let source_name = chunk
                    .metadata
                    .get("source_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Some(ScoredChunk {
                    chunk_id: hit.chunk_id,
                    document_id: chunk.document_id.clone(),
                    source_name,
                    content: chunk.content.clone(),
                    metadata: chunk.metadata_view(),
                    score: hit.score,
                    keyword_score: hit.keyword_score,
                    semantic_score: hit.semantic_score,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    fn vhit(id: &str, score: f64) -> VectorHit {
        VectorHit {
            chunk_id: id.to_string(),
            score,
            metadata: Metadata::new(),
        }
    }

    fn khit(id: &str, score: f64) -> KeywordHit {
        KeywordHit {
            chunk_id: id.to_string(),
            score,
        }
    }

    fn indexes() -> (VectorIndex, KeywordIndex) {
        let mut v = VectorIndex::new();
        let mut k = KeywordIndex::new();
        v.add("c1", vec![1.0, 0.0], Metadata::new()).unwrap();
        v.add("c2", vec![0.0, 1.0], Metadata::new()).unwrap();
        k.add("c2", "rust ownership borrow", Metadata::new());
        k.add("c3", "rust async runtime", Metadata::new());
        (v, k)
    }

    fn q<'a>(
        text: &'a str,
        vector: Option<&'a [f32]>,
        fuzziness: i64,
        filter: &'a MetadataFilter,
    ) -> HybridQuery<'a> {
        HybridQuery {
            text,
            query_vector: vector,
            k: 5,
            fuzziness,
            filter,
            allow_keyword_fallback: false,
        }
    }

    #[test]
    fn test_fusion_formula() {
        let fused = fuse(&[vhit("c", 0.8)], &[khit("c", 0.4)], 60, 5).unwrap();
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 0.64).abs() < 1e-9);
        assert_eq!(fused[0].semantic_score, Some(0.8));
        assert_eq!(fused[0].keyword_score, Some(0.4));
    }

    #[test]
    fn test_single_index_candidates_not_penalized_beyond_zero_term() {
        let fused = fuse(&[vhit("s", 0.5)], &[khit("k", 0.5)], 50, 5).unwrap();
        assert_eq!(fused.len(), 2);
        for hit in &fused {
            assert!((hit.score - 0.25).abs() < 1e-9);
        }
        // Tie broken by chunk id ascending.
        assert_eq!(fused[0].chunk_id, "k");
    }

    #[test]
    fn test_fuzziness_out_of_range_rejected() {
        assert!(matches!(
            RetrievalMode::from_fuzziness(-1),
            Err(KbError::Validation(_))
        ));
        assert!(matches!(
            RetrievalMode::from_fuzziness(101),
            Err(KbError::Validation(_))
        ));
        assert_eq!(
            RetrievalMode::from_fuzziness(0).unwrap(),
            RetrievalMode::Keyword
        );
        assert_eq!(
            RetrievalMode::from_fuzziness(100).unwrap(),
            RetrievalMode::Semantic
        );
    }

    #[test]
    fn test_keyword_only_at_zero() {
        let (v, k) = indexes();
        let f = MetadataFilter::new();
        let r = HybridRetriever::new(&v, &k);
        let hits = r.retrieve(&q("rust", Some(&[1.0f32, 0.0][..]), 0, &f)).unwrap();
        let kw: Vec<String> = k
            .query("rust", 5, &f)
            .unwrap()
            .into_iter()
            .map(|h| h.chunk_id)
            .collect();
        assert!(hits.iter().all(|h| kw.contains(&h.chunk_id)));
        assert!(hits.iter().all(|h| h.semantic_score.is_none()));
    }

    #[test]
    fn test_semantic_only_at_hundred() {
        let (v, k) = indexes();
        let f = MetadataFilter::new();
        let r = HybridRetriever::new(&v, &k);
        let hits = r.retrieve(&q("rust", Some(&[1.0f32, 0.0][..]), 100, &f)).unwrap();
        assert!(hits.iter().all(|h| v.contains(&h.chunk_id)));
        assert_eq!(hits[0].chunk_id, "c1");
    }

    #[test]
    fn test_semantic_without_vector_is_error() {
        let (v, k) = indexes();
        let f = MetadataFilter::new();
        let r = HybridRetriever::new(&v, &k);
        assert!(matches!(
            r.retrieve(&q("rust", None, 100, &f)),
            Err(KbError::EmbeddingUnavailable(_))
        ));
        assert!(matches!(
            r.retrieve(&q("rust", None, 50, &f)),
            Err(KbError::EmbeddingUnavailable(_))
        ));
    }

    #[test]
    fn test_hybrid_keyword_fallback_when_allowed() {
        let (v, k) = indexes();
        let f = MetadataFilter::new();
        let r = HybridRetriever::new(&v, &k);
        let mut query = q("rust", None, 40, &f);
        query.allow_keyword_fallback = true;
        let hits = r.retrieve(&query).unwrap();
        assert_eq!(hits.len(), 2);
        for h in &hits {
            assert!((h.score - 0.6).abs() < 1e-9);
        }
    }

    #[test]
    fn test_hybrid_blends_both_indexes() {
        let (v, k) = indexes();
        let f = MetadataFilter::new();
        let r = HybridRetriever::new(&v, &k);
        let hits = r.retrieve(&q("rust ownership", Some(&[0.0f32, 1.0][..]), 50, &f)).unwrap();
        assert_eq!(hits[0].chunk_id, "c2");
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert!(ids.contains(&"c1"));
        assert!(ids.contains(&"c3"));
    }

    #[test]
    fn test_empty_query_and_zero_k_rejected() {
        let (v, k) = indexes();
        let f = MetadataFilter::new();
        let r = HybridRetriever::new(&v, &k);
        assert!(matches!(
            r.retrieve(&q("   ", None, 0, &f)),
            Err(KbError::Validation(_))
        ));
        let mut zero = q("rust", None, 0, &f);
        zero.k = 0;
        assert!(matches!(r.retrieve(&zero), Err(KbError::Validation(_))));
    }
}
