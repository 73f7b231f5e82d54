//! Inverted keyword index with term-frequency postings.
//!
//! Every token occurrence appends one posting, so a chunk that repeats a
//! token is weighted by how often it does. A reverse map chunk → tokens keeps
//! deletes proportional to the chunk's vocabulary rather than the index size.
//!
//! Scoring is deliberately simple: `matched postings / distinct query tokens`.
//!
//! Posting lists and per-chunk entries sit behind `Arc` and are copied on
//! write, so a cloned index shares everything a mutation does not touch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{KbError, KbResult};
use crate::models::{Metadata, MetadataFilter};

/// Lowercase, split on non-alphanumeric boundaries, drop tokens of 2 chars or fewer.
///
/// ```rust
/// use knowledge_harness_core::keyword_index::tokenize;
///
/// assert_eq!(tokenize("The Rust-lang FAQ, v2!"), vec!["the", "rust", "lang", "faq"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub chunk_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct KeywordIndex {
    postings: HashMap<String, Arc<Vec<String>>>,
    chunk_tokens: HashMap<String, Arc<BTreeSet<String>>>,
    chunk_meta: HashMap<String, Arc<Metadata>>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `text` under `chunk_id`, replacing any previous postings for it.
    pub fn add(&mut self, chunk_id: &str, text: &str, metadata: Metadata) {
        self.delete(chunk_id);

        let mut distinct = BTreeSet::new();
        for token in tokenize(text) {
            Arc::make_mut(self.postings.entry(token.clone()).or_default())
                .push(chunk_id.to_string());
            distinct.insert(token);
        }
        self.chunk_tokens
            .insert(chunk_id.to_string(), Arc::new(distinct));
        self.chunk_meta
            .insert(chunk_id.to_string(), Arc::new(metadata));
    }

    /// Rank chunks against `text`. A query with no usable tokens matches nothing.
    pub fn query(&self, text: &str, k: usize, filter: &MetadataFilter) -> KbResult<Vec<KeywordHit>> {
        if k == 0 {
            return Err(KbError::validation("k must be >= 1"));
        }
        let query_tokens: BTreeSet<String> = tokenize(text).into_iter().collect();
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for token in &query_tokens {
            if let Some(ids) = self.postings.get(token) {
                for id in ids.iter() {
                    *counts.entry(id.as_str()).or_insert(0) += 1;
                }
            }
        }

        let denom = query_tokens.len() as f64;
        let mut hits: Vec<KeywordHit> = counts
            .into_iter()
            .filter(|(id, _)| {
                filter.is_empty()
                    || self
                        .chunk_meta
                        .get(*id)
                        .is_some_and(|meta| filter.matches(meta))
            })
            .map(|(id, matched)| KeywordHit {
                chunk_id: id.to_string(),
                score: matched as f64 / denom,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Remove every posting for `chunk_id`. Absent ids are a no-op.
    pub fn delete(&mut self, chunk_id: &str) -> bool {
        let tokens = match self.chunk_tokens.remove(chunk_id) {
            Some(t) => t,
            None => return false,
        };
        for token in tokens.iter() {
            let emptied = match self.postings.get_mut(token) {
                Some(ids) => {
                    let ids = Arc::make_mut(ids);
                    ids.retain(|id| id != chunk_id);
                    ids.is_empty()
                }
                None => false,
            };
            if emptied {
                self.postings.remove(token);
            }
        }
        self.chunk_meta.remove(chunk_id);
        true
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunk_tokens.contains_key(chunk_id)
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.chunk_tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_tokens.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.postings.len()
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &String> {
        self.chunk_tokens.keys()
    }

    /// Token → posting list, sorted by token for stable serialization.
    pub fn to_postings(&self) -> BTreeMap<String, Vec<String>> {
        self.posting_lists()
            .map(|(t, ids)| (t.to_string(), ids.to_vec()))
            .collect()
    }

    /// Borrowed token → posting list view, sorted by token.
    pub fn posting_lists(&self) -> impl Iterator<Item = (&str, &[String])> {
        let sorted: BTreeMap<&str, &[String]> = self
            .postings
            .iter()
            .map(|(t, ids)| (t.as_str(), ids.as_slice()))
            .collect();
        sorted.into_iter()
    }

    /// Reassemble an index from persisted postings plus per-chunk metadata.
    ///
    /// Chunks that appear in `chunk_meta` but have no postings (text with no
    /// usable tokens) are still registered so they count as indexed.
    pub fn from_postings(
        postings: BTreeMap<String, Vec<String>>,
        chunk_meta: HashMap<String, Metadata>,
    ) -> Self {
        let mut chunk_tokens: HashMap<String, BTreeSet<String>> = chunk_meta
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (token, ids) in &postings {
            for id in ids {
                chunk_tokens
                    .entry(id.clone())
                    .or_default()
                    .insert(token.clone());
            }
        }
        Self {
            postings: postings
                .into_iter()
                .map(|(t, ids)| (t, Arc::new(ids)))
                .collect(),
            chunk_tokens: chunk_tokens
                .into_iter()
                .map(|(id, tokens)| (id, Arc::new(tokens)))
                .collect(),
            chunk_meta: chunk_meta
                .into_iter()
                .map(|(id, meta)| (id, Arc::new(meta)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(doc: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert("document_id".into(), json!(doc));
        m
    }

    #[test]
    fn test_tokenize_rules() {
        assert_eq!(
            tokenize("Hello, WORLD! an ox ran to the café"),
            vec!["hello", "world", "ran", "the", "café"]
        );
        assert!(tokenize("a b c to of").is_empty());
    }

    #[test]
    fn test_score_is_matches_over_distinct_query_tokens() {
        let mut idx = KeywordIndex::new();
        idx.add("c1", "rust cargo crates", meta("d1"));
        idx.add("c2", "rust python", meta("d2"));

        let hits = idx.query("rust cargo", 10, &MetadataFilter::new()).unwrap();
        assert_eq!(hits[0].chunk_id, "c1");
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert_eq!(hits[1].chunk_id, "c2");
        assert!((hits[1].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_repeated_tokens_weight_by_frequency() {
        let mut idx = KeywordIndex::new();
        idx.add("c1", "deploy deploy deploy", meta("d1"));
        idx.add("c2", "deploy once", meta("d2"));

        let hits = idx.query("deploy", 10, &MetadataFilter::new()).unwrap();
        assert_eq!(hits[0].chunk_id, "c1");
        assert!((hits[0].score - 3.0).abs() < 1e-9);
        assert!((hits[1].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_query_tokens_counted_once() {
        let mut idx = KeywordIndex::new();
        idx.add("c1", "kubernetes", meta("d1"));
        let hits = idx
            .query("kubernetes kubernetes", 10, &MetadataFilter::new())
            .unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ties_break_by_chunk_id() {
        let mut idx = KeywordIndex::new();
        idx.add("zeta", "docker", meta("d1"));
        idx.add("alpha", "docker", meta("d2"));
        let hits = idx.query("docker", 10, &MetadataFilter::new()).unwrap();
        assert_eq!(hits[0].chunk_id, "alpha");
        assert_eq!(hits[1].chunk_id, "zeta");
    }

    #[test]
    fn test_filter_and_truncate() {
        let mut idx = KeywordIndex::new();
        idx.add("c1", "network policy", meta("d1"));
        idx.add("c2", "network route", meta("d2"));
        idx.add("c3", "network mesh", meta("d1"));

        let hits = idx
            .query("network", 10, &MetadataFilter::document("d1"))
            .unwrap();
        assert_eq!(hits.len(), 2);

        let hits = idx.query("network", 1, &MetadataFilter::new()).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_delete_removes_all_postings() {
        let mut idx = KeywordIndex::new();
        idx.add("c1", "alpha beta beta", meta("d1"));
        idx.add("c2", "beta gamma", meta("d2"));

        assert!(idx.delete("c1"));
        assert!(!idx.delete("c1"));
        assert!(idx.query("alpha", 10, &MetadataFilter::new()).unwrap().is_empty());
        let hits = idx.query("beta", 10, &MetadataFilter::new()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c2");
        assert!(!idx.to_postings().contains_key("alpha"));
    }

    #[test]
    fn test_readd_replaces_postings() {
        let mut idx = KeywordIndex::new();
        idx.add("c1", "old words here", meta("d1"));
        idx.add("c1", "fresh content", meta("d1"));
        assert!(idx.query("old", 10, &MetadataFilter::new()).unwrap().is_empty());
        assert_eq!(idx.query("fresh", 10, &MetadataFilter::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_postings_roundtrip_keeps_scores() {
        let mut idx = KeywordIndex::new();
        idx.add("c1", "search search index", meta("d1"));
        idx.add("c2", "index only", meta("d2"));

        let meta_map: HashMap<String, Metadata> =
            [("c1".to_string(), meta("d1")), ("c2".to_string(), meta("d2"))]
                .into_iter()
                .collect();
        let restored = KeywordIndex::from_postings(idx.to_postings(), meta_map);

        let f = MetadataFilter::new();
        assert_eq!(
            idx.query("search index", 10, &f).unwrap(),
            restored.query("search index", 10, &f).unwrap()
        );
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut idx = KeywordIndex::new();
        idx.add("c1", "shared posting list", meta("d1"));
        let mut next = idx.clone();
        next.add("c2", "shared again", meta("d2"));
        next.delete("c1");

        let f = MetadataFilter::new();
        assert_eq!(idx.query("shared", 10, &f).unwrap()[0].chunk_id, "c1");
        assert_eq!(next.query("shared", 10, &f).unwrap()[0].chunk_id, "c2");
        assert!(idx.query("again", 10, &f).unwrap().is_empty());
    }

    #[test]
    fn test_empty_query_tokens_match_nothing() {
        let mut idx = KeywordIndex::new();
        idx.add("c1", "content", meta("d1"));
        assert!(idx.query("a of", 5, &MetadataFilter::new()).unwrap().is_empty());
    }
}
