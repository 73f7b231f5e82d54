//! In-memory vector index with brute-force cosine ranking.
//!
//! Entries live in a dense slot vector addressed through an id → slot map.
//! Deletes leave tombstones so existing slot numbers stay valid; [`VectorIndex::rebuild`]
//! compacts them away once enough have accumulated.
//!
//! Entries and their vectors are reference-counted, so cloning an index to
//! publish a new state copies pointers, not embeddings.

use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::cosine_similarity;
use crate::error::{KbError, KbResult};
use crate::models::{Metadata, MetadataFilter};

/// Stored vector plus the chunk metadata captured at index time.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub vector: Arc<[f32]>,
    pub metadata: Metadata,
}

/// A nearest-neighbour result.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    /// `1 - cosine_distance`; can drift slightly outside `[-1, 1]`.
    pub score: f64,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    slots: Vec<Option<Arc<VectorEntry>>>,
    by_id: HashMap<String, usize>,
    dims: Option<usize>,
    tombstones: usize,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `chunk_id`.
    ///
    /// The first vector fixes the index dimension; later vectors of a
    /// different length are rejected.
    pub fn add(&mut self, chunk_id: &str, vector: Vec<f32>, metadata: Metadata) -> KbResult<()> {
        self.add_shared(chunk_id, vector.into(), metadata)
    }

    /// [`add`](Self::add) for a vector that is already shared, e.g. with the
    /// embedding cache.
    pub fn add_shared(
        &mut self,
        chunk_id: &str,
        vector: Arc<[f32]>,
        metadata: Metadata,
    ) -> KbResult<()> {
        if vector.is_empty() {
            return Err(KbError::validation("vector must not be empty"));
        }
        match self.dims {
            Some(d) if d != vector.len() => {
                return Err(KbError::validation(format!(
                    "vector dimension {} does not match index dimension {}",
                    vector.len(),
                    d
                )));
            }
            None => self.dims = Some(vector.len()),
            _ => {}
        }

        let entry = Arc::new(VectorEntry {
            chunk_id: chunk_id.to_string(),
            vector,
            metadata,
        });
        match self.by_id.get(chunk_id) {
            Some(&slot) => self.slots[slot] = Some(entry),
            None => {
                self.by_id.insert(chunk_id.to_string(), self.slots.len());
                self.slots.push(Some(entry));
            }
        }
        Ok(())
    }

    /// Rank stored vectors against `vector`, keeping only those whose metadata
    /// satisfies `filter`. Ties are broken by chunk id ascending.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> KbResult<Vec<VectorHit>> {
        if k == 0 {
            return Err(KbError::validation("k must be >= 1"));
        }
        let dims = match self.dims {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };
        if vector.len() != dims {
            return Err(KbError::validation(format!(
                "query vector dimension {} does not match index dimension {}",
                vector.len(),
                dims
            )));
        }

        let mut hits: Vec<VectorHit> = self
            .entries()
            .filter(|e| filter.matches(&e.metadata))
            .map(|e| VectorHit {
                chunk_id: e.chunk_id.clone(),
                score: cosine_similarity(vector, &e.vector) as f64,
                metadata: e.metadata.clone(),
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

    /// Remove an entry. Deleting an absent id is a no-op returning `false`.
    pub fn delete(&mut self, chunk_id: &str) -> bool {
        match self.by_id.remove(chunk_id) {
            Some(slot) => {
                self.slots[slot] = None;
                self.tombstones += 1;
                true
            }
            None => false,
        }
    }

    /// Compact storage, dropping tombstones. Entry contents are preserved
    /// exactly; only slot positions change.
    pub fn rebuild(&mut self) {
        let live: Vec<Arc<VectorEntry>> = self.slots.drain(..).flatten().collect();
        self.by_id.clear();
        for (slot, entry) in live.iter().enumerate() {
            self.by_id.insert(entry.chunk_id.clone(), slot);
        }
        self.slots = live.into_iter().map(Some).collect();
        self.tombstones = 0;
        if self.slots.is_empty() {
            self.dims = None;
        }
    }

    /// Rebuild when more than half of the slots are tombstones.
    pub fn maybe_compact(&mut self) -> bool {
        if self.tombstones > 0 && self.tombstones * 2 > self.slots.len() {
            self.rebuild();
            true
        } else {
            false
        }
    }

    pub fn get(&self, chunk_id: &str) -> Option<&VectorEntry> {
        self.by_id
            .get(chunk_id)
            .and_then(|&slot| self.slots[slot].as_deref())
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.by_id.contains_key(chunk_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    /// Allocated slots, including tombstones.
    pub fn capacity_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &VectorEntry> {
        self.slots.iter().flatten().map(|e| e.as_ref())
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

    fn sample() -> VectorIndex {
        let mut idx = VectorIndex::new();
        idx.add("c1", vec![1.0, 0.0], meta("d1")).unwrap();
        idx.add("c2", vec![0.0, 1.0], meta("d2")).unwrap();
        idx.add("c3", vec![0.7, 0.7], meta("d1")).unwrap();
        idx
    }

    #[test]
    fn test_query_ranks_by_cosine() {
        let idx = sample();
        let hits = idx.query(&[1.0, 0.0], 3, &MetadataFilter::new()).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3", "c2"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_query_filter_is_exact() {
        let idx = sample();
        let hits = idx
            .query(&[0.0, 1.0], 10, &MetadataFilter::document("d1"))
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.metadata["document_id"] == json!("d1")));
    }

    #[test]
    fn test_ties_break_by_chunk_id() {
        let mut idx = VectorIndex::new();
        idx.add("b", vec![1.0, 0.0], Metadata::new()).unwrap();
        idx.add("a", vec![2.0, 0.0], Metadata::new()).unwrap();
        let hits = idx.query(&[1.0, 0.0], 2, &MetadataFilter::new()).unwrap();
        assert_eq!(hits[0].chunk_id, "a");
        assert_eq!(hits[1].chunk_id, "b");
    }

    #[test]
    fn test_add_replaces_existing() {
        let mut idx = sample();
        idx.add("c1", vec![0.0, 1.0], meta("d9")).unwrap();
        assert_eq!(idx.len(), 3);
        assert_eq!(&*idx.get("c1").unwrap().vector, &[0.0, 1.0]);
        assert_eq!(idx.get("c1").unwrap().metadata["document_id"], json!("d9"));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut idx = sample();
        assert!(matches!(
            idx.add("c4", vec![1.0, 2.0, 3.0], Metadata::new()),
            Err(KbError::Validation(_))
        ));
        assert!(idx.query(&[1.0], 1, &MetadataFilter::new()).is_err());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut idx = sample();
        assert!(idx.delete("c2"));
        assert!(!idx.delete("c2"));
        assert!(!idx.delete("never-added"));
        assert_eq!(idx.len(), 2);
        let hits = idx.query(&[0.0, 1.0], 10, &MetadataFilter::new()).unwrap();
        assert!(hits.iter().all(|h| h.chunk_id != "c2"));
    }

    #[test]
    fn test_rebuild_preserves_entries() {
        let mut idx = sample();
        let before_c3 = idx.get("c3").cloned().unwrap();
        idx.delete("c1");
        idx.delete("c2");
        assert_eq!(idx.capacity_slots(), 3);
        idx.rebuild();
        assert_eq!(idx.capacity_slots(), 1);
        assert_eq!(idx.get("c3"), Some(&before_c3));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_maybe_compact_threshold() {
        let mut idx = sample();
        idx.delete("c1");
        assert!(!idx.maybe_compact());
        idx.delete("c2");
        assert!(idx.maybe_compact());
        assert_eq!(idx.capacity_slots(), 1);
    }

    #[test]
    fn test_clone_shares_vectors() {
        let idx = sample();
        let mut next = idx.clone();
        next.add("c4", vec![0.5, 0.5], meta("d3")).unwrap();
        assert!(Arc::ptr_eq(
            &idx.get("c1").unwrap().vector,
            &next.get("c1").unwrap().vector
        ));
        assert!(!idx.contains("c4"));
    }

    #[test]
    fn test_zero_k_rejected() {
        let idx = sample();
        assert!(matches!(
            idx.query(&[1.0, 0.0], 0, &MetadataFilter::new()),
            Err(KbError::Validation(_))
        ));
    }
}
