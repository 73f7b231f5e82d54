//! Content-hash keyed embedding cache, persisted as `embedding_cache.json`.
//!
//! Keys are SHA-256 hashes of chunk text, so unchanged chunks are never
//! re-embedded across updates, rollbacks, or restarts. The cache is scoped to
//! one model: opening it for a different model (or dimension) starts empty.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingCache {
    pub model: String,
    pub dims: usize,
    entries: HashMap<String, Arc<[f32]>>,
}

impl EmbeddingCache {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
            entries: HashMap::new(),
        }
    }

    /// Keep `loaded` only if it was written for the same model and dimension.
    pub fn adopt(loaded: Option<EmbeddingCache>, model: &str, dims: usize) -> Self {
        match loaded {
            Some(cache) if cache.model == model && cache.dims == dims => cache,
            Some(stale) => {
                tracing::info!(
                    cached_model = %stale.model,
                    model,
                    "embedding cache belongs to another model; starting empty"
                );
                Self::new(model, dims)
            }
            None => Self::new(model, dims),
        }
    }

    pub fn get(&self, hash: &str) -> Option<&Arc<[f32]>> {
        self.entries.get(hash)
    }

    pub fn insert(&mut self, hash: impl Into<String>, vector: Vec<f32>) {
        self.insert_shared(hash, vector.into());
    }

    /// Vectors are shared with the vector index, so cloning the cache copies
    /// pointers only.
    pub fn insert_shared(&mut self, hash: impl Into<String>, vector: Arc<[f32]>) {
        if self.dims == 0 || vector.len() == self.dims {
            self.entries.insert(hash.into(), vector);
        }
    }

    /// Drop vectors whose hash no longer belongs to any live chunk.
    pub fn retain_hashes<'a>(&mut self, live: impl IntoIterator<Item = &'a str>) -> usize {
        let live: std::collections::HashSet<&str> = live.into_iter().collect();
        let before = self.entries.len();
        self.entries.retain(|hash, _| live.contains(hash.as_str()));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adopt_discards_other_models() {
        let mut cache = EmbeddingCache::new("model-a", 2);
        cache.insert("h1", vec![1.0, 0.0]);

        let same = EmbeddingCache::adopt(Some(cache.clone()), "model-a", 2);
        assert_eq!(same.len(), 1);

        let other = EmbeddingCache::adopt(Some(cache.clone()), "model-b", 2);
        assert!(other.is_empty());

        let resized = EmbeddingCache::adopt(Some(cache), "model-a", 3);
        assert!(resized.is_empty());
    }

    #[test]
    fn test_insert_skips_wrong_dims() {
        let mut cache = EmbeddingCache::new("m", 2);
        cache.insert("h1", vec![1.0, 0.0, 0.0]);
        assert!(cache.get("h1").is_none());
    }

    #[test]
    fn test_retain_hashes() {
        let mut cache = EmbeddingCache::new("m", 1);
        cache.insert("keep", vec![1.0]);
        cache.insert("drop", vec![2.0]);
        assert_eq!(cache.retain_hashes(["keep"]), 1);
        assert!(cache.get("keep").is_some());
        assert!(cache.get("drop").is_none());
    }
}
