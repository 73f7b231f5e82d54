//! Append-only document version history.
//!
//! Every add, update, and rollback appends an immutable [`VersionSnapshot`].
//! Snapshots are never rewritten; the only destructive operation is
//! [`VersionStore::delete_document`], which drops a document's whole history.
//!
//! Rollback is an append: rolling back to `v1` writes `current + 1` with
//! `v1`'s content and metadata, tagged `rollback_from = v1`, and `v1` stays
//! addressable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};
use crate::models::{
    ContentDiff, Document, MetadataDiff, ValueChange, VersionDiff, VersionInfo, VersionSnapshot,
};

/// Per-document pointer record, persisted as `version_index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionIndexEntry {
    pub current_version: u32,
    pub versions: Vec<u32>,
}

/// Snapshots are shared behind `Arc` so cloning the store for a
/// copy-on-write commit does not copy document text.
#[derive(Debug, Clone, Default)]
pub struct VersionStore {
    docs: HashMap<String, BTreeMap<u32, Arc<VersionSnapshot>>>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot of `doc` at `doc.version`.
    pub fn add_version(&mut self, doc: &Document) -> KbResult<VersionSnapshot> {
        self.append(VersionSnapshot::from_document(doc, None))
    }

    /// Append an already-built snapshot. Its version must exceed the current one.
    pub fn append(&mut self, snapshot: VersionSnapshot) -> KbResult<VersionSnapshot> {
        if snapshot.version == 0 {
            return Err(KbError::validation("versions start at 1"));
        }
        let history = self.docs.entry(snapshot.document_id.clone()).or_default();
        if let Some((&current, _)) = history.last_key_value() {
            if snapshot.version <= current {
                return Err(KbError::validation(format!(
                    "version {} of {} is not newer than current version {}",
                    snapshot.version, snapshot.document_id, current
                )));
            }
        }
        history.insert(snapshot.version, Arc::new(snapshot.clone()));
        Ok(snapshot)
    }

    /// Fetch a snapshot; `None` means the current version.
    pub fn get_version(&self, document_id: &str, version: Option<u32>) -> KbResult<&VersionSnapshot> {
        let history = self
            .docs
            .get(document_id)
            .ok_or_else(|| KbError::document_not_found(document_id))?;
        let snapshot = match version {
            Some(v) => history
                .get(&v)
                .ok_or_else(|| KbError::version_not_found(document_id, v))?,
            None => history
                .last_key_value()
                .map(|(_, s)| s)
                .ok_or_else(|| KbError::document_not_found(document_id))?,
        };
        Ok(snapshot.as_ref())
    }

    pub fn current_version(&self, document_id: &str) -> Option<u32> {
        self.docs
            .get(document_id)
            .and_then(|h| h.last_key_value().map(|(v, _)| *v))
    }

    /// Append `current + 1` carrying `target`'s content and metadata.
    pub fn rollback(
        &mut self,
        document_id: &str,
        target: u32,
        timestamp: DateTime<Utc>,
    ) -> KbResult<VersionSnapshot> {
        let source = self.get_version(document_id, Some(target))?.clone();
        let current = self
            .current_version(document_id)
            .ok_or_else(|| KbError::document_not_found(document_id))?;

        self.append(VersionSnapshot {
            version: current + 1,
            timestamp,
            rollback_from: Some(target),
            ..source
        })
    }

    /// Metadata key-level and content-statistics diff from `v1` to `v2`.
    pub fn compare_versions(&self, document_id: &str, v1: u32, v2: u32) -> KbResult<VersionDiff> {
        let a = self.get_version(document_id, Some(v1))?;
        let b = self.get_version(document_id, Some(v2))?;

        let mut metadata = MetadataDiff::default();
        for (key, old) in &a.metadata {
            match b.metadata.get(key) {
                None => {
                    metadata.removed.insert(key.clone(), old.clone());
                }
                Some(new) if new != old => {
                    metadata.changed.insert(
                        key.clone(),
                        ValueChange {
                            from: old.clone(),
                            to: new.clone(),
                        },
                    );
                }
                Some(_) => {}
            }
        }
        for (key, new) in &b.metadata {
            if !a.metadata.contains_key(key) {
                metadata.added.insert(key.clone(), new.clone());
            }
        }

        let length_from = a.content.chars().count();
        let length_to = b.content.chars().count();
        let words_from = a.content.split_whitespace().count();
        let words_to = b.content.split_whitespace().count();

        Ok(VersionDiff {
            document_id: document_id.to_string(),
            from_version: v1,
            to_version: v2,
            metadata,
            content: ContentDiff {
                length_from,
                length_to,
                length_delta: length_to as i64 - length_from as i64,
                words_from,
                words_to,
                word_delta: words_to as i64 - words_from as i64,
                identical: a.content == b.content,
            },
        })
    }

    /// Version list, oldest first.
    pub fn history(&self, document_id: &str) -> KbResult<Vec<VersionInfo>> {
        let history = self
            .docs
            .get(document_id)
            .ok_or_else(|| KbError::document_not_found(document_id))?;
        let current = history.last_key_value().map(|(v, _)| *v);
        Ok(history
            .values()
            .map(|s| VersionInfo {
                version: s.version,
                timestamp: s.timestamp,
                content_length: s.content.chars().count(),
                rollback_from: s.rollback_from,
                current: Some(s.version) == current,
            })
            .collect())
    }

    /// Drop every snapshot of `document_id`.
    pub fn delete_document(&mut self, document_id: &str) -> bool {
        self.docs.remove(document_id).is_some()
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.docs.contains_key(document_id)
    }

    pub fn snapshots(&self, document_id: &str) -> impl Iterator<Item = &VersionSnapshot> {
        self.docs
            .get(document_id)
            .into_iter()
            .flat_map(|h| h.values().map(|s| s.as_ref()))
    }

    pub fn document_ids(&self) -> BTreeSet<&String> {
        self.docs.keys().collect()
    }

    pub fn index(&self) -> BTreeMap<String, VersionIndexEntry> {
        self.docs
            .iter()
            .filter_map(|(id, history)| {
                let (&current, _) = history.last_key_value()?;
                Some((
                    id.clone(),
                    VersionIndexEntry {
                        current_version: current,
                        versions: history.keys().copied().collect(),
                    },
                ))
            })
            .collect()
    }

    pub fn total_snapshots(&self) -> usize {
        self.docs.values().map(BTreeMap::len).sum()
    }
}

/// Rebuild a chunk-less [`Document`] view of a historical snapshot.
///
/// Older versions are not indexed, so their `chunks` are empty;
/// `previous_version_refs` lists every earlier version in the history.
pub fn snapshot_to_document(store: &VersionStore, snapshot: &VersionSnapshot) -> Document {
    let created_at = store
        .snapshots(&snapshot.document_id)
        .next()
        .map(|s| s.timestamp)
        .unwrap_or(snapshot.timestamp);
    Document {
        id: snapshot.document_id.clone(),
        source_type: snapshot.source_type,
        source_name: snapshot.source_name.clone(),
        content: snapshot.content.clone(),
        metadata: snapshot.metadata.clone(),
        version: snapshot.version,
        chunks: Vec::new(),
        previous_version_refs: store
            .snapshots(&snapshot.document_id)
            .map(|s| s.version)
            .filter(|v| *v < snapshot.version)
            .collect(),
        created_at,
        updated_at: snapshot.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Metadata, SourceType};
    use serde_json::json;

    fn doc(content: &str, version: u32, meta: Metadata) -> Document {
        let mut d = Document::new(SourceType::Text, "notes", content, meta);
        d.id = "doc-1".to_string();
        d.version = version;
        d
    }

    fn meta(pairs: &[(&str, serde_json::Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_add_and_get_current() {
        let mut store = VersionStore::new();
        store.add_version(&doc("one", 1, Metadata::new())).unwrap();
        store.add_version(&doc("two", 2, Metadata::new())).unwrap();

        assert_eq!(store.get_version("doc-1", None).unwrap().content, "two");
        assert_eq!(store.get_version("doc-1", Some(1)).unwrap().content, "one");
        assert_eq!(store.current_version("doc-1"), Some(2));
    }

    #[test]
    fn test_non_monotonic_version_rejected() {
        let mut store = VersionStore::new();
        store.add_version(&doc("one", 2, Metadata::new())).unwrap();
        assert!(matches!(
            store.add_version(&doc("again", 2, Metadata::new())),
            Err(KbError::Validation(_))
        ));
        assert!(matches!(
            store.add_version(&doc("older", 1, Metadata::new())),
            Err(KbError::Validation(_))
        ));
    }

    #[test]
    fn test_not_found() {
        let mut store = VersionStore::new();
        assert!(matches!(
            store.get_version("nope", None),
            Err(KbError::NotFound { kind: "document", .. })
        ));
        store.add_version(&doc("one", 1, Metadata::new())).unwrap();
        assert!(matches!(
            store.get_version("doc-1", Some(7)),
            Err(KbError::NotFound { kind: "version", .. })
        ));
    }

    #[test]
    fn test_rollback_appends_and_preserves_target() {
        let mut store = VersionStore::new();
        let m1 = meta(&[("owner", json!("ana"))]);
        store.add_version(&doc("first draft", 1, m1.clone())).unwrap();
        store
            .add_version(&doc("second draft", 2, Metadata::new()))
            .unwrap();

        let snap = store.rollback("doc-1", 1, Utc::now()).unwrap();
        assert_eq!(snap.version, 3);
        assert_eq!(snap.content, "first draft");
        assert_eq!(snap.metadata, m1);
        assert_eq!(snap.rollback_from, Some(1));

        let v1 = store.get_version("doc-1", Some(1)).unwrap();
        assert_eq!(v1.content, "first draft");
        assert_eq!(v1.rollback_from, None);
        assert_eq!(store.current_version("doc-1"), Some(3));
    }

    #[test]
    fn test_rollback_to_missing_version() {
        let mut store = VersionStore::new();
        store.add_version(&doc("one", 1, Metadata::new())).unwrap();
        assert!(store.rollback("doc-1", 5, Utc::now()).is_err());
        assert_eq!(store.current_version("doc-1"), Some(1));
    }

    #[test]
    fn test_compare_versions() {
        let mut store = VersionStore::new();
        store
            .add_version(&doc(
                "alpha beta",
                1,
                meta(&[("a", json!(1)), ("b", json!("x"))]),
            ))
            .unwrap();
        store
            .add_version(&doc(
                "alpha beta gamma delta",
                2,
                meta(&[("b", json!("y")), ("c", json!(true))]),
            ))
            .unwrap();

        let diff = store.compare_versions("doc-1", 1, 2).unwrap();
        assert_eq!(diff.metadata.added.keys().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(diff.metadata.removed.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(diff.metadata.changed["b"].from, json!("x"));
        assert_eq!(diff.metadata.changed["b"].to, json!("y"));
        assert_eq!(diff.content.length_delta, 12);
        assert_eq!(diff.content.word_delta, 2);
        assert!(!diff.content.identical);
    }

    #[test]
    fn test_history_and_index() {
        let mut store = VersionStore::new();
        store.add_version(&doc("one", 1, Metadata::new())).unwrap();
        store.add_version(&doc("two", 2, Metadata::new())).unwrap();
        store.rollback("doc-1", 1, Utc::now()).unwrap();

        let history = store.history("doc-1").unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[2].current);
        assert_eq!(history[2].rollback_from, Some(1));

        let index = store.index();
        assert_eq!(index["doc-1"].current_version, 3);
        assert_eq!(index["doc-1"].versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_delete_document_drops_history() {
        let mut store = VersionStore::new();
        store.add_version(&doc("one", 1, Metadata::new())).unwrap();
        assert!(store.delete_document("doc-1"));
        assert!(!store.delete_document("doc-1"));
        assert!(store.get_version("doc-1", None).is_err());
        assert_eq!(store.total_snapshots(), 0);
    }

    #[test]
    fn test_snapshot_to_document() {
        let mut store = VersionStore::new();
        store.add_version(&doc("one", 1, Metadata::new())).unwrap();
        store.add_version(&doc("two", 2, Metadata::new())).unwrap();
        let snap = store.get_version("doc-1", Some(2)).unwrap().clone();
        let d = snapshot_to_document(&store, &snap);
        assert_eq!(d.version, 2);
        assert_eq!(d.previous_version_refs, vec![1]);
        assert!(d.chunks.is_empty());
    }
}
