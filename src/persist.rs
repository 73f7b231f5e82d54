//! Crash-atomic on-disk layout for one knowledge base.
//!
//! ```text
//! <storage.dir>/
//!   commit.json             generation of the last committed write
//!   documents.json          id → stored document (content, metadata, chunks)
//!   keyword_index.json      token → chunk-id posting list
//!   version_index.json      id → { current_version, versions }
//!   embedding_cache.json    model-scoped content hash → vector
//!   versions/<id>_v<N>.json one immutable snapshot per version
//! ```
//!
//! A commit touches three index files, so it is made atomic with a marker:
//!
//! 1. New snapshot files are written. Nothing references them yet.
//! 2. Every index file is staged as `<name>.tmp`, stamped with the next
//!    generation and fsynced. A failure here discards the staged files and
//!    leaves the last commit untouched.
//! 3. `commit.json` is replaced with the new generation. This is the commit
//!    point.
//! 4. Staged files are renamed into place.
//!
//! On load, a staged file carrying the committed generation is moved into
//! place (the commit was interrupted during step 4); any other staged file is
//! from an aborted commit and is deleted. An index file whose generation does
//! not match `commit.json` is a persistence error.
//!
//! `version_index.json` is the authority for which snapshots exist; an
//! orphaned snapshot file is ignored on load. Snapshot files of deleted
//! documents are removed only after the commit that drops them.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use knowledge_harness_core::models::{Document, VersionSnapshot};
use knowledge_harness_core::version::{VersionIndexEntry, VersionStore};
use knowledge_harness_core::{KbError, KbResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingCache;

const COMMIT_FILE: &str = "commit.json";
const DOCUMENTS_FILE: &str = "documents.json";
const KEYWORD_INDEX_FILE: &str = "keyword_index.json";
const VERSION_INDEX_FILE: &str = "version_index.json";
const EMBEDDING_CACHE_FILE: &str = "embedding_cache.json";
const VERSIONS_DIR: &str = "versions";

const INDEX_FILES: [&str; 3] = [DOCUMENTS_FILE, KEYWORD_INDEX_FILE, VERSION_INDEX_FILE];

/// Everything read back from disk by [`Storage::load`].
#[derive(Debug, Default)]
pub struct LoadedState {
    pub documents: BTreeMap<String, Document>,
    /// `None` when `keyword_index.json` is missing.
    pub postings: Option<BTreeMap<String, Vec<String>>>,
    pub versions: VersionStore,
    pub cache: Option<EmbeddingCache>,
}

/// What one commit changed beyond the whole-file indexes.
#[derive(Debug, Default)]
pub struct Delta {
    pub new_snapshots: Vec<VersionSnapshot>,
    /// Deleted documents and the versions whose files should go.
    pub removed: Vec<(String, Vec<u32>)>,
}

/// Borrowed view of the state a commit writes.
pub struct Snapshot<'a> {
    pub documents: BTreeMap<&'a str, &'a Document>,
    pub postings: BTreeMap<&'a str, &'a [String]>,
    pub version_index: BTreeMap<String, VersionIndexEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CommitMarker {
    generation: u64,
}

#[derive(Serialize)]
struct Stamped<'a, T: ?Sized> {
    generation: u64,
    data: &'a T,
}

#[derive(Deserialize)]
struct StampedOwned<T> {
    generation: u64,
    data: T,
}

#[derive(Deserialize)]
struct StampHeader {
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    /// Last committed generation; commits are serialized by the caller.
    generation: Arc<AtomicU64>,
}

impl Storage {
    /// Create the directory tree if needed.
    pub fn open(root: impl Into<PathBuf>) -> KbResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(VERSIONS_DIR)).map_err(|e| io_error(&root, e))?;
        Ok(Self {
            root,
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn snapshot_path(&self, document_id: &str, version: u32) -> PathBuf {
        self.root
            .join(VERSIONS_DIR)
            .join(format!("{}_v{}.json", document_id, version))
    }

    pub fn load(&self) -> KbResult<LoadedState> {
        let committed = read_json::<CommitMarker>(&self.path(COMMIT_FILE))?
            .unwrap_or_default()
            .generation;
        for name in INDEX_FILES {
            self.recover_staged(name, committed)?;
        }

        let documents: Option<BTreeMap<String, Document>> =
            self.read_index(DOCUMENTS_FILE, committed)?;
        let postings = self.read_index(KEYWORD_INDEX_FILE, committed)?;
        let version_index: Option<BTreeMap<String, VersionIndexEntry>> =
            self.read_index(VERSION_INDEX_FILE, committed)?;
        if committed > 0 && (documents.is_none() || version_index.is_none()) {
            return Err(KbError::Persistence(format!(
                "{}: commit {} is recorded but its index files are missing",
                self.root.display(),
                committed
            )));
        }
        let cache = read_json(&self.path(EMBEDDING_CACHE_FILE))?;

        let mut versions = VersionStore::new();
        for (id, entry) in version_index.unwrap_or_default() {
            for v in entry.versions {
                let path = self.snapshot_path(&id, v);
                let snapshot: VersionSnapshot = read_json(&path)?.ok_or_else(|| {
                    KbError::Persistence(format!(
                        "{} is listed in {} but missing",
                        path.display(),
                        VERSION_INDEX_FILE
                    ))
                })?;
                versions.append(snapshot).map_err(|e| {
                    KbError::Persistence(format!("{}: {}", path.display(), e))
                })?;
            }
        }

        self.generation.store(committed, Ordering::SeqCst);
        Ok(LoadedState {
            documents: documents.unwrap_or_default(),
            postings,
            versions,
            cache,
        })
    }

    /// Write one commit. On error the previous commit stays the one that
    /// [`load`](Self::load) returns.
    pub fn save(&self, snapshot: &Snapshot<'_>, delta: &Delta) -> KbResult<()> {
        let generation = self.generation.load(Ordering::SeqCst) + 1;

        for s in &delta.new_snapshots {
            write_json(&self.snapshot_path(&s.document_id, s.version), s)?;
        }

        let staged = [
            (DOCUMENTS_FILE, encode(generation, &snapshot.documents)?),
            (KEYWORD_INDEX_FILE, encode(generation, &snapshot.postings)?),
            (VERSION_INDEX_FILE, encode(generation, &snapshot.version_index)?),
        ];
        for (i, (name, bytes)) in staged.iter().enumerate() {
            let target = self.path(name);
            if let Err(e) = stage(&target, bytes) {
                for (name, _) in &staged[..=i] {
                    discard(&staged_path(&self.path(name)));
                }
                return Err(io_error(&target, e));
            }
        }

        if let Err(e) = write_json(&self.path(COMMIT_FILE), &CommitMarker { generation }) {
            for (name, _) in &staged {
                discard(&staged_path(&self.path(name)));
            }
            return Err(e);
        }
        self.generation.store(generation, Ordering::SeqCst);

        for (name, _) in &staged {
            let target = self.path(name);
            if let Err(e) = publish(&staged_path(&target), &target) {
                tracing::warn!(
                    path = %target.display(),
                    error = %e,
                    "committed file left staged; it is moved into place on next open"
                );
            }
        }

        for (id, versions) in &delta.removed {
            for &v in versions {
                let path = self.snapshot_path(id, v);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    // The index no longer lists it, so a leftover file is harmless.
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove snapshot"),
                }
            }
        }
        Ok(())
    }

    pub fn save_cache(&self, cache: &EmbeddingCache) -> KbResult<()> {
        write_json(&self.path(EMBEDDING_CACHE_FILE), cache)
    }

    /// Finish or discard a commit that stopped after staging `name`.
    fn recover_staged(&self, name: &str, committed: u64) -> KbResult<()> {
        let target = self.path(name);
        let staged = staged_path(&target);
        if !staged.exists() {
            return Ok(());
        }
        let header = read_json::<StampHeader>(&staged).ok().flatten();
        match header {
            Some(h) if committed > 0 && h.generation == committed => {
                tracing::warn!(file = name, generation = committed, "completing interrupted commit");
                publish(&staged, &target).map_err(|e| io_error(&target, e))
            }
            _ => {
                tracing::warn!(file = name, "discarding staged file from an aborted commit");
                discard(&staged);
                Ok(())
            }
        }
    }

    fn read_index<T: DeserializeOwned>(&self, name: &str, committed: u64) -> KbResult<Option<T>> {
        let path = self.path(name);
        let Some(stamped) = read_json::<StampedOwned<T>>(&path)? else {
            return Ok(None);
        };
        if stamped.generation != committed {
            return Err(KbError::Persistence(format!(
                "{}: written by commit {}, but the last commit is {}",
                path.display(),
                stamped.generation,
                committed
            )));
        }
        Ok(Some(stamped.data))
    }
}

/// Chunk metadata map used to rebuild a keyword index from stored documents.
pub fn chunk_metadata<'a>(
    documents: impl IntoIterator<Item = &'a Document>,
) -> HashMap<String, knowledge_harness_core::models::Metadata> {
    documents
        .into_iter()
        .flat_map(|d| d.chunks.iter())
        .map(|c| (c.id.clone(), c.metadata_view()))
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> KbResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| KbError::Persistence(format!("{}: {}", path.display(), e)))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> KbResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| KbError::Persistence(format!("{}: {}", path.display(), e)))?;
    write_atomic(path, &bytes).map_err(|e| io_error(path, e))
}

fn encode<T: Serialize + ?Sized>(generation: u64, data: &T) -> KbResult<Vec<u8>> {
    serde_json::to_vec_pretty(&Stamped { generation, data })
        .map_err(|e| KbError::Persistence(format!("encoding commit {}: {}", generation, e)))
}

fn staged_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `bytes` to `<path>.tmp` and fsync it.
fn stage(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(staged_path(path))?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Rename `staged` over `path` and persist the rename.
fn publish(staged: &Path, path: &Path) -> std::io::Result<()> {
    fs::rename(staged, path)?;
    // Not supported for directories on every platform, so failure here is ignored.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn discard(staged: &Path) {
    match fs::remove_file(staged) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %staged.display(), error = %e, "could not remove staged file"),
    }
}

/// Write `bytes` to `<path>.tmp`, fsync, and rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    stage(path, bytes)?;
    publish(&staged_path(path), path)
}

fn io_error(path: &Path, e: std::io::Error) -> KbError {
    KbError::Persistence(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowledge_harness_core::models::{Metadata, SourceType};
    use tempfile::TempDir;

    fn doc(id: &str, version: u32, content: &str) -> Document {
        let mut d = Document::new(SourceType::Text, "notes", content, Metadata::new());
        d.id = id.to_string();
        d.version = version;
        d
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_tmp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!tmp.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_load_empty_dir() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        let loaded = storage.load().unwrap();
        assert!(loaded.documents.is_empty());
        assert!(loaded.postings.is_none());
        assert!(loaded.cache.is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();

        let d1 = doc("d1", 1, "first");
        let d2 = doc("d1", 2, "second");
        let mut versions = VersionStore::new();
        let s1 = versions.add_version(&d1).unwrap();
        let s2 = versions.add_version(&d2).unwrap();

        let mut postings = BTreeMap::new();
        postings.insert("second".to_string(), vec!["c1".to_string()]);
        let snapshot = Snapshot {
            documents: [("d1", &d2)].into_iter().collect(),
            postings: postings
                .iter()
                .map(|(t, ids)| (t.as_str(), ids.as_slice()))
                .collect(),
            version_index: versions.index(),
        };
        let delta = Delta {
            new_snapshots: vec![s1, s2],
            removed: vec![],
        };
        storage.save(&snapshot, &delta).unwrap();

        let loaded = storage.load().unwrap();
        assert_eq!(loaded.documents["d1"], d2);
        assert_eq!(loaded.postings, Some(postings));
        assert_eq!(loaded.versions.current_version("d1"), Some(2));
        assert_eq!(
            loaded.versions.get_version("d1", Some(1)).unwrap().content,
            "first"
        );
        assert!(storage.snapshot_path("d1", 2).exists());
    }

    #[test]
    fn test_removed_document_files_deleted() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        let d = doc("gone", 1, "bye");
        let mut versions = VersionStore::new();
        let s = versions.add_version(&d).unwrap();
        storage
            .save(
                &Snapshot {
                    documents: [("gone", &d)].into_iter().collect(),
                    postings: BTreeMap::new(),
                    version_index: versions.index(),
                },
                &Delta {
                    new_snapshots: vec![s],
                    removed: vec![],
                },
            )
            .unwrap();

        versions.delete_document("gone");
        storage
            .save(
                &Snapshot {
                    documents: BTreeMap::new(),
                    postings: BTreeMap::new(),
                    version_index: versions.index(),
                },
                &Delta {
                    new_snapshots: vec![],
                    removed: vec![("gone".to_string(), vec![1])],
                },
            )
            .unwrap();

        assert!(!storage.snapshot_path("gone", 1).exists());
        assert!(storage.load().unwrap().documents.is_empty());
    }

    fn save_docs(
        storage: &Storage,
        docs: &[&Document],
        versions: &VersionStore,
        new: Vec<VersionSnapshot>,
    ) -> KbResult<()> {
        storage.save(
            &Snapshot {
                documents: docs.iter().map(|d| (d.id.as_str(), *d)).collect(),
                postings: BTreeMap::new(),
                version_index: versions.index(),
            },
            &Delta {
                new_snapshots: new,
                removed: vec![],
            },
        )
    }

    #[test]
    fn test_missing_listed_snapshot_is_persistence_error() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        fs::write(tmp.path().join(COMMIT_FILE), r#"{"generation": 1}"#).unwrap();
        fs::write(
            tmp.path().join(DOCUMENTS_FILE),
            r#"{"generation": 1, "data": {}}"#,
        )
        .unwrap();
        fs::write(
            tmp.path().join(VERSION_INDEX_FILE),
            r#"{"generation": 1, "data": {"d1": {"current_version": 1, "versions": [1]}}}"#,
        )
        .unwrap();
        assert!(matches!(storage.load(), Err(KbError::Persistence(_))));
    }

    #[test]
    fn test_failed_staging_keeps_last_commit() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        let v1 = doc("d1", 1, "original");
        let mut versions = VersionStore::new();
        let s1 = versions.add_version(&v1).unwrap();
        save_docs(&storage, &[&v1], &versions, vec![s1]).unwrap();

        // A directory in the way makes staging the keyword index fail.
        let blocker = tmp.path().join("keyword_index.json.tmp");
        fs::create_dir(&blocker).unwrap();
        let v2 = doc("d1", 2, "aborted");
        let mut next = versions.clone();
        let s2 = next.add_version(&v2).unwrap();
        let err = save_docs(&storage, &[&v2], &next, vec![s2]).unwrap_err();
        assert!(matches!(err, KbError::Persistence(_)));
        assert!(!tmp.path().join("documents.json.tmp").exists());
        fs::remove_dir(&blocker).unwrap();

        let loaded = Storage::open(tmp.path()).unwrap().load().unwrap();
        assert_eq!(loaded.documents["d1"].version, 1);
        assert_eq!(loaded.documents["d1"].content, "original");
        assert_eq!(loaded.versions.current_version("d1"), Some(1));
    }

    #[test]
    fn test_interrupted_commit_rolls_forward() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        let v1 = doc("d1", 1, "original");
        let mut versions = VersionStore::new();
        let s1 = versions.add_version(&v1).unwrap();
        save_docs(&storage, &[&v1], &versions, vec![s1]).unwrap();

        // Stage and mark commit 2 without moving the files into place.
        let v2 = doc("d1", 2, "committed");
        let s2 = versions.add_version(&v2).unwrap();
        write_json(&storage.snapshot_path("d1", 2), &s2).unwrap();
        let documents: BTreeMap<&str, &Document> = [("d1", &v2)].into_iter().collect();
        let postings: BTreeMap<&str, &[String]> = BTreeMap::new();
        stage(&storage.path(DOCUMENTS_FILE), &encode(2, &documents).unwrap()).unwrap();
        stage(&storage.path(KEYWORD_INDEX_FILE), &encode(2, &postings).unwrap()).unwrap();
        stage(&storage.path(VERSION_INDEX_FILE), &encode(2, &versions.index()).unwrap()).unwrap();
        write_json(&storage.path(COMMIT_FILE), &CommitMarker { generation: 2 }).unwrap();

        let loaded = Storage::open(tmp.path()).unwrap().load().unwrap();
        assert_eq!(loaded.documents["d1"].content, "committed");
        assert_eq!(loaded.versions.current_version("d1"), Some(2));
        for name in INDEX_FILES {
            assert!(!staged_path(&tmp.path().join(name)).exists());
        }
    }

    #[test]
    fn test_staged_files_without_marker_are_discarded() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        let v1 = doc("d1", 1, "original");
        let mut versions = VersionStore::new();
        let s1 = versions.add_version(&v1).unwrap();
        save_docs(&storage, &[&v1], &versions, vec![s1]).unwrap();

        let v2 = doc("d1", 2, "never committed");
        let documents: BTreeMap<&str, &Document> = [("d1", &v2)].into_iter().collect();
        stage(&storage.path(DOCUMENTS_FILE), &encode(2, &documents).unwrap()).unwrap();

        let loaded = Storage::open(tmp.path()).unwrap().load().unwrap();
        assert_eq!(loaded.documents["d1"].content, "original");
        assert!(!staged_path(&storage.path(DOCUMENTS_FILE)).exists());
    }

    #[test]
    fn test_generation_mismatch_is_persistence_error() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        let v1 = doc("d1", 1, "original");
        let mut versions = VersionStore::new();
        let s1 = versions.add_version(&v1).unwrap();
        save_docs(&storage, &[&v1], &versions, vec![s1]).unwrap();
        fs::write(tmp.path().join(COMMIT_FILE), r#"{"generation": 7}"#).unwrap();
        assert!(matches!(
            Storage::open(tmp.path()).unwrap().load(),
            Err(KbError::Persistence(_))
        ));
    }

    #[test]
    fn test_corrupt_file_is_persistence_error() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        fs::write(tmp.path().join(DOCUMENTS_FILE), b"{not json").unwrap();
        assert!(matches!(storage.load(), Err(KbError::Persistence(_))));
    }
}
