//! Source normalization: raw text, files, and URLs into chunked [`Document`]s.
//!
//! Caller-supplied text is kept verbatim. Text extracted from files and web
//! pages goes through [`normalize_text`] first (line endings, trailing
//! whitespace, blank-line runs).
//!
//! Every call re-chunks the full content; there is no incremental
//! re-chunking, so an update or rollback always yields a fresh chunk set.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use knowledge_harness_core::chunk::{chunk_document, ChunkingParams};
use knowledge_harness_core::models::{Document, Metadata, SourceType};
use knowledge_harness_core::{KbError, KbResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::extract::{extract_text, ContentKind, ExtractError};

/// A raw input to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    Text { name: String, content: String },
    File { path: PathBuf },
    Url { url: String },
}

impl Source {
    pub fn text(name: impl Into<String>, content: impl Into<String>) -> Self {
        Source::Text {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Source::File { path: path.into() }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Source::Url { url: url.into() }
    }

    /// Human-readable label used in logs and batch reports.
    pub fn label(&self) -> String {
        match self {
            Source::Text { name, .. } => name.clone(),
            Source::File { path } => path.display().to_string(),
            Source::Url { url } => url.clone(),
        }
    }
}

pub struct DocumentProcessor {
    params: ChunkingParams,
    max_file_bytes: u64,
    http: reqwest::Client,
}

impl DocumentProcessor {
    pub fn new(config: &Config) -> KbResult<Self> {
        let params = config.chunking.params();
        params.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.ingest.url_timeout_secs))
            .user_agent(concat!("knowledge-harness/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KbError::Validation(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            params,
            max_file_bytes: config.ingest.max_file_bytes,
            http,
        })
    }

    pub fn params(&self) -> &ChunkingParams {
        &self.params
    }

    /// Extract, normalize, and chunk `source` into a version-1 document.
    pub async fn process(&self, source: &Source, metadata: Metadata) -> KbResult<Document> {
        let (source_type, source_name, content, mut metadata) = match source {
            Source::Text { name, content } => {
                (SourceType::Text, name.clone(), content.clone(), metadata)
            }
            Source::File { path } => {
                let (content, kind) = self.read_file(path).await?;
                let mut metadata = metadata;
                metadata.insert("file_path".into(), Value::from(path.display().to_string()));
                metadata.insert("content_type".into(), Value::from(kind.mime()));
                (SourceType::File, file_label(path), content, metadata)
            }
            Source::Url { url } => {
                let (content, kind) = self.fetch_url(url).await?;
                let mut metadata = metadata;
                metadata.insert("url".into(), Value::from(url.clone()));
                metadata.insert("content_type".into(), Value::from(kind.mime()));
                (SourceType::Url, url.clone(), content, metadata)
            }
        };
        if source_type != SourceType::Text {
            metadata.insert("extracted_at".into(), Value::from(Utc::now().to_rfc3339()));
        }

        let mut doc = Document::new(source_type, source_name, content, metadata);
        doc.chunks = chunk_document(&doc, &self.params)?;
        Ok(doc)
    }

    /// Re-chunk `doc` in place from its current content.
    pub fn rechunk(&self, doc: &mut Document) -> KbResult<()> {
        doc.chunks = chunk_document(doc, &self.params)?;
        Ok(())
    }

    /// Next version of `existing` with `new_content`; metadata is carried over.
    pub fn update(&self, existing: &Document, new_content: &str) -> KbResult<Document> {
        self.with_content(existing, new_content, existing.metadata.clone())
    }

    /// Next version of `existing` with the given content and metadata.
    ///
    /// `version` is bumped by one, the old version is appended to
    /// `previous_version_refs`, and the chunk set is fully replaced.
    pub fn with_content(
        &self,
        existing: &Document,
        content: &str,
        metadata: Metadata,
    ) -> KbResult<Document> {
        let mut previous_version_refs = existing.previous_version_refs.clone();
        previous_version_refs.push(existing.version);

        let mut doc = Document {
            id: existing.id.clone(),
            source_type: existing.source_type,
            source_name: existing.source_name.clone(),
            content: content.to_string(),
            metadata,
            version: existing.version + 1,
            chunks: Vec::new(),
            previous_version_refs,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };
        doc.chunks = chunk_document(&doc, &self.params)?;
        Ok(doc)
    }

    async fn read_file(&self, path: &Path) -> KbResult<(String, ContentKind)> {
        let label = path.display().to_string();
        let kind = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ContentKind::from_extension)
            .ok_or_else(|| {
                KbError::UnsupportedFormat(format!("{}: unrecognized file extension", label))
            })?;

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| extraction_failed(&label, e))?;
        if meta.len() > self.max_file_bytes {
            return Err(extraction_failed(
                &label,
                format!(
                    "file is {} bytes, limit is {}",
                    meta.len(),
                    self.max_file_bytes
                ),
            ));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| extraction_failed(&label, e))?;
        let text = extract_blocking(bytes, kind)
            .await
            .map_err(|e| e.into_kb_error(&label))?;
        Ok((normalize_text(&text), kind))
    }

    async fn fetch_url(&self, url: &str) -> KbResult<(String, ContentKind)> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(KbError::validation(format!(
                "url must start with http:// or https://, got '{}'",
                url
            )));
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| extraction_failed(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(extraction_failed(url, format!("HTTP {}", status)));
        }

        let kind = match response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            Some(ct) => ContentKind::from_mime(ct).ok_or_else(|| {
                KbError::UnsupportedFormat(format!("{}: content type {}", url, ct))
            })?,
            None => ContentKind::Html,
        };

        if response
            .content_length()
            .is_some_and(|len| len > self.max_file_bytes)
        {
            return Err(extraction_failed(url, "response exceeds max_file_bytes"));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| extraction_failed(url, e))?;
        if bytes.len() as u64 > self.max_file_bytes {
            return Err(extraction_failed(url, "response exceeds max_file_bytes"));
        }

        let text = extract_blocking(bytes.to_vec(), kind)
            .await
            .map_err(|e| e.into_kb_error(url))?;
        Ok((normalize_text(&text), kind))
    }
}

/// PDF and DOCX parsing is CPU-bound; keep it off the async workers.
async fn extract_blocking(bytes: Vec<u8>, kind: ContentKind) -> Result<String, ExtractError> {
    tokio::task::spawn_blocking(move || extract_text(&bytes, kind))
        .await
        .unwrap_or_else(|e| Err(ExtractError::Aborted(e.to_string())))
}

fn extraction_failed(source_name: &str, reason: impl std::fmt::Display) -> KbError {
    KbError::ExtractionFailed {
        source_name: source_name.to_string(),
        reason: reason.to_string(),
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// CRLF → LF, trailing whitespace trimmed per line, runs of three or more
/// newlines collapsed to two, outer whitespace trimmed.
pub fn normalize_text(text: &str) -> String {
    let unix = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unix.len());
    let mut blank_run = 0usize;
    for line in unix.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn processor(dir: &Path, size: usize, overlap: usize) -> DocumentProcessor {
        let mut config = Config::minimal(dir);
        config.chunking.chunk_size = size;
        config.chunking.chunk_overlap = overlap;
        config.ingest.max_file_bytes = 1024;
        DocumentProcessor::new(&config).unwrap()
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(
            normalize_text("  a  \r\nb\n\n\n\n c\t\n"),
            "a\nb\n\n c"
        );
    }

    #[tokio::test]
    async fn test_text_source_is_verbatim() {
        let tmp = TempDir::new().unwrap();
        let p = processor(tmp.path(), 1000, 200);
        let mut meta = Metadata::new();
        meta.insert("team".into(), json!("infra"));

        let doc = p
            .process(&Source::text("notes", "line one  \r\nline two"), meta.clone())
            .await
            .unwrap();
        assert_eq!(doc.content, "line one  \r\nline two");
        assert_eq!(doc.metadata, meta);
        assert_eq!(doc.version, 1);
        assert_eq!(doc.chunks.len(), 1);
        assert_eq!(doc.chunks[0].metadata["team"], json!("infra"));
    }

    #[tokio::test]
    async fn test_file_source_records_provenance() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("guide.md");
        std::fs::write(&path, "# Guide\r\n\r\n\r\n\r\nInstall it.   \n").unwrap();

        let p = processor(tmp.path(), 1000, 200);
        let doc = p.process(&Source::file(&path), Metadata::new()).await.unwrap();
        assert_eq!(doc.source_type, SourceType::File);
        assert_eq!(doc.source_name, "guide.md");
        assert_eq!(doc.content, "# Guide\n\nInstall it.");
        assert_eq!(doc.metadata["content_type"], json!("text/plain"));
        assert!(doc.metadata.contains_key("extracted_at"));
    }

    #[tokio::test]
    async fn test_file_errors_are_typed() {
        let tmp = TempDir::new().unwrap();
        let p = processor(tmp.path(), 1000, 200);

        let bin = tmp.path().join("blob.bin");
        std::fs::write(&bin, b"\x00\x01").unwrap();
        assert!(matches!(
            p.process(&Source::file(&bin), Metadata::new()).await,
            Err(KbError::UnsupportedFormat(_))
        ));

        let missing = tmp.path().join("missing.txt");
        assert!(matches!(
            p.process(&Source::file(&missing), Metadata::new()).await,
            Err(KbError::ExtractionFailed { .. })
        ));

        let big = tmp.path().join("big.txt");
        std::fs::write(&big, "x".repeat(2048)).unwrap();
        assert!(matches!(
            p.process(&Source::file(&big), Metadata::new()).await,
            Err(KbError::ExtractionFailed { .. })
        ));

        let broken = tmp.path().join("broken.pdf");
        std::fs::write(&broken, b"not a pdf").unwrap();
        assert!(matches!(
            p.process(&Source::file(&broken), Metadata::new()).await,
            Err(KbError::ExtractionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_url_scheme_validated() {
        let tmp = TempDir::new().unwrap();
        let p = processor(tmp.path(), 1000, 200);
        assert!(matches!(
            p.process(&Source::url("ftp://example.com/x"), Metadata::new())
                .await,
            Err(KbError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_replaces_chunks() {
        let tmp = TempDir::new().unwrap();
        let p = processor(tmp.path(), 50, 10);
        let v1 = p
            .process(&Source::text("doc", "short body"), Metadata::new())
            .await
            .unwrap();
        let v2 = p.update(&v1, &"long body ".repeat(20)).unwrap();

        assert_eq!(v2.id, v1.id);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.previous_version_refs, vec![1]);
        assert!(v2.chunks.len() > 1);
        assert!(v2
            .chunks
            .iter()
            .all(|c| v1.chunks.iter().all(|old| old.id != c.id)));
        assert!(v2.chunks.iter().all(|c| c.metadata["version"] == json!(2)));

        let v3 = p.update(&v2, "again").unwrap();
        assert_eq!(v3.previous_version_refs, vec![1, 2]);
    }

    #[test]
    fn test_source_serde_tagging() {
        let src: Source =
            serde_json::from_value(json!({"type": "url", "url": "https://example.com"})).unwrap();
        assert_eq!(src, Source::url("https://example.com"));
    }
}
