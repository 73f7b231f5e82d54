//! Recursive overlap-aware text chunker.
//!
//! Splits a document's normalized text into [`DocumentChunk`]s that never
//! exceed `chunk_size` characters while every adjacent pair shares at least
//! `chunk_overlap` characters of boundary context.
//!
//! # Algorithm
//!
//! 1. Measure the text in characters (not bytes) so multi-byte UTF-8 text is
//!    never cut mid-codepoint.
//! 2. Compute the minimum number of windows the text needs:
//!    `ceil((L - overlap) / (size - overlap))`, or 1 when `L <= size`.
//! 3. Walk a window of at most `chunk_size` characters. If the text continues
//!    past the window, try to snap the window end back to a separator, in
//!    order of preference: paragraph (`\n\n`), line (`\n`), sentence (`. `),
//!    word (` `). A snapped end is only accepted when the rest of the text
//!    still fits in the remaining window budget, so snapping never adds chunks.
//!    Otherwise the window is hard-cut at `chunk_size`.
//! 4. The next window starts `chunk_overlap` characters before the previous end.
//!
//! Empty text yields zero chunks; rejecting it is the caller's job.
//!
//! # Example
//!
//! ```rust
//! use knowledge_harness_core::chunk::{split_text, ChunkingParams};
//!
//! let text = "a".repeat(2500);
//! let pieces = split_text(&text, &ChunkingParams { chunk_size: 1000, chunk_overlap: 200 }).unwrap();
//! assert_eq!(pieces.len(), 3);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{KbError, KbResult};
use crate::models::{Document, DocumentChunk};

/// Separators tried when snapping a window end, coarsest first.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Window size and overlap, both in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl ChunkingParams {
    pub fn validate(&self) -> KbResult<()> {
        if self.chunk_size == 0 {
            return Err(KbError::validation("chunk_size must be > 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(KbError::validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }

    /// Minimum number of windows needed to cover `len` characters.
    fn windows_for(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else if len <= self.chunk_size {
            1
        } else {
            (len - self.chunk_overlap).div_ceil(self.step())
        }
    }
}

/// Split `text` into overlapping pieces. Pure; no ids or metadata.
pub fn split_text(text: &str, params: &ChunkingParams) -> KbResult<Vec<String>> {
    params.validate()?;

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let mut budget = params.windows_for(total);
    let mut pieces = Vec::with_capacity(budget);
    let mut start = 0usize;

    loop {
        if total - start <= params.chunk_size {
            pieces.push(chars[start..].iter().collect());
            break;
        }

        let hard_end = start + params.chunk_size;
        let end = snap_end(&chars, start, hard_end, budget, params).unwrap_or(hard_end);
        pieces.push(chars[start..end].iter().collect());

        budget = budget.saturating_sub(1);
        start = end - params.chunk_overlap;
    }

    Ok(pieces)
}

/// Find the latest separator-aligned end in `(start + overlap, hard_end]`
/// that keeps the remaining text within `budget - 1` windows.
fn snap_end(
    chars: &[char],
    start: usize,
    hard_end: usize,
    budget: usize,
    params: &ChunkingParams,
) -> Option<usize> {
    let fits = |end: usize| {
        let rest = chars.len() - (end - params.chunk_overlap);
        params.windows_for(rest) < budget
    };

    for sep in SEPARATORS {
        let sep: Vec<char> = sep.chars().collect();
        let lowest = start + params.chunk_overlap + 1;
        let mut end = hard_end;
        while end >= lowest.max(sep.len()) {
            if chars[end - sep.len()..end] == sep[..] {
                if fits(end) {
                    return Some(end);
                }
                // Earlier ends only leave more text behind.
                break;
            }
            end -= 1;
        }
    }
    None
}

/// Chunk a document's current content, stamping inherited metadata.
///
/// Every chunk gets a fresh UUID, a contiguous `chunk_index`, the total
/// `chunk_count`, and a SHA-256 hash of its text. `indexed_semantic` starts
/// false; the indexer flips it once a vector is stored.
pub fn chunk_document(doc: &Document, params: &ChunkingParams) -> KbResult<Vec<DocumentChunk>> {
    let pieces = split_text(&doc.content, params)?;
    let count = pieces.len();

    let mut inherited = doc.metadata.clone();
    inherited.insert("source_name".into(), Value::from(doc.source_name.clone()));
    inherited.insert("source_type".into(), Value::from(doc.source_type.as_str()));
    inherited.insert("version".into(), Value::from(doc.version));

    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(index, content)| DocumentChunk {
            id: Uuid::new_v4().to_string(),
            document_id: doc.id.clone(),
            hash: content_hash(&content),
            content,
            chunk_index: index,
            chunk_count: count,
            indexed_semantic: false,
            metadata: inherited.clone(),
        })
        .collect())
}

/// Hex SHA-256 of a piece of text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
