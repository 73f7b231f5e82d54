//! CLI command implementations for the `kb` binary.
//!
//! Each `run_*` function drives one [`KnowledgeBase`] operation and prints a
//! plain-text summary to stdout. Errors propagate to `main`, which exits
//! non-zero.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use knowledge_harness_core::models::{Metadata, MetadataFilter};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::knowledge_base::{IngestOutcome, KnowledgeBase, QueryRequest};
use crate::processor::Source;

/// Parse a `key=value` pair for `--meta` and `--filter` arguments.
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// Values that parse as JSON (`42`, `true`, `"x"`) keep their type;
/// anything else is a string.
fn to_metadata(pairs: Vec<(String, String)>) -> Metadata {
    pairs
        .into_iter()
        .map(|(k, v)| {
            let value = serde_json::from_str(&v).unwrap_or(Value::String(v));
            (k, value)
        })
        .collect()
}

/// `http(s)://` inputs are URLs; everything else is a file path.
fn source_for(input: &str) -> Source {
    if input.starts_with("http://") || input.starts_with("https://") {
        Source::url(input)
    } else {
        Source::file(PathBuf::from(input))
    }
}

/// Cancel `token` on Ctrl-C so an interrupted ingest publishes nothing.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; cancelling ingestion.");
            child.cancel();
        }
    });
    token
}

fn print_outcome(outcome: &IngestOutcome) {
    println!("  id:           {}", outcome.document_id);
    println!("  version:      {}", outcome.version);
    println!(
        "  chunks:       {} ({} semantic, {} keyword-only)",
        outcome.chunk_count, outcome.semantic_chunks, outcome.keyword_only_chunks
    );
    if let Some(e) = &outcome.embedding_error {
        println!("  embedding:    {}", e);
    }
}

pub async fn run_add(
    kb: &Arc<KnowledgeBase>,
    inputs: Vec<String>,
    text: Option<String>,
    name: Option<String>,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let metadata = to_metadata(meta);
    let cancel = cancel_on_ctrl_c();

    let mut sources: Vec<Source> = inputs.iter().map(|i| source_for(i)).collect();
    if let Some(text) = text {
        sources.push(Source::text(name.unwrap_or_else(|| "text".to_string()), text));
    }
    if sources.is_empty() {
        bail!("nothing to add: pass file paths, URLs, or --text");
    }

    if sources.len() == 1 {
        let outcome = kb
            .add_source_cancellable(&sources[0], metadata, &cancel)
            .await?;
        println!("Added {}", sources[0].label());
        print_outcome(&outcome);
        return Ok(());
    }

    let total = sources.len();
    let report = kb.ingest_batch_cancellable(sources, metadata, &cancel).await;
    for item in &report.items {
        match (&item.outcome, &item.error) {
            (Some(outcome), _) => {
                println!("Added {}", item.source);
                print_outcome(outcome);
            }
            (None, Some(err)) => println!("Failed {}\n  {}: {}", item.source, err.code, err.message),
            (None, None) => {}
        }
    }
    println!();
    println!("{} added, {} failed", report.succeeded, report.failed);
    if report.failed > 0 {
        bail!("{} of {} sources failed", report.failed, total);
    }
    Ok(())
}

pub async fn run_update(
    kb: &KnowledgeBase,
    id: &str,
    file: Option<&Path>,
    text: Option<String>,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let content = match (file, text) {
        (Some(path), None) => {
            kb.processor()
                .process(&Source::file(path), Metadata::new())
                .await?
                .content
        }
        (None, Some(text)) => text,
        _ => bail!("pass exactly one of --file or --text"),
    };
    let metadata = if meta.is_empty() {
        None
    } else {
        let mut merged = kb.get_document(id, None)?.metadata;
        merged.extend(to_metadata(meta));
        Some(merged)
    };

    let doc = kb.update_document_with(id, &content, metadata, None).await?;
    println!("Updated {} to version {}", doc.id, doc.version);
    println!("  chunks:       {}", doc.chunks.len());
    Ok(())
}

pub async fn run_delete(kb: &KnowledgeBase, id: &str) -> Result<()> {
    if !kb.delete_document(id).await? {
        bail!("document not found: {}", id);
    }
    println!("Deleted {}", id);
    Ok(())
}

pub fn run_get(kb: &KnowledgeBase, id: &str, version: Option<u32>) -> Result<()> {
    let doc = kb.get_document(id, version)?;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("source:       {} ({})", doc.source_name, doc.source_type.as_str());
    println!("version:      {}", doc.version);
    if !doc.previous_version_refs.is_empty() {
        let refs: Vec<String> = doc
            .previous_version_refs
            .iter()
            .map(u32::to_string)
            .collect();
        println!("previous:     {}", refs.join(", "));
    }
    println!("created_at:   {}", doc.created_at.to_rfc3339());
    println!("updated_at:   {}", doc.updated_at.to_rfc3339());
    println!("metadata:     {}", serde_json::to_string(&doc.metadata)?);
    println!();

    println!("--- Content ---");
    println!("{}", doc.content);
    println!();

    if !doc.chunks.is_empty() {
        println!("--- Chunks ({}) ---", doc.chunks.len());
        for chunk in &doc.chunks {
            let tag = if chunk.indexed_semantic { "" } else { " keyword-only" };
            println!("[chunk {}{}]", chunk.chunk_index, tag);
            println!("{}", chunk.content);
            println!();
        }
    }
    Ok(())
}

pub fn run_list(kb: &KnowledgeBase) -> Result<()> {
    let docs = kb.list_documents();
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    println!(
        "{:<38} {:>4} {:>7} {:>9}  SOURCE",
        "ID", "VER", "CHUNKS", "SEMANTIC"
    );
    for d in docs {
        println!(
            "{:<38} {:>4} {:>7} {:>9}  {}",
            d.id, d.version, d.chunk_count, d.semantic_chunks, d.source_name
        );
    }
    Ok(())
}

pub async fn run_query(
    kb: &KnowledgeBase,
    text: &str,
    k: Option<usize>,
    fuzziness: Option<i64>,
    filter: Vec<(String, String)>,
    keyword_fallback: bool,
) -> Result<()> {
    let mut request = QueryRequest::new(text)
        .filter(MetadataFilter(to_metadata(filter)))
        .allow_keyword_fallback(keyword_fallback);
    request.k = k;
    request.fuzziness = fuzziness;

    let results = kb.query(&request).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, result.score, result.source_name);
        let mut parts = Vec::new();
        if let Some(s) = result.keyword_score {
            parts.push(format!("keyword {:.3}", s));
        }
        if let Some(s) = result.semantic_score {
            parts.push(format!("semantic {:.3}", s));
        }
        if !parts.is_empty() {
            println!("    scores: {}", parts.join(", "));
        }
        println!(
            "    excerpt: \"{}\"",
            excerpt(&result.content, 200).replace('\n', " ").trim()
        );
        println!("    document: {}", result.document_id);
        println!();
    }
    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

pub async fn run_rollback(kb: &KnowledgeBase, id: &str, version: u32) -> Result<()> {
    let doc = kb.rollback_document(id, version).await?;
    println!(
        "Rolled back {} to the content of version {} (now version {})",
        doc.id, version, doc.version
    );
    Ok(())
}

pub fn run_diff(kb: &KnowledgeBase, id: &str, v1: u32, v2: u32) -> Result<()> {
    let diff = kb.compare_versions(id, v1, v2)?;
    println!("{}: v{} → v{}", diff.document_id, diff.from_version, diff.to_version);
    println!();
    println!("  content");
    println!(
        "    length:  {} → {} ({:+})",
        diff.content.length_from, diff.content.length_to, diff.content.length_delta
    );
    println!(
        "    words:   {} → {} ({:+})",
        diff.content.words_from, diff.content.words_to, diff.content.word_delta
    );
    if diff.content.identical {
        println!("    identical");
    }

    let meta = &diff.metadata;
    if meta.added.is_empty() && meta.removed.is_empty() && meta.changed.is_empty() {
        println!("  metadata unchanged");
        return Ok(());
    }
    println!("  metadata");
    for (k, v) in &meta.added {
        println!("    + {} = {}", k, v);
    }
    for (k, v) in &meta.removed {
        println!("    - {} = {}", k, v);
    }
    for (k, change) in &meta.changed {
        println!("    ~ {}: {} → {}", k, change.from, change.to);
    }
    Ok(())
}

pub fn run_history(kb: &KnowledgeBase, id: &str) -> Result<()> {
    for info in kb.history(id)? {
        let marker = if info.current { "*" } else { " " };
        let origin = info
            .rollback_from
            .map(|v| format!("  (rollback of v{})", v))
            .unwrap_or_default();
        println!(
            "{} v{:<4} {}  {} chars{}",
            marker,
            info.version,
            info.timestamp.format("%Y-%m-%d %H:%M:%S"),
            info.content_length,
            origin
        );
    }
    Ok(())
}

pub async fn run_backfill(kb: &KnowledgeBase) -> Result<()> {
    let report = kb.backfill_embeddings().await?;
    println!("backfill");
    println!("  documents: {}", report.documents);
    println!("  embedded:  {}", report.chunks_embedded);
    println!("  failed:    {}", report.chunks_failed);
    if let Some(e) = report.last_error {
        println!("  last error: {}", e);
    }
    Ok(())
}

pub async fn run_rebuild(kb: &KnowledgeBase) -> Result<()> {
    let report = kb.rebuild_indexes().await?;
    println!("rebuild");
    println!("  documents:       {}", report.documents);
    println!("  chunks:          {}", report.chunks);
    println!("  keyword tokens:  {}", report.keyword_tokens);
    println!("  vectors:         {}", report.vector_entries);
    println!("  reclaimed slots: {}", report.reclaimed_slots);
    println!("  pruned cache:    {}", report.pruned_cache_entries);
    Ok(())
}

pub fn run_stats(kb: &KnowledgeBase) -> Result<()> {
    let stats = kb.stats();
    println!("Knowledge Harness — Stats");
    println!("=========================");
    println!();
    println!("  Storage:     {}", kb.config().storage.dir.display());
    println!("  Model:       {}", stats.embedding_model);
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Versions:    {}", stats.version_snapshots);
    println!("  Chunks:      {}", stats.chunks);
    println!(
        "  Semantic:    {} ({} keyword-only)",
        stats.semantic_chunks, stats.keyword_only_chunks
    );
    println!("  Tokens:      {}", stats.keyword_tokens);
    match stats.vector_dims {
        Some(d) => println!(
            "  Vectors:     {} of {} slots, {} dims",
            stats.vector_entries, stats.vector_slots, d
        ),
        None => println!("  Vectors:     none"),
    }
    println!("  Cache:       {} vectors", stats.cache_entries);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("team=infra=core"),
            Ok(("team".to_string(), "infra=core".to_string()))
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn test_metadata_values_keep_json_types() {
        let meta = to_metadata(vec![
            ("n".into(), "42".into()),
            ("flag".into(), "true".into()),
            ("team".into(), "infra".into()),
        ]);
        assert_eq!(meta["n"], Value::from(42));
        assert_eq!(meta["flag"], Value::from(true));
        assert_eq!(meta["team"], Value::from("infra"));
    }

    #[test]
    fn test_source_for() {
        assert!(matches!(source_for("https://example.com/a"), Source::Url { .. }));
        assert!(matches!(source_for("./notes.md"), Source::File { .. }));
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo", 2), "hé…");
        assert_eq!(excerpt("short", 10), "short");
    }
}
