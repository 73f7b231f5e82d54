//! # Knowledge Harness CLI (`kb`)
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb add <path-or-url>...` | Ingest files or URLs (or `--text`) |
//! | `kb update <id>` | Replace content with `--file` or `--text` |
//! | `kb delete <id>` | Delete a document and its history |
//! | `kb get <id>` | Print a document (`--version N` for history) |
//! | `kb list` | List current documents |
//! | `kb query "<text>"` | Hybrid search (`--fuzziness 0..=100`) |
//! | `kb rollback <id> <version>` | Restore an old version as a new one |
//! | `kb diff <id> <v1> <v2>` | Compare two versions |
//! | `kb history <id>` | List versions |
//! | `kb backfill` | Retry embeddings for keyword-only chunks |
//! | `kb rebuild` | Rebuild indexes and compact vectors |
//! | `kb stats` | Index statistics |
//! | `kb serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! kb add docs/runbook.md https://example.com/faq.html --meta team=infra
//! kb query "rotate credentials" --fuzziness 0        # keyword only
//! kb query "rotate credentials" --fuzziness 50 -k 10 # hybrid
//! kb rollback 6f1c... 2
//! ```

use clap::{Parser, Subcommand};
use knowledge_harness::commands::{self, parse_key_val};
use knowledge_harness::knowledge_base::KnowledgeBase;
use knowledge_harness::{config, embedding, logging, server};
use std::path::PathBuf;
use std::sync::Arc;

/// Knowledge Harness CLI: versioned documents with hybrid keyword and
/// semantic retrieval.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Knowledge Harness — versioned documents with hybrid keyword + semantic retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest files, URLs, or inline text.
    ///
    /// Several inputs are ingested concurrently; each succeeds or fails on
    /// its own. Ctrl-C cancels without publishing partial documents.
    Add {
        /// File paths or `http(s)://` URLs.
        inputs: Vec<String>,

        /// Inline text to add as a document.
        #[arg(long)]
        text: Option<String>,

        /// Name for `--text` documents.
        #[arg(long, requires = "text")]
        name: Option<String>,

        /// Metadata as `key=value`; repeatable.
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },

    /// Replace a document's content, creating a new version.
    Update {
        id: String,

        /// Read new content from a file.
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,

        /// New content inline.
        #[arg(long)]
        text: Option<String>,

        /// Metadata to merge, as `key=value`; repeatable.
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },

    /// Delete a document and all of its versions.
    Delete { id: String },

    /// Print a document.
    Get {
        id: String,

        /// Historical version to print instead of the current one.
        #[arg(long)]
        version: Option<u32>,
    },

    /// List current documents.
    List,

    /// Search indexed chunks.
    Query {
        text: String,

        /// Number of results.
        #[arg(short, long)]
        k: Option<usize>,

        /// 0 = keyword only, 100 = semantic only, in between = weighted blend.
        #[arg(long, allow_hyphen_values = true)]
        fuzziness: Option<i64>,

        /// Metadata equality filter as `key=value`; repeatable.
        #[arg(long = "filter", value_parser = parse_key_val)]
        filter: Vec<(String, String)>,

        /// In hybrid mode, use keyword scores alone if the query cannot be embedded.
        #[arg(long)]
        keyword_fallback: bool,
    },

    /// Restore an earlier version's content as a new version.
    Rollback { id: String, version: u32 },

    /// Compare two versions of a document.
    Diff { id: String, v1: u32, v2: u32 },

    /// List a document's versions.
    History { id: String },

    /// Embed chunks that were indexed keyword-only.
    Backfill,

    /// Rebuild the keyword index, compact the vector index, prune the cache.
    Rebuild,

    /// Show index statistics.
    Stats,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    let provider = embedding::create_provider(&cfg.embedding)?;
    let kb = Arc::new(KnowledgeBase::open(cfg, provider)?);

    match cli.command {
        Commands::Add {
            inputs,
            text,
            name,
            meta,
        } => {
            commands::run_add(&kb, inputs, text, name, meta).await?;
        }
        Commands::Update {
            id,
            file,
            text,
            meta,
        } => {
            commands::run_update(&kb, &id, file.as_deref(), text, meta).await?;
        }
        Commands::Delete { id } => {
            commands::run_delete(&kb, &id).await?;
        }
        Commands::Get { id, version } => {
            commands::run_get(&kb, &id, version)?;
        }
        Commands::List => {
            commands::run_list(&kb)?;
        }
        Commands::Query {
            text,
            k,
            fuzziness,
            filter,
            keyword_fallback,
        } => {
            commands::run_query(&kb, &text, k, fuzziness, filter, keyword_fallback).await?;
        }
        Commands::Rollback { id, version } => {
            commands::run_rollback(&kb, &id, version).await?;
        }
        Commands::Diff { id, v1, v2 } => {
            commands::run_diff(&kb, &id, v1, v2)?;
        }
        Commands::History { id } => {
            commands::run_history(&kb, &id)?;
        }
        Commands::Backfill => {
            commands::run_backfill(&kb).await?;
        }
        Commands::Rebuild => {
            commands::run_rebuild(&kb).await?;
        }
        Commands::Stats => {
            commands::run_stats(&kb)?;
        }
        Commands::Serve => {
            server::run_server(kb).await?;
        }
    }

    Ok(())
}
