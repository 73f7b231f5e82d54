//! # Knowledge Harness
//!
//! A local knowledge base: ingest text, files, and web pages as versioned
//! documents, then retrieve chunks with a single `fuzziness` dial that blends
//! keyword and semantic relevance.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────────────┐
//! │  Sources    │──▶│  Processor   │──▶│  KnowledgeBase      │
//! │ text/file/  │   │ extract +    │   │ keyword + vector    │
//! │ url         │   │ chunk        │   │ indexes, versions   │
//! └─────────────┘   └──────────────┘   └──────────┬──────────┘
//!                                                 │
//!                      ┌──────────────────────────┤
//!                      ▼                          ▼
//!                 ┌──────────┐              ┌──────────┐
//!                 │   CLI    │              │   HTTP   │
//!                 │  (kb)    │              │  (axum)  │
//!                 └──────────┘              └──────────┘
//! ```
//!
//! The index, fusion, and version-history logic lives in the
//! `knowledge-harness-core` crate, which has no I/O. This crate adds the
//! embedding providers, extraction, persistence, and the async facade.
//!
//! ## Quick Start
//!
//! ```bash
//! kb add docs/*.md                     # ingest files
//! kb query "deploy rollback" --fuzziness 0
//! kb update <id> --file docs/new.md    # new version
//! kb history <id>
//! kb serve                             # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`extract`] | Plain text from HTML, CSV, PDF, DOCX |
//! | [`processor`] | Sources into chunked documents |
//! | [`embedding`] | OpenAI / Ollama providers and the vector cache |
//! | [`persist`] | Crash-atomic JSON storage |
//! | [`knowledge_base`] | The facade: ingest, query, versions |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |

pub mod commands;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod knowledge_base;
pub mod logging;
pub mod persist;
pub mod processor;
pub mod server;

pub use knowledge_base::{KnowledgeBase, QueryRequest};
