//! # Knowledge Harness Core
//!
//! Shared, WASM-safe logic for Knowledge Harness: data models, chunking,
//! the embedding trait, vector and keyword indexes, hybrid retrieval, and
//! append-only version history.
//!
//! This crate contains no tokio, filesystem I/O, network access, or other
//! native-only dependencies. Everything here is synchronous except the
//! [`embedding::EmbeddingProvider`] trait, whose implementations live in the
//! `knowledge-harness` app crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod hybrid;
pub mod keyword_index;
pub mod models;
pub mod vector_index;
pub mod version;

pub use error::{EmbeddingError, KbError, KbResult};
