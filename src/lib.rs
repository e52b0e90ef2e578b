//! # pocketrag — local repository-scoped RAG retrieval kernel
//!
//! Watches a directory of Markdown and plain-text documents, keeps a
//! durable index of every file in two synchronized physical indexes — an
//! FTS5 full-text table and per-embedding HNSW vector tables — and answers
//! hybrid search queries that fuse lexical and semantic similarity.
//!
//! ## Quick start
//!
//! ```no_run
//! use pocketrag::repository::{Reporters, Repository};
//! use pocketrag::store::EmbeddingConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut repo = Repository::open_paused("notes", std::path::Path::new("./notes"), Reporters::default())?;
//! repo.configure_embedding(&[EmbeddingConfig {
//!     config_name: "default".into(),
//!     model_name: "hash-embedder".into(),
//!     model_path: "hash:128".into(),
//!     max_input_length: 512,
//! }])?;
//! repo.sweep_now()?;
//!
//! let per_embedding = repo.search("crash recovery", 5)?;
//! for hit in &per_embedding[0] {
//!     println!("{:.3}  {}", hit.score, hit.metadata);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The binary target speaks newline-delimited JSON over stdio; see
//! [`server::KernelServer`].

pub mod chunker;
pub mod embedder;
pub mod error;
pub mod fts;
pub mod llm;
pub mod pipeline;
pub mod protocol;
pub mod repository;
pub mod server;
pub mod session;
pub mod store;
pub mod util;
pub mod vector;

pub use chunker::{Chunker, DocType};
pub use embedder::{EmbeddingHandle, EmbeddingModel, HashEmbedder};
pub use error::{KernelError, Result};
pub use fts::{Analyzer, SimpleAnalyzer, TextIndex};
pub use pipeline::{DocPipe, DocState, EmbeddingBinding};
pub use repository::{Reporters, Repository, SearchResult};
pub use server::KernelServer;
pub use store::{EmbeddingConfig, Store};
pub use vector::VectorTable;
