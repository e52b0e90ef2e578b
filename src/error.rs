//! Kernel-wide error taxonomy.
//!
//! Storage, vector-table, and full-text errors keep their own enums next to
//! the code that raises them; this module folds everything into the
//! [`KernelError`] surface that the document pipeline, repository, and
//! server boundary report through.

use thiserror::Error;

use crate::fts::FtsError;
use crate::llm::LlmError;
use crate::store::StoreError;
use crate::vector::VectorError;

#[derive(Error, Debug)]
pub enum KernelError {
    /// Unsupported file type, empty arguments, malformed request fields.
    #[error("Invalid input: {0}")]
    Input(String),

    /// A file could not be opened or read.
    #[error("File access error: {0}")]
    FileAccess(String),

    /// An invariant the kernel maintains itself was violated (missing row
    /// we just inserted, unexpected column count, impossible state).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Malformed JSON or SSE input.
    #[error("Parse error: {0}")]
    Parser(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Vector table error: {0}")]
    Vector(#[from] VectorError),

    #[error("Text search error: {0}")]
    Fts(#[from] FtsError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl KernelError {
    /// Convenience for wrapping an I/O failure with the path it hit.
    pub fn file_access(path: &std::path::Path, err: std::io::Error) -> Self {
        KernelError::FileAccess(format!("{}: {}", path.display(), err))
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
