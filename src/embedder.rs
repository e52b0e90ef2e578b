//! Embedding model interface.
//!
//! The kernel treats the embedding model as opaque: a function from text to
//! fixed-dimension float vectors with a known input budget. Everything the
//! index core needs lives behind [`EmbeddingModel`]; concrete backends
//! (ONNX runtimes, remote APIs) plug in at this seam.
//!
//! The built-in backend is [`HashEmbedder`], a deterministic feature-hashing
//! embedder: tokens are hashed into buckets with a sign bit and the result
//! is L2-normalized. It needs no model files, which keeps repository
//! opening infallible and makes index behavior reproducible in tests.

use std::sync::Arc;

use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("Unknown embedding backend: {0}")]
    UnknownBackend(String),
    #[error("Embedding failed: {0}")]
    Failed(String),
}

/// A dense float vector produced by an embedding model.
pub type Embedding = Vec<f32>;

/// Capability trait for embedding backends.
pub trait EmbeddingModel: Send + Sync {
    /// Embed one text into a `dimension()`-length vector.
    fn embed(&self, text: &str) -> Result<Embedding, EmbedderError>;

    /// Embed a batch of texts. The default loops over [`Self::embed`];
    /// backends with real batch inference override this.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbedderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Output vector dimension.
    fn dimension(&self) -> usize;

    /// Maximum input length the model accepts, in model tokens.
    fn max_length(&self) -> usize;

    /// Token count of a text under this model's tokenizer. The chunker
    /// uses this as its length oracle for Markdown documents.
    fn count_tokens(&self, text: &str) -> usize;
}

/// One configured embedding: the `embedding_config` row joined with its
/// loaded model. `input_length` is the per-config chunking budget; the
/// effective chunk length is `min(input_length, model.max_length())`.
#[derive(Clone)]
pub struct EmbeddingHandle {
    pub id: i64,
    pub config_name: String,
    pub input_length: usize,
    pub model: Arc<dyn EmbeddingModel>,
}

impl std::fmt::Debug for EmbeddingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingHandle")
            .field("id", &self.id)
            .field("config_name", &self.config_name)
            .field("input_length", &self.input_length)
            .field("dimension", &self.model.dimension())
            .finish()
    }
}

/// Resolve a `model_path` to a backend.
///
/// Supported schemes:
/// - `hash:<dim>` — the built-in [`HashEmbedder`] with the given dimension.
///
/// Anything else is an unknown backend error; real model runtimes register
/// their own scheme here.
pub fn load_model(model_path: &str) -> Result<Arc<dyn EmbeddingModel>, EmbedderError> {
    if let Some(dim) = model_path.strip_prefix("hash:") {
        let dim: usize = dim
            .parse()
            .map_err(|_| EmbedderError::UnknownBackend(model_path.to_string()))?;
        if dim == 0 {
            return Err(EmbedderError::UnknownBackend(model_path.to_string()));
        }
        return Ok(Arc::new(HashEmbedder::new(dim)));
    }
    Err(EmbedderError::UnknownBackend(model_path.to_string()))
}

/// Default token budget for the hash embedder. Generous on purpose so the
/// per-config `max_input_length` is normally the binding constraint.
const HASH_EMBEDDER_MAX_LENGTH: usize = 8192;

/// Deterministic feature-hashing embedder.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// ASCII alphanumeric runs become one token each; every other
    /// alphanumeric scalar (CJK and friends) is its own token.
    fn tokens(text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        for c in text.chars() {
            if c.is_ascii_alphanumeric() {
                current.extend(c.to_lowercase());
            } else {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                if !c.is_ascii() && c.is_alphanumeric() {
                    tokens.push(c.to_string());
                }
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
        tokens
    }
}

impl EmbeddingModel for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Embedding, EmbedderError> {
        let mut v = vec![0.0f32; self.dimension];
        for token in Self::tokens(text) {
            let h = xxh3_64(token.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            // Empty or punctuation-only input still needs a unit vector.
            v[0] = 1.0;
        }
        Ok(v)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_length(&self) -> usize {
        HASH_EMBEDDER_MAX_LENGTH
    }

    fn count_tokens(&self, text: &str) -> usize {
        Self::tokens(text).len()
    }
}
