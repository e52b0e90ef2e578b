//! Full-text index over one FTS5 virtual table.
//!
//! Table shape: `text_search(content, metadata, chunk_id UNINDEXED)`.
//! BM25 ranks ascending (more negative is better); results are normalized
//! to a similarity in [0, 1) via `1 − 1/(1 − bm25)` so callers can fuse
//! them with vector scores.
//!
//! The analyzer is an injected capability. sqlx exposes no hook to register
//! a native FTS5 tokenizer, so the analyzer is applied at the query
//! boundary — segmenting search input into keywords that are OR'ed into the
//! MATCH expression — and to offline highlighting. The table itself indexes
//! with `unicode61`.

use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::store::{Store, StoreError};
use crate::util::utf8_len;

pub const HIGHLIGHT_BEGIN: &str = "<mark>";
pub const HIGHLIGHT_END: &str = "</mark>";

/// Keywords shorter than this are not highlighted, unless the whole query
/// is itself shorter.
const MIN_KEYWORD_LENGTH: usize = 2;

#[derive(Error, Debug)]
pub enum FtsError {
    #[error("No chunk found with chunk_id {0}")]
    NotFound(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Injected query segmenter. A CJK-aware word segmenter registers here in
/// production; [`SimpleAnalyzer`] suffices for Latin text and tests.
pub trait Analyzer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Whitespace/punctuation segmentation: ASCII alphanumeric runs become one
/// token, every other alphanumeric scalar stands alone.
pub struct SimpleAnalyzer;

impl Analyzer for SimpleAnalyzer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        for c in text.chars() {
            if c.is_ascii_alphanumeric() {
                current.push(c);
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

/// A ranked lexical hit with highlighted spans.
#[derive(Debug, Clone)]
pub struct TextResult {
    pub chunk_id: i64,
    /// Normalized similarity in [0, 1); higher is better.
    pub similarity: f64,
    pub content: String,
    pub metadata: String,
}

/// One FTS5 table plus its analyzer. A reader-writer lock permits
/// concurrent searches while serializing writes.
pub struct TextIndex {
    store: Arc<Store>,
    analyzer: Arc<dyn Analyzer>,
    lock: RwLock<()>,
}

impl TextIndex {
    pub fn new(store: Arc<Store>, analyzer: Arc<dyn Analyzer>) -> Result<Self, FtsError> {
        Self::create_table(&store)?;
        Ok(Self {
            store,
            analyzer,
            lock: RwLock::new(()),
        })
    }

    pub fn create_table(store: &Store) -> Result<(), StoreError> {
        store.execute(
            "CREATE VIRTUAL TABLE IF NOT EXISTS text_search
             USING fts5(content, metadata, chunk_id UNINDEXED, tokenize='unicode61')",
        )?;
        Ok(())
    }

    pub fn drop_table(store: &Store) -> Result<(), StoreError> {
        store.execute("DROP TABLE IF EXISTS text_search")?;
        Ok(())
    }

    /// Insert or replace the row for `chunk_id`.
    pub fn upsert(&self, chunk_id: i64, content: &str, metadata: &str) -> Result<(), FtsError> {
        let _guard = self.lock.write().expect("text index lock poisoned");
        let mut tx = self.store.begin()?;
        tx.upsert_text_row(chunk_id, content, metadata)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete the row for `chunk_id`; absent rows are an error.
    pub fn delete(&self, chunk_id: i64) -> Result<(), FtsError> {
        let _guard = self.lock.write().expect("text index lock poisoned");
        let mut tx = self.store.begin()?;
        let changed = tx.delete_text_row(chunk_id)?;
        if changed == 0 {
            return Err(FtsError::NotFound(chunk_id));
        }
        tx.commit()?;
        Ok(())
    }

    /// Segment `query` into keywords, OR them, rank by BM25 and return up
    /// to `limit` hits with `<mark>` highlights.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<TextResult>, FtsError> {
        let keywords = self.sanitized_keywords(query);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let match_expr = keywords.join(" OR ");

        let _guard = self.lock.read().expect("text index lock poisoned");
        let rows: Vec<(String, String, i64, f64)> = self.store.block_on(async {
            sqlx::query_as(
                "SELECT highlight(text_search, 0, ?1, ?2) AS content,
                        highlight(text_search, 1, ?1, ?2) AS metadata,
                        chunk_id,
                        bm25(text_search) AS score
                 FROM text_search
                 WHERE text_search MATCH ?3
                 ORDER BY score
                 LIMIT ?4",
            )
            .bind(HIGHLIGHT_BEGIN)
            .bind(HIGHLIGHT_END)
            .bind(&match_expr)
            .bind(limit as i64)
            .fetch_all(&self.store.pool)
            .await
            .map_err(StoreError::from)
        })?;

        Ok(rows
            .into_iter()
            .map(|(content, metadata, chunk_id, bm25)| TextResult {
                chunk_id,
                similarity: 1.0 - (1.0 / (1.0 - bm25)),
                content,
                metadata,
            })
            .collect())
    }

    /// Read back the stored (content, metadata) of a chunk by id.
    pub fn get_content(&self, chunk_id: i64) -> Result<(String, String), FtsError> {
        let _guard = self.lock.read().expect("text index lock poisoned");
        let row: Option<(String, String)> = self.store.block_on(async {
            sqlx::query_as("SELECT content, metadata FROM text_search WHERE chunk_id = ?1")
                .bind(chunk_id)
                .fetch_optional(&self.store.pool)
                .await
                .map_err(StoreError::from)
        })?;
        row.ok_or(FtsError::NotFound(chunk_id))
    }

    /// Highlight keywords of `query` in already-retrieved text, without
    /// touching the index. Keywords that are proper substrings of another
    /// keyword are dropped, as are keywords shorter than the minimum
    /// (unless the whole query is that short).
    pub fn highlight(&self, text: &str, query: &str) -> String {
        if text.is_empty() || query.is_empty() {
            return text.to_string();
        }

        let keywords = self.sanitized_keywords(query);

        let mut unique: Vec<String> = Vec::new();
        for keyword in keywords {
            let mut contained = false;
            unique.retain(|kept| {
                if keyword.contains(kept.as_str()) && *kept != keyword {
                    return false; // kept is a proper substring of keyword
                }
                true
            });
            for kept in &unique {
                if kept.contains(keyword.as_str()) {
                    contained = true;
                    break;
                }
            }
            if !contained {
                unique.push(keyword);
            }
        }

        if utf8_len(query) >= MIN_KEYWORD_LENGTH {
            unique.retain(|k| utf8_len(k) >= MIN_KEYWORD_LENGTH);
        }

        let mut result = text.to_string();
        for keyword in &unique {
            let mut out = String::with_capacity(result.len());
            let mut rest = result.as_str();
            while let Some(pos) = rest.find(keyword.as_str()) {
                out.push_str(&rest[..pos]);
                out.push_str(HIGHLIGHT_BEGIN);
                out.push_str(keyword);
                out.push_str(HIGHLIGHT_END);
                rest = &rest[pos + keyword.len()..];
            }
            out.push_str(rest);
            result = out;
        }
        result
    }

    /// Tokenize and strip everything but alphanumerics / non-ASCII, which
    /// also neutralizes FTS5 operators in user input.
    fn sanitized_keywords(&self, query: &str) -> Vec<String> {
        self.analyzer
            .tokenize(query)
            .into_iter()
            .filter_map(|token| {
                let safe: String = token
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric() || !c.is_ascii())
                    .collect();
                if safe.is_empty() {
                    None
                } else {
                    Some(safe)
                }
            })
            .collect()
    }
}
