//! Per-document processing pipeline.
//!
//! One [`DocPipe`] handles one file: `check()` classifies it as created /
//! modified / unchanged / deleted against its `documents` row, and
//! `process()` reconciles chunks into the relational store, the full-text
//! index, and every vector table. Nothing here writes to the file itself.
//!
//! Reconciliation is hash-driven: existing chunk rows are loaded into a
//! multimap keyed by content hash, new chunks claim matching rows (moving
//! them to a new position through a NULL `chunk_index` parking slot when
//! needed), leftover rows are deleted as stale, and genuinely new chunks
//! are embedded and inserted in batches of 200 with a commit after each
//! batch so cancellation never leaves a half-applied document.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chunker::{Chunker, DocType, LengthFn};
use crate::embedder::EmbeddingHandle;
use crate::error::{KernelError, Result};
use crate::store::{NewChunk, ReindexUpdate, Store};
use crate::util;
use crate::vector::VectorTable;

/// Chunk adds are committed every this many rows, bounding rollback cost
/// and giving cancellation a clean boundary.
const CHUNK_COMMIT_INTERVAL: usize = 200;

/// Rows older than this (seconds) get a deep content-hash re-check even
/// when the mtime matches.
const MAX_UNCHECKED_SECS: i64 = 60 * 60 * 24;

/// One embedding configuration paired with its vector table.
#[derive(Clone)]
pub struct EmbeddingBinding {
    pub handle: EmbeddingHandle,
    pub table: Arc<VectorTable>,
}

/// Document lifecycle as decided by [`DocPipe::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocState {
    Unknown,
    Unchanged,
    Created,
    Modified,
    Deleted,
}

/// Weighted sub-step progress reporter mapping pipeline phases onto one
/// monotonic 0.0→1.0 axis.
pub struct Progress<'a> {
    callback: Option<&'a (dyn Fn(f64) + Sync)>,
    /// Cumulative step boundaries, `bounds[0] == 0.0`, last == 1.0.
    bounds: Vec<f64>,
    current: usize,
}

impl<'a> Progress<'a> {
    /// Build from named relative weights; the axis is normalized to 1.0.
    pub fn new(callback: Option<&'a (dyn Fn(f64) + Sync)>, weights: &[(&str, f64)]) -> Self {
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        let mut bounds = Vec::with_capacity(weights.len() + 1);
        bounds.push(0.0);
        let mut acc = 0.0;
        for (_, w) in weights {
            acc += w / total;
            bounds.push(acc);
        }
        if let Some(last) = bounds.last_mut() {
            *last = 1.0;
        }
        Self {
            callback,
            bounds,
            current: 0,
        }
    }

    /// Stepless reporter; `update` drives the axis directly.
    pub fn plain(callback: Option<&'a (dyn Fn(f64) + Sync)>) -> Self {
        Self {
            callback,
            bounds: Vec::new(),
            current: 0,
        }
    }

    pub fn update(&mut self, progress: f64) {
        if let Some(cb) = self.callback {
            cb(progress.clamp(0.0, 1.0));
        }
    }

    /// Report fractional progress within the current sub-step.
    pub fn update_subprocess(&mut self, fraction: f64) {
        if self.bounds.is_empty() {
            return;
        }
        let lo = self.bounds[self.current];
        let hi = self.bounds[(self.current + 1).min(self.bounds.len() - 1)];
        let p = lo + fraction.clamp(0.0, 1.0) * (hi - lo);
        if let Some(cb) = self.callback {
            cb(p);
        }
    }

    /// Advance to the next sub-step boundary.
    pub fn finish_subprogress(&mut self) {
        if self.current + 1 < self.bounds.len() {
            self.current += 1;
        }
        let p = self.bounds.get(self.current).copied().unwrap_or(1.0);
        if let Some(cb) = self.callback {
            cb(p);
        }
    }
}

pub struct DocPipe<'r> {
    store: &'r Store,
    bindings: &'r [EmbeddingBinding],
    path: PathBuf,
    name: String,
    doc_type: DocType,
    state: DocState,
    doc_id: Option<i64>,
    content: Option<String>,
}

impl<'r> std::fmt::Debug for DocPipe<'r> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocPipe")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("doc_type", &self.doc_type)
            .field("state", &self.state)
            .field("doc_id", &self.doc_id)
            .finish()
    }
}

impl<'r> DocPipe<'r> {
    /// `path` must carry a supported extension (`.md` or `.txt`).
    pub fn new(
        path: PathBuf,
        store: &'r Store,
        bindings: &'r [EmbeddingBinding],
    ) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| KernelError::Input(format!("invalid file name: {}", path.display())))?
            .to_string();
        let doc_type = match path.extension().and_then(|e| e.to_str()) {
            Some("md") => DocType::Markdown,
            Some("txt") => DocType::PlainText,
            other => {
                return Err(KernelError::Input(format!(
                    "unsupported document type: {:?} ({})",
                    other,
                    path.display()
                )))
            }
        };
        Ok(Self {
            store,
            bindings,
            path,
            name,
            doc_type,
            state: DocState::Unknown,
            doc_id: None,
            content: None,
        })
    }

    pub fn state(&self) -> DocState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw file content, read once and cached. Line-ending normalization
    /// happens inside the chunker; document hashes cover the bytes as
    /// read.
    fn read_doc(&mut self) -> Result<&str> {
        if self.content.is_none() {
            let raw = std::fs::read_to_string(&self.path)
                .map_err(|e| KernelError::file_access(&self.path, e))?;
            self.content = Some(raw);
        }
        Ok(self.content.as_deref().unwrap())
    }

    /// Classify the document. Fast path compares mtimes; rows unchecked
    /// for over a day get a content-hash comparison.
    pub fn check(&mut self) -> Result<DocState> {
        let row = self.store.document_by_name(&self.name)?;

        if !self.path.exists() {
            self.state = match row {
                Some(row) => {
                    self.doc_id = Some(row.id);
                    DocState::Deleted
                }
                // Never seen on disk nor in the database: nothing to do.
                None => DocState::Unchanged,
            };
            return Ok(self.state);
        }

        if !self.path.is_file() {
            return Err(KernelError::Input(format!(
                "document is not a regular file: {}",
                self.path.display()
            )));
        }

        let row = match row {
            None => {
                self.state = DocState::Created;
                return Ok(self.state);
            }
            Some(row) => row,
        };
        self.doc_id = Some(row.id);

        let mtime = util::mtime_secs(&self.path).map_err(|e| KernelError::file_access(&self.path, e))?;
        if row.last_modified != Some(mtime) {
            self.state = DocState::Modified;
            return Ok(self.state);
        }

        let now = util::now_secs();
        if now - row.last_checked.unwrap_or(0) > MAX_UNCHECKED_SECS {
            let hash = util::content_hash(self.read_doc()?);
            if row.content_hash.as_deref() != Some(hash.as_str()) {
                self.state = DocState::Modified;
                return Ok(self.state);
            }
        }

        self.state = DocState::Unchanged;
        Ok(self.state)
    }

    /// Run the action for the current state. No-op for `Unchanged`.
    pub fn process(
        &mut self,
        callback: Option<&(dyn Fn(f64) + Sync)>,
        stop: &AtomicBool,
    ) -> Result<()> {
        match self.state {
            DocState::Created => self.add_doc(callback, stop),
            DocState::Modified => self.update_doc(callback, stop),
            DocState::Deleted => self.del_doc(callback),
            DocState::Unchanged | DocState::Unknown => Ok(()),
        }
    }

    fn add_doc(&mut self, callback: Option<&(dyn Fn(f64) + Sync)>, stop: &AtomicBool) -> Result<()> {
        let n = self.bindings.len().max(1) as f64;
        let mut weights = vec![("insert_documents_table", 0.01), ("open_file", 0.02)];
        for _ in self.bindings {
            weights.push(("embedding", 0.96 / n));
        }
        weights.push(("update_sql", 0.01));
        let mut progress = Progress::new(callback, &weights);

        let doc_id = self.store.insert_document_placeholder(&self.name)?;
        self.doc_id = Some(doc_id);
        progress.finish_subprogress();

        self.update_to_tables(&mut progress, stop)?;
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.update_sqlite()?;
        progress.finish_subprogress();
        Ok(())
    }

    fn update_doc(
        &mut self,
        callback: Option<&(dyn Fn(f64) + Sync)>,
        stop: &AtomicBool,
    ) -> Result<()> {
        let n = self.bindings.len().max(1) as f64;
        let mut weights = vec![("open_file", 0.02)];
        for _ in self.bindings {
            weights.push(("embedding", 0.97 / n));
        }
        weights.push(("update_sql", 0.01));
        let mut progress = Progress::new(callback, &weights);

        self.update_to_tables(&mut progress, stop)?;
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.update_sqlite()?;
        progress.finish_subprogress();
        Ok(())
    }

    /// Remove the document and everything hanging off it, in one
    /// transaction on the main database. Vectors use the lenient removal:
    /// a chunk whose vector was already lost must not block the delete.
    fn del_doc(&mut self, callback: Option<&(dyn Fn(f64) + Sync)>) -> Result<()> {
        let mut progress = Progress::plain(callback);

        let doc_id = match self.doc_id {
            Some(id) => id,
            None => {
                let row = self.store.document_by_name(&self.name)?.ok_or_else(|| {
                    KernelError::Internal(format!("document not found in database: {}", self.name))
                })?;
                row.id
            }
        };
        let chunk_ids = self.store.chunk_ids_for_document(doc_id)?;
        progress.update(0.2);

        let mut tx = self.store.begin()?;
        tx.delete_chunks_for_document(doc_id)?;
        progress.update(0.4);

        if tx.delete_document(doc_id)? == 0 {
            return Err(KernelError::Internal(format!(
                "failed to delete document from database: {}",
                self.name
            )));
        }
        progress.update(0.6);

        for &chunk_id in &chunk_ids {
            if tx.delete_text_row(chunk_id)? == 0 {
                return Err(KernelError::Internal(format!(
                    "no text row found for chunk {}",
                    chunk_id
                )));
            }
        }
        progress.update(0.8);

        for binding in self.bindings {
            binding.table.remove_if_exists(&chunk_ids)?;
        }

        tx.commit()?;
        progress.update(1.0);
        Ok(())
    }

    fn update_to_tables(&mut self, progress: &mut Progress<'_>, stop: &AtomicBool) -> Result<()> {
        self.read_doc()?;
        progress.finish_subprogress();

        for binding in self.bindings {
            self.update_one_embedding(binding, progress, stop)?;
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            progress.finish_subprogress();
        }
        Ok(())
    }

    fn update_one_embedding(
        &self,
        binding: &EmbeddingBinding,
        progress: &mut Progress<'_>,
        stop: &AtomicBool,
    ) -> Result<()> {
        let content = self.content.as_deref().expect("document content cached");
        let doc_id = self.doc_id.expect("doc_id resolved before table update");
        let handle = &binding.handle;

        // 1. Chunk under this embedding's effective length budget.
        let model_max = handle.model.max_length();
        let mut chunk_length = handle.input_length;
        if chunk_length > model_max {
            tracing::warn!(
                config = %handle.config_name,
                requested = handle.input_length,
                using = model_max,
                "embedding input length exceeds model maximum"
            );
            chunk_length = model_max;
        }
        let get_length: LengthFn = match self.doc_type {
            DocType::Markdown => {
                let model = Arc::clone(&handle.model);
                Arc::new(move |s: &str| model.count_tokens(s))
            }
            DocType::PlainText => Arc::new(|s: &str| s.len()),
        };
        let chunker = Chunker::new(self.doc_type, chunk_length, get_length);
        let extra = vec![("FilePath".to_string(), self.path.display().to_string())];
        let new_chunks = chunker.chunk(content, &extra);
        progress.update_subprocess(0.01);

        // 2. Existing rows keyed by content hash; one hash may recur.
        let mut existing: std::collections::HashMap<String, Vec<crate::store::ChunkRow>> =
            std::collections::HashMap::new();
        for row in self.store.chunks_for(doc_id, handle.id)? {
            existing.entry(row.content_hash.clone()).or_default().push(row);
        }
        progress.update_subprocess(0.02);

        // 3. Walk new chunks: claim matching rows, queue the rest as adds.
        let mut adds: Vec<usize> = Vec::new();
        let mut reindexes: Vec<ReindexUpdate> = Vec::new();

        let mut tx = self.store.begin()?;
        for (index, chunk) in new_chunks.iter().enumerate() {
            let index = (index + 1) as i64; // 1-based, distinct from NULL
            let hash = util::content_hash(&format!("{}{}", chunk.content, chunk.metadata));
            let claimed = existing.get_mut(&hash).and_then(|rows| rows.pop());
            match claimed {
                Some(row) => {
                    if row.chunk_index != Some(index) {
                        // Park the slot now; the row moves after stale
                        // rows have vacated their positions.
                        if tx.clear_chunk_index(row.chunk_id)? == 0 {
                            return Err(KernelError::Internal(format!(
                                "failed to park chunk {} for reindex",
                                row.chunk_id
                            )));
                        }
                        reindexes.push(ReindexUpdate {
                            chunk_id: row.chunk_id,
                            chunk_index: index,
                            begin_line: chunk.begin_line,
                            end_line: chunk.end_line,
                        });
                    }
                }
                None => adds.push(index as usize),
            }
        }

        // Unclaimed rows are stale: drop chunk row, vector, and text row.
        for rows in existing.into_values() {
            for row in rows {
                if tx.delete_chunk(row.chunk_id)? == 0 {
                    return Err(KernelError::Internal(format!(
                        "failed to delete stale chunk {}",
                        row.chunk_id
                    )));
                }
                binding.table.remove(row.chunk_id)?;
                if tx.delete_text_row(row.chunk_id)? == 0 {
                    return Err(KernelError::Internal(format!(
                        "no text row found for stale chunk {}",
                        row.chunk_id
                    )));
                }
            }
        }
        progress.update_subprocess(0.03);

        for update in &reindexes {
            if tx.apply_reindex(update)? == 0 {
                return Err(KernelError::Internal(format!(
                    "failed to reindex chunk {}",
                    update.chunk_id
                )));
            }
        }
        progress.update_subprocess(0.04);
        // Commit before the add phase: everything below may stop mid-way.
        tx.commit()?;

        // 4. Insert new chunks in committed batches.
        let total_adds = adds.len().max(1) as f64;
        let mut done = 0usize;
        let mut tx = self.store.begin()?;
        for index in adds {
            let chunk = &new_chunks[index - 1];
            let sequence = format!("{}{}", chunk.content, chunk.metadata);
            let hash = util::content_hash(&sequence);

            let chunk_id = tx.insert_chunk(
                doc_id,
                handle.id,
                &NewChunk {
                    chunk_index: index as i64,
                    content_hash: hash,
                    begin_line: chunk.begin_line,
                    end_line: chunk.end_line,
                },
            )?;

            let vector = handle
                .model
                .embed(&sequence)
                .map_err(|e| KernelError::Internal(format!("embedding failed: {}", e)))?;
            binding.table.add_with_id(chunk_id, &vector)?;

            tx.upsert_text_row(chunk_id, &chunk.content, &chunk.metadata)?;

            done += 1;
            progress.update_subprocess(0.04 + done as f64 * 0.95 / total_adds);

            if stop.load(Ordering::Relaxed) {
                tx.commit()?;
                return Ok(());
            }
            if done % CHUNK_COMMIT_INTERVAL == 0 {
                tx.commit()?;
                tx = self.store.begin()?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn update_sqlite(&mut self) -> Result<()> {
        let hash = util::content_hash(self.read_doc()?);
        let mtime =
            util::mtime_secs(&self.path).map_err(|e| KernelError::file_access(&self.path, e))?;
        let size = std::fs::metadata(&self.path)
            .map_err(|e| KernelError::file_access(&self.path, e))?
            .len() as i64;
        let doc_id = self.doc_id.expect("doc_id resolved before row update");

        let changed =
            self.store
                .update_document(doc_id, &self.name, mtime, size, &hash, util::now_secs())?;
        if changed == 0 {
            return Err(KernelError::Internal(format!(
                "failed to update document row: {}",
                self.name
            )));
        }
        Ok(())
    }
}
