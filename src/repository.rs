//! One indexed directory: relational store + full-text index + one vector
//! table per embedding configuration, plus the background sweeper that
//! keeps them synchronized with the files on disk.
//!
//! Locking: the reader-writer lock here guards the *set* of embedding
//! bindings (configs, models, vector tables), not the data inside them —
//! each index carries its own lock. Sweeps and searches take the read
//! side; `configure_embedding` and `reconstruct` take the write side with
//! the sweeper stopped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::embedder::{load_model, EmbeddingHandle};
use crate::error::{KernelError, Result};
use crate::fts::{Analyzer, SimpleAnalyzer, TextIndex};
use crate::pipeline::{DocPipe, DocState, EmbeddingBinding};
use crate::store::{EmbeddingConfig, Store};
use crate::vector::VectorTable;

/// Weight of the vector score in hybrid fusion.
const ALPHA: f64 = 0.6;

/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Lexical search over-fetch factor.
const FTS_LIMIT_FACTOR: usize = 10;
/// Vector search over-fetch factor.
const VECTOR_LIMIT_FACTOR: usize = 3;

/// A fused search hit, materialized from the lexical table.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: i64,
    pub score: f64,
    pub content: String,
    pub metadata: String,
}

/// Callbacks the embedding session wires to the frontend.
#[derive(Default, Clone)]
pub struct Reporters {
    /// Paths whose documents changed state in a sweep.
    pub doc_state: Option<Arc<dyn Fn(&[String]) + Send + Sync>>,
    /// Per-file ingest progress, 0.0→1.0.
    pub progress: Option<Arc<dyn Fn(&str, f64) + Send + Sync>>,
    /// A file finished processing.
    pub done: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

struct RepoInner {
    name: String,
    root: PathBuf,
    db_dir: PathBuf,
    store: Arc<Store>,
    text_index: Arc<TextIndex>,
    bindings: RwLock<Vec<EmbeddingBinding>>,
    reporters: Reporters,
    stop: AtomicBool,
}

/// A repository rooted at one directory.
pub struct Repository {
    inner: Arc<RepoInner>,
    thread: Option<JoinHandle<()>>,
}

impl Repository {
    /// Open the repository and start its background sweeper.
    pub fn open(name: &str, root: &Path, reporters: Reporters) -> Result<Self> {
        let mut repo = Self::open_paused(name, root, reporters)?;
        repo.start_background();
        Ok(repo)
    }

    /// Open without starting the sweeper. Callers drive ingestion through
    /// [`Repository::sweep_now`]; used by embedders and tests that need
    /// deterministic sweeps.
    pub fn open_paused(name: &str, root: &Path, reporters: Reporters) -> Result<Self> {
        if !root.is_dir() {
            return Err(KernelError::Input(format!(
                "repository path is not a directory: {}",
                root.display()
            )));
        }
        let db_dir = root.join(".PocketRAG").join("db");
        let store = Arc::new(Store::open(&db_dir.join(format!("{}.db", name)))?);
        let analyzer: Arc<dyn Analyzer> = Arc::new(SimpleAnalyzer);
        let text_index = Arc::new(TextIndex::new(Arc::clone(&store), analyzer)?);

        let inner = Arc::new(RepoInner {
            name: name.to_string(),
            root: root.to_path_buf(),
            db_dir,
            store,
            text_index,
            bindings: RwLock::new(Vec::new()),
            reporters,
            stop: AtomicBool::new(false),
        });
        Self::reload_bindings(&inner, None)?;

        Ok(Self {
            inner,
            thread: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn text_index(&self) -> &Arc<TextIndex> {
        &self.inner.text_index
    }

    /// Rebuild the in-memory binding slice from `valid = 1` config rows,
    /// optionally applying a config diff first. Caller must hold no
    /// binding lock; takes the write side itself.
    fn reload_bindings(inner: &Arc<RepoInner>, configs: Option<&[EmbeddingConfig]>) -> Result<()> {
        let mut bindings = inner.bindings.write().expect("bindings lock poisoned");
        if let Some(configs) = configs {
            inner.store.update_embedding_configs(configs)?;
        }
        // Old tables must close (and persist) before their paths reopen.
        bindings.clear();

        let mut fresh = Vec::new();
        for row in inner.store.valid_embedding_configs()? {
            let model = load_model(&row.model_path)
                .map_err(|e| KernelError::Input(format!("embedding config {}: {}", row.config_name, e)))?;
            let table = Arc::new(VectorTable::open(
                &inner.db_dir,
                &format!("vector_{}", row.id),
                model.dimension(),
            )?);
            fresh.push(EmbeddingBinding {
                handle: EmbeddingHandle {
                    id: row.id,
                    config_name: row.config_name,
                    input_length: row.max_input_length as usize,
                    model,
                },
                table,
            });
        }
        *bindings = fresh;
        Ok(())
    }

    // ---------------- background sweeper ----------------

    pub fn start_background(&mut self) {
        if self.thread.is_some() {
            return;
        }
        self.inner.stop.store(false, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        self.thread = Some(std::thread::spawn(move || Self::background_loop(inner)));
    }

    pub fn stop_background(&mut self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn background_loop(inner: Arc<RepoInner>) {
        while !inner.stop.load(Ordering::Relaxed) {
            // Sleep in short slices so shutdown stays responsive.
            for _ in 0..10 {
                if inner.stop.load(Ordering::Relaxed) {
                    return;
                }
                std::thread::sleep(SWEEP_INTERVAL / 10);
            }
            match Self::sweep(&inner) {
                Ok(needs_rebuild) => {
                    if needs_rebuild {
                        tracing::error!(
                            repo = %inner.name,
                            "vector table reported unreachable ids, rebuilding repository"
                        );
                        if let Err(e) = Self::reconstruct_inner(&inner) {
                            tracing::error!(repo = %inner.name, error = %e, "rebuild failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(repo = %inner.name, error = %e, "background sweep failed");
                }
            }
        }
    }

    /// Run one sweep immediately (normally the background thread's job).
    pub fn sweep_now(&self) -> Result<()> {
        if Self::sweep(&self.inner)? {
            Self::reconstruct_inner(&self.inner)?;
        }
        Ok(())
    }

    /// One pass: diff the directory against `documents`, process every
    /// changed document, garbage-collect retired configs, persist vector
    /// tables. Returns true if a vector table reported an invariant break
    /// and the repository should rebuild.
    fn sweep(inner: &Arc<RepoInner>) -> Result<bool> {
        let bindings = inner.bindings.read().expect("bindings lock poisoned");

        // Files on disk (top level, no dotfiles, supported types only).
        let mut paths: Vec<PathBuf> = Vec::new();
        let entries = std::fs::read_dir(&inner.root)
            .map_err(|e| KernelError::file_access(&inner.root, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            if file_name.starts_with('.') || !path.is_file() {
                continue;
            }
            if !matches!(path.extension().and_then(|e| e.to_str()), Some("md" | "txt")) {
                continue;
            }
            paths.push(path);
        }

        // Merge in database rows whose file vanished.
        let known: std::collections::HashSet<String> = paths
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        for name in inner.store.document_names()? {
            if !known.contains(&name) {
                paths.push(inner.root.join(name));
            }
        }

        // Check phase: classify every candidate.
        let mut queue: Vec<DocPipe<'_>> = Vec::new();
        let mut changed: Vec<String> = Vec::new();
        for path in paths {
            let mut pipe = match DocPipe::new(path.clone(), &inner.store, &bindings) {
                Ok(pipe) => pipe,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping document");
                    continue;
                }
            };
            match pipe.check() {
                Ok(DocState::Unchanged | DocState::Unknown) => {}
                Ok(_) => {
                    changed.push(path.display().to_string());
                    queue.push(pipe);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "document check failed");
                }
            }
        }
        if !changed.is_empty() {
            if let Some(reporter) = &inner.reporters.doc_state {
                reporter(&changed);
            }
        }

        // Drain phase: one document at a time.
        for mut pipe in queue {
            let path = pipe.path().display().to_string();
            let progress_cb = inner.reporters.progress.clone().map(|reporter| {
                let path = path.clone();
                move |p: f64| reporter(&path, p)
            });
            let result = match &progress_cb {
                Some(cb) => pipe.process(Some(cb), &inner.stop),
                None => pipe.process(None, &inner.stop),
            };
            if let Err(e) = result {
                tracing::warn!(path = %path, error = %e, "document processing failed");
                continue;
            }
            if let Some(reporter) = &inner.reporters.done {
                reporter(&path);
            }
            if inner.stop.load(Ordering::Relaxed) {
                return Ok(false);
            }
        }

        Self::remove_invalid_embeddings(inner)?;

        let mut needs_rebuild = false;
        for binding in bindings.iter() {
            binding.table.persist()?;
            if !binding.table.invalid_ids()?.is_empty() {
                needs_rebuild = true;
            }
        }
        Ok(needs_rebuild)
    }

    /// Garbage-collect configs retired by `configure_embedding`: their
    /// chunks, text rows, config row, and vector table files.
    fn remove_invalid_embeddings(inner: &Arc<RepoInner>) -> Result<()> {
        let rows = inner.store.invalid_embedding_configs()?;
        for row in rows {
            let chunk_ids = inner.store.chunk_ids_for_embedding(row.id)?;
            let mut tx = inner.store.begin()?;
            for chunk_id in &chunk_ids {
                if tx.delete_chunk(*chunk_id)? == 0 {
                    return Err(KernelError::Internal(format!(
                        "failed to delete chunk {} of retired config {}",
                        chunk_id, row.config_name
                    )));
                }
                tx.delete_text_row(*chunk_id)?;
            }
            tx.delete_embedding_config(row.id)?;
            tx.commit()?;

            VectorTable::drop_table(&inner.db_dir, &format!("vector_{}", row.id))?;
            tracing::info!(
                config = %row.config_name,
                chunks = chunk_ids.len(),
                "removed retired embedding config"
            );
        }
        Ok(())
    }

    // ---------------- search ----------------

    /// Hybrid search: one ranked result list per embedding configuration.
    ///
    /// Lexical and vector hits are fused per id:
    /// `α·(1 − distance) + (1 − α)·lexical_similarity` when both indexes
    /// matched, `α·(1 − distance)` otherwise.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<Vec<SearchResult>>> {
        let inner = &self.inner;
        let bindings = inner.bindings.read().expect("bindings lock poisoned");

        let lexical = inner
            .text_index
            .search(query, limit * FTS_LIMIT_FACTOR)?;
        let lexical_scores: std::collections::HashMap<i64, f64> = lexical
            .iter()
            .map(|r| (r.chunk_id, r.similarity))
            .collect();

        let mut all_results = Vec::with_capacity(bindings.len());
        for binding in bindings.iter() {
            let query_vector = binding
                .handle
                .model
                .embed(query)
                .map_err(|e| KernelError::Internal(format!("query embedding failed: {}", e)))?;
            let (ids, distances) = binding
                .table
                .query(&query_vector, limit * VECTOR_LIMIT_FACTOR)?;

            let mut fused: Vec<(i64, f64)> = ids
                .iter()
                .zip(&distances)
                .map(|(&chunk_id, &distance)| {
                    let lexical = lexical_scores.get(&chunk_id).copied();
                    (chunk_id, fused_score(distance, lexical))
                })
                .collect();
            fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            fused.truncate(limit);

            let mut results = Vec::with_capacity(fused.len());
            for (chunk_id, score) in fused {
                let (content, metadata) = inner.text_index.get_content(chunk_id)?;
                results.push(SearchResult {
                    chunk_id,
                    score,
                    content,
                    metadata,
                });
            }
            all_results.push(results);
        }
        Ok(all_results)
    }

    // ---------------- reconfiguration ----------------

    /// Apply a new embedding configuration set. Stops the sweeper, diffs
    /// configs (new rows inserted, removed rows soft-deleted for the next
    /// sweep to collect), reloads models and vector tables, restarts.
    pub fn configure_embedding(&mut self, configs: &[EmbeddingConfig]) -> Result<()> {
        let was_running = self.thread.is_some();
        self.stop_background();
        let result = Self::reload_bindings(&self.inner, Some(configs));
        if was_running {
            self.start_background();
        }
        result
    }

    /// Drop and recreate every piece of repository state except the
    /// embedding config rows, then re-ingest from disk.
    pub fn reconstruct(&mut self) -> Result<()> {
        let was_running = self.thread.is_some();
        self.stop_background();
        let result = Self::reconstruct_inner(&self.inner);
        if was_running {
            self.start_background();
        }
        result
    }

    fn reconstruct_inner(inner: &Arc<RepoInner>) -> Result<()> {
        tracing::warn!(repo = %inner.name, "reconstructing repository state");
        {
            let mut bindings = inner.bindings.write().expect("bindings lock poisoned");
            // Close vector tables first so their files can be removed.
            bindings.clear();

            inner.store.drop_index_tables()?;
            for row in inner
                .store
                .valid_embedding_configs()?
                .into_iter()
                .chain(inner.store.invalid_embedding_configs()?)
            {
                VectorTable::drop_table(&inner.db_dir, &format!("vector_{}", row.id))?;
            }

            inner.store.init_index_tables()?;
            TextIndex::create_table(&inner.store)?;
        }
        Self::reload_bindings(inner, None)
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        self.stop_background();
    }
}

/// Hybrid fusion: `α·(1 − distance) + (1 − α)·lexical_similarity` when the
/// id also matched lexically, `α·(1 − distance)` otherwise.
pub fn fused_score(distance: f32, lexical: Option<f64>) -> f64 {
    let vector_part = ALPHA * (1.0 - distance as f64);
    match lexical {
        Some(lex) => vector_part + (1.0 - ALPHA) * lex,
        None => vector_part,
    }
}
