//! Common test fixtures and helpers
//!
//! Usage in test files:
//! ```ignore
//! mod common;
//! use common::TestRepo;
//! ```

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use pocketrag::embedder::load_model;
use pocketrag::pipeline::EmbeddingBinding;
use pocketrag::repository::{Reporters, Repository};
use pocketrag::store::{EmbeddingConfig, Store};
use pocketrag::vector::VectorTable;
use pocketrag::{EmbeddingHandle, SimpleAnalyzer, TextIndex};

/// The embedding config used across integration tests: the deterministic
/// hash embedder at 64 dimensions, 256-unit chunks.
pub fn test_config() -> EmbeddingConfig {
    EmbeddingConfig {
        config_name: "default".to_string(),
        model_name: "hash-embedder".to_string(),
        model_path: "hash:64".to_string(),
        max_input_length: 256,
    }
}

/// A repository over a temp directory with the sweeper paused; tests call
/// `sweep()` explicitly for deterministic ingestion.
pub struct TestRepo {
    pub repo: Repository,
    pub dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EmbeddingConfig) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let mut repo = Repository::open_paused("test_repo", dir.path(), Reporters::default())
            .expect("failed to open repository");
        repo.configure_embedding(&[config])
            .expect("failed to configure embedding");
        Self { repo, dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file under the repository root.
    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).expect("failed to write test file");
        path
    }

    pub fn remove(&self, name: &str) {
        std::fs::remove_file(self.dir.path().join(name)).expect("failed to remove test file");
    }

    pub fn sweep(&self) {
        self.repo.sweep_now().expect("sweep failed");
    }

    pub fn store(&self) -> &Arc<Store> {
        self.repo.store()
    }
}

/// Bare storage stack for tests that drive `DocPipe` directly: store,
/// text index, and one hash-embedder binding.
pub struct TestStack {
    pub store: Arc<Store>,
    pub text_index: TextIndex,
    pub bindings: Vec<EmbeddingBinding>,
    pub dir: TempDir,
}

impl TestStack {
    /// `input_length` is the chunking budget in length-oracle units.
    pub fn new(input_length: usize) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let db_dir = dir.path().join("db");
        let store = Arc::new(Store::open(&db_dir.join("main.db")).expect("open store"));
        let text_index =
            TextIndex::new(Arc::clone(&store), Arc::new(SimpleAnalyzer)).expect("open text index");

        store
            .update_embedding_configs(&[EmbeddingConfig {
                config_name: "default".to_string(),
                model_name: "hash-embedder".to_string(),
                model_path: "hash:32".to_string(),
                max_input_length: input_length as i64,
            }])
            .expect("insert config");
        let row = store.valid_embedding_configs().expect("configs")[0].clone();

        let model = load_model(&row.model_path).expect("load model");
        let table = Arc::new(
            VectorTable::open(&db_dir, &format!("vector_{}", row.id), model.dimension())
                .expect("open vector table"),
        );
        let bindings = vec![EmbeddingBinding {
            handle: EmbeddingHandle {
                id: row.id,
                config_name: row.config_name,
                input_length: row.max_input_length as usize,
                model,
            },
            table,
        }];

        Self {
            store,
            text_index,
            bindings,
            dir,
        }
    }

    pub fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).expect("failed to write test file");
        path
    }
}

/// Deterministic pseudo-random vector for ANN tests.
pub fn seeded_vector(seed: u64, dim: usize) -> Vec<f32> {
    (0..dim)
        .map(|i| {
            let x = seed.wrapping_mul(6364136223846793005).wrapping_add(i as u64 * 1442695040888963407);
            ((x >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0
        })
        .collect()
}
