//! SQLite storage for documents, chunks, and embedding configs (sqlx async
//! with sync wrappers).
//!
//! Provides sync methods that internally use a tokio runtime to execute
//! async sqlx operations, so callers stay on plain threads while sqlx keeps
//! its async driver. One pool per database file; every worker thread checks
//! a connection out of the pool on use.
//!
//! ## Module structure
//!
//! - `documents` — document row CRUD
//! - `chunks` — chunk rows + their full-text rows (kept in one transaction)
//! - `embeddings` — embedding_config rows and the soft-delete diff

mod chunks;
mod documents;
mod embeddings;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::runtime::Runtime;

pub use chunks::{ChunkRow, NewChunk, ReindexUpdate};
pub use documents::DocumentRow;
pub use embeddings::{EmbeddingConfig, EmbeddingConfigRow};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),
    #[error("Database error: {0}")]
    Execute(String),
    #[error("Transaction error: {0}")]
    Transaction(String),
    #[error("Fatal database error: {0}")]
    Fatal(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Execute(e.to_string())
    }
}

/// Thread-safe SQLite store.
///
/// All methods take `&self` and are safe to call from multiple threads;
/// each call runs on a pooled connection. Multi-statement atomic sections
/// go through [`Store::begin`], which hands out a [`StoreTx`] bound to one
/// connection for its lifetime.
pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) rt: Runtime,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database at `path`, creating parent directories
    /// and the index schema as needed. WAL journal mode for concurrent
    /// readers, foreign keys on so chunk rows cascade with their document.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("{}: {}", parent.display(), e)))?;
        }
        let rt = Runtime::new().map_err(|e| StoreError::Open(e.to_string()))?;

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = rt
            .block_on(
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options),
            )
            .map_err(|e| StoreError::Open(format!("{}: {}", path.display(), e)))?;

        let store = Store {
            pool,
            rt,
            path: path.to_path_buf(),
        };
        store.init_index_tables()?;
        Ok(store)
    }

    /// Open without creating the index schema. Used for databases that
    /// carry their own tables (the global kernel database).
    pub fn open_bare(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("{}: {}", parent.display(), e)))?;
        }
        let rt = Runtime::new().map_err(|e| StoreError::Open(e.to_string()))?;
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = rt
            .block_on(
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options),
            )
            .map_err(|e| StoreError::Open(format!("{}: {}", path.display(), e)))?;
        Ok(Store {
            pool,
            rt,
            path: path.to_path_buf(),
        })
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.rt.block_on(fut)
    }

    /// Execute a single SQL statement, returning the number of changed rows.
    pub fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        self.block_on(async {
            let result = sqlx::query(sql).execute(&self.pool).await?;
            Ok(result.rows_affected())
        })
    }

    /// Create the index schema. Idempotent; called on open and again after
    /// [`Store::drop_index_tables`] during a repository rebuild.
    pub fn init_index_tables(&self) -> Result<(), StoreError> {
        self.block_on(async {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS documents (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     doc_name TEXT UNIQUE NOT NULL,
                     last_modified INTEGER,
                     file_size INTEGER,
                     content_hash TEXT,
                     last_checked INTEGER
                 )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS embedding_config (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     config_name TEXT NOT NULL UNIQUE,
                     model_name TEXT NOT NULL,
                     model_path TEXT NOT NULL,
                     max_input_length INTEGER NOT NULL,
                     valid BOOLEAN DEFAULT 1
                 )",
            )
            .execute(&self.pool)
            .await?;

            // chunk_index is nullable: a row parks at NULL while a reindex
            // moves it to a new slot, so the UNIQUE constraint never trips
            // mid-shuffle (SQLite treats NULLs as distinct).
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS chunks (
                     chunk_id INTEGER PRIMARY KEY AUTOINCREMENT,
                     doc_id INTEGER NOT NULL,
                     embedding_id INTEGER NOT NULL,
                     chunk_index INTEGER,
                     content_hash TEXT NOT NULL,
                     begin_line INTEGER,
                     end_line INTEGER,
                     UNIQUE(doc_id, embedding_id, chunk_index),
                     FOREIGN KEY(doc_id) REFERENCES documents(id) ON DELETE CASCADE,
                     FOREIGN KEY(embedding_id) REFERENCES embedding_config(id) ON DELETE CASCADE
                 )",
            )
            .execute(&self.pool)
            .await?;

            Ok(())
        })
    }

    /// Drop every index table except `embedding_config` (which survives a
    /// rebuild). The caller recreates the schema afterwards.
    pub fn drop_index_tables(&self) -> Result<(), StoreError> {
        self.block_on(async {
            let mut tx = self.pool.begin().await.map_err(tx_err)?;
            sqlx::query("DROP TABLE IF EXISTS chunks")
                .execute(&mut *tx)
                .await?;
            sqlx::query("DROP TABLE IF EXISTS documents")
                .execute(&mut *tx)
                .await?;
            sqlx::query("DROP TABLE IF EXISTS text_search")
                .execute(&mut *tx)
                .await?;
            tx.commit().await.map_err(tx_err)?;
            Ok(())
        })
    }

    /// Begin a transaction. Statements issued through the returned handle
    /// run on one pinned connection; dropping the handle without commit
    /// rolls everything back.
    pub fn begin(&self) -> Result<StoreTx<'_>, StoreError> {
        let tx = self.block_on(self.pool.begin()).map_err(tx_err)?;
        Ok(StoreTx {
            store: self,
            tx: Some(tx),
            savepoints: Vec::new(),
            next_savepoint: 0,
        })
    }
}

fn tx_err(e: sqlx::Error) -> StoreError {
    StoreError::Transaction(e.to_string())
}

/// Handle for an open savepoint inside a [`StoreTx`]. Must be committed or
/// rolled back in LIFO order; releasing a non-top savepoint is a nesting
/// error.
#[derive(Debug)]
pub struct Savepoint {
    name: String,
    index: usize,
}

/// An open transaction. The outer level is a real `BEGIN`; nested levels
/// are named savepoints.
pub struct StoreTx<'s> {
    store: &'s Store,
    tx: Option<Transaction<'static, Sqlite>>,
    savepoints: Vec<String>,
    next_savepoint: usize,
}

impl StoreTx<'_> {
    /// Execute a raw statement inside this transaction.
    pub fn execute(&mut self, sql: &str) -> Result<u64, StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            let result = sqlx::query(sql).execute(&mut **tx).await?;
            Ok(result.rows_affected())
        })
    }

    /// Rowid of the last insert on this transaction's connection.
    pub fn last_insert_id(&mut self) -> Result<i64, StoreError> {
        let store = self.store;
        let tx = self.tx.as_mut().expect("transaction already finished");
        store.rt.block_on(async {
            let row: (i64,) = sqlx::query_as("SELECT last_insert_rowid()")
                .fetch_one(&mut **tx)
                .await?;
            Ok(row.0)
        })
    }

    /// Open a nested level as a named savepoint.
    pub fn begin_nested(&mut self) -> Result<Savepoint, StoreError> {
        let name = format!("savepoint_{}", self.next_savepoint);
        self.next_savepoint += 1;
        self.execute(&format!("SAVEPOINT {}", name))
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        self.savepoints.push(name.clone());
        let index = self.savepoints.len() - 1;
        Ok(Savepoint { name, index })
    }

    /// Release a savepoint. Fails with a nesting error unless `sp` is the
    /// innermost open level.
    pub fn commit_nested(&mut self, sp: Savepoint) -> Result<(), StoreError> {
        if self.savepoints.len() != sp.index + 1 {
            return Err(StoreError::Transaction(format!(
                "cannot commit savepoint {}: not the innermost transaction level",
                sp.name
            )));
        }
        self.execute(&format!("RELEASE SAVEPOINT {}", sp.name))
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        self.savepoints.pop();
        Ok(())
    }

    /// Roll back to (and release) a savepoint. Same LIFO rule as commit.
    pub fn rollback_nested(&mut self, sp: Savepoint) -> Result<(), StoreError> {
        if self.savepoints.len() != sp.index + 1 {
            return Err(StoreError::Transaction(format!(
                "cannot roll back savepoint {}: not the innermost transaction level",
                sp.name
            )));
        }
        self.execute(&format!("ROLLBACK TO SAVEPOINT {}", sp.name))
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        self.execute(&format!("RELEASE SAVEPOINT {}", sp.name))
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        self.savepoints.pop();
        Ok(())
    }

    /// Commit the outer transaction. Fails if a nested level is still open.
    pub fn commit(mut self) -> Result<(), StoreError> {
        if !self.savepoints.is_empty() {
            return Err(StoreError::Transaction(format!(
                "cannot commit: {} nested level(s) still open",
                self.savepoints.len()
            )));
        }
        let tx = self.tx.take().expect("transaction already finished");
        self.store.rt.block_on(tx.commit()).map_err(tx_err)
    }

    /// Explicit rollback; dropping the handle does the same.
    pub fn rollback(mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().expect("transaction already finished");
        self.store.rt.block_on(tx.rollback()).map_err(tx_err)
    }
}

impl Drop for StoreTx<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = self.store.rt.block_on(tx.rollback()) {
                // Rollback failure during teardown leaves the connection in
                // an unknown state; surface it loudly, there is no caller.
                tracing::error!(error = %e, "fatal: rollback failed while dropping transaction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_open_creates_schema() {
        let (store, _dir) = test_store();
        // Idempotent re-init must not fail.
        store.init_index_tables().unwrap();
        assert_eq!(store.document_names().unwrap().len(), 0);
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let (store, _dir) = test_store();
        {
            let mut tx = store.begin().unwrap();
            tx.execute("INSERT INTO documents (doc_name) VALUES ('a.md')")
                .unwrap();
        } // dropped uncommitted
        assert!(store.document_by_name("a.md").unwrap().is_none());

        let mut tx = store.begin().unwrap();
        tx.execute("INSERT INTO documents (doc_name) VALUES ('a.md')")
            .unwrap();
        tx.commit().unwrap();
        assert!(store.document_by_name("a.md").unwrap().is_some());
    }

    #[test]
    fn test_nested_savepoints() {
        let (store, _dir) = test_store();
        let mut tx = store.begin().unwrap();
        tx.execute("INSERT INTO documents (doc_name) VALUES ('outer.md')")
            .unwrap();

        let sp = tx.begin_nested().unwrap();
        tx.execute("INSERT INTO documents (doc_name) VALUES ('inner.md')")
            .unwrap();
        tx.rollback_nested(sp).unwrap();

        tx.commit().unwrap();
        assert!(store.document_by_name("outer.md").unwrap().is_some());
        assert!(store.document_by_name("inner.md").unwrap().is_none());
    }

    #[test]
    fn test_commit_of_non_top_level_fails() {
        let (store, _dir) = test_store();
        let mut tx = store.begin().unwrap();
        let outer_sp = tx.begin_nested().unwrap();
        let _inner_sp = tx.begin_nested().unwrap();
        let err = tx.commit_nested(outer_sp).unwrap_err();
        assert!(matches!(err, StoreError::Transaction(_)));
    }

    #[test]
    fn test_commit_with_open_savepoint_fails() {
        let (store, _dir) = test_store();
        let mut tx = store.begin().unwrap();
        let _sp = tx.begin_nested().unwrap();
        let err = tx.commit().unwrap_err();
        assert!(matches!(err, StoreError::Transaction(_)));
    }
}
