//! Durable vector table: an in-memory ANN index paired with a relational
//! sidecar that survives crashes and interleaved mutation.
//!
//! The sidecar (one SQLite file per embedding config) is the source of
//! truth; the dumped ANN files are a cache of the last persisted snapshot.
//! Each row carries three flags:
//!
//! | valid | writeback | deleted | meaning                          |
//! |-------|-----------|---------|----------------------------------|
//! |   0   |     0     |    0    | reserved id; add in progress     |
//! |   1   |     0     |    0    | live in memory only              |
//! |   1   |     1     |    0    | live and persisted               |
//! |   *   |     *     |    1    | tombstoned until compaction      |
//!
//! On open, any `valid=1, writeback=0` row is demoted to invalid — the ANN
//! file on disk never captured it, so the vector is gone and the document
//! pipeline will re-embed its chunk on the next sweep.
//!
//! The sidecar also stores each vector's raw bytes. That is what makes
//! `reconstruct`, tombstone compaction, and rebuild-after-corruption
//! possible with an ANN backend that cannot return vectors by id.

mod hnsw;

pub use hnsw::{AnnIndex, HnswBackend};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, RwLock};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::runtime::Runtime;

/// Additions since the last persist that trigger an automatic persist.
const ADD_THRESHOLD: usize = 1000;
/// Tombstones that trigger an automatic compaction.
const DELETE_THRESHOLD: usize = 1000;

#[derive(Error, Debug)]
pub enum VectorError {
    #[error("Failed to open vector table: {0}")]
    Open(String),
    #[error("Vector table at {0} is already open")]
    AlreadyOpen(String),
    #[error("Vector with id {0} does not exist")]
    NotFound(i64),
    #[error("Vector with id {0} is already deleted")]
    AlreadyDeleted(i64),
    #[error("Vector with id {0} is invalid or deleted")]
    Unreachable(i64),
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("Vector table internal error: {0}")]
    Internal(String),
    #[error("Vector table I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for VectorError {
    fn from(e: sqlx::Error) -> Self {
        VectorError::Internal(e.to_string())
    }
}

/// At most one opener per vector table path, process-wide.
fn open_registry() -> &'static Mutex<HashSet<PathBuf>> {
    static REGISTRY: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Mutable state guarded by the table lock: the ANN index plus the
/// persist/compact counters.
struct State {
    ann: Box<dyn AnnIndex>,
    add_count: usize,
    delete_count: usize,
    dirty: bool,
}

/// One durable ANN index keyed by external (chunk) ids.
///
/// Mutations take the exclusive side of the lock, queries the shared side;
/// persistence runs under the exclusive lock.
pub struct VectorTable {
    dir: PathBuf,
    name: String,
    dimension: usize,
    db_path: PathBuf,
    pool: SqlitePool,
    rt: Runtime,
    state: RwLock<State>,
}

impl std::fmt::Debug for VectorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorTable")
            .field("dir", &self.dir)
            .field("name", &self.name)
            .field("dimension", &self.dimension)
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl VectorTable {
    /// Open (or create) the vector table `name` under `dir`.
    ///
    /// Reopen path: demote never-persisted rows, then load the dumped ANN
    /// files; if they are missing or corrupt, rebuild the in-memory index
    /// from the sidecar's vector bytes.
    pub fn open(dir: &Path, name: &str, dimension: usize) -> Result<Self, VectorError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| VectorError::Open(format!("{}: {}", dir.display(), e)))?;
        let db_path = dir.join(format!("{}.db", name));

        {
            let mut registry = open_registry().lock().expect("open registry poisoned");
            if !registry.insert(db_path.clone()) {
                return Err(VectorError::AlreadyOpen(db_path.display().to_string()));
            }
        }

        let result = Self::open_inner(dir, name, dimension, &db_path);
        if result.is_err() {
            open_registry()
                .lock()
                .expect("open registry poisoned")
                .remove(&db_path);
        }
        result
    }

    fn open_inner(
        dir: &Path,
        name: &str,
        dimension: usize,
        db_path: &Path,
    ) -> Result<Self, VectorError> {
        let rt = Runtime::new().map_err(|e| VectorError::Open(e.to_string()))?;
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = rt
            .block_on(SqlitePoolOptions::new().max_connections(2).connect_with(options))
            .map_err(|e| VectorError::Open(format!("{}: {}", db_path.display(), e)))?;

        rt.block_on(async {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS vectors (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     embedding BLOB NOT NULL,
                     valid BOOLEAN NOT NULL DEFAULT 0,
                     writeback BOOLEAN NOT NULL DEFAULT 0,
                     deleted BOOLEAN NOT NULL DEFAULT 0
                 )",
            )
            .execute(&pool)
            .await?;
            // Rows added since the last persist did not reach the ANN file;
            // they are unreachable now and must not look live.
            sqlx::query("UPDATE vectors SET valid = 0, writeback = 0 WHERE valid = 1 AND writeback = 0")
                .execute(&pool)
                .await?;
            Ok::<_, VectorError>(())
        })?;

        // A crash mid-persist may leave partial `.new` dumps behind.
        remove_stale_partials(dir, name);

        let ann = Self::load_or_rebuild(dir, name, dimension, &rt, &pool)?;

        // Tombstones inherited from the previous run still count toward
        // the compaction threshold.
        let inherited: (i64,) = rt.block_on(async {
            sqlx::query_as("SELECT COUNT(*) FROM vectors WHERE deleted = 1")
                .fetch_one(&pool)
                .await
        })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            dimension,
            db_path: db_path.to_path_buf(),
            pool,
            rt,
            state: RwLock::new(State {
                ann,
                add_count: 0,
                delete_count: inherited.0 as usize,
                dirty: false,
            }),
        })
    }

    fn load_or_rebuild(
        dir: &Path,
        name: &str,
        dimension: usize,
        rt: &Runtime,
        pool: &SqlitePool,
    ) -> Result<Box<dyn AnnIndex>, VectorError> {
        let graph_path = dir.join(format!("{}.hnsw.graph", name));
        if graph_path.exists() {
            match HnswBackend::load(dir, name, dimension) {
                Ok(backend) => return Ok(Box::new(backend)),
                Err(e) => {
                    tracing::warn!(
                        table = name,
                        error = %e,
                        "failed to load persisted ANN index, rebuilding from sidecar"
                    );
                }
            }
        }

        // No usable dump. Rebuild from the sidecar bytes of persisted rows.
        let rows: Vec<(i64, Vec<u8>)> = rt.block_on(async {
            sqlx::query_as(
                "SELECT id, embedding FROM vectors WHERE valid = 1 AND deleted = 0 ORDER BY id",
            )
            .fetch_all(pool)
            .await
        })?;
        let mut backend = HnswBackend::new(dimension);
        if !rows.is_empty() {
            let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
            let vectors: Vec<Vec<f32>> = rows.iter().map(|(_, b)| bytes_to_vec(b)).collect();
            backend.add_with_ids(&vectors, &ids);
            tracing::info!(table = name, count = ids.len(), "rebuilt ANN index from sidecar");
        }
        Ok(Box::new(backend))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check_dimension(&self, v: &[f32]) -> Result<(), VectorError> {
        if v.len() != self.dimension {
            return Err(VectorError::Dimension {
                expected: self.dimension,
                actual: v.len(),
            });
        }
        Ok(())
    }

    /// Add one vector under a freshly reserved id and return it.
    pub fn add(&self, vector: &[f32]) -> Result<i64, VectorError> {
        let ids = self.add_batch(&[vector.to_vec()])?;
        Ok(ids[0])
    }

    /// Batched add. Phase one reserves ids (all flags zero), phase two
    /// inserts into the ANN index and marks the rows live. Each phase is
    /// its own atomic section so a crash between them leaves only
    /// reserved-id rows, which `invalid_ids` later surfaces.
    pub fn add_batch(&self, vectors: &[Vec<f32>]) -> Result<Vec<i64>, VectorError> {
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        for v in vectors {
            self.check_dimension(v)?;
        }
        let mut state = self.state.write().expect("vector table lock poisoned");

        let ids: Vec<i64> = self.rt.block_on(async {
            let mut tx = self.pool.begin().await?;
            let mut ids = Vec::with_capacity(vectors.len());
            for v in vectors {
                let result = sqlx::query("INSERT INTO vectors (embedding) VALUES (?1)")
                    .bind(vec_to_bytes(v))
                    .execute(&mut *tx)
                    .await?;
                ids.push(result.last_insert_rowid());
            }
            tx.commit().await?;
            Ok::<_, VectorError>(ids)
        })?;

        state.ann.add_with_ids(vectors, &ids);

        self.rt.block_on(async {
            let mut tx = self.pool.begin().await?;
            for id in &ids {
                sqlx::query("UPDATE vectors SET valid = 1 WHERE id = ?1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok::<_, VectorError>(())
        })?;

        state.add_count += ids.len();
        state.dirty = true;
        if state.add_count >= ADD_THRESHOLD {
            self.persist_locked(&mut state)?;
        }
        Ok(ids)
    }

    /// Add one vector under an external id (the chunk id). A leftover row
    /// for the id (from an interrupted earlier add) is overwritten.
    pub fn add_with_id(&self, id: i64, vector: &[f32]) -> Result<(), VectorError> {
        self.check_dimension(vector)?;
        let mut state = self.state.write().expect("vector table lock poisoned");

        self.rt.block_on(async {
            sqlx::query("INSERT OR REPLACE INTO vectors (id, embedding) VALUES (?1, ?2)")
                .bind(id)
                .bind(vec_to_bytes(vector))
                .execute(&self.pool)
                .await?;
            Ok::<_, VectorError>(())
        })?;

        state.ann.add_with_ids(&[vector.to_vec()], &[id]);

        self.rt.block_on(async {
            sqlx::query("UPDATE vectors SET valid = 1 WHERE id = ?1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok::<_, VectorError>(())
        })?;

        state.add_count += 1;
        state.dirty = true;
        if state.add_count >= ADD_THRESHOLD {
            self.persist_locked(&mut state)?;
        }
        Ok(())
    }

    /// Tombstone one id. Fails if the id is absent or already deleted.
    pub fn remove(&self, id: i64) -> Result<(), VectorError> {
        self.remove_batch(&[id])
    }

    /// Tombstone a batch atomically: if any id is absent or already
    /// deleted, nothing is marked.
    pub fn remove_batch(&self, ids: &[i64]) -> Result<(), VectorError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().expect("vector table lock poisoned");

        self.rt.block_on(async {
            let mut tx = self.pool.begin().await?;
            for &id in ids {
                let row: Option<(bool,)> =
                    sqlx::query_as("SELECT deleted FROM vectors WHERE id = ?1")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?;
                match row {
                    None => return Err(VectorError::NotFound(id)),
                    Some((true,)) => return Err(VectorError::AlreadyDeleted(id)),
                    Some((false,)) => {}
                }
                sqlx::query("UPDATE vectors SET deleted = 1 WHERE id = ?1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok::<_, VectorError>(())
        })?;

        state.delete_count += ids.len();
        if state.delete_count >= DELETE_THRESHOLD {
            self.compact_locked(&mut state)?;
        }
        Ok(())
    }

    /// Tombstone any of `ids` that exist and are not yet deleted; missing
    /// ids are silently skipped. Returns the number tombstoned.
    pub fn remove_if_exists(&self, ids: &[i64]) -> Result<u64, VectorError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.write().expect("vector table lock poisoned");

        let changed = self.rt.block_on(async {
            let mut tx = self.pool.begin().await?;
            let mut changed = 0u64;
            for &id in ids {
                let result =
                    sqlx::query("UPDATE vectors SET deleted = 1 WHERE id = ?1 AND deleted = 0")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                changed += result.rows_affected();
            }
            tx.commit().await?;
            Ok::<_, VectorError>(changed)
        })?;

        state.delete_count += changed as usize;
        if state.delete_count >= DELETE_THRESHOLD {
            self.compact_locked(&mut state)?;
        }
        Ok(changed)
    }

    /// k-NN query. The raw ANN result is filtered through the sidecar so
    /// in-progress and tombstoned ids never surface, then truncated to the
    /// first `k` survivors.
    pub fn query(&self, query: &[f32], k: usize) -> Result<(Vec<i64>, Vec<f32>), VectorError> {
        self.check_dimension(query)?;
        let state = self.state.read().expect("vector table lock poisoned");

        // Over-fetch so sidecar filtering still leaves k survivors.
        let fetch = (k * 2 + 16).min(state.ann.len().max(1));
        let raw = state.ann.search(query, fetch);
        if raw.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let id_list = raw
            .iter()
            .map(|(id, _)| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("SELECT id, valid, deleted FROM vectors WHERE id IN ({})", id_list);
        let rows: Vec<(i64, bool, bool)> = self
            .rt
            .block_on(async { sqlx::query_as(&sql).fetch_all(&self.pool).await })?;
        let flags: HashMap<i64, (bool, bool)> = rows
            .into_iter()
            .map(|(id, valid, deleted)| (id, (valid, deleted)))
            .collect();

        let mut ids = Vec::new();
        let mut distances = Vec::new();
        for (id, distance) in raw {
            if let Some(&(true, false)) = flags.get(&id) {
                ids.push(id);
                distances.push(distance);
                if ids.len() == k {
                    break;
                }
            }
        }
        Ok((ids, distances))
    }

    /// Fetch the stored vector for an id. Errors if the sidecar reports the
    /// id invalid or deleted.
    pub fn reconstruct(&self, id: i64) -> Result<Vec<f32>, VectorError> {
        let _state = self.state.read().expect("vector table lock poisoned");
        let row: Option<(Vec<u8>, bool, bool)> = self.rt.block_on(async {
            sqlx::query_as("SELECT embedding, valid, deleted FROM vectors WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
        })?;
        match row {
            None => Err(VectorError::NotFound(id)),
            Some((_, valid, deleted)) if !valid || deleted => Err(VectorError::Unreachable(id)),
            Some((bytes, _, _)) => Ok(bytes_to_vec(&bytes)),
        }
    }

    /// Write the ANN index to disk and flip `writeback` on everything that
    /// was live in memory only. No-op when nothing changed since the last
    /// persist. Returns the number of rows newly marked persisted.
    pub fn persist(&self) -> Result<u64, VectorError> {
        let mut state = self.state.write().expect("vector table lock poisoned");
        self.persist_locked(&mut state)
    }

    fn persist_locked(&self, state: &mut State) -> Result<u64, VectorError> {
        if !state.dirty {
            return Ok(0);
        }

        // Dump beside the canonical files, then rename over them, so a
        // crash leaves either the old snapshot or the new one, never a
        // partial file.
        let new_basename = format!("{}.new", self.name);
        remove_stale_partials(&self.dir, &self.name);
        state.ann.save(&self.dir, &new_basename)?;
        for ext in ["hnsw.graph", "hnsw.data"] {
            let from = self.dir.join(format!("{}.{}", new_basename, ext));
            let to = self.dir.join(format!("{}.{}", self.name, ext));
            std::fs::rename(&from, &to)?;
        }
        hnsw::write_checksums(&self.dir, &self.name)?;

        let changed = self.rt.block_on(async {
            let result =
                sqlx::query("UPDATE vectors SET writeback = 1 WHERE valid = 1 AND writeback = 0")
                    .execute(&self.pool)
                    .await?;
            Ok::<_, VectorError>(result.rows_affected())
        })?;

        state.add_count = 0;
        state.dirty = false;
        tracing::debug!(table = %self.name, rows = changed, "persisted vector table");
        Ok(changed)
    }

    /// Rebuild the ANN index from live sidecar rows, purge tombstones, and
    /// persist the fresh snapshot. Returns the number of purged rows.
    pub fn compact(&self) -> Result<u64, VectorError> {
        let mut state = self.state.write().expect("vector table lock poisoned");
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut State) -> Result<u64, VectorError> {
        if state.delete_count == 0 {
            return Ok(0);
        }

        let rows: Vec<(i64, Vec<u8>)> = self.rt.block_on(async {
            sqlx::query_as(
                "SELECT id, embedding FROM vectors WHERE valid = 1 AND deleted = 0 ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await
        })?;

        let mut fresh = HnswBackend::new(self.dimension);
        if !rows.is_empty() {
            let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
            let vectors: Vec<Vec<f32>> = rows.iter().map(|(_, b)| bytes_to_vec(b)).collect();
            fresh.add_with_ids(&vectors, &ids);
        }

        let purged = self.rt.block_on(async {
            let result = sqlx::query("DELETE FROM vectors WHERE deleted = 1")
                .execute(&self.pool)
                .await?;
            Ok::<_, VectorError>(result.rows_affected())
        })?;

        state.ann = Box::new(fresh);
        state.delete_count = 0;
        state.dirty = true;
        self.persist_locked(state)?;
        tracing::info!(table = %self.name, purged = purged, "compacted vector table");
        Ok(purged)
    }

    /// Ids that are reachable by nobody: `valid=0, deleted=0`. Non-empty
    /// after a quiescent sweep means the table lost vectors it still has
    /// chunks for, and the repository rebuilds itself.
    pub fn invalid_ids(&self) -> Result<Vec<i64>, VectorError> {
        let _state = self.state.read().expect("vector table lock poisoned");
        let rows: Vec<(i64,)> = self.rt.block_on(async {
            sqlx::query_as("SELECT id FROM vectors WHERE valid = 0 AND deleted = 0")
                .fetch_all(&self.pool)
                .await
        })?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Total sidecar rows (tombstones included).
    pub fn row_count(&self) -> Result<u64, VectorError> {
        let row: (i64,) = self.rt.block_on(async {
            sqlx::query_as("SELECT COUNT(*) FROM vectors")
                .fetch_one(&self.pool)
                .await
        })?;
        Ok(row.0 as u64)
    }

    /// Test hook: release a leaked single-opener registration. Simulated
    /// crashes `mem::forget` the table, which skips the Drop that would
    /// normally free the path.
    #[doc(hidden)]
    pub fn force_release_path(dir: &Path, name: &str) {
        let db_path = dir.join(format!("{}.db", name));
        open_registry()
            .lock()
            .expect("open registry poisoned")
            .remove(&db_path);
    }

    /// Delete every on-disk artifact of a table that is not currently
    /// open: sidecar database, ANN dumps, checksum.
    pub fn drop_table(dir: &Path, name: &str) -> Result<(), VectorError> {
        let db_path = dir.join(format!("{}.db", name));
        {
            let registry = open_registry().lock().expect("open registry poisoned");
            if registry.contains(&db_path) {
                return Err(VectorError::AlreadyOpen(db_path.display().to_string()));
            }
        }
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(dir.join(format!("{}.db{}", name, suffix)));
        }
        hnsw::remove_dump_files(dir, name);
        remove_stale_partials(dir, name);
        Ok(())
    }
}

impl Drop for VectorTable {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.write() {
            if let Err(e) = self.persist_locked(&mut state) {
                tracing::error!(table = %self.name, error = %e, "persist on close failed");
            }
        }
        open_registry()
            .lock()
            .expect("open registry poisoned")
            .remove(&self.db_path);
    }
}

/// Remove leftover `<name>.new.*` dump files from an interrupted persist.
fn remove_stale_partials(dir: &Path, name: &str) {
    let prefix = format!("{}.new.", name);
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&prefix))
            {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vec_for(seed: u64, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|i| ((seed as f32 * 0.73) + i as f32 * 0.017).cos())
            .collect()
    }

    #[test]
    fn test_single_opener() {
        let dir = TempDir::new().unwrap();
        let table = VectorTable::open(dir.path(), "v1", 8).unwrap();
        let err = VectorTable::open(dir.path(), "v1", 8).unwrap_err();
        assert!(matches!(err, VectorError::AlreadyOpen(_)));
        drop(table);
        // Closing releases the path.
        VectorTable::open(dir.path(), "v1", 8).unwrap();
    }

    #[test]
    fn test_add_query_reconstruct() {
        let dir = TempDir::new().unwrap();
        let table = VectorTable::open(dir.path(), "v1", 8).unwrap();

        let v = vec_for(3, 8);
        let id = table.add(&v).unwrap();
        let (ids, distances) = table.query(&v, 1).unwrap();
        assert_eq!(ids, vec![id]);
        assert!(distances[0] < 1e-5);

        let back = table.reconstruct(id).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_remove_hides_id_and_errors_twice() {
        let dir = TempDir::new().unwrap();
        let table = VectorTable::open(dir.path(), "v1", 8).unwrap();
        let id = table.add(&vec_for(1, 8)).unwrap();

        table.remove(id).unwrap();
        let (ids, _) = table.query(&vec_for(1, 8), 5).unwrap();
        assert!(!ids.contains(&id));
        assert!(matches!(
            table.remove(id),
            Err(VectorError::AlreadyDeleted(_))
        ));
        assert!(matches!(table.remove(9999), Err(VectorError::NotFound(_))));
        assert!(matches!(
            table.reconstruct(id),
            Err(VectorError::Unreachable(_))
        ));
    }

    #[test]
    fn test_remove_batch_is_atomic() {
        let dir = TempDir::new().unwrap();
        let table = VectorTable::open(dir.path(), "v1", 8).unwrap();
        let a = table.add(&vec_for(1, 8)).unwrap();
        let err = table.remove_batch(&[a, 12345]).unwrap_err();
        assert!(matches!(err, VectorError::NotFound(12345)));
        // a must not have been tombstoned by the failed batch.
        table.remove(a).unwrap();
    }

    #[test]
    fn test_remove_if_exists_skips_missing() {
        let dir = TempDir::new().unwrap();
        let table = VectorTable::open(dir.path(), "v1", 8).unwrap();
        let a = table.add(&vec_for(1, 8)).unwrap();
        let changed = table.remove_if_exists(&[a, 777]).unwrap();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_persist_flips_writeback_and_skips_when_clean() {
        let dir = TempDir::new().unwrap();
        let table = VectorTable::open(dir.path(), "v1", 8).unwrap();
        table.add(&vec_for(1, 8)).unwrap();
        table.add(&vec_for(2, 8)).unwrap();

        assert_eq!(table.persist().unwrap(), 2);
        assert_eq!(table.persist().unwrap(), 0);
    }

    #[test]
    fn test_compact_purges_tombstones() {
        let dir = TempDir::new().unwrap();
        let table = VectorTable::open(dir.path(), "v1", 8).unwrap();
        let vectors: Vec<Vec<f32>> = (0..50).map(|i| vec_for(i, 8)).collect();
        let ids = table.add_batch(&vectors).unwrap();

        table.remove_batch(&ids[..10]).unwrap();
        let purged = table.compact().unwrap();
        assert_eq!(purged, 10);
        assert_eq!(table.row_count().unwrap(), 40);
        assert!(table.invalid_ids().unwrap().is_empty());

        // A surviving probe still resolves to itself.
        let (got, _) = table.query(&vec_for(20, 8), 1).unwrap();
        assert_eq!(got, vec![ids[20]]);
    }

    #[test]
    fn test_unpersisted_rows_demoted_on_reopen() {
        let dir = TempDir::new().unwrap();
        let persisted_id;
        {
            let table = VectorTable::open(dir.path(), "v1", 8).unwrap();
            persisted_id = table.add(&vec_for(1, 8)).unwrap();
            table.persist().unwrap();
            table.add(&vec_for(2, 8)).unwrap();
            // Simulate a crash: skip persist, drop without the Drop persist
            // by forgetting the table (the registry entry leaks, so use a
            // different name for the reopen check below).
            std::mem::forget(table);
        }
        // Reopen through the registry bypass: clear the leaked entry.
        open_registry()
            .lock()
            .unwrap()
            .remove(&dir.path().join("v1.db"));

        let table = VectorTable::open(dir.path(), "v1", 8).unwrap();
        // The never-persisted row was demoted to invalid.
        assert_eq!(table.invalid_ids().unwrap().len(), 1);
        let (ids, _) = table.query(&vec_for(2, 8), 2).unwrap();
        assert!(ids.contains(&persisted_id));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_add_with_external_id() {
        let dir = TempDir::new().unwrap();
        let table = VectorTable::open(dir.path(), "v1", 8).unwrap();
        table.add_with_id(4242, &vec_for(9, 8)).unwrap();
        let (ids, _) = table.query(&vec_for(9, 8), 1).unwrap();
        assert_eq!(ids, vec![4242]);
    }

    #[test]
    fn test_dimension_checked() {
        let dir = TempDir::new().unwrap();
        let table = VectorTable::open(dir.path(), "v1", 8).unwrap();
        assert!(matches!(
            table.add(&[1.0, 2.0]),
            Err(VectorError::Dimension { .. })
        ));
    }
}
