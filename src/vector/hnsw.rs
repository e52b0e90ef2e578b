//! HNSW backend for the vector table.
//!
//! The backing ANN algorithm is a pluggable parameter of the vector table;
//! this is the default: HNSW over flat vectors with an L2 metric and
//! id-mapped labels (chunk ids cast to the library's `usize` labels).
//!
//! ## Security
//!
//! The underlying hnsw_rs library uses bincode for serialization, which is
//! unmaintained (RUSTSEC-2025-0141). To mitigate deserialization risks, we
//! compute and verify blake3 checksums on save/load.
//!
//! ## Memory management
//!
//! When loading an index from disk, hnsw_rs returns `Hnsw<'a>` borrowing
//! from `HnswIo`. `LoadedHnsw` manages this self-referential pattern:
//! - HnswIo is heap-allocated, we hold a raw pointer
//! - Hnsw's lifetime is transmuted to 'static (sound because HnswIo
//!   outlives it)
//! - a custom Drop frees HnswIo only after the Hnsw is gone
//!
//! **If upgrading hnsw_rs**: breaking changes to `HnswIo::load_hnsw()` or
//! `Hnsw`'s borrowing could make the transmute unsound; re-verify.

use std::mem::ManuallyDrop;
use std::path::Path;

use hnsw_rs::anndists::dist::distances::DistL2;
use hnsw_rs::api::AnnT;
use hnsw_rs::hnsw::Hnsw;
use hnsw_rs::hnswio::HnswIo;

use super::VectorError;

// HNSW tuning parameters, sized for repository-scale corpora (1k-100k
// chunks per embedding).
const MAX_NB_CONNECTION: usize = 24; // M parameter
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;
const EF_SEARCH: usize = 100;

/// Element-count hint for incrementally grown indexes.
const GROWTH_HINT: usize = 10_000;

/// Dump file extensions the library produces for a basename.
const DUMP_EXTENSIONS: &[&str] = &["hnsw.graph", "hnsw.data"];

/// In-memory ANN index interface: add-with-id, k-NN query, and dump-to-dir.
/// Id-stable deletion is deliberately absent — the vector table tombstones
/// in its sidecar and rebuilds a fresh index at compaction.
pub trait AnnIndex: Send + Sync {
    /// Insert vectors under the given external ids.
    fn add_with_ids(&mut self, vectors: &[Vec<f32>], ids: &[i64]);

    /// Nearest neighbors of `query`: `(id, distance)` pairs, ascending
    /// distance. May return fewer than `k`.
    fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)>;

    fn len(&self) -> usize;

    /// Serialize to `dir` under `basename` (library-native format).
    fn save(&self, dir: &Path, basename: &str) -> Result<(), VectorError>;
}

/// Self-referential wrapper for an index loaded from disk. See module docs.
struct LoadedHnsw {
    /// Raw pointer to HnswIo; this struct owns the allocation.
    io_ptr: *mut HnswIo,
    /// Hnsw borrowing from io_ptr (lifetime transmuted, manually dropped).
    hnsw: ManuallyDrop<Hnsw<'static, f32, DistL2>>,
}

impl Drop for LoadedHnsw {
    fn drop(&mut self) {
        // SAFETY: drop order is controlled — the Hnsw is dropped while the
        // HnswIo data it borrows is still alive, then the HnswIo is freed.
        unsafe {
            ManuallyDrop::drop(&mut self.hnsw);
            drop(Box::from_raw(self.io_ptr));
        }
    }
}

// SAFETY: io_ptr points at buffers only this struct touches, the Hnsw
// data structures are thread-safe, and all mutation happens under the
// vector table's exclusive lock.
unsafe impl Send for LoadedHnsw {}
unsafe impl Sync for LoadedHnsw {}

enum HnswInner {
    /// Built in memory; owns its data with a real 'static lifetime.
    Owned(Hnsw<'static, f32, DistL2>),
    /// Loaded from disk; self-referential, manually managed.
    Loaded(LoadedHnsw),
}

/// Default [`AnnIndex`]: hnsw_rs with L2 distance.
pub struct HnswBackend {
    inner: HnswInner,
    dimension: usize,
    count: usize,
}

impl HnswBackend {
    /// Fresh empty index.
    pub fn new(dimension: usize) -> Self {
        let hnsw = Hnsw::new(
            MAX_NB_CONNECTION,
            GROWTH_HINT,
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistL2 {},
        );
        Self {
            inner: HnswInner::Owned(hnsw),
            dimension,
            count: 0,
        }
    }

    /// Load a previously dumped index, verifying checksums first.
    pub fn load(dir: &Path, basename: &str, dimension: usize) -> Result<Self, VectorError> {
        for ext in DUMP_EXTENSIONS {
            let path = dir.join(format!("{}.{}", basename, ext));
            if !path.exists() {
                return Err(VectorError::Internal(format!(
                    "ANN dump file missing: {}",
                    path.display()
                )));
            }
        }
        verify_checksums(dir, basename)?;

        let hnsw_io = Box::new(HnswIo::new(dir, basename));
        let io_ptr = Box::into_raw(hnsw_io);

        // SAFETY: io_ptr was just created from Box::into_raw above.
        let hnsw: Hnsw<'_, f32, DistL2> = match unsafe { &mut *io_ptr }.load_hnsw() {
            Ok(h) => h,
            Err(e) => {
                // SAFETY: reclaim the allocation on the error path.
                unsafe {
                    drop(Box::from_raw(io_ptr));
                }
                return Err(VectorError::Internal(format!("failed to load ANN index: {}", e)));
            }
        };

        // SAFETY: io_ptr lives as long as LoadedHnsw, whose Drop guarantees
        // the Hnsw is dropped first; the Hnsw only reads HnswIo-owned data.
        let hnsw: Hnsw<'static, f32, DistL2> = unsafe { std::mem::transmute(hnsw) };
        let count = hnsw.get_nb_point();

        Ok(Self {
            inner: HnswInner::Loaded(LoadedHnsw {
                io_ptr,
                hnsw: ManuallyDrop::new(hnsw),
            }),
            dimension,
            count,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn hnsw(&self) -> &Hnsw<'static, f32, DistL2> {
        match &self.inner {
            HnswInner::Owned(h) => h,
            HnswInner::Loaded(l) => &l.hnsw,
        }
    }

    fn hnsw_mut(&mut self) -> &mut Hnsw<'static, f32, DistL2> {
        match &mut self.inner {
            HnswInner::Owned(h) => h,
            HnswInner::Loaded(l) => &mut l.hnsw,
        }
    }
}

impl AnnIndex for HnswBackend {
    fn add_with_ids(&mut self, vectors: &[Vec<f32>], ids: &[i64]) {
        debug_assert_eq!(vectors.len(), ids.len());
        let data: Vec<(&Vec<f32>, usize)> = vectors
            .iter()
            .zip(ids)
            .map(|(v, &id)| (v, id as usize))
            .collect();
        self.hnsw_mut().parallel_insert_data(&data);
        self.count += vectors.len();
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        if self.count == 0 || k == 0 {
            return Vec::new();
        }
        self.hnsw()
            .search_neighbours(query, k, EF_SEARCH)
            .into_iter()
            .map(|n| (n.d_id as i64, n.distance))
            .collect()
    }

    fn len(&self) -> usize {
        self.count
    }

    fn save(&self, dir: &Path, basename: &str) -> Result<(), VectorError> {
        std::fs::create_dir_all(dir)?;
        self.hnsw()
            .file_dump(dir, basename)
            .map_err(|e| VectorError::Internal(format!("failed to dump ANN index: {}", e)))?;
        Ok(())
    }
}

/// Write `<basename>.hnsw.checksum` covering the dump files.
pub(crate) fn write_checksums(dir: &Path, basename: &str) -> Result<(), VectorError> {
    let mut lines = Vec::new();
    for ext in DUMP_EXTENSIONS {
        let path = dir.join(format!("{}.{}", basename, ext));
        if path.exists() {
            let data = std::fs::read(&path)?;
            lines.push(format!("{}:{}", ext, blake3::hash(&data).to_hex()));
        }
    }
    std::fs::write(
        dir.join(format!("{}.hnsw.checksum", basename)),
        lines.join("\n"),
    )?;
    Ok(())
}

/// Verify blake3 checksums for a dumped index. A missing checksum file is
/// tolerated with a warning; a mismatch is an error (the dump is treated
/// as corrupt and the caller rebuilds from the sidecar).
pub(crate) fn verify_checksums(dir: &Path, basename: &str) -> Result<(), VectorError> {
    let checksum_path = dir.join(format!("{}.hnsw.checksum", basename));
    if !checksum_path.exists() {
        tracing::warn!(
            basename = basename,
            "no checksum file for ANN index, skipping verification"
        );
        return Ok(());
    }
    let content = std::fs::read_to_string(&checksum_path)?;
    for line in content.lines() {
        if let Some((ext, expected)) = line.split_once(':') {
            if !DUMP_EXTENSIONS.contains(&ext) {
                tracing::warn!(ext = ext, "ignoring unknown extension in checksum file");
                continue;
            }
            let path = dir.join(format!("{}.{}", basename, ext));
            if path.exists() {
                let data = std::fs::read(&path)?;
                let actual = blake3::hash(&data).to_hex().to_string();
                if actual != expected {
                    return Err(VectorError::Internal(format!(
                        "checksum mismatch for {}: expected {}, got {}",
                        path.display(),
                        expected,
                        actual
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Remove the dump files (and checksum) for a basename, ignoring absence.
pub(crate) fn remove_dump_files(dir: &Path, basename: &str) {
    for ext in DUMP_EXTENSIONS {
        let _ = std::fs::remove_file(dir.join(format!("{}.{}", basename, ext)));
    }
    let _ = std::fs::remove_file(dir.join(format!("{}.hnsw.checksum", basename)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vec_for(seed: u64, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|i| ((seed as f32 * 0.37) + i as f32 * 0.011).sin())
            .collect()
    }

    #[test]
    fn test_add_and_search_returns_self_first() {
        let mut index = HnswBackend::new(16);
        let vectors: Vec<Vec<f32>> = (0..20).map(|i| vec_for(i, 16)).collect();
        let ids: Vec<i64> = (100..120).collect();
        index.add_with_ids(&vectors, &ids);
        assert_eq!(index.len(), 20);

        let results = index.search(&vec_for(5, 16), 3);
        assert_eq!(results[0].0, 105);
        assert!(results[0].1 < results[1].1 + 1e-6);
    }

    #[test]
    fn test_empty_index_search() {
        let index = HnswBackend::new(8);
        assert!(index.search(&vec_for(1, 8), 5).is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut index = HnswBackend::new(8);
        let vectors: Vec<Vec<f32>> = (0..5).map(|i| vec_for(i, 8)).collect();
        let ids: Vec<i64> = (1..=5).collect();
        index.add_with_ids(&vectors, &ids);

        index.save(dir.path(), "probe").unwrap();
        write_checksums(dir.path(), "probe").unwrap();

        let loaded = HnswBackend::load(dir.path(), "probe", 8).unwrap();
        assert_eq!(loaded.len(), 5);
        let results = loaded.search(&vec_for(2, 8), 1);
        assert_eq!(results[0].0, 3); // seed 2 inserted under id 3
    }

    #[test]
    fn test_corrupt_dump_detected() {
        let dir = TempDir::new().unwrap();
        let mut index = HnswBackend::new(8);
        index.add_with_ids(&[vec_for(1, 8)], &[1]);
        index.save(dir.path(), "probe").unwrap();
        write_checksums(dir.path(), "probe").unwrap();

        std::fs::write(dir.path().join("probe.hnsw.data"), b"garbage").unwrap();
        assert!(HnswBackend::load(dir.path(), "probe", 8).is_err());
    }

    #[test]
    fn test_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HnswBackend>();
    }
}
