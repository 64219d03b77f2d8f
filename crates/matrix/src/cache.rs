use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use batchwise_core::atomic::{retry_io, write_atomic};
use batchwise_core::config::MatrixConfig;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{MatrixError, Result};
use crate::triangular::TriangularMatrix;

const FILE_PREFIX: &str = "matrix_";
const FILE_EXT: &str = "msgpack";
const MAX_KEY_LEN: usize = 100;
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A cached matrix with its key and creation time.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub matrix: Arc<TriangularMatrix>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    key: String,
    created_at: DateTime<Utc>,
    n: u64,
    values: Vec<f32>,
}

/// Stable cache key for an ordered item set: hex SHA-256 of the ids.
pub fn cache_key_for<S: AsRef<str>>(ids: &[S]) -> String {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Keys that are safe as a file name stem are used directly; anything else is hashed.
fn file_stem(key: &str) -> String {
    let safe = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !key.starts_with('.');
    if safe {
        key.to_string()
    } else {
        hex::encode(Sha256::digest(key.as_bytes()))
    }
}

/// Key-addressed store of computed matrices.
///
/// Recent matrices stay in an in-memory LRU; every entry is also written to
/// `dir` (when set) so later runs can reuse it. Unreadable files count as misses.
pub struct MatrixCache {
    dir: Option<PathBuf>,
    memory: Mutex<LruCache<String, CacheEntry>>,
}

impl MatrixCache {
    pub fn new(dir: impl Into<PathBuf>, memory_entries: usize) -> Self {
        Self {
            dir: Some(dir.into()),
            memory: Mutex::new(LruCache::new(capacity(memory_entries))),
        }
    }

    /// A cache that never stores anything: `compute_or_load` always computes.
    pub fn disabled() -> Self {
        Self {
            dir: None,
            memory: Mutex::new(LruCache::new(NonZeroUsize::MIN)),
        }
    }

    pub fn from_config(config: &MatrixConfig) -> Self {
        if config.cache_enabled {
            Self::new(&config.cache_dir, config.memory_entries)
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn path_for(&self, key: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("{FILE_PREFIX}{}.{FILE_EXT}", file_stem(key))))
    }

    /// Return the matrix cached under `key`, or compute every pair of `items`
    /// with `score` and cache it.
    pub fn compute_or_load<T, F>(&self, items: &[T], key: &str, score: F) -> Arc<TriangularMatrix>
    where
        T: Sync,
        F: Fn(&T, &T) -> f32 + Sync + Send,
    {
        if let Some(entry) = self.get(key) {
            debug!(key, n = entry.matrix.n(), "Matrix cache hit");
            return entry.matrix;
        }

        info!(key, n = items.len(), "Computing similarity matrix");
        let matrix = TriangularMatrix::from_pairs(items.len(), |i, j| score(&items[i], &items[j]));
        self.insert(key, matrix).matrix
    }

    /// Look up `key` in memory, then on disk.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        if !self.is_enabled() {
            return None;
        }
        if let Some(entry) = self.lock().get(key) {
            return Some(entry.clone());
        }

        let path = self.path_for(key)?;
        if !path.exists() {
            return None;
        }
        match read_entry(&path) {
            Ok(entry) if entry.key == key => {
                self.lock().put(key.to_string(), entry.clone());
                Some(entry)
            }
            Ok(entry) => {
                warn!(key, stored = %entry.key, path = %path.display(), "Cache file belongs to another key, ignoring");
                None
            }
            Err(e) => {
                warn!(key, path = %path.display(), error = %e, "Unreadable cache entry, recomputing");
                None
            }
        }
    }

    /// Store `matrix` under `key`. A failed disk write is logged; the entry is
    /// still returned and kept in memory.
    pub fn insert(&self, key: &str, matrix: TriangularMatrix) -> CacheEntry {
        let entry = CacheEntry {
            key: key.to_string(),
            matrix: Arc::new(matrix),
            created_at: Utc::now(),
        };
        if !self.is_enabled() {
            return entry;
        }

        if let Some(path) = self.path_for(key) {
            let persisted = retry_io("matrix cache write", PERSIST_ATTEMPTS, PERSIST_RETRY_DELAY, || {
                write_entry(&path, &entry)
            });
            match persisted {
                Ok(()) => debug!(key, path = %path.display(), "Cached matrix"),
                Err(e) => warn!(key, path = %path.display(), error = %e, "Failed to persist matrix"),
            }
        }
        self.lock().put(key.to_string(), entry.clone());
        entry
    }

    /// Delete every cached file and drop in-memory entries. Returns files removed.
    pub fn clear(&self) -> Result<usize> {
        self.clear_memory();
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if is_cache_file(&path) {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        info!(dir = %dir.display(), removed, "Cleared matrix cache");
        Ok(removed)
    }

    /// Drop in-memory entries only. Returns how many were dropped.
    pub fn clear_memory(&self) -> usize {
        let mut memory = self.lock();
        let n = memory.len();
        memory.clear();
        n
    }

    pub fn memory_len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, CacheEntry>> {
        // A panic while holding the lock leaves the LRU structurally intact.
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn capacity(entries: usize) -> NonZeroUsize {
    NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN)
}

fn is_cache_file(path: &Path) -> bool {
    let name_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(FILE_PREFIX));
    name_ok && path.extension().is_some_and(|e| e == FILE_EXT) && path.is_file()
}

fn write_entry(path: &Path, entry: &CacheEntry) -> Result<()> {
    let file = CacheFile {
        key: entry.key.clone(),
        created_at: entry.created_at,
        n: entry.matrix.n() as u64,
        values: entry.matrix.values().to_vec(),
    };
    let bytes = rmp_serde::to_vec_named(&file)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

fn read_entry(path: &Path) -> Result<CacheEntry> {
    let bytes = std::fs::read(path)?;
    let file: CacheFile = rmp_serde::from_slice(&bytes)?;
    let matrix = TriangularMatrix::from_values(file.n as usize, file.values)?;
    Ok(CacheEntry {
        key: file.key,
        matrix: Arc::new(matrix),
        created_at: file.created_at,
    })
}

// ── Incremental extension ─────────────────────────────────────

/// Grow `existing` by `new_items`, giving a matrix of
/// `existing_count + new_items.len()` items.
///
/// Pairs among the first `existing_count` items are copied unchanged and pairs
/// among the new items are computed with `score`. Pairs between an existing
/// item and a new item are NOT computed and stay 0; callers that need them
/// must compute the full matrix instead.
pub fn extend_matrix<T, F>(
    existing: &TriangularMatrix,
    new_items: &[T],
    existing_count: usize,
    score: F,
) -> Result<TriangularMatrix>
where
    T: Sync,
    F: Fn(&T, &T) -> f32 + Sync + Send,
{
    if existing_count > existing.n() {
        return Err(MatrixError::ExtendOutOfRange {
            existing_count,
            n: existing.n(),
        });
    }

    let n = existing_count + new_items.len();
    let mut extended = TriangularMatrix::new(n);
    for i in 0..existing_count {
        for j in (i + 1)..existing_count {
            extended.set(i, j, existing.get(i, j)?)?;
        }
    }

    let fresh = TriangularMatrix::from_pairs(new_items.len(), |i, j| score(&new_items[i], &new_items[j]));
    for i in 0..new_items.len() {
        for j in (i + 1)..new_items.len() {
            extended.set(existing_count + i, existing_count + j, fresh.get(i, j)?)?;
        }
    }

    if existing_count > 0 && !new_items.is_empty() {
        warn!(
            existing = existing_count,
            added = new_items.len(),
            "Extended matrix leaves existing-vs-new pairs at 0"
        );
    }
    Ok(extended)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abs_diff(a: &f64, b: &f64) -> f32 {
        (a - b).abs() as f32
    }

    #[test]
    fn key_depends_on_order_and_content() {
        let a = cache_key_for(&["x", "y"]);
        assert_eq!(a, cache_key_for(&["x".to_string(), "y".to_string()]));
        assert_ne!(a, cache_key_for(&["y", "x"]));
        assert_ne!(cache_key_for(&["ab", "c"]), cache_key_for(&["a", "bc"]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn unsafe_keys_are_hashed_for_file_names() {
        assert_eq!(file_stem("pockets-v1"), "pockets-v1");
        let stem = file_stem("../../etc/passwd");
        assert_eq!(stem.len(), 64);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn second_lookup_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MatrixCache::new(dir.path(), 4);
        let items = [1.0f64, 4.0, 9.0];
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let score = |a: &f64, b: &f64| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            abs_diff(a, b)
        };

        let first = cache.compute_or_load(&items, "k", score);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        let second = cache.compute_or_load(&items, "k", score);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.get(2, 0).unwrap(), 8.0);
    }

    #[test]
    fn disk_entry_survives_a_new_cache_instance() {
        let dir = tempfile::tempdir().unwrap();
        let items = [0.0f64, 2.0, 5.0, 6.0];
        let original = MatrixCache::new(dir.path(), 2).compute_or_load(&items, "run", abs_diff);

        let reopened = MatrixCache::new(dir.path(), 2);
        let loaded = reopened.compute_or_load(&items, "run", |_: &f64, _: &f64| -> f32 {
            panic!("should load from disk")
        });
        assert_eq!(*loaded, *original);
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MatrixCache::new(dir.path(), 2);
        let path = cache.path_for("bad").unwrap();
        std::fs::write(&path, b"not msgpack").unwrap();

        let m = cache.compute_or_load(&[1.0f64, 3.0], "bad", abs_diff);
        assert_eq!(m.get(0, 1).unwrap(), 2.0);
        // The rewrite replaced the corrupt file with a readable one.
        assert!(read_entry(&path).is_ok());
    }

    #[test]
    fn disabled_cache_always_computes() {
        let cache = MatrixCache::disabled();
        let calls = std::sync::atomic::AtomicUsize::new(0);
        for _ in 0..2 {
            cache.compute_or_load(&[1.0f64, 2.0], "k", |a: &f64, b: &f64| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                abs_diff(a, b)
            });
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(cache.clear().unwrap(), 0);
    }

    #[test]
    fn clear_counts_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MatrixCache::new(dir.path(), 8);
        for key in ["a", "b", "c"] {
            cache.compute_or_load(&[1.0f64, 2.0, 3.0], key, abs_diff);
        }
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        assert_eq!(cache.clear().unwrap(), 3);
        assert_eq!(cache.memory_len(), 0);
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(cache.clear().unwrap(), 0);
    }

    #[test]
    fn clear_memory_keeps_disk_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MatrixCache::new(dir.path(), 8);
        cache.compute_or_load(&[1.0f64, 2.0], "k", abs_diff);
        assert_eq!(cache.clear_memory(), 1);
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn lru_evicts_oldest_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MatrixCache::new(dir.path(), 2);
        for key in ["a", "b", "c"] {
            cache.compute_or_load(&[1.0f64, 2.0], key, abs_diff);
        }
        assert_eq!(cache.memory_len(), 2);
    }

    #[test]
    fn extend_copies_old_pairs_and_scores_new_ones() {
        let old_items = [0.0f64, 10.0, 30.0];
        let new_items = [100.0f64, 101.5];
        let existing = TriangularMatrix::from_pairs(3, |i, j| abs_diff(&old_items[i], &old_items[j]));

        let ext = extend_matrix(&existing, &new_items, 3, abs_diff).unwrap();
        assert_eq!(ext.n(), 5);
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(ext.get(i, j).unwrap(), existing.get(i, j).unwrap());
            }
        }
        assert_eq!(ext.get(3, 4).unwrap(), 1.5);
        // Existing-vs-new pairs are not computed.
        for i in 0..3 {
            for j in 3..5 {
                assert_eq!(ext.get(i, j).unwrap(), 0.0);
            }
        }
    }

    #[test]
    fn extend_rejects_count_beyond_existing() {
        let existing = TriangularMatrix::new(2);
        assert!(matches!(
            extend_matrix(&existing, &[1.0f64], 3, abs_diff),
            Err(MatrixError::ExtendOutOfRange { existing_count: 3, n: 2 })
        ));
    }
}
