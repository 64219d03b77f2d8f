//! Symmetric zero-diagonal matrix stored as its strict upper triangle.

use std::path::Path;

use batchwise_core::atomic::write_atomic;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MatrixError, Result};

const BYTES_PER_VALUE: usize = std::mem::size_of::<f32>();

/// Pairwise scores for `n` items in `n * (n - 1) / 2` floats.
///
/// `get(i, j) == get(j, i)` and `get(i, i) == 0` always hold. Fill it once
/// (`set` or [`TriangularMatrix::from_pairs`]), then share it read-only,
/// usually behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangularMatrix {
    n: usize,
    values: Vec<f32>,
}

/// On-disk layout: `{n, values}`.
#[derive(Serialize, Deserialize)]
struct MatrixFile {
    n: u64,
    values: Vec<f32>,
}

/// Triangular vs. dense footprint. Observability only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryReport {
    pub triangular_bytes: usize,
    pub dense_bytes: usize,
    pub saved_bytes: usize,
    pub saved_percent: f64,
}

impl MemoryReport {
    pub fn triangular_mb(&self) -> f64 {
        self.triangular_bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn dense_mb(&self) -> f64 {
        self.dense_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Values needed to store `n` items.
pub fn storage_len(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

impl TriangularMatrix {
    /// Zero-filled matrix for `n` items.
    pub fn new(n: usize) -> Self {
        debug!(n, values = storage_len(n), "Created triangular matrix");
        Self {
            n,
            values: vec![0.0; storage_len(n)],
        }
    }

    /// Like [`new`](Self::new) but accepts a signed size and rejects `n < 0`.
    pub fn try_new(n: i64) -> Result<Self> {
        if n < 0 {
            return Err(MatrixError::NegativeSize(n));
        }
        Ok(Self::new(n as usize))
    }

    /// Wrap an existing flat value array, checking its length.
    pub fn from_values(n: usize, values: Vec<f32>) -> Result<Self> {
        let expected = storage_len(n);
        if values.len() != expected {
            return Err(MatrixError::LengthMismatch {
                n,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { n, values })
    }

    /// Fill every pair `i < j` with `score(i, j)`, computing rows in parallel.
    pub fn from_pairs<F>(n: usize, score: F) -> Self
    where
        F: Fn(usize, usize) -> f32 + Sync + Send,
    {
        let values: Vec<f32> = (0..n)
            .into_par_iter()
            .flat_map_iter(|i| ((i + 1)..n).map(move |j| (i, j)))
            .map(|(i, j)| score(i, j))
            .collect();
        debug_assert_eq!(values.len(), storage_len(n));
        Self { n, values }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    fn check_range(&self, i: usize, j: usize) -> Result<()> {
        if i >= self.n || j >= self.n {
            return Err(MatrixError::OutOfRange { i, j, n: self.n });
        }
        Ok(())
    }

    /// Linear position of pair `(i, j)`, `i != j`, in either order:
    /// `i*n - i*(i+1)/2 + j - i - 1` for `i < j`.
    pub fn index(&self, i: usize, j: usize) -> Result<usize> {
        self.check_range(i, j)?;
        if i == j {
            return Err(MatrixError::Diagonal(i));
        }
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        Ok(i * self.n - i * (i + 1) / 2 + j - i - 1)
    }

    pub fn get(&self, i: usize, j: usize) -> Result<f32> {
        self.check_range(i, j)?;
        if i == j {
            return Ok(0.0);
        }
        let idx = self.index(i, j)?;
        Ok(self.values[idx])
    }

    /// Store a score for the pair. Writing the diagonal is accepted and ignored.
    pub fn set(&mut self, i: usize, j: usize, value: f32) -> Result<()> {
        self.check_range(i, j)?;
        if i == j {
            return Ok(());
        }
        let idx = self.index(i, j)?;
        self.values[idx] = value;
        Ok(())
    }

    /// Full `n x n` copy. Expensive: only for consumers that need 2-D access.
    pub fn to_dense(&self) -> Vec<Vec<f32>> {
        let mut dense = vec![vec![0.0f32; self.n]; self.n];
        let mut k = 0;
        for i in 0..self.n {
            for j in (i + 1)..self.n {
                let v = self.values[k];
                dense[i][j] = v;
                dense[j][i] = v;
                k += 1;
            }
        }
        dense
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let file = MatrixFile {
            n: self.n as u64,
            values: self.values.clone(),
        };
        Ok(rmp_serde::to_vec_named(&file)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let file: MatrixFile = rmp_serde::from_slice(bytes)?;
        Self::from_values(file.n as usize, file.values)
    }

    /// Write to `path` atomically.
    pub fn persist(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes()?)?;
        debug!(path = %path.display(), n = self.n, "Saved matrix");
        Ok(())
    }

    pub fn restore(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let matrix = Self::from_bytes(&bytes)?;
        debug!(path = %path.display(), n = matrix.n, "Loaded matrix");
        Ok(matrix)
    }

    pub fn memory_report(&self) -> MemoryReport {
        let triangular_bytes = self.values.len() * BYTES_PER_VALUE;
        let dense_bytes = self.n * self.n * BYTES_PER_VALUE;
        let saved_bytes = dense_bytes - triangular_bytes;
        let saved_percent = if dense_bytes == 0 {
            0.0
        } else {
            saved_bytes as f64 / dense_bytes as f64 * 100.0
        };
        MemoryReport {
            triangular_bytes,
            dense_bytes,
            saved_bytes,
            saved_percent,
        }
    }
}
