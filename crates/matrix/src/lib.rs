//! Pairwise similarity matrices for downstream analysis: triangular storage,
//! parallel fill, and a key-addressed cache with incremental extension.

pub mod cache;
pub mod error;
pub mod triangular;

pub use cache::{cache_key_for, extend_matrix, CacheEntry, MatrixCache};
pub use error::MatrixError;
pub use triangular::{storage_len, MemoryReport, TriangularMatrix};
