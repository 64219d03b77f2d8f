use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("matrix size must not be negative, got {0}")]
    NegativeSize(i64),

    #[error("index ({i}, {j}) out of range for {n} items")]
    OutOfRange { i: usize, j: usize, n: usize },

    #[error("diagonal ({0}, {0}) is not stored")]
    Diagonal(usize),

    #[error("corrupt matrix data: {n} items need {expected} values, found {actual}")]
    LengthMismatch {
        n: usize,
        expected: usize,
        actual: usize,
    },

    #[error("existing count {existing_count} exceeds matrix size {n}")]
    ExtendOutOfRange { existing_count: usize, n: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

pub type Result<T, E = MatrixError> = std::result::Result<T, E>;
