//! Error types for pagedcheck

use thiserror::Error;

/// Result type alias using pagedcheck's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for validation operations.
///
/// `Precondition`, `OutputMismatch` and `CacheMismatch` are the designed
/// failure modes of the suite; everything a scenario reports flows through
/// one of them. `Operator` wraps collaborator failures unmodified.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error(
        "attn_out mismatches reference at seq_idx:{seq_idx}, token_idx:{token_idx}, \
         embed_idx:{embed_idx} (got {actual}, expected {expected})"
    )]
    OutputMismatch {
        seq_idx: usize,
        token_idx: usize,
        embed_idx: usize,
        expected: f32,
        actual: f32,
    },

    #[error(
        "{tensor} mismatches {tensor} cache at token_idx:{token_idx}, embed_idx:{embed_idx}, \
         block_idx:{block_idx}, block_offset:{block_offset} (got {actual}, expected {expected})"
    )]
    CacheMismatch {
        tensor: &'static str,
        token_idx: usize,
        embed_idx: usize,
        block_idx: usize,
        block_offset: usize,
        expected: f32,
        actual: f32,
    },

    #[error("Operator error: {0}")]
    Operator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
