//! Error types for nano-eagle.

use thiserror::Error;

/// Result type alias for nano-eagle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-eagle.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (unknown drafting method, bad token count, ...).
    /// Fatal to session startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The layer registry produced an inconsistent draft-only layer set.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Two inputs of a call disagree on a dimension.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Any other call-boundary contract violation.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The block table has no physical block for the next decode position.
    #[error("block table for request {request} has no slot for position {position}")]
    CacheExhausted { request: usize, position: usize },

    /// Model loading failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::ShapeMismatch`].
    pub(crate) fn shape(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            what,
            expected,
            actual,
        }
    }
}
