//! Error types for the chain store.

use thiserror::Error;

use glint_core::mmr::MmrError;

/// Chain-store errors. Every failure is surfaced synchronously to the
/// caller; the store performs no retries.
#[derive(Error, Debug)]
pub enum ChainDbError {
    /// Failure from the embedded store.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The database file was created by an incompatible schema version.
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch {
        /// Version this build writes and reads.
        expected: u64,
        /// Version recorded in the file.
        found: u64,
    },

    /// The referenced state row is not present.
    #[error("state not found")]
    NotFound,

    /// Delete refused: the state still has children.
    #[error("state still has children")]
    DeleteHasChildren,

    /// A cross-table invariant would be broken.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),

    /// A fixed-width blob column holds the wrong number of bytes.
    #[error("blob size mismatch: expected {expected}, actual {actual}")]
    BlobSize {
        /// Width the schema requires.
        expected: usize,
        /// Width found in the store.
        actual: usize,
    },
}

/// Result alias for chain-store operations.
pub type ChainDbResult<T> = Result<T, ChainDbError>;

impl From<MmrError<ChainDbError>> for ChainDbError {
    fn from(err: MmrError<ChainDbError>) -> Self {
        match err {
            MmrError::Source(e) => e,
            MmrError::PayloadSize { expected, actual, .. } => {
                ChainDbError::BlobSize { expected, actual }
            }
        }
    }
}
