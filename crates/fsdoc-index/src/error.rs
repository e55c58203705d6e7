//! Error types for the index crate.

use std::path::PathBuf;

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Enumerating or reading the repository failed.
    #[error("store error: {0}")]
    Store(#[from] fsdoc_store::StoreError),

    /// A claimed file could not be parsed.
    #[error("failed to probe {path}: {reason}")]
    Probe { path: PathBuf, reason: String },

    /// The rebuild worker pool could not be created.
    #[error("worker pool error: {0}")]
    Pool(String),
}

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;
