use std::path::PathBuf;

/// Errors from repository and staging operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the underlying file system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error tied to a specific path.
    #[error("I/O error at {path}: {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A staging file (or staged deletion) for this target already exists:
    /// another unit of work is mid-flush.
    #[error("staging file already exists: {0}")]
    StagingFileExists(PathBuf),

    /// The path does not live below the repository root.
    #[error("path {0} is outside the repository root")]
    OutsideRoot(PathBuf),

    /// The path cannot be represented as UTF-8 (needed for id derivation).
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    /// Directory enumeration failed.
    #[error("failed to enumerate repository: {0}")]
    Walk(String),

    /// The search index rejected an operation.
    #[error("search index error: {0}")]
    Search(String),
}

impl StoreError {
    pub(crate) fn at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PathIo {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
