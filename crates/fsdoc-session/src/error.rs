//! Error types for the session crate.

use std::path::PathBuf;

use fsdoc_store::StoreError;
use fsdoc_types::{EntityId, EntityType};

/// Errors raised by a session and its actions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The persisted version moved past the one this session tracked, or the
    /// file it expected to find is gone.
    #[error("stale object state at {path}: {detail}")]
    StaleObjectState { path: PathBuf, detail: String },

    /// A staging file or staged deletion for the same target already
    /// exists: another unit of work is mid-flush.
    #[error("stale flush file: {0}")]
    StaleObjectFile(PathBuf),

    /// The entity type has no descriptor in the registry.
    #[error("entity type not registered: {0}")]
    EntityNotRegistered(EntityType),

    /// Several failures collected while rolling back.
    #[error("{} failure(s) during rollback", .0.len())]
    Aggregate(Vec<SessionError>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A previous prepare or commit failed; only `rollback` is accepted.
    #[error("session is rollback-only")]
    RollbackOnly,

    /// An id or handle resolved to an entity of another type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: EntityType,
        found: EntityType,
    },

    /// The persister failed to encode or decode an entity.
    #[error("persister error: {0}")]
    Persist(String),

    /// A lazy relation outlived the session it was bound to.
    #[error("owning session is closed")]
    SessionClosed,

    /// A session method was re-entered while another one was running.
    #[error("session re-entered while busy")]
    Reentrant,

    /// The entity's cell was mutably borrowed while the session needed it.
    #[error("entity of type {0} is already borrowed")]
    EntityBorrowed(EntityType),

    #[error("entity not found: {0}")]
    NotFound(EntityId),

    /// Another object instance already represents this id in the session.
    #[error("another instance of entity {0} is attached to this session")]
    AlreadyAttached(EntityId),

    /// The entity was never persisted and is unknown to the session.
    #[error("entity of type {0} is not attached to this session")]
    Detached(EntityType),

    /// A session invariant did not hold; indicates a bug in the engine.
    #[error("internal session error: {0}")]
    Internal(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("index error: {0}")]
    Index(#[from] fsdoc_index::IndexError),
}

impl SessionError {
    /// Stale-state and stale-flush-file conflicts are expected under
    /// contention; callers retry the unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleObjectState { .. } | Self::StaleObjectFile(_))
    }

    pub(crate) fn stale(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::StaleObjectState {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Map staging collisions to [`SessionError::StaleObjectFile`].
    pub(crate) fn from_staging(err: StoreError) -> Self {
        match err {
            StoreError::StagingFileExists(path) => Self::StaleObjectFile(path),
            other => Self::Store(other),
        }
    }
}

/// Convenience alias for session results.
pub type SessionResult<T> = Result<T, SessionError>;
