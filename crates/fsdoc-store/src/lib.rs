//! File-system repository for fsdoc.
//!
//! Every entity lives in exactly one file below a repository root. This
//! crate owns that tree: it creates the root and the reserved search-index
//! directory, enumerates entity files for index rebuilds, decides where an
//! entity's file goes (naming strategies), and provides the staging
//! primitives the write protocol is built from.
//!
//! # Design Rules
//!
//! 1. New content is always written to a hidden staging file first.
//! 2. Publication is a single same-directory `rename`; a crash leaves either
//!    the old file or the new one, never a torn file.
//! 3. Deletions are staged as renames to a `_del` sibling so they can be
//!    undone until commit.
//! 4. Staging files and staged deletions are invisible to enumeration.
//! 5. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod naming;
pub mod repository;
pub mod search;
pub mod staging;

pub use error::{StoreError, StoreResult};
pub use naming::{sanitize_file_name, EntityFolderNaming, NamingStrategy, TypeFolderNaming};
pub use repository::{Repository, DEFAULT_INDEX_DIR};
pub use search::{
    InMemorySearchIndex, NoopSearchIndex, SearchDocument, SearchIndex, SearchOp,
};
pub use staging::{remove_if_exists, StagedDelete, StagedWrite, DELETE_SUFFIX, STAGING_SUFFIX};
