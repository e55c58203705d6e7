//! The repository root and its enumeration.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};
use crate::search::{NoopSearchIndex, SearchIndex};
use crate::staging::DELETE_SUFFIX;

/// Default name of the reserved search-index directory below the root.
pub const DEFAULT_INDEX_DIR: &str = ".index";

/// A directory tree holding one file per persisted entity.
///
/// The repository owns the on-disk tree and the search index's storage
/// handle. It is `Send + Sync` and meant to be shared through an `Arc` by
/// every session of the process.
pub struct Repository {
    root: PathBuf,
    index_dir: PathBuf,
    search: Arc<dyn SearchIndex>,
    closed: AtomicBool,
}

impl Repository {
    /// Open (or create) a repository at `root` without a search index.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with(root, DEFAULT_INDEX_DIR, |_| {
            Ok(Arc::new(NoopSearchIndex) as Arc<dyn SearchIndex>)
        })
    }

    /// Open (or create) a repository, creating the reserved `index_dir_name`
    /// directory and handing it to `search_factory` to open the search index.
    pub fn open_with<F>(
        root: impl AsRef<Path>,
        index_dir_name: &str,
        search_factory: F,
    ) -> StoreResult<Self>
    where
        F: FnOnce(&Path) -> StoreResult<Arc<dyn SearchIndex>>,
    {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|e| StoreError::at(root, e))?;
        let root = root.canonicalize().map_err(|e| StoreError::at(root, e))?;

        let index_dir = root.join(index_dir_name);
        fs::create_dir_all(&index_dir).map_err(|e| StoreError::at(&index_dir, e))?;

        let search = search_factory(&index_dir)?;
        info!(root = %root.display(), "repository opened");

        Ok(Self {
            root,
            index_dir,
            search,
            closed: AtomicBool::new(false),
        })
    }

    /// Canonical absolute path of the repository root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory reserved for the search index's storage.
    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// The search index kept in sync with this repository.
    pub fn search(&self) -> &Arc<dyn SearchIndex> {
        &self.search
    }

    /// Returns `true` if `path` lives below the repository root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Enumerate every entity file below the root, sorted by path.
    ///
    /// The reserved index directory, hidden entries (staging files start with
    /// a dot) and staged deletions (`*_del`) are skipped. Any walk error is
    /// returned to the caller.
    pub fn files(&self) -> StoreResult<Vec<PathBuf>> {
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_excluded(entry.path()));

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| StoreError::Walk(e.to_string()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files.sort();
        debug!(count = files.len(), "enumerated repository files");
        Ok(files)
    }

    /// The POSIX-style path of `path` relative to the root.
    pub fn relative_posix(&self, path: &Path) -> StoreResult<String> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| StoreError::OutsideRoot(path.to_path_buf()))?;

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(
                    part.to_str()
                        .ok_or_else(|| StoreError::NonUtf8Path(path.to_path_buf()))?,
                ),
                Component::CurDir => {}
                _ => return Err(StoreError::OutsideRoot(path.to_path_buf())),
            }
        }
        Ok(parts.join("/"))
    }

    /// Release the search index. Idempotent.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.search.close()?;
        info!(root = %self.root.display(), "repository closed");
        Ok(())
    }

    /// Returns `true` once [`Self::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if path == self.index_dir {
            return true;
        }
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.starts_with('.') || name.ends_with(DELETE_SUFFIX),
            None => false,
        }
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("root", &self.root)
            .field("index_dir", &self.index_dir)
            .field("closed", &self.is_closed())
            .finish()
    }
}
