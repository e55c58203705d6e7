//! Store configuration, loadable from TOML.
//!
//! ```toml
//! root = "/var/lib/notes"
//! index_dir = ".index"
//! rebuild_workers = 4
//! sync_writes = true
//! rebuild_on_open = true
//! ```

use std::path::{Path, PathBuf};

use fsdoc_store::DEFAULT_INDEX_DIR;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{SdkError, SdkResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Repository root; created if missing.
    pub root: PathBuf,
    /// Name of the reserved search-index directory below the root.
    pub index_dir: String,
    /// Threads used by index rebuilds. `None` uses one per core.
    pub rebuild_workers: Option<usize>,
    /// `fsync` staging files before publishing them.
    pub sync_writes: bool,
    /// Rebuild the global index from disk when the store opens.
    pub rebuild_on_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            index_dir: DEFAULT_INDEX_DIR.to_string(),
            rebuild_workers: None,
            sync_writes: true,
            rebuild_on_open: true,
        }
    }
}

impl StoreConfig {
    /// Defaults for a repository at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_index_dir(mut self, dir: impl Into<String>) -> Self {
        self.index_dir = dir.into();
        self
    }

    pub fn with_rebuild_workers(mut self, workers: usize) -> Self {
        self.rebuild_workers = Some(workers);
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_rebuild_on_open(mut self, rebuild: bool) -> Self {
        self.rebuild_on_open = rebuild;
        self
    }

    pub fn from_toml_str(text: &str) -> SdkResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file. A relative `root` is resolved against
    /// the file's directory.
    pub fn load(path: impl AsRef<Path>) -> SdkResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SdkError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if config.root.is_relative() {
            if let Some(dir) = path.parent() {
                config.root = dir.join(&config.root);
            }
        }
        info!(path = %path.display(), root = %config.root.display(), "store configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> SdkResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(SdkError::Config("root must be set".into()));
        }
        let index_dir = Path::new(&self.index_dir);
        if self.index_dir.is_empty()
            || index_dir.components().count() != 1
            || index_dir.is_absolute()
        {
            return Err(SdkError::Config(format!(
                "index_dir must be a single directory name, got {:?}",
                self.index_dir
            )));
        }
        if self.rebuild_workers == Some(0) {
            return Err(SdkError::Config("rebuild_workers must be at least 1".into()));
        }
        Ok(())
    }
}
