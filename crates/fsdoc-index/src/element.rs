//! Index element types.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fsdoc_types::{ContentDigest, EntityId, EntityType};
use serde::Serialize;

/// The global index's record of one entity file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexElement {
    /// Engine-assigned id (frozen at first insert).
    pub id: EntityId,
    /// Natural id, if the entity has one.
    pub natural_id: Option<String>,
    /// Absolute path of the entity file.
    pub path: PathBuf,
    /// Registered type that owns the file.
    pub entity_type: EntityType,
    /// BLAKE3 digest of the file content.
    pub digest: ContentDigest,
    /// Last modification time of the file.
    pub modified: SystemTime,
}

impl IndexElement {
    /// Create an element from already known values.
    pub fn new(
        id: EntityId,
        entity_type: EntityType,
        natural_id: Option<String>,
        path: impl Into<PathBuf>,
        digest: ContentDigest,
        modified: SystemTime,
    ) -> Self {
        Self {
            id,
            natural_id,
            path: path.into(),
            entity_type,
            digest,
            modified,
        }
    }

    /// Create an element for a file that was just written, reading its
    /// modification time from the file system.
    pub fn stat(
        id: EntityId,
        entity_type: EntityType,
        natural_id: Option<String>,
        path: impl Into<PathBuf>,
        digest: ContentDigest,
    ) -> io::Result<Self> {
        let path = path.into();
        let modified = fs::metadata(&path)?.modified()?;
        Ok(Self::new(id, entity_type, natural_id, path, digest, modified))
    }

    /// Lookup key for the natural-id map.
    pub fn natural_key(&self) -> Option<NaturalKey> {
        self.natural_id
            .as_ref()
            .map(|nid| NaturalKey::new(self.entity_type, nid.clone()))
    }

    /// Returns `true` if the file lives below `folder`.
    pub fn is_under(&self, folder: &Path) -> bool {
        self.path.starts_with(folder)
    }
}

/// Natural ids are unique per entity type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub entity_type: EntityType,
    pub natural_id: String,
}

impl NaturalKey {
    pub fn new(entity_type: EntityType, natural_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            natural_id: natural_id.into(),
        }
    }
}
