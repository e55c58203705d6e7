//! Where an entity's file lives.
//!
//! A [`NamingStrategy`] maps an entity type and its natural id to a file
//! name and a folder. The folder is computed below a *base*: the repository
//! root for top-level entities, or the owner's child folder for entities
//! reached through a child relation.

use std::path::{Path, PathBuf};

use fsdoc_types::EntityType;

use crate::staging::{DELETE_SUFFIX, STAGING_SUFFIX};

/// Naming contract consumed by the write protocol.
///
/// Implementations are pure: they compute paths but never touch the file
/// system. The session creates folders when it stages a write.
pub trait NamingStrategy: Send + Sync {
    /// Folder that holds the entity file named `file_name`.
    fn folder_for(&self, base: &Path, entity_type: EntityType, file_name: &str) -> PathBuf;

    /// File name for an entity. With no natural id a fresh time-ordered
    /// unique name is generated, so callers must only ask once per entity.
    fn file_name_for(&self, natural_id: Option<&str>, extension: &str) -> String {
        let stem = match natural_id {
            Some(nid) => sanitize_file_name(nid),
            None => uuid::Uuid::now_v7().simple().to_string(),
        };
        format!("{stem}.{extension}")
    }

    /// Hidden staging file name used while a write is in flight.
    fn staging_file_name_for(&self, file_name: &str) -> String {
        format!(".{file_name}{STAGING_SUFFIX}")
    }

    /// Whether deleting an entity removes its whole folder (and with it
    /// every child stored below).
    fn remove_folder_on_delete(&self) -> bool {
        false
    }

    /// Folder below which child entities of an entity stored at `file` live.
    fn child_base(&self, file: &Path) -> PathBuf {
        file.parent().map(Path::to_path_buf).unwrap_or_default()
    }

    /// Folder an entity currently stored in `folder` moves to when its file
    /// is renamed to `file_name`. Strategies that keep one folder per entity
    /// rename the folder along with the file.
    fn folder_after_rename(&self, folder: &Path, _file_name: &str) -> PathBuf {
        folder.to_path_buf()
    }
}

/// One folder per entity type: `<base>/<Type>/<natural-id>.<ext>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TypeFolderNaming;

impl NamingStrategy for TypeFolderNaming {
    fn folder_for(&self, base: &Path, entity_type: EntityType, _file_name: &str) -> PathBuf {
        base.join(entity_type.name())
    }
}

/// One folder per entity: `<base>/<Type>/<natural-id>/<natural-id>.<ext>`.
///
/// Children are stored inside the entity's own folder and the folder is
/// removed as a whole when the entity is deleted.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntityFolderNaming;

impl NamingStrategy for EntityFolderNaming {
    fn folder_for(&self, base: &Path, entity_type: EntityType, file_name: &str) -> PathBuf {
        base.join(entity_type.name()).join(stem_of(file_name))
    }

    fn remove_folder_on_delete(&self) -> bool {
        true
    }

    fn folder_after_rename(&self, folder: &Path, file_name: &str) -> PathBuf {
        folder.with_file_name(stem_of(file_name))
    }
}

fn stem_of(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}

/// Make a natural id safe to use as a file name.
///
/// Path separators, characters reserved on common file systems and control
/// characters become `_`. A leading dot is replaced as well, since hidden
/// names are reserved for staging files, and a trailing delete suffix gets
/// an extra `_` so the name never looks like a staged deletion.
pub fn sanitize_file_name(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if out.starts_with('.') {
        out.replace_range(..1, "_");
    }
    if out.ends_with(DELETE_SUFFIX) {
        out.push('_');
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
