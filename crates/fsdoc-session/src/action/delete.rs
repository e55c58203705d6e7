use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fsdoc_store::{SearchOp, StagedDelete, StoreError};
use tracing::{debug, warn};

use super::{
    check_version, parent_of, remap, ActionKind, ActionState, Effects, Env, LocateCx,
    SessionAction,
};
use crate::entry::Entry;
use crate::error::{SessionError, SessionResult};

/// Removal of an entity's file, or of its whole folder when the naming
/// strategy owns one folder per entity.
#[derive(Debug, Default)]
pub(crate) struct Delete {
    state: ActionState,
    file: Option<PathBuf>,
    original: Option<PathBuf>,
    folder: bool,
    staged: Option<StagedDelete>,
}

impl Delete {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionAction for Delete {
    fn kind(&self) -> ActionKind {
        ActionKind::Delete
    }

    fn state(&self) -> ActionState {
        self.state
    }

    fn target(&self) -> Option<&Path> {
        self.original.as_deref()
    }

    fn locate(&mut self, entry: &mut Entry, cx: &mut LocateCx<'_>) -> SessionResult<()> {
        if self.original.is_some() {
            return Ok(());
        }
        let current = entry
            .path
            .as_deref()
            .ok_or_else(|| SessionError::Internal("delete of an entity without a file".into()))?;
        let file = remap(current, cx.moves.as_slice());
        self.folder = entry.descriptor.naming().remove_folder_on_delete();
        let original = if self.folder {
            parent_of(&file)?.to_path_buf()
        } else {
            file.clone()
        };
        self.file = Some(file);
        self.original = Some(original);
        Ok(())
    }

    fn prepare(&mut self, entry: &mut Entry, _env: &Env<'_>) -> SessionResult<()> {
        let (Some(file), Some(original)) = (&self.file, &self.original) else {
            return Err(SessionError::Internal("delete prepared before it was located".into()));
        };
        let desc = Arc::clone(&entry.descriptor);
        let persisted = desc
            .persisted_version(file)?
            .ok_or_else(|| SessionError::stale(file, "entity file no longer exists"))?;
        check_version(file, entry.version, persisted)?;

        let staged = match StagedDelete::stage(original.clone()) {
            Ok(staged) => staged,
            Err(StoreError::PathIo { path, source }) if source.kind() == io::ErrorKind::NotFound => {
                return Err(SessionError::stale(path, "entity file no longer exists"));
            }
            Err(e) => return Err(SessionError::from_staging(e)),
        };

        // A write staged before the rename would publish the file again.
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging_name = desc.naming().staging_file_name_for(&file_name);
        let in_flight = if self.folder {
            staged.staged_path().join(&staging_name)
        } else {
            parent_of(file)?.join(&staging_name)
        };
        self.staged = Some(staged);
        if in_flight.exists() {
            return Err(SessionError::StaleObjectFile(in_flight));
        }

        debug!(entity_type = %desc.entity_type(), path = %original.display(), folder = self.folder, "delete prepared");
        self.state = ActionState::Prepared;
        Ok(())
    }

    fn commit(
        &mut self,
        entry: &mut Entry,
        env: &Env<'_>,
        effects: &mut Effects,
    ) -> SessionResult<()> {
        let Some(staged) = &self.staged else {
            return Err(SessionError::Internal("delete committed before it was prepared".into()));
        };
        staged.purge()?;
        self.state = ActionState::Committed;

        if self.folder {
            let folder = staged.original_path().to_path_buf();
            for element in env.index.remove_under(&folder) {
                effects.search.push(SearchOp::Remove(element.id));
            }
            effects.purged.push(folder);
        }
        if let Some(id) = entry.id {
            if env.index.remove(&id).is_some() || !self.folder {
                effects.search.push(SearchOp::Remove(id));
            }
            debug!(id = %id.short_hex(), "delete committed");
        }
        Ok(())
    }

    fn rollback(&mut self, _entry: &mut Entry, _env: &Env<'_>) -> SessionResult<()> {
        let result = match self.staged.take() {
            Some(staged) => staged.restore().map_err(|e| {
                warn!(path = %staged.original_path().display(), error = %e, "failed to restore staged deletion");
                SessionError::from(e)
            }),
            None => Ok(()),
        };
        self.file = None;
        self.original = None;
        self.state = ActionState::RolledBack;
        result
    }
}
