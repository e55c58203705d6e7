use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fsdoc_index::IndexElement;
use fsdoc_store::{SearchOp, StagedWrite};
use fsdoc_types::{ContentDigest, Version};
use tracing::{debug, warn};

use super::{
    check_version, collect, parent_of, ActionKind, ActionState, Effects, Env, LocateCx,
    SessionAction,
};
use crate::entry::Entry;
use crate::error::{SessionError, SessionResult};

/// First write of a new entity.
#[derive(Debug, Default)]
pub(crate) struct Insert {
    state: ActionState,
    target: Option<PathBuf>,
    assigned_id: bool,
    /// Version serialized into the staging file.
    written: Option<Version>,
    staged: Option<StagedWrite>,
    digest: Option<ContentDigest>,
    content: Vec<u8>,
}

impl Insert {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionAction for Insert {
    fn kind(&self) -> ActionKind {
        ActionKind::Insert
    }

    fn state(&self) -> ActionState {
        self.state
    }

    fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    fn locate(&mut self, entry: &mut Entry, cx: &mut LocateCx<'_>) -> SessionResult<()> {
        if self.target.is_some() {
            return Ok(());
        }
        let desc = Arc::clone(&entry.descriptor);
        let meta = desc.meta(entry.object())?;
        let naming = desc.naming();
        let file_name = naming.file_name_for(meta.natural_id.as_deref(), desc.extension());
        let target = naming
            .folder_for(&cx.base, desc.entity_type(), &file_name)
            .join(&file_name);

        match meta.id {
            Some(id) => {
                cx.taken.insert(id);
                entry.id = Some(id);
            }
            None => {
                let id = cx.fresh_id(&target)?;
                desc.assign_id(entry.object(), Some(id))?;
                entry.id = Some(id);
                self.assigned_id = true;
            }
        }
        entry.natural_id = meta.natural_id;
        debug!(entity_type = %desc.entity_type(), target = %target.display(), "insert located");
        self.target = Some(target);
        Ok(())
    }

    fn prepare(&mut self, entry: &mut Entry, env: &Env<'_>) -> SessionResult<()> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| SessionError::Internal("insert prepared before it was located".into()))?;
        let desc = Arc::clone(&entry.descriptor);

        let next = entry.version.next();
        desc.assign_version(entry.object(), next)?;
        self.written = Some(next);
        let bytes = desc.serialize(entry.object())?;

        let folder = parent_of(&target)?;
        fs::create_dir_all(folder)?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = folder.join(desc.naming().staging_file_name_for(&file_name));
        let write = StagedWrite::create(staging, target.clone(), &bytes, env.sync_writes)
            .map_err(SessionError::from_staging)?;
        let write = self.staged.insert(write);

        // Checked while holding the staging file: a writer that published
        // before it was created is seen here, a later one cannot start.
        if let Some(persisted) = desc.persisted_version(&target)? {
            check_version(&target, entry.version, persisted)?;
        }
        write.probe_target()?;

        self.digest = Some(ContentDigest::of(&bytes));
        self.content = bytes;
        self.state = ActionState::Prepared;
        debug!(entity_type = %desc.entity_type(), target = %target.display(), version = %next, "insert prepared");
        Ok(())
    }

    fn commit(
        &mut self,
        entry: &mut Entry,
        env: &Env<'_>,
        effects: &mut Effects,
    ) -> SessionResult<()> {
        let (Some(write), Some(written), Some(digest)) = (&self.staged, self.written, self.digest)
        else {
            return Err(SessionError::Internal("insert committed before it was prepared".into()));
        };
        write.publish()?;
        self.state = ActionState::Committed;

        let target = write.target_path().to_path_buf();
        entry.path = Some(target.clone());
        entry.version = written;
        entry.digest = Some(digest);
        let id = entry
            .id
            .ok_or_else(|| SessionError::Internal("inserted entity has no id".into()))?;

        let element = IndexElement::stat(
            id,
            entry.entity_type(),
            entry.natural_id.clone(),
            &target,
            digest,
        )?;
        env.index.add(element);
        if let Some(doc) = entry.search_document(std::mem::take(&mut self.content)) {
            effects.search.push(SearchOp::Add(doc));
        }
        debug!(id = %id.short_hex(), target = %target.display(), "insert committed");
        Ok(())
    }

    fn rollback(&mut self, entry: &mut Entry, _env: &Env<'_>) -> SessionResult<()> {
        let mut errors = Vec::new();
        if let Some(write) = self.staged.take() {
            if let Err(e) = write.discard() {
                warn!(path = %write.staging_path().display(), error = %e, "failed to discard staging file");
                errors.push(e.into());
            }
        }
        if self.written.take().is_some() {
            if let Err(e) = entry.descriptor.assign_version(entry.object(), entry.version) {
                errors.push(e);
            }
        }
        if self.assigned_id {
            if let Err(e) = entry.descriptor.assign_id(entry.object(), None) {
                errors.push(e);
            }
            entry.id = None;
            self.assigned_id = false;
        }
        self.target = None;
        self.digest = None;
        self.content.clear();
        self.state = ActionState::RolledBack;
        collect(errors)
    }
}
