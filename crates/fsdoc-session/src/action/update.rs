use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fsdoc_index::IndexElement;
use fsdoc_store::{remove_if_exists, SearchOp, StagedWrite};
use fsdoc_types::{ContentDigest, Version};
use tracing::{debug, warn};

use super::{
    check_version, collect, parent_of, remap, ActionKind, ActionState, Effects, Env, FolderMove,
    LocateCx, SessionAction,
};
use crate::entry::Entry;
use crate::error::{SessionError, SessionResult};

/// Rewrite of an entity that already has a file.
///
/// When the natural id changed the file is renamed: the new file is
/// published under the new name and the old one removed at commit. For
/// naming strategies with one folder per entity the folder is renamed
/// during prepare so children follow their owner.
#[derive(Debug, Default)]
pub(crate) struct Update {
    state: ActionState,
    source: Option<PathBuf>,
    target: Option<PathBuf>,
    natural_id: Option<String>,
    folder_move: Option<FolderMove>,
    folder_moved: bool,
    written: Option<Version>,
    staged: Option<StagedWrite>,
    digest: Option<ContentDigest>,
    content: Vec<u8>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    fn paths(&self) -> SessionResult<(PathBuf, PathBuf)> {
        match (&self.source, &self.target) {
            (Some(source), Some(target)) => Ok((source.clone(), target.clone())),
            _ => Err(SessionError::Internal("update used before it was located".into())),
        }
    }
}

impl SessionAction for Update {
    fn kind(&self) -> ActionKind {
        ActionKind::Update
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
        let current = entry
            .path
            .as_deref()
            .ok_or_else(|| SessionError::Internal("update of an entity without a file".into()))?;
        let mut source = remap(current, cx.moves.as_slice());
        let desc = Arc::clone(&entry.descriptor);
        let meta = desc.meta(entry.object())?;

        let target = if meta.natural_id != entry.natural_id {
            let naming = desc.naming();
            let file_name = naming.file_name_for(meta.natural_id.as_deref(), desc.extension());
            let folder = parent_of(&source)?.to_path_buf();
            let new_folder = naming.folder_after_rename(&folder, &file_name);
            if new_folder != folder {
                let mv = FolderMove {
                    from: folder,
                    to: new_folder.clone(),
                };
                source = remap(&source, std::slice::from_ref(&mv));
                cx.moves.push(mv.clone());
                self.folder_move = Some(mv);
            }
            debug!(
                entity_type = %desc.entity_type(),
                from = ?entry.natural_id,
                to = ?meta.natural_id,
                "update renames entity file"
            );
            new_folder.join(file_name)
        } else {
            source.clone()
        };

        self.natural_id = meta.natural_id;
        self.source = Some(source);
        self.target = Some(target);
        Ok(())
    }

    fn stage_folder(&mut self, _entry: &Entry) -> SessionResult<()> {
        let Some(mv) = &self.folder_move else {
            return Ok(());
        };
        if self.folder_moved {
            return Ok(());
        }
        if mv.to.exists() {
            return Err(SessionError::stale(&mv.to, "rename target folder already exists"));
        }
        match fs::rename(&mv.from, &mv.to) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SessionError::stale(&mv.from, "entity folder no longer exists"));
            }
            Err(e) => return Err(e.into()),
        }
        self.folder_moved = true;
        debug!(from = %mv.from.display(), to = %mv.to.display(), "entity folder renamed");
        Ok(())
    }

    fn prepare(&mut self, entry: &mut Entry, env: &Env<'_>) -> SessionResult<()> {
        let (source, target) = self.paths()?;
        let desc = Arc::clone(&entry.descriptor);

        desc.before_update(entry.object())?;
        let next = entry.version.next();
        desc.assign_version(entry.object(), next)?;
        self.written = Some(next);
        let bytes = desc.serialize(entry.object())?;

        let folder = parent_of(&target)?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = folder.join(desc.naming().staging_file_name_for(&file_name));
        let write = StagedWrite::create(staging, target.clone(), &bytes, env.sync_writes)
            .map_err(SessionError::from_staging)?;
        let write = self.staged.insert(write);

        // Checked while holding the staging file of the new name.
        if target != source && target.exists() {
            return Err(SessionError::stale(&target, "rename target already exists"));
        }
        let persisted = desc
            .persisted_version(&source)?
            .ok_or_else(|| SessionError::stale(&source, "entity file no longer exists"))?;
        check_version(&source, entry.version, persisted)?;
        write.probe_target()?;

        self.digest = Some(ContentDigest::of(&bytes));
        self.content = bytes;
        self.state = ActionState::Prepared;
        debug!(entity_type = %desc.entity_type(), target = %target.display(), version = %next, "update prepared");
        Ok(())
    }

    fn commit(
        &mut self,
        entry: &mut Entry,
        env: &Env<'_>,
        effects: &mut Effects,
    ) -> SessionResult<()> {
        let (source, target) = self.paths()?;
        let (Some(write), Some(written), Some(digest)) = (&self.staged, self.written, self.digest)
        else {
            return Err(SessionError::Internal("update committed before it was prepared".into()));
        };
        write.publish()?;
        self.state = ActionState::Committed;
        if source != target {
            remove_if_exists(&source)?;
        }

        entry.path = Some(target.clone());
        entry.version = written;
        entry.digest = Some(digest);
        entry.natural_id = self.natural_id.take();

        if let Some(mv) = self.folder_move.take() {
            env.index.relocate(&mv.from, &mv.to);
            effects.moved.push(mv);
        }
        let id = entry
            .id
            .ok_or_else(|| SessionError::Internal("updated entity has no id".into()))?;
        let element = IndexElement::stat(
            id,
            entry.entity_type(),
            entry.natural_id.clone(),
            &target,
            digest,
        )?;
        env.index.update(element);

        if let Err(e) = entry.descriptor.after_update(entry.object()) {
            warn!(id = %id.short_hex(), error = %e, "after-update hook skipped");
        }
        if let Some(doc) = entry.search_document(std::mem::take(&mut self.content)) {
            effects.search.push(SearchOp::Update(doc));
        }
        debug!(id = %id.short_hex(), target = %target.display(), "update committed");
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
        if let Some(mv) = self.folder_move.take() {
            if self.folder_moved {
                if let Err(e) = fs::rename(&mv.to, &mv.from) {
                    warn!(from = %mv.to.display(), to = %mv.from.display(), error = %e, "failed to move entity folder back");
                    errors.push(e.into());
                }
                self.folder_moved = false;
            }
        }
        self.source = None;
        self.target = None;
        self.natural_id = None;
        self.digest = None;
        self.content.clear();
        self.state = ActionState::RolledBack;
        collect(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::testing::{Album, Note, TestEnv};

    fn retitle(entry: &Entry, title: &str) {
        let note = entry
            .handle
            .downcast_ref::<std::cell::RefCell<Note>>()
            .unwrap();
        note.borrow_mut().title = title.to_string();
    }

    #[test]
    fn update_rewrites_file_and_bumps_version() {
        let env = TestEnv::new();
        let mut entry = env.insert(Note::new("a", "one"));
        let path = entry.path.clone().unwrap();

        let mut update = Update::new();
        env.locate(&mut update, &mut entry).unwrap();
        assert_eq!(update.target(), Some(path.as_path()));
        update.prepare(&mut entry, &env.env()).unwrap();
        let mut effects = Effects::default();
        update.commit(&mut entry, &env.env(), &mut effects).unwrap();

        assert_eq!(entry.version, Version::new(2));
        let desc = &entry.descriptor;
        assert_eq!(desc.persisted_version(&path).unwrap(), Some(Version::new(2)));
        assert!(matches!(effects.search.as_slice(), [SearchOp::Update(_)]));
    }

    #[test]
    fn concurrent_writer_makes_update_stale() {
        let env = TestEnv::new();
        let mut mine = env.insert(Note::new("a", "one"));
        let mut theirs = env.load(&mine);

        let mut update = Update::new();
        env.locate(&mut update, &mut theirs).unwrap();
        update.prepare(&mut theirs, &env.env()).unwrap();
        update
            .commit(&mut theirs, &env.env(), &mut Effects::default())
            .unwrap();

        let mut update = Update::new();
        env.locate(&mut update, &mut mine).unwrap();
        let err = update.prepare(&mut mine, &env.env()).unwrap_err();
        assert!(matches!(err, SessionError::StaleObjectState { .. }));
        update.rollback(&mut mine, &env.env()).unwrap();
        let meta = mine.descriptor.meta(mine.object()).unwrap();
        assert_eq!(meta.version, Version::new(1));
    }

    #[test]
    fn rename_publishes_new_file_and_removes_old_one() {
        let env = TestEnv::new();
        let mut entry = env.insert(Note::new("test", ""));
        let id = entry.id.unwrap();
        retitle(&entry, "huhu");

        let mut update = Update::new();
        env.locate(&mut update, &mut entry).unwrap();
        update.prepare(&mut entry, &env.env()).unwrap();
        update
            .commit(&mut entry, &env.env(), &mut Effects::default())
            .unwrap();

        let files = env.repo.files().unwrap();
        assert_eq!(files, vec![env.repo.root().join("Note/huhu.json")]);
        assert_eq!(entry.natural_id.as_deref(), Some("huhu"));
        let element = env.index.get(&id).unwrap();
        assert_eq!(element.natural_id.as_deref(), Some("huhu"));
        assert!(env.index.get_by_natural_id(Note::TYPE, "test").is_none());
    }

    #[test]
    fn rename_of_folder_owner_moves_folder_and_rolls_back() {
        let env = TestEnv::new();
        let mut entry = env.insert(Album::new("summer"));
        let old_folder = env.repo.root().join("Album/summer");
        assert!(old_folder.join("summer.json").exists());
        {
            let album = entry
                .handle
                .downcast_ref::<std::cell::RefCell<Album>>()
                .unwrap();
            album.borrow_mut().name = "winter".into();
        }

        let mut update = Update::new();
        env.locate(&mut update, &mut entry).unwrap();
        update.stage_folder(&entry).unwrap();
        let new_folder = env.repo.root().join("Album/winter");
        assert!(new_folder.join("summer.json").exists());
        update.prepare(&mut entry, &env.env()).unwrap();

        update.rollback(&mut entry, &env.env()).unwrap();
        assert!(old_folder.join("summer.json").exists());
        assert!(!new_folder.exists());
        assert_eq!(env.repo.files().unwrap().len(), 1);
    }

    #[test]
    fn rename_onto_existing_file_is_stale_and_leaves_it_alone() {
        let env = TestEnv::new();
        let mut entry = env.insert(Note::new("test", "mine"));
        let other = env.insert(Note::new("huhu", "theirs"));
        let other_path = other.path.clone().unwrap();
        let before = fs::read(&other_path).unwrap();
        retitle(&entry, "huhu");

        let mut update = Update::new();
        env.locate(&mut update, &mut entry).unwrap();
        let err = update.prepare(&mut entry, &env.env()).unwrap_err();
        assert!(matches!(err, SessionError::StaleObjectState { .. }));

        update.rollback(&mut entry, &env.env()).unwrap();
        assert_eq!(fs::read(&other_path).unwrap(), before);
        assert!(!env.repo.root().join("Note/.huhu.json.flush").exists());
        assert!(entry.path.as_ref().unwrap().exists());
        let meta = entry.descriptor.meta(entry.object()).unwrap();
        assert_eq!(meta.version, Version::new(1));
    }

    #[test]
    fn rename_onto_a_name_another_writer_is_staging_is_stale_file() {
        let env = TestEnv::new();
        let mut entry = env.insert(Note::new("test", ""));
        let foreign = env.repo.root().join("Note/.huhu.json.flush");
        fs::write(&foreign, b"insert in flight").unwrap();
        retitle(&entry, "huhu");

        let mut update = Update::new();
        env.locate(&mut update, &mut entry).unwrap();
        let err = update.prepare(&mut entry, &env.env()).unwrap_err();
        assert!(matches!(err, SessionError::StaleObjectFile(p) if p == foreign));

        update.rollback(&mut entry, &env.env()).unwrap();
        assert_eq!(fs::read(&foreign).unwrap(), b"insert in flight");
        assert!(!env.repo.root().join("Note/huhu.json").exists());
    }

    #[test]
    fn missing_file_is_stale() {
        let env = TestEnv::new();
        let mut entry = env.insert(Note::new("a", ""));
        fs::remove_file(entry.path.as_ref().unwrap()).unwrap();

        let mut update = Update::new();
        env.locate(&mut update, &mut entry).unwrap();
        let err = update.prepare(&mut entry, &env.env()).unwrap_err();
        assert!(matches!(err, SessionError::StaleObjectState { .. }));
    }
}
