//! Session actions: the staged write protocol.
//!
//! Every entity a session writes is bound to exactly one action. An action
//! moves through three steps:
//!
//! 1. **locate** assigns the target path (and, for inserts, the id). All
//!    actions are located before any is staged, so relation ids are known
//!    when owners are serialized and owner folders are known when children
//!    are placed.
//! 2. **prepare** checks the persisted version and stages the change
//!    beside its target: a hidden staging file for writes, a `_del` rename
//!    for deletes.
//! 3. **commit** publishes the staged change with a single rename and
//!    updates the global index; search-index operations are queued in
//!    [`Effects`] and applied by the session afterwards.
//!
//! `rollback` undoes whatever prepare staged and never stops early.

mod delete;
mod insert;
mod update;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use fsdoc_index::GlobalIndex;
use fsdoc_store::{Repository, SearchOp};
use fsdoc_types::{EntityId, EntityType, Version};

use crate::entry::Entry;
use crate::error::{SessionError, SessionResult};

pub(crate) use delete::Delete;
pub(crate) use insert::Insert;
pub(crate) use update::Update;

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

/// Kind of a staged action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Insert,
    Update,
    Delete,
}

/// Lifecycle of an action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ActionState {
    /// Registered by `persist`/`remove`, nothing on disk yet.
    #[default]
    Staged,
    /// Staging file written or deletion staged.
    Prepared,
    /// Published.
    Committed,
    RolledBack,
}

/// Read-only description of an action, as returned by
/// [`Session::pending_actions`](crate::Session::pending_actions).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub state: ActionState,
    pub entity_type: EntityType,
    pub id: Option<EntityId>,
}

// ---------------------------------------------------------------------------
// Context handed to actions
// ---------------------------------------------------------------------------

/// Shared process state actions write through.
pub(crate) struct Env<'a> {
    pub repo: &'a Repository,
    pub index: &'a GlobalIndex,
    pub sync_writes: bool,
}

/// A folder renamed as part of the current unit of work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FolderMove {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Re-root `path` through every folder move that covers it.
pub(crate) fn remap(path: &Path, moves: &[FolderMove]) -> PathBuf {
    let mut current = path.to_path_buf();
    for mv in moves {
        if let Ok(rest) = current.strip_prefix(&mv.from) {
            current = mv.to.join(rest);
        }
    }
    current
}

/// State of the locate pass.
pub(crate) struct LocateCx<'a> {
    pub repo: &'a Repository,
    pub index: &'a GlobalIndex,
    /// Folder new entities are placed under: the root, or the owner's
    /// child folder.
    pub base: PathBuf,
    pub moves: &'a mut Vec<FolderMove>,
    /// Ids held by the session or assigned earlier in this pass.
    pub taken: &'a mut HashSet<EntityId>,
}

impl LocateCx<'_> {
    /// Id for a new entity whose file will live at `target`.
    ///
    /// The id is derived from the target's relative path. If that id is
    /// already in use (an entity that was since renamed kept it), the path is
    /// salted with a counter until a free id is found.
    pub fn fresh_id(&mut self, target: &Path) -> SessionResult<EntityId> {
        let relative = self.repo.relative_posix(target)?;
        let mut id = EntityId::derive(&relative);
        let mut salt = 1u32;
        while self.taken.contains(&id) || self.index.contains(&id) {
            id = EntityId::derive(&format!("{relative}#{salt}"));
            salt += 1;
        }
        self.taken.insert(id);
        Ok(id)
    }
}

/// Side effects of committed actions the session applies once the commit
/// loop finishes.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub search: Vec<SearchOp>,
    pub moved: Vec<FolderMove>,
    pub purged: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// The action contract
// ---------------------------------------------------------------------------

pub(crate) trait SessionAction {
    fn kind(&self) -> ActionKind;

    fn state(&self) -> ActionState;

    /// Path the action writes or removes, once located.
    fn target(&self) -> Option<&Path>;

    /// Assign the target path. Called once per prepare attempt; a located
    /// action ignores further calls.
    fn locate(&mut self, entry: &mut Entry, cx: &mut LocateCx<'_>) -> SessionResult<()>;

    /// Rename folders that must move before any file is staged.
    fn stage_folder(&mut self, _entry: &Entry) -> SessionResult<()> {
        Ok(())
    }

    fn prepare(&mut self, entry: &mut Entry, env: &Env<'_>) -> SessionResult<()>;

    fn commit(&mut self, entry: &mut Entry, env: &Env<'_>, effects: &mut Effects)
        -> SessionResult<()>;

    fn rollback(&mut self, entry: &mut Entry, env: &Env<'_>) -> SessionResult<()>;
}

/// Fail with stale-object-state if the file at `path` holds a version the
/// tracked one has not seen.
pub(crate) fn check_version(path: &Path, tracked: Version, persisted: Version) -> SessionResult<()> {
    if tracked.is_stale_against(persisted) {
        return Err(SessionError::stale(
            path,
            format!("persisted version {persisted} is ahead of tracked version {tracked}"),
        ));
    }
    Ok(())
}

/// Fold rollback failures into one result.
pub(crate) fn collect(errors: Vec<SessionError>) -> SessionResult<()> {
    let mut flat = Vec::with_capacity(errors.len());
    for error in errors {
        match error {
            SessionError::Aggregate(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    match flat.len() {
        0 => Ok(()),
        1 => Err(flat.remove(0)),
        _ => Err(SessionError::Aggregate(flat)),
    }
}

/// Folder a file lives in.
pub(crate) fn parent_of(path: &Path) -> SessionResult<&Path> {
    path.parent()
        .ok_or_else(|| SessionError::Internal(format!("{} has no parent folder", path.display())))
}
