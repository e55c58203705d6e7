//! The unit of work.
//!
//! A [`Session`] caches the entities it loaded or was asked to persist,
//! registers one action per entity to write, and pushes those actions
//! through prepare and commit. It is confined to the thread that created it:
//! handles are `Rc<RefCell<T>>` and lazy relations call back into the
//! session when resolved.

use std::any::Any;
use std::cell::{RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::slice;
use std::sync::Arc;

use fsdoc_index::GlobalIndex;
use fsdoc_store::Repository;
use fsdoc_types::{ContentDigest, EntityId, EntityType};
use tracing::{debug, info, warn};

use crate::action::{
    collect, remap, ActionKind, ActionState, Delete, Effects, Env, FolderMove, Insert,
    LocateCx, PendingAction, SessionAction, Update,
};
use crate::descriptor::{ErasedDescriptor, FetchScope};
use crate::dirty::{self, Dirtiness};
use crate::entity::{Entity, Handle};
use crate::entry::{obj_key, Entry, ObjKey};
use crate::error::{SessionError, SessionResult};
use crate::lazy::SessionLink;
use crate::registry::Registry;

/// Owner chains longer than this are treated as cycles.
const MAX_OWNER_DEPTH: usize = 64;

/// Tunables of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// `fsync` staging files before they are published.
    pub sync_writes: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { sync_writes: true }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

struct ActionSlot {
    key: ObjKey,
    action: Box<dyn SessionAction>,
}

#[derive(Default)]
struct SessionState {
    entries: HashMap<ObjKey, Entry>,
    by_id: HashMap<EntityId, ObjKey>,
    by_natural: HashMap<(EntityType, String), ObjKey>,
    /// Entries with a pending delete; no longer visible to lookups.
    removed: HashMap<ObjKey, Entry>,
    /// In registration order.
    actions: Vec<ActionSlot>,
    rollback_only: bool,
    prepared: bool,
}

fn entry_mut<'a>(
    entries: &'a mut HashMap<ObjKey, Entry>,
    removed: &'a mut HashMap<ObjKey, Entry>,
    key: ObjKey,
) -> Option<&'a mut Entry> {
    match entries.get_mut(&key) {
        Some(entry) => Some(entry),
        None => removed.get_mut(&key),
    }
}

fn missing_entry() -> SessionError {
    SessionError::Internal("action has no session entry".into())
}

impl SessionState {
    fn entry(&self, key: ObjKey) -> Option<&Entry> {
        self.entries.get(&key).or_else(|| self.removed.get(&key))
    }

    fn attach(&mut self, entry: Entry) -> ObjKey {
        let key = entry.key();
        if let Some(id) = entry.id {
            self.by_id.insert(id, key);
        }
        if let Some(natural) = entry.natural_key() {
            self.by_natural.insert(natural, key);
        }
        self.entries.insert(key, entry);
        key
    }

    fn detach(&mut self, key: ObjKey) -> Option<Entry> {
        let entry = self.entries.remove(&key)?;
        self.by_id.retain(|_, k| *k != key);
        self.by_natural.retain(|_, k| *k != key);
        Some(entry)
    }

    /// Refresh the lookup maps after an entry's id or natural id changed.
    fn reindex(&mut self, key: ObjKey) {
        self.by_id.retain(|_, k| *k != key);
        self.by_natural.retain(|_, k| *k != key);
        if let Some(entry) = self.entries.get(&key) {
            if let Some(id) = entry.id {
                self.by_id.insert(id, key);
            }
            if let Some(natural) = entry.natural_key() {
                self.by_natural.insert(natural, key);
            }
        }
    }

    fn has_action(&self, key: ObjKey) -> bool {
        self.actions.iter().any(|slot| slot.key == key)
    }

    fn push_action(&mut self, key: ObjKey, action: Box<dyn SessionAction>) {
        debug!(kind = ?action.kind(), "action registered");
        self.actions.push(ActionSlot { key, action });
        self.prepared = false;
    }

    /// Drop the action of `key`, undoing whatever it staged.
    fn cancel_action(&mut self, key: ObjKey, env: &Env<'_>) -> SessionResult<()> {
        let Some(index) = self.actions.iter().position(|slot| slot.key == key) else {
            return Ok(());
        };
        let mut slot = self.actions.remove(index);
        if slot.action.state() == ActionState::Committed {
            return Ok(());
        }
        match entry_mut(&mut self.entries, &mut self.removed, key) {
            Some(entry) => slot.action.rollback(entry, env),
            None => Ok(()),
        }
    }

    fn owned_by(&self, mut key: ObjKey, root: ObjKey) -> bool {
        for _ in 0..MAX_OWNER_DEPTH {
            match self.entry(key).and_then(|e| e.owner) {
                Some(owner) if owner == root => return true,
                Some(owner) => key = owner,
                None => return false,
            }
        }
        false
    }

    fn depth(&self, mut key: ObjKey) -> usize {
        let mut depth = 0;
        while let Some(owner) = self.entry(key).and_then(|e| e.owner) {
            depth += 1;
            if depth >= MAX_OWNER_DEPTH {
                break;
            }
            key = owner;
        }
        depth
    }

    /// Action indexes with owners before the entities cascaded from them.
    fn owner_first_order(&self) -> Vec<usize> {
        let mut order: Vec<(usize, usize)> = self
            .actions
            .iter()
            .enumerate()
            .map(|(i, slot)| (self.depth(slot.key), i))
            .collect();
        order.sort();
        order.into_iter().map(|(_, i)| i).collect()
    }

    /// Folder new entities cascaded from `key`'s owner are placed under.
    fn base_for(&self, key: ObjKey, root: &Path, moves: &[FolderMove]) -> PathBuf {
        let Some(owner) = self
            .entry(key)
            .and_then(|e| e.owner)
            .and_then(|owner| self.entry(owner))
        else {
            return root.to_path_buf();
        };
        let owner_key = owner.key();
        let file = self
            .actions
            .iter()
            .find(|slot| slot.key == owner_key && slot.action.kind() != ActionKind::Delete)
            .and_then(|slot| slot.action.target().map(Path::to_path_buf))
            .or_else(|| owner.path.as_deref().map(|p| remap(p, moves)));
        match file {
            Some(file) => owner.descriptor.naming().child_base(&file),
            None => root.to_path_buf(),
        }
    }

    /// Evict everything cascaded from `root`, plus everything stored below
    /// `folder`, cancelling their actions.
    fn evict_descendants(
        &mut self,
        root: ObjKey,
        folder: Option<&Path>,
        env: &Env<'_>,
    ) -> SessionResult<()> {
        let doomed: Vec<ObjKey> = self
            .entries
            .iter()
            .chain(self.removed.iter())
            .filter(|(key, entry)| {
                **key != root
                    && (self.owned_by(**key, root)
                        || folder.is_some_and(|f| {
                            entry.path.as_deref().is_some_and(|p| p.starts_with(f))
                        }))
            })
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.cancel_action(*key, env)?;
            self.detach(*key);
            self.removed.remove(key);
        }
        if !doomed.is_empty() {
            debug!(count = doomed.len(), "evicted descendants of removed entity");
        }
        Ok(())
    }

    /// Forget entries whose files went away with a purged folder.
    fn drop_under(&mut self, folder: &Path) {
        let doomed: Vec<ObjKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.path.as_deref().is_some_and(|p| p.starts_with(folder)))
            .map(|(key, _)| *key)
            .collect();
        for key in doomed {
            self.actions.retain(|slot| slot.key != key);
            self.detach(key);
        }
        self.removed
            .retain(|_, e| !e.path.as_deref().is_some_and(|p| p.starts_with(folder)));
    }
}

// ---------------------------------------------------------------------------
// SessionCore
// ---------------------------------------------------------------------------

/// Shared part of a session; lazy relations hold a weak reference to it.
pub(crate) struct SessionCore {
    this: Weak<SessionCore>,
    repo: Arc<Repository>,
    index: Arc<GlobalIndex>,
    registry: Arc<Registry>,
    options: SessionOptions,
    state: RefCell<SessionState>,
}

fn downcast<T: Entity>(obj: Rc<dyn Any>) -> SessionResult<Handle<T>> {
    obj.downcast::<RefCell<T>>()
        .map_err(|_| SessionError::Internal(format!("cached handle is not a {}", T::TYPE)))
}

impl SessionCore {
    fn state(&self) -> SessionResult<RefMut<'_, SessionState>> {
        self.state
            .try_borrow_mut()
            .map_err(|_| SessionError::Reentrant)
    }

    fn env(&self) -> Env<'_> {
        Env {
            repo: &self.repo,
            index: &self.index,
            sync_writes: self.options.sync_writes,
        }
    }

    fn link(&self) -> SessionLink {
        SessionLink(self.this.clone())
    }

    // -- lookups ------------------------------------------------------------

    pub(crate) fn find_by_id<T: Entity>(&self, id: &EntityId) -> SessionResult<Option<Handle<T>>> {
        self.registry.descriptor_of::<T>()?;
        self.find_erased(id, T::TYPE)?.map(downcast::<T>).transpose()
    }

    fn find_erased(
        &self,
        id: &EntityId,
        expected: EntityType,
    ) -> SessionResult<Option<Rc<dyn Any>>> {
        {
            let state = self.state()?;
            if let Some(entry) = state.by_id.get(id).and_then(|key| state.entries.get(key)) {
                if entry.entity_type() != expected {
                    return Err(SessionError::TypeMismatch {
                        expected,
                        found: entry.entity_type(),
                    });
                }
                return Ok(Some(Rc::clone(&entry.handle)));
            }
            if state.removed.values().any(|e| e.id == Some(*id)) {
                return Ok(None);
            }
        }

        let Some(element) = self.index.get(id) else {
            return Ok(None);
        };
        if element.entity_type != expected {
            return Err(SessionError::TypeMismatch {
                expected,
                found: element.entity_type,
            });
        }
        let desc = Arc::clone(self.registry.descriptor(element.entity_type)?);
        let obj = match desc.load(&element.path) {
            Ok(obj) => obj,
            Err(SessionError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!(id = %id.short_hex(), path = %element.path.display(), "indexed file is gone");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let meta = desc.meta(&*obj)?;
        if meta.id.is_none() {
            desc.assign_id(&*obj, Some(*id))?;
        }
        let digest = ContentDigest::of(&desc.serialize(&*obj)?);
        self.state()?.attach(Entry {
            handle: Rc::clone(&obj),
            descriptor: Arc::clone(&desc),
            id: Some(*id),
            natural_id: meta.natural_id,
            version: meta.version,
            path: Some(element.path),
            digest: Some(digest),
            owner: None,
        });
        desc.bind_relations(&*obj, &self.link())?;
        desc.fetch_relations(&*obj, FetchScope::Eager)?;
        debug!(entity_type = %expected, id = %id.short_hex(), "entity loaded");
        Ok(Some(obj))
    }

    pub(crate) fn find_by_natural_id<T: Entity>(
        &self,
        natural_id: &str,
    ) -> SessionResult<Option<Handle<T>>> {
        self.registry.descriptor_of::<T>()?;
        {
            let state = self.state()?;
            let cached = state
                .by_natural
                .get(&(T::TYPE, natural_id.to_string()))
                .and_then(|key| state.entries.get(key));
            if let Some(entry) = cached {
                return downcast::<T>(Rc::clone(&entry.handle)).map(Some);
            }
        }
        match self.index.get_by_natural_id(T::TYPE, natural_id) {
            Some(element) => self.find_by_id::<T>(&element.id),
            None => Ok(None),
        }
    }

    pub(crate) fn find_all<T: Entity>(&self) -> SessionResult<Vec<Handle<T>>> {
        self.registry.descriptor_of::<T>()?;
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for element in self.index.all_of_type(T::TYPE) {
            if let Some(handle) = self.find_by_id::<T>(&element.id)? {
                let obj: Rc<dyn Any> = handle.clone();
                if seen.insert(obj_key(&obj)) {
                    found.push(handle);
                }
            }
        }
        let pending: Vec<Rc<dyn Any>> = {
            let state = self.state()?;
            state
                .entries
                .values()
                .filter(|e| e.entity_type() == T::TYPE && e.path.is_none())
                .map(|e| Rc::clone(&e.handle))
                .collect()
        };
        for obj in pending {
            if seen.insert(obj_key(&obj)) {
                found.push(downcast::<T>(obj)?);
            }
        }
        Ok(found)
    }

    // -- registration -------------------------------------------------------

    pub(crate) fn persist<T: Entity>(&self, entity: &Handle<T>) -> SessionResult<()> {
        let desc = Arc::clone(self.registry.descriptor_of::<T>()?);
        let obj: Rc<dyn Any> = entity.clone();
        self.persist_erased(obj, desc, None)
    }

    fn persist_erased(
        &self,
        obj: Rc<dyn Any>,
        desc: Arc<dyn ErasedDescriptor>,
        owner: Option<ObjKey>,
    ) -> SessionResult<()> {
        let key = obj_key(&obj);
        let newly_attached = {
            let mut state = self.state()?;
            if state.rollback_only {
                return Err(SessionError::RollbackOnly);
            }
            if let Some(entry) = state.entries.get(&key) {
                let written = entry.path.is_some();
                if written && !state.has_action(key) {
                    state.push_action(key, Box::new(Update::new()));
                }
                false
            } else if state.removed.contains_key(&key) {
                let env = self.env();
                state.cancel_action(key, &env)?;
                if let Some(entry) = state.removed.remove(&key) {
                    state.attach(entry);
                }
                debug!(entity_type = %desc.entity_type(), "pending delete cancelled by persist");
                false
            } else {
                let meta = desc.meta(&*obj)?;
                match meta.id {
                    None => {
                        state.attach(Entry {
                            handle: Rc::clone(&obj),
                            descriptor: Arc::clone(&desc),
                            id: None,
                            natural_id: meta.natural_id,
                            version: meta.version,
                            path: None,
                            digest: None,
                            owner,
                        });
                        state.push_action(key, Box::new(Insert::new()));
                    }
                    Some(id) => {
                        let entry = self.reattach_entry(&state, &obj, &desc, id)?;
                        state.attach(entry);
                        state.push_action(key, Box::new(Update::new()));
                    }
                }
                true
            }
        };
        if newly_attached {
            desc.bind_relations(&*obj, &self.link())?;
        }
        self.cascade(&obj, &desc)
    }

    /// Entry for an entity that carries an id but is unknown to this
    /// session, e.g. one loaded by a session that is gone.
    fn reattach_entry(
        &self,
        state: &SessionState,
        obj: &Rc<dyn Any>,
        desc: &Arc<dyn ErasedDescriptor>,
        id: EntityId,
    ) -> SessionResult<Entry> {
        if state.by_id.contains_key(&id) || state.removed.values().any(|e| e.id == Some(id)) {
            return Err(SessionError::AlreadyAttached(id));
        }
        let element = self.index.get(&id).ok_or(SessionError::NotFound(id))?;
        if element.entity_type != desc.entity_type() {
            return Err(SessionError::TypeMismatch {
                expected: desc.entity_type(),
                found: element.entity_type,
            });
        }
        let meta = desc.meta(&**obj)?;
        Ok(Entry {
            handle: Rc::clone(obj),
            descriptor: Arc::clone(desc),
            id: Some(id),
            natural_id: element.natural_id,
            version: meta.version,
            path: Some(element.path),
            digest: None,
            owner: None,
        })
    }

    /// Persist loaded relation targets the session does not know yet.
    fn cascade(&self, obj: &Rc<dyn Any>, desc: &Arc<dyn ErasedDescriptor>) -> SessionResult<()> {
        let owner = obj_key(obj);
        for related in desc.related(&**obj)? {
            let key = obj_key(&related.handle);
            let known = {
                let mut state = self.state()?;
                if state.removed.contains_key(&key) {
                    true
                } else if let Some(entry) = state.entries.get_mut(&key) {
                    if related.child && entry.owner.is_none() && entry.path.is_none() {
                        entry.owner = Some(owner);
                    }
                    true
                } else {
                    false
                }
            };
            if known {
                continue;
            }
            let target = Arc::clone(self.registry.descriptor(related.entity_type)?);
            self.persist_erased(related.handle, target, related.child.then_some(owner))?;
        }
        Ok(())
    }

    fn cascade_all(&self) -> SessionResult<()> {
        let roots: Vec<(Rc<dyn Any>, Arc<dyn ErasedDescriptor>)> = {
            let state = self.state()?;
            state
                .entries
                .values()
                .map(|e| (Rc::clone(&e.handle), Arc::clone(&e.descriptor)))
                .collect()
        };
        for (obj, desc) in roots {
            self.cascade(&obj, &desc)?;
        }
        Ok(())
    }

    pub(crate) fn remove<T: Entity>(&self, entity: &Handle<T>) -> SessionResult<()> {
        let desc = Arc::clone(self.registry.descriptor_of::<T>()?);
        let obj: Rc<dyn Any> = entity.clone();
        self.remove_erased(obj, desc)
    }

    fn remove_erased(&self, obj: Rc<dyn Any>, desc: Arc<dyn ErasedDescriptor>) -> SessionResult<()> {
        let key = obj_key(&obj);
        let attached = {
            let state = self.state()?;
            if state.rollback_only {
                return Err(SessionError::RollbackOnly);
            }
            if state.removed.contains_key(&key) {
                return Ok(());
            }
            state.entries.contains_key(&key)
        };
        if !attached {
            let id = desc
                .meta(&*obj)?
                .id
                .ok_or(SessionError::Detached(desc.entity_type()))?;
            {
                let mut state = self.state()?;
                let entry = self.reattach_entry(&state, &obj, &desc, id)?;
                state.attach(entry);
            }
            desc.bind_relations(&*obj, &self.link())?;
        }

        let folder_delete = desc.naming().remove_folder_on_delete();
        let children = if folder_delete {
            Vec::new()
        } else {
            desc.fetch_relations(&*obj, FetchScope::Children)?;
            desc.related(&*obj)?
                .into_iter()
                .filter(|r| r.child)
                .collect()
        };

        {
            let mut state = self.state()?;
            let env = self.env();
            state.cancel_action(key, &env)?;
            let Some(entry) = state.detach(key) else {
                return Ok(());
            };
            match entry.path.as_deref().map(Path::to_path_buf) {
                None => {
                    debug!(entity_type = %desc.entity_type(), "pending insert dropped");
                    if folder_delete {
                        state.evict_descendants(key, None, &env)?;
                    }
                }
                Some(path) => {
                    state.removed.insert(key, entry);
                    state.push_action(key, Box::new(Delete::new()));
                    if folder_delete {
                        let folder = path.parent().map(Path::to_path_buf);
                        state.evict_descendants(key, folder.as_deref(), &env)?;
                    }
                }
            }
        }

        for child in children {
            let child_desc = Arc::clone(self.registry.descriptor(child.entity_type)?);
            self.remove_erased(child.handle, child_desc)?;
        }
        Ok(())
    }

    fn evict_erased(&self, obj: &Rc<dyn Any>) -> SessionResult<bool> {
        let key = obj_key(obj);
        let mut state = self.state()?;
        let env = self.env();
        state.cancel_action(key, &env)?;
        let evicted = state.detach(key).is_some() || state.removed.remove(&key).is_some();
        if evicted {
            debug!("entity evicted");
        }
        Ok(evicted)
    }

    // -- the write protocol ---------------------------------------------------

    pub(crate) fn prepare(&self) -> SessionResult<()> {
        {
            let state = self.state()?;
            if state.rollback_only {
                return Err(SessionError::RollbackOnly);
            }
            if state.prepared {
                return Ok(());
            }
        }
        self.repo.search().on_prepare();
        let result = self.prepare_actions();
        let mut state = self.state()?;
        match result {
            Ok(()) => {
                state.prepared = true;
                debug!(actions = state.actions.len(), "session prepared");
                Ok(())
            }
            Err(e) => {
                state.rollback_only = true;
                warn!(error = %e, "prepare failed; session is rollback-only");
                Err(e)
            }
        }
    }

    fn prepare_actions(&self) -> SessionResult<()> {
        self.cascade_all()?;
        let mut state = self.state()?;
        let env = self.env();

        // Renames first: their folder moves decide where children go.
        let mut renamed = Vec::new();
        for (key, entry) in &state.entries {
            if !state.has_action(*key) && dirty::renamed(entry)? {
                renamed.push((entry.path.clone(), *key));
            }
        }
        renamed.sort();
        for (_, key) in renamed {
            state.push_action(key, Box::new(Update::new()));
        }

        let mut moves = Vec::new();
        let mut taken: HashSet<EntityId> = state.by_id.keys().copied().collect();
        for index in state.owner_first_order() {
            self.locate(&mut state, index, &mut moves, &mut taken)?;
        }
        let keys: Vec<ObjKey> = state.actions.iter().map(|slot| slot.key).collect();
        for key in keys {
            state.reindex(key);
        }

        let unstaged: Vec<ObjKey> = state
            .entries
            .iter()
            .filter(|(key, entry)| entry.path.is_some() && !state.has_action(**key))
            .map(|(key, _)| *key)
            .collect();
        for key in unstaged {
            let dirtiness = match state.entries.get(&key) {
                Some(entry) => dirty::check(entry)?,
                None => continue,
            };
            if dirtiness != Dirtiness::Clean {
                debug!(?dirtiness, "implicit update");
                state.push_action(key, Box::new(Update::new()));
                let index = state.actions.len() - 1;
                self.locate(&mut state, index, &mut moves, &mut taken)?;
            }
        }

        for index in state.owner_first_order() {
            let SessionState {
                entries,
                removed,
                actions,
                ..
            } = &mut *state;
            let Some(slot) = actions.get_mut(index) else {
                continue;
            };
            if slot.action.state() != ActionState::Staged {
                continue;
            }
            let entry = entries
                .get(&slot.key)
                .or_else(|| removed.get(&slot.key))
                .ok_or_else(missing_entry)?;
            slot.action.stage_folder(entry)?;
        }

        let SessionState {
            entries,
            removed,
            actions,
            ..
        } = &mut *state;
        for slot in actions.iter_mut() {
            if slot.action.state() != ActionState::Staged {
                continue;
            }
            let entry = entry_mut(entries, removed, slot.key).ok_or_else(missing_entry)?;
            slot.action.prepare(entry, &env)?;
        }
        Ok(())
    }

    fn locate(
        &self,
        state: &mut SessionState,
        index: usize,
        moves: &mut Vec<FolderMove>,
        taken: &mut HashSet<EntityId>,
    ) -> SessionResult<()> {
        let Some(key) = state.actions.get(index).map(|slot| slot.key) else {
            return Ok(());
        };
        let base = state.base_for(key, self.repo.root(), moves.as_slice());
        let SessionState {
            entries,
            removed,
            actions,
            ..
        } = state;
        let Some(slot) = actions.get_mut(index) else {
            return Ok(());
        };
        if slot.action.state() != ActionState::Staged {
            return Ok(());
        }
        let entry = entry_mut(entries, removed, key).ok_or_else(missing_entry)?;
        let mut cx = LocateCx {
            repo: &self.repo,
            index: &self.index,
            base,
            moves,
            taken,
        };
        slot.action.locate(entry, &mut cx)
    }

    pub(crate) fn commit(&self) -> SessionResult<()> {
        let rollback_only = self.state()?.rollback_only;
        if rollback_only {
            return Err(SessionError::RollbackOnly);
        }
        self.prepare()?;

        let mut state = self.state()?;
        let env = self.env();
        let mut effects = Effects::default();
        let mut failure = None;
        {
            let SessionState {
                entries,
                removed,
                actions,
                ..
            } = &mut *state;
            for slot in actions.iter_mut() {
                if slot.action.state() != ActionState::Prepared {
                    continue;
                }
                let Some(entry) = entry_mut(entries, removed, slot.key) else {
                    failure = Some(missing_entry());
                    break;
                };
                if let Err(e) = slot.action.commit(entry, &env, &mut effects) {
                    failure = Some(e);
                    break;
                }
            }
        }

        let committed: Vec<(ObjKey, ActionKind)> = state
            .actions
            .iter()
            .filter(|slot| slot.action.state() == ActionState::Committed)
            .map(|slot| (slot.key, slot.action.kind()))
            .collect();
        for (key, kind) in &committed {
            match kind {
                ActionKind::Delete => {
                    state.removed.remove(key);
                }
                ActionKind::Insert | ActionKind::Update => state.reindex(*key),
            }
        }
        for mv in &effects.moved {
            for entry in state.entries.values_mut() {
                if let Some(path) = entry.path.as_mut() {
                    let moved = remap(path, slice::from_ref(mv));
                    *path = moved;
                }
            }
        }
        for folder in &effects.purged {
            state.drop_under(folder);
        }
        state
            .actions
            .retain(|slot| slot.action.state() != ActionState::Committed);

        let search = self.repo.search();
        for op in &effects.search {
            if let Err(e) = search.apply(op) {
                warn!(error = %e, "search index update failed");
            }
        }

        match failure {
            Some(e) => {
                state.rollback_only = true;
                warn!(error = %e, committed = committed.len(), "commit failed; session is rollback-only");
                Err(e)
            }
            None => {
                state.prepared = false;
                drop(state);
                search.on_commit();
                info!(actions = committed.len(), "session committed");
                Ok(())
            }
        }
    }

    pub(crate) fn rollback(&self) -> SessionResult<()> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let env = self.env();
        let slots = std::mem::take(&mut state.actions);
        let count = slots.len();
        let mut errors = Vec::new();
        for mut slot in slots.into_iter().rev() {
            if slot.action.state() == ActionState::Committed {
                continue;
            }
            if let Some(entry) = entry_mut(&mut state.entries, &mut state.removed, slot.key) {
                if let Err(e) = slot.action.rollback(entry, &env) {
                    warn!(kind = ?slot.action.kind(), error = %e, "action rollback failed");
                    errors.push(e);
                }
            }
            match slot.action.kind() {
                ActionKind::Insert => {
                    state.detach(slot.key);
                }
                ActionKind::Delete => {
                    if let Some(entry) = state.removed.remove(&slot.key) {
                        state.attach(entry);
                    }
                }
                ActionKind::Update => {}
            }
        }
        state.rollback_only = false;
        state.prepared = false;
        drop(guard);
        self.repo.search().on_rollback();
        info!(actions = count, failures = errors.len(), "session rolled back");
        collect(errors)
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        let env = Env {
            repo: &self.repo,
            index: &self.index,
            sync_writes: self.options.sync_writes,
        };
        let state = self.state.get_mut();
        let slots = std::mem::take(&mut state.actions);
        let pending = slots
            .iter()
            .filter(|slot| slot.action.state() != ActionState::Committed)
            .count();
        if pending > 0 {
            warn!(pending, "session dropped with uncommitted actions; rolling back");
        }
        for mut slot in slots.into_iter().rev() {
            if slot.action.state() == ActionState::Committed {
                continue;
            }
            if let Some(entry) = entry_mut(&mut state.entries, &mut state.removed, slot.key) {
                if let Err(e) = slot.action.rollback(entry, &env) {
                    warn!(error = %e, "rollback on drop failed");
                }
            }
        }
        for entry in state.entries.values().chain(state.removed.values()) {
            entry.descriptor.detach_relations(entry.object());
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A unit of work over one repository.
///
/// Obtain entities with the `find_*` methods, register changes with
/// [`persist`](Self::persist) and [`remove`](Self::remove), then
/// [`commit`](Self::commit). Entities the application changed without
/// calling `persist` are picked up by the dirty check at prepare time.
///
/// Any prepare or commit failure makes the session rollback-only: every
/// further write is refused until [`rollback`](Self::rollback) is called.
/// Dropping a session rolls back whatever was not committed.
pub struct Session {
    core: Rc<SessionCore>,
}

impl Session {
    pub fn new(
        repo: Arc<Repository>,
        index: Arc<GlobalIndex>,
        registry: Arc<Registry>,
        options: SessionOptions,
    ) -> Self {
        let core = Rc::new_cyclic(|this| SessionCore {
            this: this.clone(),
            repo,
            index,
            registry,
            options,
            state: RefCell::new(SessionState::default()),
        });
        Self { core }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.core.repo
    }

    pub fn index(&self) -> &Arc<GlobalIndex> {
        &self.core.index
    }

    pub fn options(&self) -> SessionOptions {
        self.core.options
    }

    /// Entity with the given id. Repeated lookups return the same handle.
    pub fn find_by_id<T: Entity>(&self, id: &EntityId) -> SessionResult<Option<Handle<T>>> {
        self.core.find_by_id(id)
    }

    /// Entity of type `T` with the given natural id, including entities
    /// persisted in this session but not committed yet.
    pub fn find_by_natural_id<T: Entity>(
        &self,
        natural_id: &str,
    ) -> SessionResult<Option<Handle<T>>> {
        self.core.find_by_natural_id(natural_id)
    }

    /// Every indexed entity of type `T` plus pending inserts of that type.
    pub fn find_all<T: Entity>(&self) -> SessionResult<Vec<Handle<T>>> {
        self.core.find_all()
    }

    /// Register `entity` for insert (new) or update (already persisted).
    ///
    /// Idempotent per object instance. Loaded relation targets the session
    /// does not know yet are persisted as well.
    pub fn persist<T: Entity>(&self, entity: &Handle<T>) -> SessionResult<()> {
        self.core.persist(entity)
    }

    /// Register `entity` for deletion and drop it from the cache.
    ///
    /// Child relations are removed with it. An entity whose insert is still
    /// pending is simply forgotten.
    pub fn remove<T: Entity>(&self, entity: &Handle<T>) -> SessionResult<()> {
        self.core.remove(entity)
    }

    /// Forget `entity` without writing anything. Returns `false` if the
    /// session did not know it.
    pub fn evict<T: Entity>(&self, entity: &Handle<T>) -> SessionResult<bool> {
        let obj: Rc<dyn Any> = entity.clone();
        self.core.evict_erased(&obj)
    }

    /// Whether this exact object instance is managed by the session.
    pub fn contains<T: Entity>(&self, entity: &Handle<T>) -> SessionResult<bool> {
        let obj: Rc<dyn Any> = entity.clone();
        let key = obj_key(&obj);
        Ok(self.core.state()?.entries.contains_key(&key))
    }

    /// Number of cached entities.
    pub fn len(&self) -> SessionResult<usize> {
        Ok(self.core.state()?.entries.len())
    }

    pub fn is_empty(&self) -> SessionResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_rollback_only(&self) -> SessionResult<bool> {
        Ok(self.core.state()?.rollback_only)
    }

    pub fn is_prepared(&self) -> SessionResult<bool> {
        Ok(self.core.state()?.prepared)
    }

    /// Actions not committed yet, in registration order.
    pub fn pending_actions(&self) -> SessionResult<Vec<PendingAction>> {
        let state = self.core.state()?;
        let pending = state
            .actions
            .iter()
            .filter_map(|slot| {
                let entry = state.entry(slot.key)?;
                Some(PendingAction {
                    kind: slot.action.kind(),
                    state: slot.action.state(),
                    entity_type: entry.entity_type(),
                    id: entry.id,
                })
            })
            .collect();
        Ok(pending)
    }

    /// Check versions and stage every pending change. Idempotent until the
    /// next `persist` or `remove`.
    pub fn prepare(&self) -> SessionResult<()> {
        self.core.prepare()
    }

    /// Prepare if needed, then publish every staged change.
    pub fn commit(&self) -> SessionResult<()> {
        self.core.commit()
    }

    /// Undo every change that was not committed and leave rollback-only
    /// mode. Failures are collected, never cut the rollback short.
    pub fn rollback(&self) -> SessionResult<()> {
        self.core.rollback()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Session");
        match self.core.state.try_borrow() {
            Ok(state) => s
                .field("entries", &state.entries.len())
                .field("actions", &state.actions.len())
                .field("rollback_only", &state.rollback_only)
                .finish(),
            Err(_) => s.finish_non_exhaustive(),
        }
    }
}
