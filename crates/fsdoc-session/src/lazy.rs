//! Relation values that defer fetching to the owning session.
//!
//! A relation is stored on disk as the target's id. After a load the value
//! is *unloaded*: it knows the id and the session that loaded its owner.
//! The first [`Lazy::resolve`] asks that session for the target, caches the
//! handle and never fetches again.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use fsdoc_types::EntityId;
use serde::ser::{Error as _, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::entity::{Entity, Handle};
use crate::error::{SessionError, SessionResult};
use crate::session::SessionCore;

/// Weak back-reference from a relation value to its owning session.
#[derive(Clone)]
pub struct SessionLink(pub(crate) Weak<SessionCore>);

impl SessionLink {
    fn upgrade(&self) -> Option<Rc<SessionCore>> {
        self.0.upgrade()
    }
}

impl fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLink")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}

/// Type-erased view of a relation field, used by the session to bind,
/// fetch and walk relations without knowing the target type.
pub trait RelationSlot {
    /// Attach unloaded values to the session that will resolve them.
    fn bind(&self, link: &SessionLink);

    /// Resolve every unloaded target.
    fn fetch(&self) -> SessionResult<()>;

    /// Handles of the targets that are already loaded.
    fn loaded(&self) -> Vec<Rc<dyn Any>>;

    /// Drop loaded handles back to ids and forget the session.
    fn detach(&self);
}

fn target_id<T: Entity>(target: &Handle<T>) -> Result<EntityId, String> {
    let entity = target
        .try_borrow()
        .map_err(|_| format!("relation target of type {} is mutably borrowed", T::TYPE))?;
    entity
        .meta()
        .id()
        .ok_or_else(|| format!("relation target of type {} has no id yet", T::TYPE))
}

fn resolve_one<T: Entity>(link: Option<&SessionLink>, id: EntityId) -> SessionResult<Handle<T>> {
    let core = link
        .and_then(SessionLink::upgrade)
        .ok_or(SessionError::SessionClosed)?;
    core.find_by_id::<T>(&id)?.ok_or(SessionError::NotFound(id))
}

// ---------------------------------------------------------------------------
// Lazy
// ---------------------------------------------------------------------------

enum LazyState<T> {
    Empty,
    Unloaded {
        id: EntityId,
        link: Option<SessionLink>,
    },
    Loaded(Handle<T>),
}

/// A to-one relation.
pub struct Lazy<T> {
    state: RefCell<LazyState<T>>,
}

impl<T: Entity> Lazy<T> {
    /// A relation pointing nowhere.
    pub fn empty() -> Self {
        Self {
            state: RefCell::new(LazyState::Empty),
        }
    }

    /// A relation to an entity already in hand.
    pub fn new(target: Handle<T>) -> Self {
        Self {
            state: RefCell::new(LazyState::Loaded(target)),
        }
    }

    /// A relation known only by id, not bound to any session yet.
    pub fn unloaded(id: EntityId) -> Self {
        Self {
            state: RefCell::new(LazyState::Unloaded { id, link: None }),
        }
    }

    pub fn set(&mut self, target: Handle<T>) {
        *self.state.get_mut() = LazyState::Loaded(target);
    }

    pub fn clear(&mut self) {
        *self.state.get_mut() = LazyState::Empty;
    }

    pub fn is_empty(&self) -> bool {
        matches!(*self.state.borrow(), LazyState::Empty)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.borrow(), LazyState::Loaded(_))
    }

    /// Id of the target, if known without fetching.
    pub fn id(&self) -> Option<EntityId> {
        match &*self.state.borrow() {
            LazyState::Empty => None,
            LazyState::Unloaded { id, .. } => Some(*id),
            LazyState::Loaded(target) => target_id(target).ok(),
        }
    }

    /// The target handle if it is already loaded.
    pub fn get(&self) -> Option<Handle<T>> {
        match &*self.state.borrow() {
            LazyState::Loaded(target) => Some(Rc::clone(target)),
            _ => None,
        }
    }

    /// Fetch the target through the owning session on first call.
    ///
    /// Must run on the session's thread (the type is `!Send`). Fails with
    /// [`SessionError::SessionClosed`] when the session is gone and with
    /// [`SessionError::NotFound`] when the target no longer exists.
    pub fn resolve(&self) -> SessionResult<Option<Handle<T>>> {
        let (id, link) = match &*self.state.borrow() {
            LazyState::Empty => return Ok(None),
            LazyState::Loaded(target) => return Ok(Some(Rc::clone(target))),
            LazyState::Unloaded { id, link } => (*id, link.clone()),
        };

        let target = resolve_one::<T>(link.as_ref(), id)?;

        let mut state = self.state.borrow_mut();
        if let LazyState::Loaded(existing) = &*state {
            return Ok(Some(Rc::clone(existing)));
        }
        *state = LazyState::Loaded(Rc::clone(&target));
        Ok(Some(target))
    }
}

impl<T: Entity> Default for Lazy<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Entity> RelationSlot for Lazy<T> {
    fn bind(&self, link: &SessionLink) {
        if let LazyState::Unloaded { link: slot, .. } = &mut *self.state.borrow_mut() {
            *slot = Some(link.clone());
        }
    }

    fn fetch(&self) -> SessionResult<()> {
        self.resolve().map(|_| ())
    }

    fn loaded(&self) -> Vec<Rc<dyn Any>> {
        match &*self.state.borrow() {
            LazyState::Loaded(target) => vec![Rc::clone(target) as Rc<dyn Any>],
            _ => Vec::new(),
        }
    }

    fn detach(&self) {
        let mut state = self.state.borrow_mut();
        let next = match &*state {
            LazyState::Loaded(target) => match target_id(target) {
                Ok(id) => LazyState::Unloaded { id, link: None },
                Err(_) => return,
            },
            LazyState::Unloaded { id, .. } => LazyState::Unloaded { id: *id, link: None },
            LazyState::Empty => return,
        };
        *state = next;
    }
}

impl<T: Entity> Serialize for Lazy<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &*self.state.borrow() {
            LazyState::Empty => serializer.serialize_none(),
            LazyState::Unloaded { id, .. } => serializer.serialize_some(id),
            LazyState::Loaded(target) => {
                let id = target_id(target).map_err(S::Error::custom)?;
                serializer.serialize_some(&id)
            }
        }
    }
}

impl<'de, T: Entity> Deserialize<'de> for Lazy<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<EntityId>::deserialize(deserializer)? {
            Some(id) => Self::unloaded(id),
            None => Self::empty(),
        })
    }
}

impl<T> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_borrow() {
            Ok(state) => match &*state {
                LazyState::Empty => f.write_str("Lazy(empty)"),
                LazyState::Unloaded { id, .. } => write!(f, "Lazy(unloaded {})", id.short_hex()),
                LazyState::Loaded(_) => f.write_str("Lazy(loaded)"),
            },
            Err(_) => f.write_str("Lazy(<busy>)"),
        }
    }
}

// ---------------------------------------------------------------------------
// LazyList
// ---------------------------------------------------------------------------

enum Item<T> {
    Unloaded(EntityId),
    Loaded(Handle<T>),
}

/// A to-many relation. Items resolve individually, each at most once.
pub struct LazyList<T> {
    items: RefCell<Vec<Item<T>>>,
    link: RefCell<Option<SessionLink>>,
}

impl<T: Entity> LazyList<T> {
    pub fn new() -> Self {
        Self {
            items: RefCell::new(Vec::new()),
            link: RefCell::new(None),
        }
    }

    pub fn from_handles(targets: impl IntoIterator<Item = Handle<T>>) -> Self {
        Self {
            items: RefCell::new(targets.into_iter().map(Item::Loaded).collect()),
            link: RefCell::new(None),
        }
    }

    pub fn push(&mut self, target: Handle<T>) {
        self.items.get_mut().push(Item::Loaded(target));
    }

    /// Remove `target`, matching loaded items by identity and unloaded ones
    /// by id. Returns `true` if an item was removed.
    pub fn remove(&mut self, target: &Handle<T>) -> bool {
        let id = target_id(target).ok();
        let items = self.items.get_mut();
        let position = items.iter().position(|item| match item {
            Item::Loaded(h) => Rc::ptr_eq(h, target),
            Item::Unloaded(item_id) => Some(*item_id) == id,
        });
        match position {
            Some(i) => {
                items.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// `true` when every item is loaded.
    pub fn is_loaded(&self) -> bool {
        self.items
            .borrow()
            .iter()
            .all(|item| matches!(item, Item::Loaded(_)))
    }

    /// Ids of all items known without fetching.
    pub fn ids(&self) -> Vec<EntityId> {
        self.items
            .borrow()
            .iter()
            .filter_map(|item| match item {
                Item::Unloaded(id) => Some(*id),
                Item::Loaded(target) => target_id(target).ok(),
            })
            .collect()
    }

    /// Fetch every unloaded item through the owning session and return all
    /// targets in order.
    pub fn resolve(&self) -> SessionResult<Vec<Handle<T>>> {
        let pending: Vec<(usize, EntityId)> = self
            .items
            .borrow()
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item {
                Item::Unloaded(id) => Some((i, *id)),
                Item::Loaded(_) => None,
            })
            .collect();

        if !pending.is_empty() {
            let link = self.link.borrow().clone();
            for (i, id) in pending {
                let target = resolve_one::<T>(link.as_ref(), id)?;
                let mut items = self.items.borrow_mut();
                if let Some(slot) = items.get_mut(i) {
                    if matches!(slot, Item::Unloaded(_)) {
                        *slot = Item::Loaded(target);
                    }
                }
            }
        }

        Ok(self
            .items
            .borrow()
            .iter()
            .filter_map(|item| match item {
                Item::Loaded(target) => Some(Rc::clone(target)),
                Item::Unloaded(_) => None,
            })
            .collect())
    }
}

impl<T: Entity> Default for LazyList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> RelationSlot for LazyList<T> {
    fn bind(&self, link: &SessionLink) {
        *self.link.borrow_mut() = Some(link.clone());
    }

    fn fetch(&self) -> SessionResult<()> {
        self.resolve().map(|_| ())
    }

    fn loaded(&self) -> Vec<Rc<dyn Any>> {
        self.items
            .borrow()
            .iter()
            .filter_map(|item| match item {
                Item::Loaded(target) => Some(Rc::clone(target) as Rc<dyn Any>),
                Item::Unloaded(_) => None,
            })
            .collect()
    }

    fn detach(&self) {
        for item in self.items.borrow_mut().iter_mut() {
            if let Item::Loaded(target) = item {
                if let Ok(id) = target_id(target) {
                    *item = Item::Unloaded(id);
                }
            }
        }
        *self.link.borrow_mut() = None;
    }
}

impl<T: Entity> Serialize for LazyList<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let items = self.items.borrow();
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items.iter() {
            match item {
                Item::Unloaded(id) => seq.serialize_element(id)?,
                Item::Loaded(target) => {
                    let id = target_id(target).map_err(S::Error::custom)?;
                    seq.serialize_element(&id)?;
                }
            }
        }
        seq.end()
    }
}

impl<'de, T: Entity> Deserialize<'de> for LazyList<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ids = Vec::<EntityId>::deserialize(deserializer)?;
        Ok(Self {
            items: RefCell::new(ids.into_iter().map(Item::Unloaded).collect()),
            link: RefCell::new(None),
        })
    }
}

impl<T> fmt::Debug for LazyList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.items.try_borrow() {
            Ok(items) => {
                let loaded = items
                    .iter()
                    .filter(|item| matches!(item, Item::Loaded(_)))
                    .count();
                f.debug_struct("LazyList")
                    .field("len", &items.len())
                    .field("loaded", &loaded)
                    .finish()
            }
            Err(_) => f.write_str("LazyList(<busy>)"),
        }
    }
}
