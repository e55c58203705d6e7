//! Per-type entity metadata.
//!
//! An [`EntityDescriptor`] is built once per entity type at startup and
//! registered in a [`Registry`](crate::Registry). It bundles the persister,
//! the naming strategy and the relation table the session needs to handle
//! entities of that type without reflection.

use std::any::Any;
use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use fsdoc_index::{FileClaim, IndexError, IndexResult, Probe};
use fsdoc_store::{NamingStrategy, TypeFolderNaming};
use fsdoc_types::{EntityId, EntityType, Version};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::entity::Entity;
use crate::error::{SessionError, SessionResult};
use crate::lazy::{Lazy, LazyList, RelationSlot, SessionLink};
use crate::persister::{JsonPersister, Persister};

/// Whether a relation points at one target or many.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// When a relation's targets are fetched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// On first [`Lazy::resolve`] / [`LazyList::resolve`].
    #[default]
    Lazy,
    /// Right after the owner is loaded.
    Eager,
}

trait SlotAccess<T>: Send + Sync {
    fn slot<'a>(&self, entity: &'a T) -> &'a dyn RelationSlot;
}

struct FieldAccess<T, S> {
    get: fn(&T) -> &S,
}

impl<T: 'static, S: RelationSlot + 'static> SlotAccess<T> for FieldAccess<T, S> {
    fn slot<'a>(&self, entity: &'a T) -> &'a dyn RelationSlot {
        (self.get)(entity)
    }
}

/// One relation field of an entity type.
pub struct RelationDescriptor<T> {
    name: &'static str,
    target: EntityType,
    cardinality: Cardinality,
    fetch: FetchMode,
    child: bool,
    access: Box<dyn SlotAccess<T>>,
}

impl<T: Entity> RelationDescriptor<T> {
    /// A lazy to-one relation stored in the field `get` returns.
    pub fn to_one<U: Entity>(name: &'static str, get: fn(&T) -> &Lazy<U>) -> Self {
        Self {
            name,
            target: U::TYPE,
            cardinality: Cardinality::One,
            fetch: FetchMode::Lazy,
            child: false,
            access: Box::new(FieldAccess { get }),
        }
    }

    /// A lazy to-many relation stored in the field `get` returns.
    pub fn to_many<U: Entity>(name: &'static str, get: fn(&T) -> &LazyList<U>) -> Self {
        Self {
            name,
            target: U::TYPE,
            cardinality: Cardinality::Many,
            fetch: FetchMode::Lazy,
            child: false,
            access: Box::new(FieldAccess { get }),
        }
    }

    /// Fetch the targets as soon as the owner is loaded.
    pub fn eager(mut self) -> Self {
        self.fetch = FetchMode::Eager;
        self
    }

    /// Store the targets below the owner's folder and delete them with it.
    pub fn child(mut self) -> Self {
        self.child = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn target(&self) -> EntityType {
        self.target
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn fetch_mode(&self) -> FetchMode {
        self.fetch
    }

    pub fn is_child(&self) -> bool {
        self.child
    }

    fn slot<'a>(&self, entity: &'a T) -> &'a dyn RelationSlot {
        self.access.slot(entity)
    }
}

impl<T> std::fmt::Debug for RelationDescriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationDescriptor")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("cardinality", &self.cardinality)
            .field("fetch", &self.fetch)
            .field("child", &self.child)
            .finish()
    }
}

/// Everything the session needs to know about one entity type.
pub struct EntityDescriptor<T> {
    persister: Arc<dyn Persister<T>>,
    naming: Arc<dyn NamingStrategy>,
    relations: Vec<RelationDescriptor<T>>,
}

impl<T: Entity> EntityDescriptor<T> {
    /// Descriptor with the given persister, one folder per type and no
    /// relations.
    pub fn new(persister: impl Persister<T> + 'static) -> Self {
        Self {
            persister: Arc::new(persister),
            naming: Arc::new(TypeFolderNaming),
            relations: Vec::new(),
        }
    }

    /// Descriptor backed by [`JsonPersister`].
    pub fn json() -> Self
    where
        T: Serialize + DeserializeOwned,
    {
        Self::new(JsonPersister::<T>::new())
    }

    pub fn with_naming(mut self, naming: impl NamingStrategy + 'static) -> Self {
        self.naming = Arc::new(naming);
        self
    }

    pub fn with_relation(mut self, relation: RelationDescriptor<T>) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn entity_type(&self) -> EntityType {
        T::TYPE
    }

    pub fn persister(&self) -> &dyn Persister<T> {
        self.persister.as_ref()
    }

    pub fn naming(&self) -> &dyn NamingStrategy {
        self.naming.as_ref()
    }

    pub fn relations(&self) -> &[RelationDescriptor<T>] {
        &self.relations
    }

    fn cell<'a>(&self, obj: &'a dyn Any) -> SessionResult<&'a RefCell<T>> {
        obj.downcast_ref::<RefCell<T>>()
            .ok_or_else(|| SessionError::Persist(format!("handle does not hold a {}", T::TYPE)))
    }

    fn with_ref<R>(&self, obj: &dyn Any, f: impl FnOnce(&T) -> R) -> SessionResult<R> {
        let entity = self
            .cell(obj)?
            .try_borrow()
            .map_err(|_| SessionError::EntityBorrowed(T::TYPE))?;
        Ok(f(&*entity))
    }

    fn with_mut<R>(&self, obj: &dyn Any, f: impl FnOnce(&mut T) -> R) -> SessionResult<R> {
        let mut entity = self
            .cell(obj)?
            .try_borrow_mut()
            .map_err(|_| SessionError::EntityBorrowed(T::TYPE))?;
        Ok(f(&mut *entity))
    }
}

impl<T> std::fmt::Debug for EntityDescriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("relations", &self.relations)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Type-erased view used by the session
// ---------------------------------------------------------------------------

/// Engine-managed fields read off an entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ObjMeta {
    pub id: Option<EntityId>,
    pub version: Version,
    pub natural_id: Option<String>,
}

/// Which relations [`ErasedDescriptor::fetch_relations`] resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FetchScope {
    Eager,
    Children,
}

/// A loaded relation target.
pub(crate) struct Related {
    pub handle: Rc<dyn Any>,
    pub entity_type: EntityType,
    pub child: bool,
}

/// Object-safe view of an [`EntityDescriptor`]. `obj` is always the
/// `RefCell<T>` behind a session handle.
pub(crate) trait ErasedDescriptor: Send + Sync {
    fn entity_type(&self) -> EntityType;
    fn naming(&self) -> &dyn NamingStrategy;
    fn extension(&self) -> &str;
    fn load(&self, path: &Path) -> SessionResult<Rc<dyn Any>>;
    fn serialize(&self, obj: &dyn Any) -> SessionResult<Vec<u8>>;
    fn meta(&self, obj: &dyn Any) -> SessionResult<ObjMeta>;
    fn assign_id(&self, obj: &dyn Any, id: Option<EntityId>) -> SessionResult<()>;
    fn assign_version(&self, obj: &dyn Any, version: Version) -> SessionResult<()>;
    fn before_update(&self, obj: &dyn Any) -> SessionResult<()>;
    fn after_update(&self, obj: &dyn Any) -> SessionResult<()>;
    /// Version stored in the file at `path`, `None` if there is no file.
    fn persisted_version(&self, path: &Path) -> SessionResult<Option<Version>>;
    fn bind_relations(&self, obj: &dyn Any, link: &SessionLink) -> SessionResult<()>;
    fn fetch_relations(&self, obj: &dyn Any, scope: FetchScope) -> SessionResult<()>;
    fn related(&self, obj: &dyn Any) -> SessionResult<Vec<Related>>;
    fn detach_relations(&self, obj: &dyn Any);
}

impl<T: Entity> ErasedDescriptor for EntityDescriptor<T> {
    fn entity_type(&self) -> EntityType {
        T::TYPE
    }

    fn naming(&self) -> &dyn NamingStrategy {
        self.naming.as_ref()
    }

    fn extension(&self) -> &str {
        self.persister.extension()
    }

    fn load(&self, path: &Path) -> SessionResult<Rc<dyn Any>> {
        let entity = self.persister.load(path)?;
        Ok(Rc::new(RefCell::new(entity)))
    }

    fn serialize(&self, obj: &dyn Any) -> SessionResult<Vec<u8>> {
        self.with_ref(obj, |entity| self.persister.serialize(entity))?
    }

    fn meta(&self, obj: &dyn Any) -> SessionResult<ObjMeta> {
        self.with_ref(obj, |entity| ObjMeta {
            id: entity.meta().id(),
            version: entity.meta().version(),
            natural_id: entity.natural_id().map(str::to_string),
        })
    }

    fn assign_id(&self, obj: &dyn Any, id: Option<EntityId>) -> SessionResult<()> {
        self.with_mut(obj, |entity| entity.meta_mut().set_id(id))
    }

    fn assign_version(&self, obj: &dyn Any, version: Version) -> SessionResult<()> {
        self.with_mut(obj, |entity| entity.meta_mut().set_version(version))
    }

    fn before_update(&self, obj: &dyn Any) -> SessionResult<()> {
        self.with_mut(obj, T::before_update)
    }

    fn after_update(&self, obj: &dyn Any) -> SessionResult<()> {
        self.with_mut(obj, T::after_update)
    }

    fn persisted_version(&self, path: &Path) -> SessionResult<Option<Version>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(self.persister.decode(&bytes)?.meta().version())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn bind_relations(&self, obj: &dyn Any, link: &SessionLink) -> SessionResult<()> {
        self.with_ref(obj, |entity| {
            for relation in &self.relations {
                relation.slot(entity).bind(link);
            }
        })
    }

    fn fetch_relations(&self, obj: &dyn Any, scope: FetchScope) -> SessionResult<()> {
        self.with_ref(obj, |entity| {
            self.relations
                .iter()
                .filter(|r| match scope {
                    FetchScope::Eager => r.fetch == FetchMode::Eager,
                    FetchScope::Children => r.child,
                })
                .try_for_each(|r| r.slot(entity).fetch())
        })?
    }

    fn related(&self, obj: &dyn Any) -> SessionResult<Vec<Related>> {
        self.with_ref(obj, |entity| {
            self.relations
                .iter()
                .flat_map(|r| {
                    r.slot(entity).loaded().into_iter().map(move |handle| Related {
                        handle,
                        entity_type: r.target,
                        child: r.child,
                    })
                })
                .collect()
        })
    }

    fn detach_relations(&self, obj: &dyn Any) {
        let _ = self.with_ref(obj, |entity| {
            for relation in &self.relations {
                relation.slot(entity).detach();
            }
        });
    }
}

impl<T: Entity> FileClaim for EntityDescriptor<T> {
    fn entity_type(&self) -> EntityType {
        T::TYPE
    }

    fn recognizes(&self, path: &Path) -> bool {
        self.persister.recognizes(path)
    }

    fn probe(&self, path: &Path, bytes: &[u8]) -> IndexResult<Probe> {
        let entity = self.persister.decode(bytes).map_err(|e| IndexError::Probe {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Probe {
            id: entity.meta().id(),
            natural_id: entity.natural_id().map(str::to_string),
        })
    }
}
