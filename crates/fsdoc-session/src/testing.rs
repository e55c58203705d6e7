//! Entity types and fixtures shared by the unit tests.

use std::any::Any;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use fsdoc_index::GlobalIndex;
use fsdoc_store::{EntityFolderNaming, Repository};
use fsdoc_types::{EntityId, EntityType};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::action::{Effects, Env, Insert, LocateCx, SessionAction};
use crate::descriptor::{EntityDescriptor, RelationDescriptor};
use crate::entity::{handle, Entity, EntityMeta};
use crate::entry::Entry;
use crate::error::SessionResult;
use crate::lazy::{Lazy, LazyList};
use crate::registry::Registry;
use crate::session::{Session, SessionOptions};

macro_rules! entity {
    ($ty:ident, $name:literal, $nid:ident) => {
        impl Entity for $ty {
            const TYPE: EntityType = EntityType::new($name);

            fn meta(&self) -> &EntityMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut EntityMeta {
                &mut self.meta
            }

            fn natural_id(&self) -> Option<&str> {
                Some(&self.$nid)
            }
        }
    };
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Person {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
}

impl Person {
    pub fn new(name: &str) -> Self {
        Self {
            meta: EntityMeta::new(),
            name: name.to_string(),
        }
    }
}

entity!(Person, "Person", name);

#[derive(Debug, Serialize, Deserialize)]
pub struct Note {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub author: Lazy<Person>,
    #[serde(default)]
    pub tags: LazyList<Tag>,
}

impl Note {
    pub fn new(title: &str, body: &str) -> Self {
        Self {
            meta: EntityMeta::new(),
            title: title.to_string(),
            body: body.to_string(),
            author: Lazy::empty(),
            tags: LazyList::new(),
        }
    }
}

entity!(Note, "Note", title);

#[derive(Debug, Serialize, Deserialize)]
pub struct Tag {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub label: String,
}

impl Tag {
    pub fn new(label: &str) -> Self {
        Self {
            meta: EntityMeta::new(),
            label: label.to_string(),
        }
    }
}

entity!(Tag, "Tag", label);

#[derive(Debug, Serialize, Deserialize)]
pub struct Album {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
    #[serde(default)]
    pub photos: LazyList<Photo>,
}

impl Album {
    pub fn new(name: &str) -> Self {
        Self {
            meta: EntityMeta::new(),
            name: name.to_string(),
            photos: LazyList::new(),
        }
    }
}

entity!(Album, "Album", name);

#[derive(Debug, Serialize, Deserialize)]
pub struct Photo {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub caption: String,
    #[serde(default)]
    pub album: Lazy<Album>,
}

impl Photo {
    pub fn new(caption: &str) -> Self {
        Self {
            meta: EntityMeta::new(),
            caption: caption.to_string(),
            album: Lazy::empty(),
        }
    }
}

entity!(Photo, "Photo", caption);

/// An entity without a natural id; its file gets a generated name.
#[derive(Debug, Serialize, Deserialize)]
pub struct Memo {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub text: String,
}

impl Memo {
    pub fn new(text: &str) -> Self {
        Self {
            meta: EntityMeta::new(),
            text: text.to_string(),
        }
    }
}

impl Entity for Memo {
    const TYPE: EntityType = EntityType::new("Memo");

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

pub fn registry() -> Registry {
    Registry::builder()
        .register(EntityDescriptor::<Person>::json())
        .register(
            EntityDescriptor::<Note>::json()
                .with_relation(RelationDescriptor::to_one("author", |n: &Note| &n.author))
                .with_relation(RelationDescriptor::to_many("tags", |n: &Note| &n.tags).child()),
        )
        .register(EntityDescriptor::<Tag>::json())
        .register(
            EntityDescriptor::<Album>::json()
                .with_naming(EntityFolderNaming)
                .with_relation(
                    RelationDescriptor::to_many("photos", |a: &Album| &a.photos).child(),
                ),
        )
        .register(
            EntityDescriptor::<Photo>::json()
                .with_relation(RelationDescriptor::to_one("album", |p: &Photo| &p.album).eager()),
        )
        .register(EntityDescriptor::<Memo>::json())
        .build()
}

/// A fresh, unattached entry for `entity`.
pub fn entry_for<T: Entity>(entity: T) -> Entry {
    let descriptor = Arc::clone(registry().descriptor_of::<T>().unwrap());
    let handle: Rc<dyn Any> = handle(entity);
    let meta = descriptor.meta(&*handle).unwrap();
    Entry {
        handle,
        descriptor,
        id: meta.id,
        natural_id: meta.natural_id,
        version: meta.version,
        path: None,
        digest: None,
        owner: None,
    }
}

/// Repository plus index for driving actions directly.
pub struct TestEnv {
    _dir: TempDir,
    pub repo: Repository,
    pub index: GlobalIndex,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        Self {
            _dir: dir,
            repo,
            index: GlobalIndex::new(),
        }
    }

    pub fn env(&self) -> Env<'_> {
        Env {
            repo: &self.repo,
            index: &self.index,
            sync_writes: false,
        }
    }

    /// Locate `action` at the repository root.
    pub fn locate(&self, action: &mut dyn SessionAction, entry: &mut Entry) -> SessionResult<()> {
        let mut moves = Vec::new();
        let mut taken = HashSet::new();
        let mut cx = LocateCx {
            repo: &self.repo,
            index: &self.index,
            base: self.repo.root().to_path_buf(),
            moves: &mut moves,
            taken: &mut taken,
        };
        action.locate(entry, &mut cx)
    }

    /// Insert `entity` and return its committed entry.
    pub fn insert<T: Entity>(&self, entity: T) -> Entry {
        let mut entry = entry_for(entity);
        let mut insert = Insert::new();
        self.locate(&mut insert, &mut entry).unwrap();
        insert.prepare(&mut entry, &self.env()).unwrap();
        insert
            .commit(&mut entry, &self.env(), &mut Effects::default())
            .unwrap();
        entry
    }

    /// A second, independent instance of a committed entry, read from disk.
    pub fn load(&self, entry: &Entry) -> Entry {
        let path = entry.path.clone().unwrap();
        Entry {
            handle: entry.descriptor.load(&path).unwrap(),
            descriptor: Arc::clone(&entry.descriptor),
            id: entry.id,
            natural_id: entry.natural_id.clone(),
            version: entry.version,
            path: Some(path),
            digest: entry.digest,
            owner: None,
        }
    }
}

/// Repository, index and registry shared by several sessions.
pub struct Fixture {
    _dir: TempDir,
    pub repo: Arc<Repository>,
    pub index: Arc<GlobalIndex>,
    pub registry: Arc<Registry>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        Self {
            _dir: dir,
            repo: Arc::new(repo),
            index: Arc::new(GlobalIndex::new()),
            registry: Arc::new(registry()),
        }
    }

    pub fn session(&self) -> Session {
        Session::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.index),
            Arc::clone(&self.registry),
            SessionOptions { sync_writes: false },
        )
    }

    /// Commit `entity` in a throwaway session and return its id.
    pub fn seed<T: Entity>(&self, entity: T) -> EntityId {
        let session = self.session();
        let entity = handle(entity);
        session.persist(&entity).unwrap();
        session.commit().unwrap();
        let id = entity.borrow().meta().id();
        id.unwrap()
    }
}
