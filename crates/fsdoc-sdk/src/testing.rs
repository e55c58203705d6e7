//! Domain types used by the store tests.

use std::path::Path;

use fsdoc_session::{
    Entity, EntityDescriptor, EntityMeta, Lazy, LazyList, Registry, RelationDescriptor,
};
use fsdoc_store::EntityFolderNaming;
use fsdoc_types::EntityType;
use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::store::Store;

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
            name: name.into(),
        }
    }
}

impl Entity for Person {
    const TYPE: EntityType = EntityType::new("Person");

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn natural_id(&self) -> Option<&str> {
        Some(&self.name)
    }
}

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
    /// Bumped by the update hook.
    #[serde(default)]
    pub edits: u32,
}

impl Note {
    pub fn new(title: &str, body: &str) -> Self {
        Self {
            meta: EntityMeta::new(),
            title: title.into(),
            body: body.into(),
            author: Lazy::empty(),
            tags: LazyList::new(),
            edits: 0,
        }
    }
}

impl Entity for Note {
    const TYPE: EntityType = EntityType::new("Note");

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn natural_id(&self) -> Option<&str> {
        Some(&self.title)
    }

    fn before_update(&mut self) {
        self.edits += 1;
    }
}

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
            label: label.into(),
        }
    }
}

impl Entity for Tag {
    const TYPE: EntityType = EntityType::new("Tag");

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn natural_id(&self) -> Option<&str> {
        Some(&self.label)
    }
}

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
            name: name.into(),
            photos: LazyList::new(),
        }
    }
}

impl Entity for Album {
    const TYPE: EntityType = EntityType::new("Album");

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn natural_id(&self) -> Option<&str> {
        Some(&self.name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Photo {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub caption: String,
}

impl Photo {
    pub fn new(caption: &str) -> Self {
        Self {
            meta: EntityMeta::new(),
            caption: caption.into(),
        }
    }
}

impl Entity for Photo {
    const TYPE: EntityType = EntityType::new("Photo");

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn natural_id(&self) -> Option<&str> {
        Some(&self.caption)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Counter {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
    pub value: u64,
}

impl Counter {
    pub fn new(name: &str) -> Self {
        Self {
            meta: EntityMeta::new(),
            name: name.into(),
            value: 0,
        }
    }
}

impl Entity for Counter {
    const TYPE: EntityType = EntityType::new("Counter");

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn natural_id(&self) -> Option<&str> {
        Some(&self.name)
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
        .register(EntityDescriptor::<Photo>::json())
        .register(EntityDescriptor::<Counter>::json())
        .build()
}

/// Open (and rebuild) a store at `root` with unsynced writes.
pub fn open(root: &Path) -> Store {
    Store::open(
        StoreConfig::new(root)
            .with_sync_writes(false)
            .with_rebuild_workers(2),
        registry(),
    )
    .unwrap()
}
