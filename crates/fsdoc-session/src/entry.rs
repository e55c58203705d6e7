//! The session's record of one managed entity.

use std::any::Any;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use fsdoc_store::SearchDocument;
use fsdoc_types::{ContentDigest, EntityId, EntityType, Version};

use crate::descriptor::ErasedDescriptor;

/// Identity of an object instance inside a session: the address of the
/// value behind its handle.
pub(crate) type ObjKey = usize;

pub(crate) fn obj_key(obj: &Rc<dyn Any>) -> ObjKey {
    Rc::as_ptr(obj) as *const () as usize
}

/// What a session knows about one entity instance.
///
/// `natural_id`, `version`, `path` and `digest` describe the last state the
/// session loaded or committed, not the in-memory object, which the
/// application may have changed since.
pub(crate) struct Entry {
    pub handle: Rc<dyn Any>,
    pub descriptor: Arc<dyn ErasedDescriptor>,
    pub id: Option<EntityId>,
    pub natural_id: Option<String>,
    pub version: Version,
    /// `None` until the first insert commits.
    pub path: Option<PathBuf>,
    pub digest: Option<ContentDigest>,
    /// Entry this one was cascaded from through a child relation.
    pub owner: Option<ObjKey>,
}

impl Entry {
    pub fn entity_type(&self) -> EntityType {
        self.descriptor.entity_type()
    }

    pub fn object(&self) -> &dyn Any {
        &*self.handle
    }

    pub fn key(&self) -> ObjKey {
        obj_key(&self.handle)
    }

    pub fn natural_key(&self) -> Option<(EntityType, String)> {
        self.natural_id
            .as_ref()
            .map(|nid| (self.entity_type(), nid.clone()))
    }

    /// Search document for the committed state of this entry.
    pub fn search_document(&self, content: Vec<u8>) -> Option<SearchDocument> {
        Some(SearchDocument {
            id: self.id?,
            entity_type: self.entity_type(),
            natural_id: self.natural_id.clone(),
            path: self.path.clone()?,
            content,
        })
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("entity_type", &self.entity_type())
            .field("id", &self.id)
            .field("natural_id", &self.natural_id)
            .field("version", &self.version)
            .field("path", &self.path)
            .finish()
    }
}
