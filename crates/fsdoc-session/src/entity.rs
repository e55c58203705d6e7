//! The entity contract.

use std::cell::RefCell;
use std::rc::Rc;

use fsdoc_types::{EntityId, EntityType, Version};
use serde::{Deserialize, Serialize};

/// Shared handle to an entity managed by a session.
///
/// Two lookups of the same logical entity within one session return clones
/// of the same handle.
pub type Handle<T> = Rc<RefCell<T>>;

/// Wrap a freshly constructed entity in a handle.
pub fn handle<T: Entity>(entity: T) -> Handle<T> {
    Rc::new(RefCell::new(entity))
}

/// Engine-managed fields every entity carries.
///
/// Applications embed this in their entity (usually with
/// `#[serde(flatten)]`) and expose it through [`Entity::meta`]. The id and
/// version can be read but only the session assigns them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<EntityId>,
    #[serde(default)]
    version: Version,
}

impl EntityMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id assigned at first insert, `None` before that.
    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_id(&mut self, id: Option<EntityId>) {
        self.id = id;
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }
}

/// A domain object persisted as one file.
pub trait Entity: 'static {
    /// Registered type name; also the default folder name.
    const TYPE: EntityType;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// User-meaningful unique key (per type) that names the file.
    fn natural_id(&self) -> Option<&str> {
        None
    }

    /// Called on the entity right before an update is serialized.
    fn before_update(&mut self) {}

    /// Called after an update was committed.
    fn after_update(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_serializes_without_missing_id() {
        let meta = EntityMeta::new();
        assert_eq!(serde_json::to_string(&meta).unwrap(), r#"{"version":0}"#);

        let mut meta = EntityMeta::new();
        let id = EntityId::derive("Note/a.json");
        meta.set_id(Some(id));
        meta.set_version(Version::new(3));
        let json = serde_json::to_string(&meta).unwrap();
        let back: EntityMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), Some(id));
        assert_eq!(back.version(), Version::new(3));
    }

    #[test]
    fn meta_defaults_when_absent() {
        let meta: EntityMeta = serde_json::from_str("{}").unwrap();
        assert_eq!(meta, EntityMeta::new());
    }
}
