//! The process-wide catalog of entity files.

use std::path::Path;

use dashmap::DashMap;
use fsdoc_types::{EntityId, EntityType};
use tracing::debug;

use crate::element::{IndexElement, NaturalKey};

/// Concurrent catalog of every entity in a repository.
///
/// Two sharded maps back the index: id to element, and natural key to id.
/// There is no global lock; single-entry operations only contend on the
/// shard they touch. A reader racing a writer may briefly observe the id
/// map updated before the natural-id map.
#[derive(Default)]
pub struct GlobalIndex {
    by_id: DashMap<EntityId, IndexElement>,
    by_natural: DashMap<NaturalKey, EntityId>,
}

impl GlobalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed entities.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Insert or replace the element for `element.id`, returning the previous
    /// one. A stale natural-id mapping of the previous element is dropped.
    pub fn add(&self, element: IndexElement) -> Option<IndexElement> {
        let id = element.id;
        let key = element.natural_key();
        let previous = self.by_id.insert(id, element);

        if let Some(old_key) = previous.as_ref().and_then(IndexElement::natural_key) {
            if key.as_ref() != Some(&old_key) {
                self.by_natural.remove_if(&old_key, |_, owner| *owner == id);
            }
        }
        if let Some(key) = key {
            self.by_natural.insert(key, id);
        }
        previous
    }

    /// Refresh the element of an entity that was already indexed.
    ///
    /// Behaves like [`Self::add`]; an update for an unknown id is indexed
    /// anyway and logged, since the file it describes exists.
    pub fn update(&self, element: IndexElement) -> Option<IndexElement> {
        let id = element.id;
        let previous = self.add(element);
        if previous.is_none() {
            debug!(id = %id.short_hex(), "update indexed a previously unknown entity");
        }
        previous
    }

    /// Remove an entity, returning its element.
    pub fn remove(&self, id: &EntityId) -> Option<IndexElement> {
        let (_, element) = self.by_id.remove(id)?;
        if let Some(key) = element.natural_key() {
            self.by_natural.remove_if(&key, |_, owner| owner == id);
        }
        Some(element)
    }

    /// Remove every entity whose file lives below `folder`.
    pub fn remove_under(&self, folder: &Path) -> Vec<IndexElement> {
        let ids: Vec<EntityId> = self
            .by_id
            .iter()
            .filter(|e| e.value().is_under(folder))
            .map(|e| *e.key())
            .collect();
        let removed: Vec<IndexElement> = ids.iter().filter_map(|id| self.remove(id)).collect();
        debug!(folder = %folder.display(), count = removed.len(), "removed subtree from index");
        removed
    }

    /// Re-root every element below `from` to the same relative place below
    /// `to`, after a folder rename. Returns the number of moved elements.
    pub fn relocate(&self, from: &Path, to: &Path) -> usize {
        let mut moved = 0;
        for mut entry in self.by_id.iter_mut() {
            let element = entry.value_mut();
            if let Ok(rest) = element.path.strip_prefix(from) {
                element.path = to.join(rest);
                moved += 1;
            }
        }
        debug!(from = %from.display(), to = %to.display(), moved, "relocated index subtree");
        moved
    }

    /// Element by id.
    pub fn get(&self, id: &EntityId) -> Option<IndexElement> {
        self.by_id.get(id).map(|e| e.value().clone())
    }

    /// Element by entity type and natural id.
    pub fn get_by_natural_id(
        &self,
        entity_type: EntityType,
        natural_id: &str,
    ) -> Option<IndexElement> {
        let key = NaturalKey::new(entity_type, natural_id);
        let id = *self.by_natural.get(&key)?.value();
        self.get(&id)
    }

    /// All elements of one type, sorted by path.
    pub fn all_of_type(&self, entity_type: EntityType) -> Vec<IndexElement> {
        let mut elements: Vec<IndexElement> = self
            .by_id
            .iter()
            .filter(|e| e.value().entity_type == entity_type)
            .map(|e| e.value().clone())
            .collect();
        elements.sort_by(|a, b| a.path.cmp(&b.path));
        elements
    }

    /// All elements, sorted by path.
    pub fn snapshot(&self) -> Vec<IndexElement> {
        let mut elements: Vec<IndexElement> =
            self.by_id.iter().map(|e| e.value().clone()).collect();
        elements.sort_by(|a, b| a.path.cmp(&b.path));
        elements
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.by_id.clear();
        self.by_natural.clear();
    }
}

impl std::fmt::Debug for GlobalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalIndex")
            .field("entries", &self.by_id.len())
            .field("natural_ids", &self.by_natural.len())
            .finish()
    }
}
