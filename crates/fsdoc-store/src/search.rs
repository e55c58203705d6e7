//! Secondary search index contract.
//!
//! The store keeps a search index in step with committed changes. Full-text
//! analysis and query execution are the index's business; the store only
//! feeds it documents and lifecycle notifications.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use fsdoc_types::{EntityId, EntityType};

use crate::error::{StoreError, StoreResult};

/// What the search index receives for one entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchDocument {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub natural_id: Option<String>,
    pub path: PathBuf,
    /// Serialized entity bytes as written to disk.
    pub content: Vec<u8>,
}

/// A queued search-index change, applied after a commit succeeds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchOp {
    Add(SearchDocument),
    Update(SearchDocument),
    Remove(EntityId),
}

/// A search index kept in sync with the repository.
///
/// Implementations must be safe to share between all sessions of a process.
pub trait SearchIndex: Send + Sync {
    /// Index a newly inserted entity.
    fn add(&self, doc: &SearchDocument) -> StoreResult<()>;

    /// Re-index an updated entity.
    fn update(&self, doc: &SearchDocument) -> StoreResult<()>;

    /// Drop an entity from the index. Unknown ids are ignored.
    fn remove(&self, id: &EntityId) -> StoreResult<()>;

    /// Replace the whole index content.
    fn rebuild(&self, docs: Vec<SearchDocument>) -> StoreResult<()>;

    /// Called before a session starts preparing its actions.
    fn on_prepare(&self) {}

    /// Called after a session committed and its queued ops were applied.
    fn on_commit(&self) {}

    /// Called after a session rolled back.
    fn on_rollback(&self) {}

    /// Release the index's storage. Called once by the repository.
    fn close(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Apply one queued operation.
    fn apply(&self, op: &SearchOp) -> StoreResult<()> {
        match op {
            SearchOp::Add(doc) => self.add(doc),
            SearchOp::Update(doc) => self.update(doc),
            SearchOp::Remove(id) => self.remove(id),
        }
    }
}

/// A search index that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSearchIndex;

impl SearchIndex for NoopSearchIndex {
    fn add(&self, _doc: &SearchDocument) -> StoreResult<()> {
        Ok(())
    }

    fn update(&self, _doc: &SearchDocument) -> StoreResult<()> {
        Ok(())
    }

    fn remove(&self, _id: &EntityId) -> StoreResult<()> {
        Ok(())
    }

    fn rebuild(&self, _docs: Vec<SearchDocument>) -> StoreResult<()> {
        Ok(())
    }
}

struct Indexed {
    entity_type: EntityType,
    text: String,
}

/// In-memory term index for tests and embedding.
///
/// Matches a lowercase term against each document's natural id and its
/// content decoded as UTF-8.
pub struct InMemorySearchIndex {
    docs: RwLock<HashMap<EntityId, Indexed>>,
    closed: AtomicBool,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Ids of documents containing `term` (case-insensitive), sorted.
    pub fn search(&self, term: &str) -> Vec<EntityId> {
        let needle = term.to_lowercase();
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<EntityId> = docs
            .iter()
            .filter(|(_, doc)| doc.text.contains(&needle))
            .map(|(id, _)| *id)
            .collect();
        hits.sort();
        hits
    }

    /// Ids of all indexed documents of one type, sorted.
    pub fn ids_of_type(&self, entity_type: EntityType) -> Vec<EntityId> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<EntityId> = docs
            .iter()
            .filter(|(_, doc)| doc.entity_type == entity_type)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Search("index is closed".into()));
        }
        Ok(())
    }

    fn upsert(&self, doc: &SearchDocument) -> StoreResult<()> {
        self.ensure_open()?;
        let mut text = doc.natural_id.clone().unwrap_or_default();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&doc.content));
        let mut docs = self
            .docs
            .write()
            .map_err(|e| StoreError::Search(format!("lock poisoned: {e}")))?;
        docs.insert(
            doc.id,
            Indexed {
                entity_type: doc.entity_type,
                text: text.to_lowercase(),
            },
        );
        Ok(())
    }
}

impl Default for InMemorySearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchIndex for InMemorySearchIndex {
    fn add(&self, doc: &SearchDocument) -> StoreResult<()> {
        self.upsert(doc)
    }

    fn update(&self, doc: &SearchDocument) -> StoreResult<()> {
        self.upsert(doc)
    }

    fn remove(&self, id: &EntityId) -> StoreResult<()> {
        self.ensure_open()?;
        let mut docs = self
            .docs
            .write()
            .map_err(|e| StoreError::Search(format!("lock poisoned: {e}")))?;
        docs.remove(id);
        Ok(())
    }

    fn rebuild(&self, docs: Vec<SearchDocument>) -> StoreResult<()> {
        self.ensure_open()?;
        {
            let mut map = self
                .docs
                .write()
                .map_err(|e| StoreError::Search(format!("lock poisoned: {e}")))?;
            map.clear();
        }
        for doc in &docs {
            self.upsert(doc)?;
        }
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for InMemorySearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySearchIndex")
            .field("doc_count", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTE: EntityType = EntityType::new("Note");

    fn doc(path: &str, nid: &str, content: &str) -> SearchDocument {
        SearchDocument {
            id: EntityId::derive(path),
            entity_type: NOTE,
            natural_id: Some(nid.to_string()),
            path: PathBuf::from(path),
            content: content.as_bytes().to_vec(),
        }
    }

    #[test]
    fn add_search_remove() {
        let index = InMemorySearchIndex::new();
        let a = doc("Note/a.json", "groceries", "milk and Bread");
        let b = doc("Note/b.json", "todo", "fix the bread maker");
        index.add(&a).unwrap();
        index.add(&b).unwrap();

        let mut both = vec![a.id, b.id];
        both.sort();
        assert_eq!(index.search("BREAD"), both);
        assert_eq!(index.search("groceries"), vec![a.id]);

        index.remove(&a.id).unwrap();
        assert_eq!(index.search("bread"), vec![b.id]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn update_replaces_text() {
        let index = InMemorySearchIndex::new();
        let mut a = doc("Note/a.json", "a", "old words");
        index.add(&a).unwrap();
        a.content = b"new words".to_vec();
        index.apply(&SearchOp::Update(a.clone())).unwrap();
        assert!(index.search("old").is_empty());
        assert_eq!(index.search("new"), vec![a.id]);
    }

    #[test]
    fn rebuild_replaces_everything() {
        let index = InMemorySearchIndex::new();
        index.add(&doc("Note/a.json", "a", "x")).unwrap();
        let b = doc("Note/b.json", "b", "y");
        index.rebuild(vec![b.clone()]).unwrap();
        assert_eq!(index.ids_of_type(NOTE), vec![b.id]);
    }

    #[test]
    fn closed_index_rejects_writes() {
        let index = InMemorySearchIndex::new();
        index.close().unwrap();
        let err = index.add(&doc("Note/a.json", "a", "x")).unwrap_err();
        assert!(matches!(err, StoreError::Search(_)));
    }

    #[test]
    fn noop_accepts_everything() {
        let index = NoopSearchIndex;
        let d = doc("Note/a.json", "a", "x");
        index.apply(&SearchOp::Add(d.clone())).unwrap();
        index.apply(&SearchOp::Remove(d.id)).unwrap();
        index.rebuild(vec![d]).unwrap();
    }
}
