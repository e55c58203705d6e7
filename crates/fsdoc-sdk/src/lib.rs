//! High-level API for fsdoc, an embedded file-system document store.
//!
//! Open a [`Store`] from a [`StoreConfig`] and a [`Registry`] of entity
//! descriptors, then do all reads and writes through per-thread
//! [`Session`]s.
//!
//! ```no_run
//! use fsdoc_sdk::{handle, Entity, EntityDescriptor, EntityMeta, EntityType, Registry, Store, StoreConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Note {
//!     #[serde(flatten)]
//!     meta: EntityMeta,
//!     title: String,
//! }
//!
//! impl Entity for Note {
//!     const TYPE: EntityType = EntityType::new("Note");
//!     fn meta(&self) -> &EntityMeta { &self.meta }
//!     fn meta_mut(&mut self) -> &mut EntityMeta { &mut self.meta }
//!     fn natural_id(&self) -> Option<&str> { Some(&self.title) }
//! }
//!
//! # fn main() -> fsdoc_sdk::SdkResult<()> {
//! let registry = Registry::builder().register(EntityDescriptor::<Note>::json()).build();
//! let store = Store::open(StoreConfig::new("/tmp/notes"), registry)?;
//! store.run(|session| {
//!     session.persist(&handle(Note { meta: EntityMeta::new(), title: "hello".into() }))
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod store;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testing;

pub use config::StoreConfig;
pub use error::{SdkError, SdkResult};
pub use store::Store;

// Re-export key types
pub use fsdoc_index::{GlobalIndex, IndexElement, RebuildReport};
pub use fsdoc_session::{
    handle, ActionKind, ActionState, Entity, EntityDescriptor, EntityMeta, Handle, JsonPersister,
    Lazy, LazyList, PendingAction, Persister, Registry, RelationDescriptor, Session,
    SessionError, SessionOptions, SessionResult,
};
pub use fsdoc_store::{
    EntityFolderNaming, InMemorySearchIndex, NamingStrategy, NoopSearchIndex, Repository,
    SearchDocument, SearchIndex, TypeFolderNaming,
};
pub use fsdoc_types::{ContentDigest, EntityId, EntityType, Version};
