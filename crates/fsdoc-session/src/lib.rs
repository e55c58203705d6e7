//! Unit of work for fsdoc.
//!
//! A [`Session`] loads entities from a repository, tracks what the
//! application changed, and writes all of it back through a staged
//! prepare/commit protocol with optimistic version checks. Relations
//! between entities are stored as ids and fetched on demand.
//!
//! # Key Types
//!
//! - [`Session`] -- identity map plus pending insert/update/delete actions
//! - [`Entity`] -- the contract domain types implement
//! - [`EntityDescriptor`] -- persister, naming strategy and relations of a type
//! - [`Registry`] -- every registered entity type
//! - [`Lazy`] / [`LazyList`] -- to-one and to-many relations
//!
//! # Threading
//!
//! Sessions and handles are `!Send`. Each thread opens its own session; the
//! repository, global index and registry they share are thread-safe.

mod action;
mod descriptor;
mod dirty;
mod entity;
mod entry;
mod error;
mod lazy;
mod persister;
mod registry;
mod session;

#[cfg(test)]
mod testing;

pub use action::{ActionKind, ActionState, PendingAction};
pub use descriptor::{Cardinality, EntityDescriptor, FetchMode, RelationDescriptor};
pub use entity::{handle, Entity, EntityMeta, Handle};
pub use error::{SessionError, SessionResult};
pub use lazy::{Lazy, LazyList, RelationSlot, SessionLink};
pub use persister::{JsonPersister, Persister};
pub use registry::{Registry, RegistryBuilder};
pub use session::{Session, SessionOptions};
