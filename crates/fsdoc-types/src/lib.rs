//! Foundation types for fsdoc.
//!
//! This crate provides the identity, versioning and hashing types used
//! throughout the store. Every other fsdoc crate depends on `fsdoc-types`.
//!
//! # Key Types
//!
//! - [`EntityId`]: SHA-1 of an entity's repository-relative path, frozen at first insert
//! - [`Version`]: Monotonic per-entity version used for optimistic concurrency
//! - [`ContentDigest`]: BLAKE3 digest of serialized entity bytes
//! - [`EntityType`]: Stable name of a registered entity type

pub mod digest;
pub mod entity_type;
pub mod error;
pub mod id;
pub mod version;

pub use digest::ContentDigest;
pub use entity_type::EntityType;
pub use error::TypeError;
pub use id::EntityId;
pub use version::Version;
