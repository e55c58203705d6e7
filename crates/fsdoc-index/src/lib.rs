//! Global index for fsdoc.
//!
//! The [`GlobalIndex`] is the process-wide catalog of every entity file in a
//! repository: id to [`IndexElement`], and (type, natural id) to id. It is
//! shared by all sessions and can be rebuilt from disk at any time.
//!
//! # Key Types
//!
//! - [`GlobalIndex`] -- concurrent catalog (sharded maps, no global lock)
//! - [`IndexElement`] -- durable lookup record for one entity file
//! - [`FileClaim`] -- how a registered entity type claims and probes files
//! - [`RebuildReport`] -- outcome counts of a rebuild

pub mod element;
pub mod error;
pub mod global;
pub mod rebuild;

pub use element::{IndexElement, NaturalKey};
pub use error::{IndexError, IndexResult};
pub use global::GlobalIndex;
pub use rebuild::{FileClaim, Probe, RebuildReport};
