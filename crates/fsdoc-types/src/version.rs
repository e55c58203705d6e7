use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-entity version number.
///
/// A freshly constructed entity is at [`Version::INITIAL`]. The engine bumps
/// the version on every successful insert and update; a writer whose tracked
/// version is behind the persisted one is rejected as stale.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version of an entity that has never been written.
    pub const INITIAL: Self = Self(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The version a successful write of this version produces.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// `true` when `persisted` already reached the version a writer tracking
    /// `self` is about to produce, i.e. someone else wrote in between.
    pub fn is_stale_against(self, persisted: Version) -> bool {
        persisted >= self.next()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
