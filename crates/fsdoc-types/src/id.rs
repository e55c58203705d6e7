use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::TypeError;

/// Engine-assigned identifier of a persisted entity.
///
/// An `EntityId` is the SHA-1 hash of the UTF-16 encoding (big-endian, no
/// byte order mark) of the entity file's path relative to the repository
/// root, with `/` as separator. It is computed exactly once, when the entity
/// is first inserted, and is stored inside the file content from then on.
/// Renaming the file later does not change the id: the path only locates an
/// entity, it does not re-derive its identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId([u8; 20]);

impl EntityId {
    /// Number of hex characters in the rendered id.
    pub const HEX_LEN: usize = 40;

    /// Derive an id from a POSIX-style repository-relative path.
    pub fn derive(relative_path: &str) -> Self {
        let mut hasher = Sha1::new();
        for unit in relative_path.encode_utf16() {
            hasher.update(unit.to_be_bytes());
        }
        Self(hasher.finalize().into())
    }

    /// Create an id from raw digest bytes.
    pub fn from_raw(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// The raw 20-byte digest.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex representation (40 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters), for logs.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse a 40-character lowercase hex id.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if s.len() != Self::HEX_LEN || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(TypeError::InvalidEntityId(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|e| TypeError::MalformedHex(e.to_string()))?;
        let arr: [u8; 20] = bytes.try_into().map_err(|v: Vec<u8>| TypeError::WrongLength {
            expected: 20,
            actual: v.len(),
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.short_hex())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for EntityId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
