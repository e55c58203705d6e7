//! Byte-level serialization of entities.

use std::fs;
use std::marker::PhantomData;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{SessionError, SessionResult};

/// Converts entities of one type to and from bytes.
///
/// Relation ids travel inside the decoded entity's [`Lazy`](crate::Lazy)
/// and [`LazyList`](crate::LazyList) values; the session binds them after
/// loading.
pub trait Persister<T>: Send + Sync {
    /// File extension (without the dot) of files this persister writes.
    fn extension(&self) -> &str;

    fn serialize(&self, entity: &T) -> SessionResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> SessionResult<T>;

    fn load(&self, path: &Path) -> SessionResult<T> {
        let bytes = fs::read(path)?;
        self.decode(&bytes)
    }

    /// Whether the file at `path` was written by this persister.
    fn recognizes(&self, path: &Path) -> bool;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    #[serde(rename = "type")]
    entity_type: &'a str,
    entity: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(rename = "type")]
    entity_type: String,
    entity: T,
}

#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    entity_type: String,
}

/// Pretty-printed JSON in a `{"type": ..., "entity": ...}` envelope.
///
/// Several types may share an extension; files are told apart by the type
/// tag.
pub struct JsonPersister<T> {
    extension: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonPersister<T> {
    pub fn new() -> Self {
        Self::with_extension("json")
    }

    pub fn with_extension(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonPersister<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonPersister<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonPersister")
            .field("extension", &self.extension)
            .finish()
    }
}

impl<T> Persister<T> for JsonPersister<T>
where
    T: Entity + Serialize + DeserializeOwned,
{
    fn extension(&self) -> &str {
        &self.extension
    }

    fn serialize(&self, entity: &T) -> SessionResult<Vec<u8>> {
        let envelope = EnvelopeRef {
            entity_type: T::TYPE.name(),
            entity,
        };
        serde_json::to_vec_pretty(&envelope).map_err(|e| SessionError::Persist(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> SessionResult<T> {
        let envelope: Envelope<T> =
            serde_json::from_slice(bytes).map_err(|e| SessionError::Persist(e.to_string()))?;
        if envelope.entity_type != T::TYPE.name() {
            return Err(SessionError::Persist(format!(
                "expected type {}, found {}",
                T::TYPE,
                envelope.entity_type
            )));
        }
        Ok(envelope.entity)
    }

    fn recognizes(&self, path: &Path) -> bool {
        if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
            return false;
        }
        fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<TypeTag>(&bytes).ok())
            .is_some_and(|tag| tag.entity_type == T::TYPE.name())
    }
}
