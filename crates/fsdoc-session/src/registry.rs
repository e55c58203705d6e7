//! Build-once table of entity descriptors.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use fsdoc_index::FileClaim;
use fsdoc_types::EntityType;
use tracing::warn;

use crate::descriptor::{EntityDescriptor, ErasedDescriptor};
use crate::entity::Entity;
use crate::error::{SessionError, SessionResult};

struct Registered {
    rust_type: TypeId,
    descriptor: Arc<dyn ErasedDescriptor>,
    claim: Arc<dyn FileClaim>,
}

/// Immutable mapping from entity type to descriptor.
///
/// Built once at startup with [`Registry::builder`] and shared read-only
/// (usually behind an `Arc`) by every session of the process. Registration
/// order decides which type claims a file first during index rebuild.
pub struct Registry {
    entries: HashMap<EntityType, Registered>,
    order: Vec<EntityType>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            registry: Registry {
                entries: HashMap::new(),
                order: Vec::new(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, entity_type: EntityType) -> bool {
        self.entries.contains_key(&entity_type)
    }

    /// Registered types in registration order.
    pub fn types(&self) -> &[EntityType] {
        &self.order
    }

    /// File claims for index rebuild, in registration order.
    pub fn claims(&self) -> Vec<Arc<dyn FileClaim>> {
        self.order
            .iter()
            .filter_map(|t| self.entries.get(t))
            .map(|r| Arc::clone(&r.claim))
            .collect()
    }

    pub(crate) fn descriptor(
        &self,
        entity_type: EntityType,
    ) -> SessionResult<&Arc<dyn ErasedDescriptor>> {
        self.entries
            .get(&entity_type)
            .map(|r| &r.descriptor)
            .ok_or(SessionError::EntityNotRegistered(entity_type))
    }

    /// Descriptor of `T`, checking that `T::TYPE` was registered for `T`
    /// itself and not for another Rust type of the same name.
    pub(crate) fn descriptor_of<T: Entity>(&self) -> SessionResult<&Arc<dyn ErasedDescriptor>> {
        match self.entries.get(&T::TYPE) {
            Some(r) if r.rust_type == TypeId::of::<T>() => Ok(&r.descriptor),
            _ => Err(SessionError::EntityNotRegistered(T::TYPE)),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("types", &self.order).finish()
    }
}

/// Collects descriptors before the registry is frozen.
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// Add a descriptor. Registering a type name twice replaces the earlier
    /// descriptor but keeps its position.
    pub fn register<T: Entity>(mut self, descriptor: EntityDescriptor<T>) -> Self {
        let typed = Arc::new(descriptor);
        let entry = Registered {
            rust_type: TypeId::of::<T>(),
            descriptor: Arc::clone(&typed) as Arc<dyn ErasedDescriptor>,
            claim: typed as Arc<dyn FileClaim>,
        };
        if self.registry.entries.insert(T::TYPE, entry).is_some() {
            warn!(entity_type = %T::TYPE, "entity type registered twice; keeping the last descriptor");
        } else {
            self.registry.order.push(T::TYPE);
        }
        self
    }

    pub fn build(self) -> Registry {
        self.registry
    }
}
