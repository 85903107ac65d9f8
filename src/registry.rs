//! Bidirectional registry between owner tags and aggregate types.
//!
//! Replaces runtime type lookup: every aggregate type is registered once at
//! startup, its applier table is built then, and hydration resolves a
//! stream's owner tag through this map.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::{Aggregate, Appliers};
use crate::error::{AggregateError, RegistryError};

/// One registered aggregate type.
struct Registration {
    type_id: TypeId,
    type_name: &'static str,
    /// `Arc<Appliers<A>>` for the registered `A`.
    appliers: Arc<dyn Any + Send + Sync>,
}

/// Owner tag ↔ aggregate type map, with each type's applier table.
#[derive(Default)]
pub struct AggregateRegistry {
    by_owner: HashMap<&'static str, Registration>,
    by_type: HashMap<TypeId, &'static str>,
}

impl AggregateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `A` under [`Aggregate::OWNER`] and build its applier table.
    ///
    /// Registering the same type twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateOwner`] if a different type already
    /// claims the owner tag.
    pub fn register<A: Aggregate>(&mut self) -> Result<&mut Self, RegistryError> {
        let type_id = TypeId::of::<A>();
        if let Some(existing) = self.by_owner.get(A::OWNER) {
            if existing.type_id == type_id {
                return Ok(self);
            }
            return Err(RegistryError::DuplicateOwner(A::OWNER));
        }

        let appliers: Arc<Appliers<A>> = Arc::new(Appliers::build());
        tracing::debug!(owner = A::OWNER, appliers = ?appliers, "aggregate type registered");
        self.by_owner.insert(
            A::OWNER,
            Registration {
                type_id,
                type_name: type_name::<A>(),
                appliers,
            },
        );
        self.by_type.insert(type_id, A::OWNER);
        Ok(self)
    }

    /// Owner tag `A` was registered under.
    pub fn owner_of<A: Aggregate>(&self) -> Option<&'static str> {
        self.by_type.get(&TypeId::of::<A>()).copied()
    }

    /// Rust type name registered under `owner`.
    pub fn type_name_of(&self, owner: &str) -> Option<&'static str> {
        self.by_owner.get(owner).map(|r| r.type_name)
    }

    /// All registered owner tags, in no particular order.
    pub fn owners(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_owner.keys().copied()
    }

    /// Applier table for `A`.
    pub(crate) fn appliers<A: Aggregate>(&self) -> Result<Arc<Appliers<A>>, AggregateError> {
        let unregistered = || AggregateError::Unregistered { owner: A::OWNER };
        let registration = self
            .by_owner
            .get(A::OWNER)
            .filter(|r| r.type_id == TypeId::of::<A>())
            .ok_or_else(unregistered)?;
        Arc::clone(&registration.appliers)
            .downcast::<Appliers<A>>()
            .map_err(|_| unregistered())
    }

    /// Check that a stream whose first event carries `owner` can be
    /// hydrated as `A`.
    pub(crate) fn check_owner<A: Aggregate>(
        &self,
        aggregate_id: &str,
        owner: &str,
    ) -> Result<(), AggregateError> {
        match self.by_owner.get(owner) {
            Some(r) if r.type_id == TypeId::of::<A>() => Ok(()),
            Some(_) => Err(AggregateError::TypeMismatch {
                id: aggregate_id.to_owned(),
                expected: A::OWNER,
                actual: owner.to_owned(),
            }),
            None => Err(AggregateError::UnknownOwner {
                id: aggregate_id.to_owned(),
                owner: owner.to_owned(),
            }),
        }
    }
}

impl std::fmt::Debug for AggregateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.by_owner.iter().map(|(owner, r)| (owner, r.type_name)))
            .finish()
    }
}
