//! Aggregate hydration from the event store.

use std::fmt;
use std::sync::Arc;

use crate::aggregate::{Aggregate, Root};
use crate::error::AggregateError;
use crate::event::EventData;
use crate::registry::AggregateRegistry;
use crate::snapshot::{SnapshotPolicy, SnapshotRecord, SnapshotStore};
use crate::storage::EventStore;

/// Snapshot store plus the policy deciding when to write to it.
struct Snapshotting {
    store: Arc<dyn SnapshotStore>,
    policy: SnapshotPolicy,
}

/// Rebuilds aggregates by replaying their streams.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn EventStore>,
    registry: Arc<AggregateRegistry>,
    snapshots: Option<Arc<Snapshotting>>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("registry", &self.registry)
            .field("snapshots", &self.snapshots.is_some())
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Create a repository over `store` that can hydrate every type in
    /// `registry`.
    pub fn new(store: Arc<dyn EventStore>, registry: AggregateRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            snapshots: None,
        }
    }

    /// Load from and save to `snapshots` according to `policy`.
    ///
    /// Snapshot failures are logged and never fail a hydration.
    pub fn with_snapshots(
        mut self,
        snapshots: Arc<dyn SnapshotStore>,
        policy: SnapshotPolicy,
    ) -> Self {
        self.snapshots = Some(Arc::new(Snapshotting {
            store: snapshots,
            policy,
        }));
        self
    }

    /// The underlying event store.
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// The aggregate type registry.
    pub fn registry(&self) -> &AggregateRegistry {
        &self.registry
    }

    /// Hydrate aggregate `id` as of `max_global_seq`.
    ///
    /// Replays the aggregate's events with global sequence
    /// `<= max_global_seq`, resuming from the newest usable snapshot when
    /// snapshots are enabled. The first event's owner tag must resolve to
    /// `A`. The returned root is not bound to a unit of work, so it cannot
    /// emit.
    ///
    /// # Arguments
    ///
    /// * `id` - Aggregate id.
    /// * `max_global_seq` - Visibility cutoff; pass `i64::MAX` for the
    ///   latest state.
    /// * `create_if_not_exists` - Return a fresh instance instead of
    ///   [`AggregateError::NotFound`] when no events are visible.
    ///
    /// # Errors
    ///
    /// - [`AggregateError::NotFound`] for an empty stream unless
    ///   `create_if_not_exists`.
    /// - [`AggregateError::TypeMismatch`] / [`AggregateError::UnknownOwner`]
    ///   if the stream belongs to another or an unregistered type.
    /// - [`AggregateError::ReplayCorruption`] on a local-sequence gap.
    /// - [`AggregateError::Store`] if the store cannot be read.
    pub fn get<A: Aggregate>(
        &self,
        id: &str,
        max_global_seq: i64,
        create_if_not_exists: bool,
    ) -> Result<Root<A>, AggregateError> {
        let appliers = self.registry.appliers::<A>()?;
        let mut root = Root::new(id, appliers, self.clone());
        root.set_global_cutoff(max_global_seq);

        let restored = self.restore_snapshot(&mut root, max_global_seq);
        let from_local = root.current_sequence() + 1;

        let events: Vec<EventData> = self
            .store
            .load(id, from_local)?
            .into_iter()
            .filter(|e| e.global_sequence() <= max_global_seq)
            .collect();

        match events.first() {
            Some(first) => self.registry.check_owner::<A>(id, first.owner())?,
            None if restored => {}
            None if create_if_not_exists => return Ok(root),
            None => {
                return Err(AggregateError::NotFound { id: id.to_owned() });
            }
        }

        for event in &events {
            root.replay(event)?;
        }

        tracing::debug!(
            owner = A::OWNER,
            aggregate_id = %id,
            from_snapshot = restored,
            replayed = events.len(),
            current_sequence = root.current_sequence(),
            "aggregate hydrated"
        );

        if let Some(last) = events.last() {
            self.offer_snapshot(&root, last, events.len());
        }
        Ok(root)
    }

    /// Hydrate the latest state of `id`.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Repository::get) without creation.
    pub fn load<A: Aggregate>(&self, id: &str) -> Result<A, AggregateError> {
        self.get::<A>(id, i64::MAX, false).map(Root::into_state)
    }

    /// Returns `true` if `id`'s first event has global sequence
    /// `<= max_global_seq`.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Store`] if the store cannot be read.
    pub fn exists(&self, id: &str, max_global_seq: i64) -> Result<bool, AggregateError> {
        Ok(self
            .store
            .load(id, 0)?
            .first()
            .is_some_and(|e| e.global_sequence() <= max_global_seq))
    }

    /// Seed `root` from the newest snapshot below `max_global_seq`.
    ///
    /// Returns `true` if a snapshot was applied.
    fn restore_snapshot<A: Aggregate>(&self, root: &mut Root<A>, max_global_seq: i64) -> bool {
        let Some(snapshots) = &self.snapshots else {
            return false;
        };
        let record = match snapshots.store.load(
            A::OWNER,
            root.id(),
            A::SCHEMA_VERSION,
            max_global_seq,
        ) {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(
                    owner = A::OWNER,
                    aggregate_id = %root.id(),
                    error = %e,
                    "snapshot load failed; replaying full stream"
                );
                return false;
            }
        };
        match serde_json::from_value::<A>(record.state) {
            Ok(state) => {
                root.restore(state, record.local_sequence);
                true
            }
            Err(e) => {
                tracing::warn!(
                    owner = A::OWNER,
                    aggregate_id = %root.id(),
                    error = %e,
                    "snapshot does not match aggregate state; replaying full stream"
                );
                false
            }
        }
    }

    fn offer_snapshot<A: Aggregate>(&self, root: &Root<A>, last: &EventData, replayed: usize) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        if replayed < snapshots.policy.min_replayed_events {
            return;
        }
        let state = match serde_json::to_value(root.state()) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(owner = A::OWNER, error = %e, "failed to serialize snapshot");
                return;
            }
        };
        let record = SnapshotRecord {
            owner: A::OWNER.to_owned(),
            aggregate_id: root.id().to_owned(),
            schema_version: A::SCHEMA_VERSION,
            valid_from_global: last.global_sequence(),
            local_sequence: root.current_sequence(),
            state,
        };
        if let Err(e) = snapshots.store.save(&record) {
            tracing::warn!(
                owner = A::OWNER,
                aggregate_id = %root.id(),
                error = %e,
                "failed to save snapshot"
            );
        }
    }
}
