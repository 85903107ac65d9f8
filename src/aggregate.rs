//! Aggregate traits, the applier table, and the replay state machine.
//!
//! An aggregate's state is rebuilt by applying its events in local-sequence
//! order. The same apply path serves two callers: hydration replaying
//! history ([`ReplayState::ReplayApply`]) and live commands applying an
//! event they just emitted ([`ReplayState::EmitApply`]).

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::AggregateError;
use crate::event::{EventData, EventMetadata, NO_SEQUENCE, decode_payload, encode_payload};
use crate::repository::Repository;

/// A domain event type with a stable tag.
///
/// The tag is written to [`EventMetadata::event_type`] and is what appliers
/// and view handlers are keyed by, so it must never change once events
/// carrying it have been stored.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable event type tag (e.g. `"Deposited"`).
    const EVENT_TYPE: &'static str;
}

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
///
/// # Contract
///
/// - [`register_appliers`](Aggregate::register_appliers) is called once,
///   when the type is registered, and must register one applier per event
///   type the aggregate emits.
/// - Appliers must be deterministic: replaying the same events always
///   yields the same state.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Owner tag stamped on every event this aggregate emits. Resolves a
    /// stream back to its aggregate type, so it must be unique and stable.
    const OWNER: &'static str;

    /// Version of the serialized state layout. Bump it to invalidate
    /// existing snapshots.
    const SCHEMA_VERSION: u32 = 0;

    /// Register the applier for each event type.
    fn register_appliers(appliers: &mut Appliers<Self>);
}

/// Where an aggregate instance is in its apply cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplayState {
    /// Idle; commands may emit.
    #[default]
    None,
    /// Applying an event just emitted by a live command. Nested loads see
    /// the instance's own cutoff.
    EmitApply,
    /// Applying a historical event during hydration. Nested loads see only
    /// events up to that event's global sequence.
    ReplayApply,
}

type ApplyFn<A> =
    Box<dyn Fn(&mut A, &ApplyContext<'_>, &[u8]) -> Result<(), AggregateError> + Send + Sync>;

/// Table mapping event type tags to typed apply functions.
///
/// Built once per aggregate type at registration; lookups during replay
/// are a single hash lookup.
pub struct Appliers<A> {
    by_type: HashMap<&'static str, ApplyFn<A>>,
}

impl<A: Aggregate> Appliers<A> {
    pub(crate) fn build() -> Self {
        let mut appliers = Self {
            by_type: HashMap::new(),
        };
        A::register_appliers(&mut appliers);
        appliers
    }

    /// Register an infallible applier for `E`.
    pub fn on<E: DomainEvent>(&mut self, apply: fn(&mut A, &E)) -> &mut Self {
        self.insert(
            E::EVENT_TYPE,
            Box::new(move |state: &mut A, _ctx: &ApplyContext<'_>, bytes: &[u8]| {
                let event: E = decode_payload(bytes)?;
                apply(state, &event);
                Ok(())
            }),
        )
    }

    /// Register an applier for `E` that can load other aggregates through
    /// the [`ApplyContext`] and may fail.
    pub fn on_with_context<E: DomainEvent>(
        &mut self,
        apply: fn(&mut A, &ApplyContext<'_>, &E) -> Result<(), AggregateError>,
    ) -> &mut Self {
        self.insert(
            E::EVENT_TYPE,
            Box::new(move |state: &mut A, ctx: &ApplyContext<'_>, bytes: &[u8]| {
                let event: E = decode_payload(bytes)?;
                apply(state, ctx, &event)
            }),
        )
    }

    /// Returns `true` if an applier is registered for `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.by_type.contains_key(event_type)
    }

    fn insert(&mut self, event_type: &'static str, apply: ApplyFn<A>) -> &mut Self {
        if self.by_type.insert(event_type, apply).is_some() {
            tracing::warn!(
                owner = A::OWNER,
                event_type,
                "applier registered twice; keeping the last one"
            );
        }
        self
    }
}

impl<A> fmt::Debug for Appliers<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.by_type.keys()).finish()
    }
}

/// Shared, ordered collection point for events emitted inside one unit of
/// work.
pub(crate) type EmitSink = Arc<Mutex<Vec<EventData>>>;

/// What an applier can see besides the event itself.
pub struct ApplyContext<'a> {
    repository: &'a Repository,
    aggregate_id: &'a str,
    replay_state: ReplayState,
    cutoff: i64,
    meta: &'a EventMetadata,
}

impl ApplyContext<'_> {
    /// Id of the aggregate being applied to.
    pub fn aggregate_id(&self) -> &str {
        self.aggregate_id
    }

    /// Whether this is a replay or a live emit.
    pub fn replay_state(&self) -> ReplayState {
        self.replay_state
    }

    /// Highest global sequence nested loads may observe.
    pub fn cutoff(&self) -> i64 {
        self.cutoff
    }

    /// Metadata of the event being applied. A freshly emitted event has no
    /// global sequence, batch id or time yet.
    pub fn metadata(&self) -> &EventMetadata {
        self.meta
    }

    /// Load another aggregate's state as of this context's cutoff.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::get`] with `create_if_not_exists = false`.
    pub fn load<B: Aggregate>(&self, id: &str) -> Result<B, AggregateError> {
        self.repository
            .get::<B>(id, self.cutoff, false)
            .map(Root::into_state)
    }

    /// Like [`load`](ApplyContext::load), but a missing aggregate is `None`.
    ///
    /// # Errors
    ///
    /// Any hydration failure other than [`AggregateError::NotFound`].
    pub fn try_load<B: Aggregate>(&self, id: &str) -> Result<Option<B>, AggregateError> {
        match self.load::<B>(id) {
            Ok(state) => Ok(Some(state)),
            Err(AggregateError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// A live aggregate instance: identity, sequence bookkeeping, and state.
///
/// Created by [`Repository::get`] or by a unit of work; discarded when the
/// hydration call or command that created it ends.
pub struct Root<A: Aggregate> {
    id: String,
    current_sequence: i64,
    replay_state: ReplayState,
    global_cutoff: i64,
    state: A,
    appliers: Arc<Appliers<A>>,
    repository: Repository,
    sink: Option<EmitSink>,
}

impl<A: Aggregate> Root<A> {
    pub(crate) fn new(id: &str, appliers: Arc<Appliers<A>>, repository: Repository) -> Self {
        Self {
            id: id.to_owned(),
            current_sequence: NO_SEQUENCE,
            replay_state: ReplayState::None,
            global_cutoff: i64::MAX,
            state: A::default(),
            appliers,
            repository,
            sink: None,
        }
    }

    /// Aggregate id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Local sequence of the last applied event, or [`NO_SEQUENCE`].
    pub fn current_sequence(&self) -> i64 {
        self.current_sequence
    }

    /// Returns `true` if no event has been applied yet.
    pub fn is_new(&self) -> bool {
        self.current_sequence == NO_SEQUENCE
    }

    /// Current apply state.
    pub fn replay_state(&self) -> ReplayState {
        self.replay_state
    }

    /// Highest global sequence nested loads from this instance may observe.
    pub fn global_cutoff(&self) -> i64 {
        self.global_cutoff
    }

    /// Borrow the aggregate state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Take the aggregate state.
    pub fn into_state(self) -> A {
        self.state
    }

    /// Emit a new event: apply it to this instance, then record it in the
    /// unit of work.
    ///
    /// # Errors
    ///
    /// - [`AggregateError::IllegalEmit`] if an event is currently being
    ///   applied.
    /// - [`AggregateError::NotBound`] if the instance does not belong to a
    ///   unit of work.
    /// - [`AggregateError::UnhandledEvent`] if `E` has no applier.
    /// - Any error raised by the applier; the event is then not recorded.
    pub fn emit<E: DomainEvent>(&mut self, event: E) -> Result<(), AggregateError> {
        if self.replay_state != ReplayState::None {
            return Err(AggregateError::IllegalEmit {
                id: self.id.clone(),
                state: self.replay_state,
            });
        }
        let Some(sink) = self.sink.clone() else {
            return Err(AggregateError::NotBound {
                id: self.id.clone(),
            });
        };
        if !self.appliers.handles(E::EVENT_TYPE) {
            return Err(AggregateError::UnhandledEvent {
                owner: A::OWNER,
                event_type: E::EVENT_TYPE.to_owned(),
            });
        }

        let meta = EventMetadata {
            aggregate_id: Some(self.id.clone()),
            local_sequence: Some(self.current_sequence + 1),
            owner: Some(A::OWNER.to_owned()),
            event_type: Some(E::EVENT_TYPE.to_owned()),
            ..EventMetadata::default()
        };
        let data = EventData::new(meta, encode_payload(&event)?);
        self.apply_event(&data, ReplayState::EmitApply)?;

        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data);
        Ok(())
    }

    pub(crate) fn bind(&mut self, sink: EmitSink) {
        self.sink = Some(sink);
    }

    pub(crate) fn set_global_cutoff(&mut self, cutoff: i64) {
        self.global_cutoff = cutoff;
    }

    /// Resume from a snapshot taken after `local_sequence` was applied.
    pub(crate) fn restore(&mut self, state: A, local_sequence: i64) {
        self.state = state;
        self.current_sequence = local_sequence;
    }

    /// Apply a stored event during hydration.
    pub(crate) fn replay(&mut self, event: &EventData) -> Result<(), AggregateError> {
        self.apply_event(event, ReplayState::ReplayApply)
    }

    fn apply_event(&mut self, event: &EventData, mode: ReplayState) -> Result<(), AggregateError> {
        let sequence = event.local_sequence();
        let expected = self.current_sequence + 1;
        if sequence != expected {
            return Err(AggregateError::ReplayCorruption {
                id: self.id.clone(),
                expected,
                actual: sequence,
            });
        }

        let appliers = Arc::clone(&self.appliers);
        let apply =
            appliers
                .by_type
                .get(event.event_type())
                .ok_or_else(|| AggregateError::UnhandledEvent {
                    owner: A::OWNER,
                    event_type: event.event_type().to_owned(),
                })?;

        let cutoff = match mode {
            ReplayState::ReplayApply => event.global_sequence(),
            _ => self.global_cutoff,
        };

        {
            let mut scope = ReplayScope::enter(self, mode, cutoff);
            let root = &mut *scope;
            let ctx = ApplyContext {
                repository: &root.repository,
                aggregate_id: &root.id,
                replay_state: root.replay_state,
                cutoff: root.global_cutoff,
                meta: &event.meta,
            };
            apply(&mut root.state, &ctx, &event.payload)?;
        }

        self.current_sequence = sequence;
        Ok(())
    }
}

impl<A: Aggregate> fmt::Debug for Root<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("owner", &A::OWNER)
            .field("id", &self.id)
            .field("current_sequence", &self.current_sequence)
            .field("replay_state", &self.replay_state)
            .field("global_cutoff", &self.global_cutoff)
            .finish_non_exhaustive()
    }
}

/// Holds a root in a non-idle replay state and restores the previous state
/// and cutoff when dropped, whichever way the apply exits.
struct ReplayScope<'r, A: Aggregate> {
    root: &'r mut Root<A>,
    previous_state: ReplayState,
    previous_cutoff: i64,
}

impl<'r, A: Aggregate> ReplayScope<'r, A> {
    fn enter(root: &'r mut Root<A>, state: ReplayState, cutoff: i64) -> Self {
        let previous_state = std::mem::replace(&mut root.replay_state, state);
        let previous_cutoff = std::mem::replace(&mut root.global_cutoff, cutoff);
        Self {
            root,
            previous_state,
            previous_cutoff,
        }
    }
}

impl<A: Aggregate> Deref for ReplayScope<'_, A> {
    type Target = Root<A>;

    fn deref(&self) -> &Root<A> {
        &*self.root
    }
}

impl<A: Aggregate> DerefMut for ReplayScope<'_, A> {
    fn deref_mut(&mut self) -> &mut Root<A> {
        &mut *self.root
    }
}

impl<A: Aggregate> Drop for ReplayScope<'_, A> {
    fn drop(&mut self) {
        self.root.replay_state = self.previous_state;
        self.root.global_cutoff = self.previous_cutoff;
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::{Aggregate, AggregateError, ApplyContext, Appliers, DomainEvent};
    use crate::registry::AggregateRegistry;
    use crate::repository::Repository;
    use crate::storage::{EventStore, InMemoryEventStore};

    /// A simple counter aggregate used as a test fixture.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Counter {
        pub value: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Incremented;

    impl DomainEvent for Incremented {
        const EVENT_TYPE: &'static str = "Incremented";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Added {
        pub amount: u64,
    }

    impl DomainEvent for Added {
        const EVENT_TYPE: &'static str = "Added";
    }

    /// Applier that always fails, for exercising error paths.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Poisoned;

    impl DomainEvent for Poisoned {
        const EVENT_TYPE: &'static str = "Poisoned";
    }

    impl Aggregate for Counter {
        const OWNER: &'static str = "counter";

        fn register_appliers(appliers: &mut Appliers<Self>) {
            appliers
                .on::<Incremented>(|c, _| c.value += 1)
                .on::<Added>(|c, e| c.value += e.amount)
                .on_with_context::<Poisoned>(|_, ctx, _| {
                    Err(AggregateError::NotFound {
                        id: format!("poisoned:{}", ctx.aggregate_id()),
                    })
                });
        }
    }

    /// Copies the value of the counter named in each event, as of that
    /// event's position in the log.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Mirror {
        pub observed: Vec<u64>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Observed {
        pub counter_id: String,
    }

    impl DomainEvent for Observed {
        const EVENT_TYPE: &'static str = "Observed";
    }

    fn apply_observed(
        mirror: &mut Mirror,
        ctx: &ApplyContext<'_>,
        event: &Observed,
    ) -> Result<(), AggregateError> {
        let value = ctx
            .try_load::<Counter>(&event.counter_id)?
            .map_or(0, |c| c.value);
        mirror.observed.push(value);
        Ok(())
    }

    impl Aggregate for Mirror {
        const OWNER: &'static str = "mirror";

        fn register_appliers(appliers: &mut Appliers<Self>) {
            appliers.on_with_context::<Observed>(apply_observed);
        }
    }

    pub(crate) fn registry() -> AggregateRegistry {
        let mut registry = AggregateRegistry::new();
        registry
            .register::<Counter>()
            .expect("counter registers")
            .register::<Mirror>()
            .expect("mirror registers");
        registry
    }

    pub(crate) fn repository() -> (InMemoryEventStore, Repository) {
        let store = InMemoryEventStore::new();
        let shared: Arc<dyn EventStore> = Arc::new(store.clone());
        (store, Repository::new(shared, registry()))
    }
}
