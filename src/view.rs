//! Views: read models folded from the global event log.
//!
//! A [`View`] declares typed handlers per event type. A [`ViewManager`]
//! owns one view's persistence and implements the position protocol the
//! catch-up dispatcher relies on:
//!
//! - an instance skips events at or below its own `last_global_sequence`,
//!   so re-delivery is harmless;
//! - the position document is written after the instances it covers;
//! - the position is resolved cache, then position document, then the
//!   lowest instance watermark, then [`NO_SEQUENCE`].

use std::any::Any;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::aggregate::{Aggregate, DomainEvent, Root};
use crate::consistency::{self, CommandProcessingResult};
use crate::error::{AggregateError, ViewError, WaitError};
use crate::event::{EventData, NO_SEQUENCE, decode_payload};
use crate::locator::{InstancePerAggregate, ViewLocator};
use crate::repository::Repository;
use crate::view_store::{ViewDocument, ViewStore};

/// A read model built from events of any aggregate.
///
/// The implementing type is the state of one view instance.
pub trait View: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique view name, used in logs and by name lookups.
    const NAME: &'static str;

    /// Register the handler for each event type the view consumes. Events
    /// without a handler are skipped.
    fn register_handlers(handlers: &mut ViewHandlers<Self>);

    /// Which instances an event updates. Defaults to one instance per
    /// aggregate.
    fn locator() -> Arc<dyn ViewLocator> {
        Arc::new(InstancePerAggregate)
    }
}

type HandleFn<V> =
    Box<dyn Fn(&mut V, &ViewContext<'_>, &[u8]) -> Result<(), ViewError> + Send + Sync>;

/// Table mapping event type tags to typed view handlers.
pub struct ViewHandlers<V> {
    by_type: HashMap<&'static str, HandleFn<V>>,
}

impl<V: View> ViewHandlers<V> {
    fn build() -> Self {
        let mut handlers = Self {
            by_type: HashMap::new(),
        };
        V::register_handlers(&mut handlers);
        handlers
    }

    /// Register an infallible handler for `E`.
    pub fn on<E: DomainEvent>(&mut self, handle: fn(&mut V, &E)) -> &mut Self {
        self.by_type.insert(
            E::EVENT_TYPE,
            Box::new(move |state: &mut V, _ctx: &ViewContext<'_>, bytes: &[u8]| {
                let event: E = decode_payload(bytes)?;
                handle(state, &event);
                Ok(())
            }),
        );
        self
    }

    /// Register a handler for `E` that reads the [`ViewContext`] and may
    /// fail.
    pub fn on_with_context<E: DomainEvent>(
        &mut self,
        handle: fn(&mut V, &ViewContext<'_>, &E) -> Result<(), ViewError>,
    ) -> &mut Self {
        self.by_type.insert(
            E::EVENT_TYPE,
            Box::new(move |state: &mut V, ctx: &ViewContext<'_>, bytes: &[u8]| {
                let event: E = decode_payload(bytes)?;
                handle(state, ctx, &event)
            }),
        );
        self
    }

    /// Returns `true` if a handler is registered for `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.by_type.contains_key(event_type)
    }
}

impl<V> fmt::Debug for ViewHandlers<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.by_type.keys()).finish()
    }
}

/// Shared inputs for one dispatch pass.
#[derive(Clone, Copy)]
pub struct DispatchContext<'a> {
    repository: &'a Repository,
    items: &'a HashMap<String, Value>,
}

impl<'a> DispatchContext<'a> {
    pub(crate) fn new(repository: &'a Repository, items: &'a HashMap<String, Value>) -> Self {
        Self { repository, items }
    }

    /// Context for locating the instances of `event`.
    pub(crate) fn locate<'c>(&'c self, event: &'c EventData, batch: &'c [EventData]) -> ViewContext<'c> {
        ViewContext {
            repository: self.repository,
            items: self.items,
            event,
            batch,
            view_id: None,
        }
    }
}

/// What a handler or locator can see besides the event payload.
#[derive(Clone, Copy)]
pub struct ViewContext<'a> {
    repository: &'a Repository,
    items: &'a HashMap<String, Value>,
    event: &'a EventData,
    batch: &'a [EventData],
    view_id: Option<&'a str>,
}

impl<'a> ViewContext<'a> {
    /// The event being handled.
    pub fn current_event(&self) -> &EventData {
        self.event
    }

    /// Every event in the batch being dispatched to this view.
    pub fn batch(&self) -> &[EventData] {
        self.batch
    }

    /// Context item registered on the dispatcher.
    pub fn item(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }

    /// Id of the instance being updated; `None` while locating.
    pub fn view_id(&self) -> Option<&str> {
        self.view_id
    }

    /// Load an aggregate as of the current event's global sequence.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::get`] without creation.
    pub fn load<A: Aggregate>(&self, id: &str) -> Result<A, AggregateError> {
        self.repository
            .get::<A>(id, self.event.global_sequence(), false)
            .map(Root::into_state)
    }

    /// Like [`load`](ViewContext::load), but a missing aggregate is `None`.
    ///
    /// # Errors
    ///
    /// Any hydration failure other than [`AggregateError::NotFound`].
    pub fn try_load<A: Aggregate>(&self, id: &str) -> Result<Option<A>, AggregateError> {
        match self.load::<A>(id) {
            Ok(state) => Ok(Some(state)),
            Err(AggregateError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn for_instance(&self, view_id: &'a str) -> Self {
        Self {
            view_id: Some(view_id),
            ..*self
        }
    }
}

/// Receives the time each handler invocation took.
pub trait ViewProfiler: Send + Sync {
    /// Record that `view` spent `elapsed` handling `event`.
    fn register_time_spent(&self, view: &str, event: &EventData, elapsed: Duration);
}

/// Profiler that discards every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProfiler;

impl ViewProfiler for NullProfiler {
    fn register_time_spent(&self, _view: &str, _event: &EventData, _elapsed: Duration) {}
}

/// Cache slot value meaning "not cached".
const NOT_CACHED: i64 = i64::MIN;

/// Runs one view: applies batches, tracks and reports its position.
pub struct ViewManager<V: View> {
    store: Arc<dyn ViewStore<V>>,
    handlers: ViewHandlers<V>,
    locator: Arc<dyn ViewLocator>,
    cached_position: AtomicI64,
    /// Bumped by every purge; a batch started under an older epoch is
    /// dropped instead of written.
    purge_epoch: AtomicU64,
    /// Serializes batch writes, purges and position refreshes.
    write_lock: Mutex<()>,
}

impl<V: View> ViewManager<V> {
    /// Create a manager persisting to `store`, using the view's own
    /// locator.
    pub fn new(store: Arc<dyn ViewStore<V>>) -> Self {
        Self::with_locator(store, V::locator())
    }

    /// Create a manager with a custom locator.
    pub fn with_locator(store: Arc<dyn ViewStore<V>>, locator: Arc<dyn ViewLocator>) -> Self {
        Self {
            store,
            handlers: ViewHandlers::build(),
            locator,
            cached_position: AtomicI64::new(NOT_CACHED),
            purge_epoch: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Apply `events` (ascending global order) and advance the position to
    /// their maximum.
    ///
    /// A batch overtaken by a purge is dropped: nothing is written and the
    /// view is left empty for the next catch-up. Instances are persisted
    /// before the position document.
    ///
    /// # Errors
    ///
    /// [`ViewError`] from a locator, a handler, or the store. Nothing is
    /// persisted for the batch in that case.
    pub fn dispatch(
        &self,
        ctx: &DispatchContext<'_>,
        events: &[EventData],
        profiler: &dyn ViewProfiler,
    ) -> Result<(), ViewError> {
        let epoch = self.purge_epoch.load(Ordering::Acquire);
        let Some(batch_max) = events.iter().map(EventData::global_sequence).max() else {
            return Ok(());
        };

        let mut touched: HashMap<String, ViewDocument<V>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for event in events {
            let Some(handle) = self.handlers.by_type.get(event.event_type()) else {
                continue;
            };
            let locate = ctx.locate(event, events);
            for id in self.locator.view_ids(event, &locate)? {
                let doc = match touched.entry(id) {
                    Entry::Occupied(slot) => slot.into_mut(),
                    Entry::Vacant(slot) => {
                        let doc = self
                            .store
                            .load(slot.key())?
                            .unwrap_or_else(|| ViewDocument::new(slot.key().clone()));
                        order.push(slot.key().clone());
                        slot.insert(doc)
                    }
                };
                let global = event.global_sequence();
                if global <= doc.last_global_sequence {
                    continue;
                }
                let started = Instant::now();
                handle(&mut doc.state, &locate.for_instance(&doc.id), &event.payload)?;
                profiler.register_time_spent(V::NAME, event, started.elapsed());
                doc.last_global_sequence = global;
            }
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.purge_epoch.load(Ordering::Acquire) != epoch {
            tracing::debug!(view = V::NAME, "purged during dispatch; dropping batch");
            return Ok(());
        }
        for id in &order {
            if let Some(doc) = touched.get(id) {
                self.store.upsert(doc)?;
            }
        }
        self.store.set_position(batch_max)?;
        self.cached_position.store(batch_max, Ordering::Release);
        tracing::debug!(
            view = V::NAME,
            events = events.len(),
            instances = order.len(),
            position = batch_max,
            "view batch applied"
        );
        Ok(())
    }

    /// Highest global sequence this view has durably applied.
    ///
    /// With `allow_cache` the last known value is returned without touching
    /// the store. Otherwise the position document is read, falling back to
    /// the lowest instance watermark, then [`NO_SEQUENCE`]. The cache is
    /// refreshed with the result.
    ///
    /// # Errors
    ///
    /// [`ViewError`] if the store cannot be read.
    pub fn position(&self, allow_cache: bool) -> Result<i64, ViewError> {
        if allow_cache {
            let cached = self.cached_position.load(Ordering::Acquire);
            if cached != NOT_CACHED {
                return Ok(cached);
            }
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let position = match self.store.get_position()? {
            Some(position) => position,
            None => self
                .store
                .min_last_global_sequence()?
                .unwrap_or(NO_SEQUENCE),
        };
        self.cached_position.store(position, Ordering::Release);
        Ok(position)
    }

    /// Delete every instance and reset the position to [`NO_SEQUENCE`].
    ///
    /// Waits for an in-flight batch write to finish; a batch still being
    /// folded is dropped.
    ///
    /// # Errors
    ///
    /// [`ViewError`] if the store cannot be cleared.
    pub fn purge(&self) -> Result<(), ViewError> {
        let guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge_epoch.fetch_add(1, Ordering::AcqRel);
        let result = self.store.delete_all();
        self.cached_position.store(
            if result.is_ok() { NO_SEQUENCE } else { NOT_CACHED },
            Ordering::Release,
        );
        drop(guard);
        tracing::info!(view = V::NAME, ok = result.is_ok(), "view purged");
        result
    }

    /// State of instance `id`, or `None` if it was never written.
    ///
    /// # Errors
    ///
    /// [`ViewError`] if the store cannot be read.
    pub fn load(&self, id: &str) -> Result<Option<V>, ViewError> {
        Ok(self.store.load(id)?.map(|doc| doc.state))
    }

    /// Wait until this view has applied `result`'s events.
    ///
    /// Returns at once when the command emitted nothing.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] if the position is not reached within
    /// `timeout`.
    pub async fn wait_until_processed(
        &self,
        result: &CommandProcessingResult,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        let Some(target) = consistency::target_of(result) else {
            return Ok(());
        };
        consistency::wait_for_position(target, timeout, |allow_cache| {
            self.position(allow_cache)
        })
        .await
    }
}

impl<V: View> fmt::Debug for ViewManager<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewManager")
            .field("name", &V::NAME)
            .field("handlers", &self.handlers)
            .field("cached_position", &self.cached_position.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Type-erased view, as held by the catch-up dispatcher.
pub trait CatchUpView: Send + Sync {
    /// The view's name.
    fn name(&self) -> &'static str;

    /// See [`ViewManager::position`].
    ///
    /// # Errors
    ///
    /// [`ViewError`] if the store cannot be read.
    fn position(&self, allow_cache: bool) -> Result<i64, ViewError>;

    /// See [`ViewManager::dispatch`].
    ///
    /// # Errors
    ///
    /// [`ViewError`] from a locator, a handler, or the store.
    fn dispatch(
        &self,
        ctx: &DispatchContext<'_>,
        events: &[EventData],
        profiler: &dyn ViewProfiler,
    ) -> Result<(), ViewError>;

    /// See [`ViewManager::purge`].
    ///
    /// # Errors
    ///
    /// [`ViewError`] if the store cannot be cleared.
    fn purge(&self) -> Result<(), ViewError>;

    /// Upcast for typed lookup.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<V: View> CatchUpView for ViewManager<V> {
    fn name(&self) -> &'static str {
        V::NAME
    }

    fn position(&self, allow_cache: bool) -> Result<i64, ViewError> {
        ViewManager::position(self, allow_cache)
    }

    fn dispatch(
        &self,
        ctx: &DispatchContext<'_>,
        events: &[EventData],
        profiler: &dyn ViewProfiler,
    ) -> Result<(), ViewError> {
        ViewManager::dispatch(self, ctx, events, profiler)
    }

    fn purge(&self) -> Result<(), ViewError> {
        ViewManager::purge(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::test_fixtures::{Seen, Totals};
    use super::*;
    use crate::aggregate::test_fixtures::{Added, Counter, Incremented, repository};
    use crate::event::{EventMetadata, encode_payload};
    use crate::locator::{GLOBAL_INSTANCE_ID, GlobalInstance};
    use crate::storage::{EventStore, InMemoryEventStore};
    use crate::view_store::{FileViewStore, InMemoryViewStore};

    fn counter_event<E: DomainEvent>(id: &str, local: i64, global: i64, event: &E) -> EventData {
        EventData::new(
            EventMetadata {
                aggregate_id: Some(id.to_owned()),
                local_sequence: Some(local),
                global_sequence: Some(global),
                owner: Some(Counter::OWNER.to_owned()),
                event_type: Some(E::EVENT_TYPE.to_owned()),
                batch_id: Some(Uuid::nil()),
                time_utc: Some(0),
                ..EventMetadata::default()
            },
            encode_payload(event).expect("encode"),
        )
    }

    fn batch() -> Vec<EventData> {
        vec![
            counter_event("a", 0, 0, &Incremented),
            counter_event("b", 0, 1, &Added { amount: 5 }),
            counter_event("a", 1, 2, &Added { amount: 3 }),
        ]
    }

    fn in_memory<V: View>() -> (Arc<InMemoryViewStore<V>>, ViewManager<V>) {
        let store = Arc::new(InMemoryViewStore::new());
        let manager = ViewManager::new(store.clone());
        (store, manager)
    }

    #[test]
    fn dispatch_updates_instances_and_position() {
        let (_, repo) = repository();
        let items = HashMap::new();
        let ctx = DispatchContext::new(&repo, &items);
        let (_, manager) = in_memory::<Totals>();

        assert_eq!(manager.position(false).expect("position"), NO_SEQUENCE);
        manager
            .dispatch(&ctx, &batch(), &NullProfiler)
            .expect("dispatch");

        assert_eq!(manager.position(true).expect("position"), 2);
        assert_eq!(manager.position(false).expect("position"), 2);
        let a = manager.load("a").expect("load").expect("a exists");
        assert_eq!(a, Totals { total: 4, events: 2 });
        let b = manager.load("b").expect("load").expect("b exists");
        assert_eq!(b.total, 5);
    }

    #[test]
    fn redelivered_events_are_skipped_per_instance() {
        let (_, repo) = repository();
        let items = HashMap::new();
        let ctx = DispatchContext::new(&repo, &items);
        let (_, manager) = in_memory::<Totals>();

        manager.dispatch(&ctx, &batch(), &NullProfiler).expect("first");
        manager.dispatch(&ctx, &batch(), &NullProfiler).expect("again");

        let a = manager.load("a").expect("load").expect("a exists");
        assert_eq!(a.events, 2);
    }

    #[test]
    fn global_locator_folds_everything_into_one_instance() {
        let (_, repo) = repository();
        let items = HashMap::new();
        let ctx = DispatchContext::new(&repo, &items);
        let manager: ViewManager<Totals> =
            ViewManager::with_locator(Arc::new(InMemoryViewStore::new()), Arc::new(GlobalInstance));

        manager.dispatch(&ctx, &batch(), &NullProfiler).expect("dispatch");
        let global = manager
            .load(GLOBAL_INSTANCE_ID)
            .expect("load")
            .expect("global exists");
        assert_eq!(global.total, 9);
        assert!(manager.load("a").expect("load").is_none());
    }

    #[test]
    fn position_falls_back_to_lowest_instance() {
        let (store, manager) = in_memory::<Totals>();
        store
            .upsert(&ViewDocument {
                id: "x".into(),
                last_global_sequence: 8,
                state: Totals::default(),
            })
            .expect("upsert");
        store
            .upsert(&ViewDocument {
                id: "y".into(),
                last_global_sequence: 5,
                state: Totals::default(),
            })
            .expect("upsert");
        assert_eq!(manager.position(false).expect("position"), 5);
    }

    #[test]
    fn file_store_survives_lost_position_document() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let (_, repo) = repository();
        let items = HashMap::new();
        let ctx = DispatchContext::new(&repo, &items);

        let manager: ViewManager<Totals> =
            ViewManager::new(Arc::new(FileViewStore::new(dir.path())));
        manager.dispatch(&ctx, &batch(), &NullProfiler).expect("dispatch");
        std::fs::remove_file(dir.path().join("position.json")).expect("remove position");

        let reopened: ViewManager<Totals> =
            ViewManager::new(Arc::new(FileViewStore::new(dir.path())));
        // "b" last saw global 1, "a" saw 2; the lower one bounds the resume point.
        assert_eq!(reopened.position(true).expect("position"), 1);
    }

    #[test]
    fn purge_resets_position_and_instances() {
        let (_, repo) = repository();
        let items = HashMap::new();
        let ctx = DispatchContext::new(&repo, &items);
        let (_, manager) = in_memory::<Totals>();

        manager.dispatch(&ctx, &batch(), &NullProfiler).expect("dispatch");
        manager.purge().expect("purge");

        assert_eq!(manager.position(true).expect("position"), NO_SEQUENCE);
        assert!(manager.load("a").expect("load").is_none());
    }

    /// Store that purges its manager the first time an armed load runs.
    #[derive(Default)]
    struct PurgeOnLoad {
        inner: InMemoryViewStore<Totals>,
        manager: Mutex<Option<Arc<ViewManager<Totals>>>>,
    }

    impl ViewStore<Totals> for PurgeOnLoad {
        fn load(&self, id: &str) -> Result<Option<ViewDocument<Totals>>, ViewError> {
            let armed = self.manager.lock().expect("lock").take();
            if let Some(manager) = armed {
                manager.purge()?;
            }
            self.inner.load(id)
        }

        fn upsert(&self, doc: &ViewDocument<Totals>) -> Result<(), ViewError> {
            self.inner.upsert(doc)
        }

        fn delete_all(&self) -> Result<(), ViewError> {
            self.inner.delete_all()
        }

        fn min_last_global_sequence(&self) -> Result<Option<i64>, ViewError> {
            self.inner.min_last_global_sequence()
        }

        fn get_position(&self) -> Result<Option<i64>, ViewError> {
            self.inner.get_position()
        }

        fn set_position(&self, position: i64) -> Result<(), ViewError> {
            self.inner.set_position(position)
        }
    }

    #[test]
    fn purge_during_dispatch_drops_the_batch() {
        let (_, repo) = repository();
        let items = HashMap::new();
        let ctx = DispatchContext::new(&repo, &items);
        let store = Arc::new(PurgeOnLoad::default());
        let manager = Arc::new(ViewManager::<Totals>::new(store.clone()));

        manager.dispatch(&ctx, &batch(), &NullProfiler).expect("first batch");
        *store.manager.lock().expect("lock") = Some(manager.clone());
        let late = vec![counter_event("c", 0, 3, &Incremented)];
        manager.dispatch(&ctx, &late, &NullProfiler).expect("second batch");

        assert_eq!(manager.position(true).expect("position"), NO_SEQUENCE);
        assert_eq!(manager.position(false).expect("position"), NO_SEQUENCE);
        for id in ["a", "b", "c"] {
            assert!(manager.load(id).expect("load").is_none(), "{id} survived purge");
        }
    }

    #[test]
    fn handler_loads_are_bounded_by_event_position() {
        let (store, repo): (InMemoryEventStore, Repository) = repository();
        let events = vec![
            counter_event("c", 0, 0, &Incremented),
            counter_event("c", 1, 1, &Added { amount: 10 }),
            counter_event("c", 2, 2, &Incremented),
        ];
        store.append(Uuid::new_v4(), &events).expect("append");
        let stored: Vec<EventData> = store
            .stream_all(0)
            .expect("stream")
            .collect::<Result<_, _>>()
            .expect("read");

        let items = HashMap::new();
        let ctx = DispatchContext::new(&repo, &items);
        let (_, manager) = in_memory::<Seen>();
        manager.dispatch(&ctx, &stored, &NullProfiler).expect("dispatch");

        let seen = manager.load("c").expect("load").expect("c exists");
        assert_eq!(seen.values, vec![1, 12]);
    }

    struct Recording(Mutex<Vec<(String, i64)>>);

    impl ViewProfiler for Recording {
        fn register_time_spent(&self, view: &str, event: &EventData, _elapsed: Duration) {
            self.0
                .lock()
                .expect("lock")
                .push((view.to_owned(), event.global_sequence()));
        }
    }

    #[test]
    fn profiler_sees_each_handled_event() {
        let (_, repo) = repository();
        let items = HashMap::new();
        let ctx = DispatchContext::new(&repo, &items);
        let (_, manager) = in_memory::<Totals>();
        let profiler = Recording(Mutex::new(Vec::new()));

        manager.dispatch(&ctx, &batch(), &profiler).expect("dispatch");
        let seen = profiler.0.lock().expect("lock").clone();
        assert_eq!(
            seen,
            vec![
                ("totals".to_owned(), 0),
                ("totals".to_owned(), 1),
                ("totals".to_owned(), 2)
            ]
        );
    }

    #[tokio::test]
    async fn wait_returns_immediately_without_events() {
        let (_, manager) = in_memory::<Totals>();
        manager
            .wait_until_processed(&CommandProcessingResult::no_events(), Duration::ZERO)
            .await
            .expect("nothing to wait for");
    }

    #[tokio::test]
    async fn wait_times_out_when_view_lags() {
        let (_, manager) = in_memory::<Totals>();
        let err = manager
            .wait_until_processed(
                &CommandProcessingResult::with_position(3),
                Duration::from_millis(50),
            )
            .await
            .expect_err("view never advances");
        assert!(matches!(
            err,
            WaitError::Timeout(t) if t.target == 3 && t.reached == NO_SEQUENCE
        ));
    }
}
