//! Command processing: execute, number, append, retry, notify.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::command::{Command, CommandContext, UnitOfWork};
use crate::consistency::CommandProcessingResult;
use crate::error::{CommandError, StoreError};
use crate::event::EventData;
use crate::repository::Repository;

/// Command processor tuning.
///
/// # Examples
///
/// ```
/// use replay_es::ProcessorConfig;
///
/// let config = ProcessorConfig { max_retries: 3 };
/// assert_eq!(config.max_retries, 3);
/// assert_eq!(ProcessorConfig::default().max_retries, 10);
/// ```
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How many times a command is re-executed after losing an append
    /// race. The command runs at most `max_retries + 1` times.
    ///
    /// Default: 10.
    pub max_retries: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { max_retries: 10 }
    }
}

/// Receives every batch the processor commits.
pub trait EventDispatcher: Send + Sync {
    /// Called once per committed batch, with events in global order.
    /// Must not block.
    fn dispatch(&self, events: &[EventData]);
}

/// Dispatcher that ignores every batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventDispatcher;

impl EventDispatcher for NullEventDispatcher {
    fn dispatch(&self, _events: &[EventData]) {}
}

/// Runs commands against the repository and commits what they emit.
#[derive(Clone)]
pub struct CommandProcessor {
    repository: Repository,
    dispatcher: Arc<dyn EventDispatcher>,
    config: ProcessorConfig,
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("repository", &self.repository)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CommandProcessor {
    /// Create a processor that hands committed batches to `dispatcher`.
    pub fn new(
        repository: Repository,
        dispatcher: Arc<dyn EventDispatcher>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            config,
        }
    }

    /// The repository commands load aggregates from.
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Process `command` with an empty [`CommandContext`].
    ///
    /// # Errors
    ///
    /// See [`process_with_context`](CommandProcessor::process_with_context).
    pub fn process<C: Command>(
        &self,
        command: &C,
    ) -> Result<CommandProcessingResult, CommandError<C::Error>> {
        self.process_with_context(command, CommandContext::default())
    }

    /// Process `command`, stamping `context` onto every emitted event.
    ///
    /// Each attempt runs the command in a fresh [`UnitOfWork`], numbers
    /// the emitted events from the store's high-water mark, and appends
    /// them as one batch. A lost race re-runs the whole command.
    ///
    /// # Errors
    ///
    /// - [`CommandError::Domain`] as returned by the command.
    /// - [`CommandError::Processing`] for aggregate or store failures; no
    ///   events were saved.
    /// - [`CommandError::Conflict`] when every attempt lost its race.
    pub fn process_with_context<C: Command>(
        &self,
        command: &C,
        context: CommandContext,
    ) -> Result<CommandProcessingResult, CommandError<C::Error>> {
        let span = tracing::info_span!("process_command", command = std::any::type_name::<C>());
        let _guard = span.enter();
        let attempts = self.config.max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let mut uow = UnitOfWork::new(self.repository.clone(), context.clone());
            match command.execute(&mut uow) {
                Ok(()) => {}
                Err(CommandError::Aggregate(e)) => return Err(processing(command, e)),
                Err(e) => return Err(e),
            }

            let mut events = uow.into_emitted();
            if events.is_empty() {
                tracing::debug!("command emitted no events");
                return Ok(CommandProcessingResult::no_events());
            }

            let store = self.repository.event_store();
            let first_global = store
                .last_global_seq()
                .map_err(|e| processing(command, e))?
                + 1;
            let batch_id = Uuid::new_v4();
            stamp(&mut events, first_global, batch_id, &context);

            match store.append(batch_id, &events) {
                Ok(()) => {
                    let last_global = first_global + events.len() as i64 - 1;
                    tracing::debug!(
                        %batch_id,
                        events = events.len(),
                        first_global,
                        last_global,
                        attempt,
                        "batch committed"
                    );
                    self.dispatcher.dispatch(&events);
                    return Ok(CommandProcessingResult::with_position(last_global));
                }
                Err(StoreError::Concurrency(reason)) => {
                    tracing::warn!(attempt, attempts, %reason, "append lost a race; retrying command");
                }
                Err(e) => return Err(processing(command, e)),
            }
        }

        tracing::error!(attempts, "giving up after repeated concurrency conflicts");
        Err(CommandError::Conflict { attempts })
    }
}

/// Assign global sequences in emission order, plus batch, time and
/// command metadata.
fn stamp(events: &mut [EventData], first_global: i64, batch_id: Uuid, context: &CommandContext) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    for (global, event) in (first_global..).zip(events.iter_mut()) {
        let meta = &mut event.meta;
        meta.global_sequence = Some(global);
        meta.batch_id = Some(batch_id);
        meta.time_utc = Some(now);
        meta.actor.clone_from(&context.actor);
        meta.correlation_id.clone_from(&context.correlation_id);
        meta.extra.clone_from(&context.metadata);
    }
}

fn processing<C: Command>(
    command: &C,
    source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> CommandError<C::Error> {
    let source = source.into();
    tracing::warn!(error = %source, "command processing failed");
    CommandError::Processing {
        command: format!("{command:?}"),
        source,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::aggregate::test_fixtures::{Counter, Incremented, registry};
    use crate::error::AggregateError;
    use crate::event::{EventMetadata, encode_payload};
    use crate::storage::{EventStore, EventStream, InMemoryEventStore};

    #[derive(Debug, thiserror::Error)]
    #[error("rejected by domain rule")]
    struct Rejected;

    #[derive(Debug)]
    struct Increment {
        id: &'static str,
        times: usize,
    }

    impl Command for Increment {
        type Error = Rejected;

        fn execute(&self, uow: &mut UnitOfWork) -> Result<(), CommandError<Rejected>> {
            let counter = uow.get_or_create::<Counter>(self.id)?;
            for _ in 0..self.times {
                counter.emit(Incremented)?;
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Refuse;

    impl Command for Refuse {
        type Error = Rejected;

        fn execute(&self, uow: &mut UnitOfWork) -> Result<(), CommandError<Rejected>> {
            uow.get_or_create::<Counter>("c-1")?.emit(Incremented)?;
            Err(CommandError::Domain(Rejected))
        }
    }

    #[derive(Debug)]
    struct TouchMissing;

    impl Command for TouchMissing {
        type Error = Rejected;

        fn execute(&self, uow: &mut UnitOfWork) -> Result<(), CommandError<Rejected>> {
            uow.load::<Counter>("missing")?.emit(Incremented)?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collecting(Mutex<Vec<Vec<EventData>>>);

    impl EventDispatcher for Collecting {
        fn dispatch(&self, events: &[EventData]) {
            self.0.lock().expect("lock").push(events.to_vec());
        }
    }

    fn processor(
        store: Arc<dyn EventStore>,
        config: ProcessorConfig,
    ) -> (Arc<Collecting>, CommandProcessor) {
        let dispatcher = Arc::new(Collecting::default());
        let repository = Repository::new(store, registry());
        let processor = CommandProcessor::new(repository, dispatcher.clone(), config);
        (dispatcher, processor)
    }

    #[test]
    fn committed_events_are_numbered_stamped_and_dispatched() {
        let store = InMemoryEventStore::new();
        let (dispatched, processor) =
            processor(Arc::new(store.clone()), ProcessorConfig::default());

        let ctx = CommandContext::default()
            .with_actor("user-1")
            .with_correlation_id("req-7")
            .with_metadata(json!({"source": "test"}));
        let first = processor
            .process(&Increment { id: "c-1", times: 2 })
            .expect("first command");
        let second = processor
            .process_with_context(&Increment { id: "c-2", times: 1 }, ctx)
            .expect("second command");

        assert_eq!(first.new_position(), Some(1));
        assert_eq!(second.new_position(), Some(2));
        assert_eq!(store.last_global_seq().expect("read"), 2);

        let batches = dispatched.0.lock().expect("lock");
        assert_eq!(batches.len(), 2);
        let event = &batches[1][0];
        assert!(event.is_complete());
        assert_eq!(event.global_sequence(), 2);
        assert_eq!(event.meta.actor.as_deref(), Some("user-1"));
        assert_eq!(event.meta.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(event.meta.extra, Some(json!({"source": "test"})));
        let unstamped = &batches[0][0].meta;
        assert_eq!(
            (&unstamped.actor, &unstamped.correlation_id, &unstamped.extra),
            (&None, &None, &None)
        );
        assert_eq!(batches[0][0].meta.batch_id, batches[0][1].meta.batch_id);
        assert_ne!(batches[0][0].meta.batch_id, batches[1][0].meta.batch_id);
    }

    #[test]
    fn command_without_events_appends_nothing() {
        let store = InMemoryEventStore::new();
        let (dispatched, processor) =
            processor(Arc::new(store.clone()), ProcessorConfig::default());
        let result = processor
            .process(&Increment { id: "c-1", times: 0 })
            .expect("no-op command");
        assert!(!result.events_emitted());
        assert!(store.is_empty());
        assert!(dispatched.0.lock().expect("lock").is_empty());
    }

    #[test]
    fn domain_error_passes_through_and_discards_events() {
        let store = InMemoryEventStore::new();
        let (_, processor) = processor(Arc::new(store.clone()), ProcessorConfig::default());
        let err = processor.process(&Refuse).expect_err("refused");
        assert!(err.is_domain());
        assert!(store.is_empty());
    }

    #[test]
    fn aggregate_error_is_wrapped_with_command_description() {
        let (_, processor) = processor(
            Arc::new(InMemoryEventStore::new()),
            ProcessorConfig::default(),
        );
        match processor.process(&TouchMissing).expect_err("missing aggregate") {
            CommandError::Processing { command, source } => {
                assert_eq!(command, "TouchMissing");
                assert!(
                    source
                        .downcast_ref::<AggregateError>()
                        .is_some_and(|e| matches!(e, AggregateError::NotFound { .. }))
                );
            }
            other => panic!("expected processing error, got {other:?}"),
        }
    }

    /// Lets a competing writer take the next global sequence before each of
    /// the first `races` appends.
    struct RacingStore {
        inner: InMemoryEventStore,
        races: AtomicU32,
        appends: AtomicU32,
    }

    impl RacingStore {
        fn new(races: u32) -> Self {
            Self {
                inner: InMemoryEventStore::new(),
                races: AtomicU32::new(races),
                appends: AtomicU32::new(0),
            }
        }

        fn competing_write(&self) {
            let global = self.inner.last_global_seq().expect("read") + 1;
            let local = self.inner.load("rival", 0).expect("load").len() as i64;
            let event = EventData::new(
                EventMetadata {
                    aggregate_id: Some("rival".into()),
                    local_sequence: Some(local),
                    global_sequence: Some(global),
                    owner: Some("counter".into()),
                    event_type: Some("Incremented".into()),
                    time_utc: Some(0),
                    ..EventMetadata::default()
                },
                encode_payload(&Incremented).expect("encode"),
            );
            self.inner
                .append(Uuid::new_v4(), &[event])
                .expect("competing append");
        }
    }

    impl EventStore for RacingStore {
        fn append(&self, batch_id: Uuid, events: &[EventData]) -> Result<(), StoreError> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            let remaining = self.races.load(Ordering::SeqCst);
            if remaining > 0 {
                self.races.store(remaining - 1, Ordering::SeqCst);
                self.competing_write();
            }
            self.inner.append(batch_id, events)
        }

        fn load(&self, id: &str, from: i64) -> Result<Vec<EventData>, StoreError> {
            self.inner.load(id, from)
        }

        fn stream_all(&self, from: i64) -> Result<EventStream<'_>, StoreError> {
            self.inner.stream_all(from)
        }

        fn last_global_seq(&self) -> Result<i64, StoreError> {
            self.inner.last_global_seq()
        }
    }

    #[test]
    fn lost_race_reruns_command_against_fresh_state() {
        let racing = Arc::new(RacingStore::new(2));
        let (_, processor) = processor(racing.clone(), ProcessorConfig::default());

        let result = processor
            .process(&Increment { id: "c-1", times: 1 })
            .expect("succeeds on third attempt");

        assert_eq!(racing.appends.load(Ordering::SeqCst), 3);
        assert_eq!(result.new_position(), Some(2));
        assert_eq!(
            processor.repository().load::<Counter>("c-1").expect("load").value,
            1
        );
    }

    #[test]
    fn exhausted_retries_report_conflict() {
        let racing = Arc::new(RacingStore::new(u32::MAX));
        let (dispatched, processor) = processor(racing, ProcessorConfig { max_retries: 2 });

        let err = processor
            .process(&Increment { id: "c-1", times: 1 })
            .expect_err("never wins");
        assert!(matches!(err, CommandError::Conflict { attempts: 3 }));
        assert!(dispatched.0.lock().expect("lock").is_empty());
    }
}
