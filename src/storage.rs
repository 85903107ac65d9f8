//! Event store contract and the in-memory reference backend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{EventData, NO_SEQUENCE};
use crate::validation::{in_global_order, validate_batch, validate_continuation};

/// Lazily evaluated, ascending sequence of events read from a store.
pub type EventStream<'a> = Box<dyn Iterator<Item = Result<EventData, StoreError>> + Send + 'a>;

/// Append-only, globally ordered event log.
///
/// # Contract
///
/// - [`append`](EventStore::append) validates the batch with
///   [`validate_batch`] and [`validate_continuation`] before any write, then
///   writes it atomically in global order. A global sequence or an
///   `(aggregate id, local sequence)` pair that is already taken surfaces as
///   [`StoreError::Concurrency`], never as an I/O error.
/// - Both reads take a starting cursor so callers can page through the log
///   in bounded batches.
pub trait EventStore: Send + Sync {
    /// Atomically append a batch, stamping every event with `batch_id`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidBatch`] if the batch is malformed or an event
    ///   lacks required metadata.
    /// - [`StoreError::Concurrency`] if another writer got there first.
    fn append(&self, batch_id: Uuid, events: &[EventData]) -> Result<(), StoreError>;

    /// Load one aggregate's events with local sequence `>= from_local_seq`,
    /// ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend cannot be read.
    fn load(&self, aggregate_id: &str, from_local_seq: i64) -> Result<Vec<EventData>, StoreError>;

    /// Stream every event with global sequence `>= from_global_seq`,
    /// ascending, across all aggregates.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the stream cannot be opened. Failures while
    /// iterating are yielded as `Err` items.
    fn stream_all(&self, from_global_seq: i64) -> Result<EventStream<'_>, StoreError>;

    /// Highest global sequence in the log, or [`NO_SEQUENCE`] when empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend cannot be read.
    fn last_global_seq(&self) -> Result<i64, StoreError>;
}

impl<S: EventStore + ?Sized> EventStore for Arc<S> {
    fn append(&self, batch_id: Uuid, events: &[EventData]) -> Result<(), StoreError> {
        (**self).append(batch_id, events)
    }

    fn load(&self, aggregate_id: &str, from_local_seq: i64) -> Result<Vec<EventData>, StoreError> {
        (**self).load(aggregate_id, from_local_seq)
    }

    fn stream_all(&self, from_global_seq: i64) -> Result<EventStream<'_>, StoreError> {
        (**self).stream_all(from_global_seq)
    }

    fn last_global_seq(&self) -> Result<i64, StoreError> {
        (**self).last_global_seq()
    }
}

/// In-memory index structures behind [`InMemoryEventStore`].
///
/// `events` is sorted by global sequence. Each entry in `streams` lists the
/// positions in `events` belonging to one aggregate; since local sequences
/// start at 0 and are gap-free, the index in that list is the local sequence.
#[derive(Debug, Default)]
struct EventLog {
    events: Vec<EventData>,
    streams: HashMap<String, Vec<usize>>,
}

impl EventLog {
    fn last_local(&self, aggregate_id: &str) -> i64 {
        self.streams
            .get(aggregate_id)
            .map_or(NO_SEQUENCE, |positions| positions.len() as i64 - 1)
    }

    fn last_global(&self) -> i64 {
        self.events.last().map_or(NO_SEQUENCE, EventData::global_sequence)
    }

    /// First position in `events` with global sequence `>= from`.
    fn position_of(&self, from: i64) -> usize {
        self.events.partition_point(|e| e.global_sequence() < from)
    }
}

/// Number of events copied out of the log per lock acquisition while
/// streaming.
const STREAM_PAGE: usize = 256;

/// Event store held entirely in memory.
///
/// Cheap to clone; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<EventLog>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events in the log.
    pub fn len(&self) -> usize {
        self.read_log(|log| log.events.len())
    }

    /// Returns `true` if nothing has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_log<T>(&self, f: impl FnOnce(&EventLog) -> T) -> T {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        f(&log)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, batch_id: Uuid, events: &[EventData]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        validate_batch(batch_id, events)?;

        let stamped: Vec<EventData> = in_global_order(events)
            .into_iter()
            .map(|e| {
                let mut e = e.clone();
                e.meta.batch_id = Some(batch_id);
                e
            })
            .collect();
        if let Some(incomplete) = stamped.iter().find(|e| !e.is_complete()) {
            return Err(StoreError::invalid(
                batch_id,
                format!(
                    "event at global sequence {} is missing required metadata",
                    incomplete.global_sequence()
                ),
            ));
        }

        let mut log = self.log.write().unwrap_or_else(PoisonError::into_inner);
        validate_continuation(batch_id, &stamped, |id| log.last_local(id))?;

        let first_global = stamped[0].global_sequence();
        if first_global <= log.last_global() {
            return Err(StoreError::Concurrency(format!(
                "global sequence {first_global} is not above the log's last global sequence {}",
                log.last_global()
            )));
        }

        for event in stamped {
            let position = log.events.len();
            log.streams
                .entry(event.aggregate_id().to_owned())
                .or_default()
                .push(position);
            log.events.push(event);
        }
        tracing::debug!(%batch_id, last_global = log.last_global(), "batch appended");
        Ok(())
    }

    fn load(&self, aggregate_id: &str, from_local_seq: i64) -> Result<Vec<EventData>, StoreError> {
        Ok(self.read_log(|log| {
            let Some(positions) = log.streams.get(aggregate_id) else {
                return Vec::new();
            };
            let start = usize::try_from(from_local_seq.max(0)).unwrap_or(usize::MAX);
            positions
                .iter()
                .skip(start)
                .map(|&p| log.events[p].clone())
                .collect()
        }))
    }

    fn stream_all(&self, from_global_seq: i64) -> Result<EventStream<'_>, StoreError> {
        Ok(Box::new(PagedStream {
            store: self,
            next_global: from_global_seq,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn last_global_seq(&self) -> Result<i64, StoreError> {
        Ok(self.read_log(EventLog::last_global))
    }
}

/// Cursor over an [`InMemoryEventStore`] that copies out one page at a time,
/// so the read lock is never held between `next` calls.
struct PagedStream<'a> {
    store: &'a InMemoryEventStore,
    next_global: i64,
    buffer: VecDeque<EventData>,
    exhausted: bool,
}

impl Iterator for PagedStream<'_> {
    type Item = Result<EventData, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            let from = self.next_global;
            let page: VecDeque<EventData> = self.store.read_log(|log| {
                let start = log.position_of(from);
                log.events[start..]
                    .iter()
                    .take(STREAM_PAGE)
                    .cloned()
                    .collect()
            });
            self.exhausted = page.len() < STREAM_PAGE;
            if let Some(last) = page.back() {
                self.next_global = last.global_sequence() + 1;
            }
            self.buffer = page;
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::stored;

    fn collect_stream(store: &InMemoryEventStore, from: i64) -> Vec<EventData> {
        store
            .stream_all(from)
            .expect("stream should open")
            .collect::<Result<Vec<_>, _>>()
            .expect("stream should not fail")
    }

    fn globals(events: &[EventData]) -> Vec<i64> {
        events.iter().map(EventData::global_sequence).collect()
    }

    fn locals(events: &[EventData]) -> Vec<i64> {
        events.iter().map(EventData::local_sequence).collect()
    }

    #[test]
    fn empty_store_reports_no_sequence() {
        let store = InMemoryEventStore::new();
        assert_eq!(store.last_global_seq().expect("read"), NO_SEQUENCE);
        assert!(store.is_empty());
        assert!(collect_stream(&store, 0).is_empty());
    }

    #[test]
    fn two_batches_are_readable_globally_and_per_aggregate() {
        let store = InMemoryEventStore::new();
        store
            .append(Uuid::new_v4(), &[stored("a", 0, 0)])
            .expect("first batch");
        store
            .append(Uuid::new_v4(), &[stored("a", 1, 1), stored("b", 0, 2)])
            .expect("second batch");

        assert_eq!(globals(&collect_stream(&store, 0)), vec![0, 1, 2]);
        assert_eq!(locals(&store.load("a", 0).expect("load a")), vec![0, 1]);
        assert_eq!(locals(&store.load("b", 0).expect("load b")), vec![0]);
        assert_eq!(store.last_global_seq().expect("read"), 2);
    }

    #[test]
    fn load_resumes_from_local_cursor() {
        let store = InMemoryEventStore::new();
        store
            .append(
                Uuid::new_v4(),
                &[stored("a", 0, 0), stored("a", 1, 1), stored("a", 2, 2)],
            )
            .expect("append");
        assert_eq!(locals(&store.load("a", 2).expect("load")), vec![2]);
        assert!(store.load("missing", 0).expect("load").is_empty());
    }

    #[test]
    fn stream_pages_past_one_page() {
        let store = InMemoryEventStore::new();
        let count = STREAM_PAGE as i64 * 2 + 3;
        let events: Vec<EventData> = (0..count).map(|i| stored("a", i, i)).collect();
        store.append(Uuid::new_v4(), &events).expect("append");

        let streamed = collect_stream(&store, 5);
        assert_eq!(streamed.len() as i64, count - 5);
        assert_eq!(streamed.first().map(EventData::global_sequence), Some(5));
        assert_eq!(streamed.last().map(EventData::global_sequence), Some(count - 1));
    }

    #[test]
    fn append_stamps_batch_id_and_writes_in_global_order() {
        let store = InMemoryEventStore::new();
        let batch_id = Uuid::new_v4();
        store
            .append(batch_id, &[stored("b", 0, 1), stored("a", 0, 0)])
            .expect("append");
        let all = collect_stream(&store, 0);
        assert_eq!(globals(&all), vec![0, 1]);
        assert!(all.iter().all(|e| e.meta.batch_id == Some(batch_id)));
    }

    #[test]
    fn local_gap_is_rejected_before_write() {
        let store = InMemoryEventStore::new();
        store
            .append(
                Uuid::new_v4(),
                &[stored("a", 0, 0), stored("a", 1, 1), stored("a", 2, 2)],
            )
            .expect("append");

        let result = store.append(Uuid::new_v4(), &[stored("a", 5, 3)]);
        assert!(matches!(result, Err(StoreError::InvalidBatch { .. })));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn duplicate_local_sequence_is_a_concurrency_error() {
        let store = InMemoryEventStore::new();
        store
            .append(Uuid::new_v4(), &[stored("a", 0, 0)])
            .expect("append");
        let result = store.append(Uuid::new_v4(), &[stored("a", 0, 1)]);
        assert!(matches!(result, Err(StoreError::Concurrency(_))));
    }

    #[test]
    fn duplicate_global_sequence_is_a_concurrency_error() {
        let store = InMemoryEventStore::new();
        store
            .append(Uuid::new_v4(), &[stored("a", 0, 0)])
            .expect("append");
        let result = store.append(Uuid::new_v4(), &[stored("b", 0, 0)]);
        assert!(matches!(result, Err(StoreError::Concurrency(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn incomplete_event_is_rejected() {
        let store = InMemoryEventStore::new();
        let mut event = stored("a", 0, 0);
        event.meta.owner = None;
        let result = store.append(Uuid::new_v4(), &[event]);
        assert!(matches!(result, Err(StoreError::InvalidBatch { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn failed_batch_leaves_log_untouched() {
        let store = InMemoryEventStore::new();
        store
            .append(Uuid::new_v4(), &[stored("a", 0, 0)])
            .expect("append");
        // "b" is fine on its own but "a" collides, so nothing is written.
        let result = store.append(Uuid::new_v4(), &[stored("b", 0, 1), stored("a", 0, 2)]);
        assert!(result.is_err());
        assert!(store.load("b", 0).expect("load").is_empty());
        assert_eq!(store.last_global_seq().expect("read"), 0);
    }
}
