//! Event-sourcing runtime: an ordered event log, aggregate replay, and
//! catch-up views.
//!
//! Aggregates are rebuilt by replaying their events; commands emit new
//! events through a [`UnitOfWork`] and are committed as one batch by the
//! [`CommandProcessor`]. A [`CatchUpDispatcher`] keeps every registered
//! [`View`] in step with the log on a background thread, and
//! [`CommandProcessingResult`]s let callers wait until their own writes are
//! visible.

mod aggregate;
mod command;
mod consistency;
mod dispatcher;
mod error;
mod event;
pub mod locator;
mod persist;
mod processor;
mod registry;
mod repository;
mod runtime;
mod snapshot;
mod storage;
mod validation;
mod view;
mod view_store;

pub use aggregate::{Aggregate, Appliers, ApplyContext, DomainEvent, ReplayState, Root};
pub use command::{Command, CommandContext, UnitOfWork};
pub use consistency::{CommandProcessingResult, POLL_INTERVAL};
pub use dispatcher::{CatchUpDispatcher, CatchUpWork, DispatcherConfig};
pub use error::{
    AggregateError, BuildError, CommandError, ConsistencyTimeout, DispatchError, RegistryError,
    StoreError, ViewError, WaitError,
};
pub use event::{EventData, EventMetadata, NO_SEQUENCE, decode_payload, encode_payload};
pub use locator::{GlobalInstance, InstancePerAggregate, ViewLocator};
pub use processor::{CommandProcessor, EventDispatcher, NullEventDispatcher, ProcessorConfig};
pub use registry::AggregateRegistry;
pub use repository::Repository;
pub use runtime::{Runtime, RuntimeBuilder};
pub use snapshot::{
    FileSnapshotStore, InMemorySnapshotStore, SnapshotPolicy, SnapshotRecord, SnapshotStore,
    snapshot_path,
};
pub use storage::{EventStore, EventStream, InMemoryEventStore};
pub use validation::{validate_batch, validate_continuation};
pub use view::{
    CatchUpView, DispatchContext, NullProfiler, View, ViewContext, ViewHandlers, ViewManager,
    ViewProfiler,
};
pub use view_store::{FileViewStore, InMemoryViewStore, ViewDocument, ViewStore};
