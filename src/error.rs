//! Crate-level error types, one enum per layer.

use std::io;
use std::time::Duration;

use uuid::Uuid;

use crate::aggregate::ReplayState;

/// Error returned by an [`EventStore`](crate::EventStore) or its validator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An optimistic write lost a uniqueness race.
    ///
    /// Raised when a global sequence or an `(aggregate id, local sequence)`
    /// pair is already taken. Recoverable by re-running the whole command.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// The batch is structurally malformed. Never retried.
    #[error("invalid batch {batch_id}: {reason}")]
    InvalidBatch {
        /// Id of the rejected batch.
        batch_id: Uuid,
        /// Which rule the batch broke.
        reason: String,
    },

    /// Disk I/O failure in a storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn invalid(batch_id: Uuid, reason: impl Into<String>) -> Self {
        Self::InvalidBatch {
            batch_id,
            reason: reason.into(),
        }
    }
}

/// Error raised while hydrating, creating, or mutating an aggregate.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// No events exist for the id and creation was not requested.
    #[error("aggregate '{id}' not found")]
    NotFound {
        /// Requested aggregate id.
        id: String,
    },

    /// An event's local sequence does not follow the aggregate's current one.
    ///
    /// Fatal: gaps and repeats are never skipped.
    #[error(
        "replay corruption on aggregate '{id}': expected local sequence {expected}, got {actual}"
    )]
    ReplayCorruption {
        /// Aggregate being applied to.
        id: String,
        /// `current_sequence + 1`.
        expected: i64,
        /// Local sequence carried by the offending event.
        actual: i64,
    },

    /// The stored owner tag belongs to a different aggregate type.
    #[error("aggregate '{id}' is a '{actual}', not a '{expected}'")]
    TypeMismatch {
        /// Aggregate id.
        id: String,
        /// Owner tag of the requested type.
        expected: &'static str,
        /// Owner tag found in the stream.
        actual: String,
    },

    /// The stream's owner tag is not in the aggregate registry.
    #[error("aggregate '{id}' has unregistered owner tag '{owner}'")]
    UnknownOwner {
        /// Aggregate id.
        id: String,
        /// Owner tag found in the stream.
        owner: String,
    },

    /// The requested aggregate type was never registered.
    #[error("aggregate type '{owner}' is not registered")]
    Unregistered {
        /// Owner tag of the requested type.
        owner: &'static str,
    },

    /// `emit` called while an event is being applied.
    #[error("cannot emit on aggregate '{id}' while in replay state {state:?}")]
    IllegalEmit {
        /// Aggregate id.
        id: String,
        /// State at the time of the call.
        state: ReplayState,
    },

    /// No applier is registered for the event type.
    #[error("aggregate type '{owner}' has no applier for event type '{event_type}'")]
    UnhandledEvent {
        /// Owner tag of the aggregate type.
        owner: &'static str,
        /// Event type tag without an applier.
        event_type: String,
    },

    /// `emit` called on an instance not bound to a unit of work.
    #[error("aggregate '{id}' is not bound to a unit of work")]
    NotBound {
        /// Aggregate id.
        id: String,
    },

    /// `create` called for an id that already has events.
    #[error("aggregate '{id}' already exists")]
    AlreadyExists {
        /// Aggregate id.
        id: String,
    },

    /// Reading from the event store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Encoding or decoding an event payload or snapshot failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Error raised by a view manager or its persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    /// Disk I/O failure in a view store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A view document or event payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A handler's aggregate load failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// A handler or locator rejected an event.
    #[error("view '{view}' failed: {message}")]
    Handler {
        /// Name of the failing view.
        view: &'static str,
        /// Human-readable reason.
        message: String,
    },
}

/// Failure inside the catch-up worker.
///
/// Transient by definition: the worker logs it, backs off, and re-derives
/// its resume point from view positions on the next item. Never surfaced
/// to callers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Streaming from the event store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A view failed to report its position, purge, or apply a batch.
    #[error(transparent)]
    View(#[from] ViewError),
}

/// A consistency wait exceeded its deadline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("timed out after {timeout:?} waiting for global sequence {target}; reached {reached}")]
pub struct ConsistencyTimeout {
    /// Global sequence the caller waited for.
    pub target: i64,
    /// Closest position observed before giving up.
    pub reached: i64,
    /// Configured deadline.
    pub timeout: Duration,
}

/// Error returned by `wait_until_processed`.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The target position was not reached in time.
    #[error(transparent)]
    Timeout(#[from] ConsistencyTimeout),

    /// Reading a view position failed.
    #[error(transparent)]
    View(#[from] ViewError),

    /// Reading the event store's high-water mark failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The named view is not registered with the dispatcher.
    #[error("view '{0}' is not registered")]
    UnknownView(String),
}

/// Error returned when processing a command fails.
///
/// Generic over `E`, the command's own domain error. Domain errors pass
/// through unwrapped; everything else is wrapped with the command's
/// description.
#[derive(Debug, thiserror::Error)]
pub enum CommandError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by domain logic.
    #[error(transparent)]
    Domain(E),

    /// Aggregate failure raised inside `execute`.
    ///
    /// Commands return this through `?`; the processor rewraps it as
    /// [`CommandError::Processing`] before it reaches the caller.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Infrastructure failure while running or committing the command.
    #[error(
        "an error occurred while processing command {command}; any events emitted were not saved"
    )]
    Processing {
        /// `Debug` rendering of the command.
        command: String,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Optimistic concurrency retries exhausted.
    #[error("optimistic concurrency conflict: gave up after {attempts} attempts")]
    Conflict {
        /// Number of times the command was executed.
        attempts: u32,
    },
}

impl<E: std::error::Error + Send + Sync + 'static> CommandError<E> {
    /// Returns `true` when the error came from the command's domain logic.
    pub fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(_))
    }
}

/// Error raised while registering aggregate or view types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two aggregate types claim the same owner tag.
    #[error("owner tag '{0}' is registered twice")]
    DuplicateOwner(&'static str),

    /// Two views share a name.
    #[error("view name '{0}' is registered twice")]
    DuplicateView(&'static str),
}

/// Error returned by [`RuntimeBuilder::build`](crate::RuntimeBuilder::build).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// An aggregate or view was registered twice.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The catch-up worker thread could not be started.
    #[error("failed to start catch-up worker: {0}")]
    Io(#[from] io::Error),
}
