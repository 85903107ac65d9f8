//! Commands, their metadata context, and the unit of work they run in.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::{Aggregate, EmitSink, Root};
use crate::error::{AggregateError, CommandError};
use crate::event::EventData;
use crate::repository::Repository;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail and correlation information without polluting the
/// `Command` or `DomainEvent` types. Fields are copied onto the
/// [`EventMetadata`](crate::EventMetadata) of every event the command
/// emits.
///
/// # Examples
///
/// ```
/// use replay_es::CommandContext;
/// use serde_json::json;
///
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(ctx.metadata.is_some());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across aggregates.
    pub correlation_id: Option<String>,
    /// Arbitrary metadata copied to [`EventMetadata::extra`](crate::EventMetadata::extra).
    pub metadata: Option<Value>,
}

impl CommandContext {
    /// Set the actor identity.
    ///
    /// # Arguments
    ///
    /// * `actor` - Any value convertible to `String` identifying who issued
    ///   the command (e.g. a user ID or service name).
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set arbitrary metadata.
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }
}

/// A request to change state, expressed by emitting events on aggregates.
///
/// `execute` may be called more than once for one submission: when the
/// append loses an optimistic-concurrency race the processor discards the
/// unit of work and runs the command again against fresh state. It must
/// therefore have no side effects besides emitting events.
///
/// # Examples
///
/// ```ignore
/// impl Command for Deposit {
///     type Error = BankError;
///
///     fn execute(&self, uow: &mut UnitOfWork) -> Result<(), CommandError<BankError>> {
///         let account = uow.get_or_create::<Account>(&self.account)?;
///         if self.amount == 0 {
///             return Err(CommandError::Domain(BankError::ZeroAmount));
///         }
///         account.emit(Deposited { amount: self.amount })?;
///         Ok(())
///     }
/// }
/// ```
pub trait Command: fmt::Debug + Send + Sync {
    /// Domain error the command can reject with.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run the command's logic against `uow`.
    ///
    /// # Errors
    ///
    /// [`CommandError::Domain`] for business rule violations; aggregate
    /// failures convert through `?`.
    fn execute(&self, uow: &mut UnitOfWork) -> Result<(), CommandError<Self::Error>>;
}

/// A hydrated root held by the unit of work, with its owner tag.
struct Cached {
    owner: &'static str,
    root: Box<dyn Any + Send>,
}

/// Scope of one command execution.
///
/// Hydrates aggregates at the latest position, binds them to a shared emit
/// sink, and caches each root by id so repeated loads in the same command
/// see the events emitted so far.
pub struct UnitOfWork {
    repository: Repository,
    sink: EmitSink,
    roots: HashMap<String, Cached>,
    context: CommandContext,
}

impl UnitOfWork {
    pub(crate) fn new(repository: Repository, context: CommandContext) -> Self {
        Self {
            repository,
            sink: Arc::new(Mutex::new(Vec::new())),
            roots: HashMap::new(),
            context,
        }
    }

    /// Metadata of the command being executed.
    pub fn context(&self) -> &CommandContext {
        &self.context
    }

    /// Load an existing aggregate.
    ///
    /// # Errors
    ///
    /// [`AggregateError::NotFound`] if it has no events, or any hydration
    /// failure.
    pub fn load<A: Aggregate>(&mut self, id: &str) -> Result<&mut Root<A>, AggregateError> {
        let root = self.root::<A>(id)?;
        if root.is_new() {
            return Err(AggregateError::NotFound { id: id.to_owned() });
        }
        Ok(root)
    }

    /// Like [`load`](UnitOfWork::load), but a missing aggregate is `None`.
    ///
    /// # Errors
    ///
    /// Any hydration failure other than [`AggregateError::NotFound`].
    pub fn try_load<A: Aggregate>(
        &mut self,
        id: &str,
    ) -> Result<Option<&mut Root<A>>, AggregateError> {
        let root = self.root::<A>(id)?;
        Ok(if root.is_new() { None } else { Some(root) })
    }

    /// Start a new aggregate.
    ///
    /// # Errors
    ///
    /// [`AggregateError::AlreadyExists`] if `id` already has events.
    pub fn create<A: Aggregate>(&mut self, id: &str) -> Result<&mut Root<A>, AggregateError> {
        let root = self.root::<A>(id)?;
        if !root.is_new() {
            return Err(AggregateError::AlreadyExists { id: id.to_owned() });
        }
        Ok(root)
    }

    /// Load `id`, or start it if it has no events.
    ///
    /// # Errors
    ///
    /// Any hydration failure.
    pub fn get_or_create<A: Aggregate>(
        &mut self,
        id: &str,
    ) -> Result<&mut Root<A>, AggregateError> {
        self.root::<A>(id)
    }

    /// Returns `true` if `id` has events, counting those emitted in this
    /// unit of work.
    ///
    /// # Errors
    ///
    /// [`AggregateError::Store`] if the store cannot be read.
    pub fn exists(&self, id: &str) -> Result<bool, AggregateError> {
        let emitted = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| e.aggregate_id() == id);
        if emitted {
            return Ok(true);
        }
        self.repository.exists(id, i64::MAX)
    }

    /// Events emitted so far, in emission order.
    pub(crate) fn into_emitted(self) -> Vec<EventData> {
        let UnitOfWork { sink, roots, .. } = self;
        drop(roots);
        let mut emitted = sink.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *emitted)
    }

    /// Cached root for `id`, hydrating (or creating) it on first access.
    fn root<A: Aggregate>(&mut self, id: &str) -> Result<&mut Root<A>, AggregateError> {
        if !self.roots.contains_key(id) {
            let mut root = self.repository.get::<A>(id, i64::MAX, true)?;
            root.bind(Arc::clone(&self.sink));
            self.roots.insert(
                id.to_owned(),
                Cached {
                    owner: A::OWNER,
                    root: Box::new(root),
                },
            );
        }
        let cached = self
            .roots
            .get_mut(id)
            .ok_or_else(|| AggregateError::NotFound { id: id.to_owned() })?;
        let owner = cached.owner;
        cached
            .root
            .downcast_mut::<Root<A>>()
            .ok_or_else(|| AggregateError::TypeMismatch {
                id: id.to_owned(),
                expected: A::OWNER,
                actual: owner.to_owned(),
            })
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("roots", &self.roots.keys().collect::<Vec<_>>())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
