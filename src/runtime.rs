//! Wiring: one builder that composes store, registry, repository, views,
//! dispatcher and processor into a running [`Runtime`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::aggregate::Aggregate;
use crate::command::{Command, CommandContext};
use crate::consistency::CommandProcessingResult;
use crate::dispatcher::{CatchUpDispatcher, DispatcherConfig};
use crate::error::{BuildError, CommandError, RegistryError, WaitError};
use crate::processor::{CommandProcessor, EventDispatcher, ProcessorConfig};
use crate::registry::AggregateRegistry;
use crate::repository::Repository;
use crate::snapshot::{FileSnapshotStore, InMemorySnapshotStore, SnapshotPolicy, SnapshotStore};
use crate::storage::{EventStore, InMemoryEventStore};
use crate::view::{CatchUpView, View, ViewManager};
use crate::view_store::{FileViewStore, InMemoryViewStore, ViewStore};

/// Builds a view manager once the base directory is known.
type ViewFactory = Box<dyn FnOnce(Option<&Path>) -> Arc<dyn CatchUpView> + Send>;

/// Where snapshots go, resolved at build time.
enum SnapshotSetup {
    Default(SnapshotPolicy),
    Store(Arc<dyn SnapshotStore>, SnapshotPolicy),
}

/// Builder for [`Runtime`].
///
/// # Examples
///
/// ```ignore
/// let runtime = Runtime::builder()
///     .base_dir("/var/lib/ledger")
///     .aggregate::<Account>()
///     .view::<Balances>()
///     .snapshots(SnapshotPolicy::default())
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    store: Arc<dyn EventStore>,
    base_dir: Option<PathBuf>,
    registry: AggregateRegistry,
    registry_error: Option<RegistryError>,
    view_factories: Vec<(&'static str, ViewFactory)>,
    snapshots: Option<SnapshotSetup>,
    dispatcher_config: DispatcherConfig,
    processor_config: ProcessorConfig,
    purge_views_on_start: bool,
}

impl RuntimeBuilder {
    /// Create a builder over a fresh [`InMemoryEventStore`] with default
    /// configuration.
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryEventStore::new()),
            base_dir: None,
            registry: AggregateRegistry::new(),
            registry_error: None,
            view_factories: Vec::new(),
            snapshots: None,
            dispatcher_config: DispatcherConfig::default(),
            processor_config: ProcessorConfig::default(),
            purge_views_on_start: false,
        }
    }

    /// Use `store` as the event log.
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = store;
        self
    }

    /// Persist views and snapshots as JSON files under `path`.
    ///
    /// Views registered with [`view`](RuntimeBuilder::view) go to
    /// `<path>/views/<name>/`; snapshots enabled with
    /// [`snapshots`](RuntimeBuilder::snapshots) go to `<path>/snapshots/`.
    /// Without a base directory both are kept in memory.
    pub fn base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.base_dir = Some(path.as_ref().to_owned());
        self
    }

    /// Register an aggregate type.
    ///
    /// A duplicate owner tag is reported by [`build`](RuntimeBuilder::build).
    pub fn aggregate<A: Aggregate>(mut self) -> Self {
        if let Err(e) = self.registry.register::<A>()
            && self.registry_error.is_none()
        {
            self.registry_error = Some(e);
        }
        self
    }

    /// Register a view stored under the base directory, or in memory.
    pub fn view<V: View>(mut self) -> Self {
        self.view_factories.push((
            V::NAME,
            Box::new(|base_dir: Option<&Path>| {
                let store: Arc<dyn ViewStore<V>> = match base_dir {
                    Some(dir) => Arc::new(FileViewStore::new(dir.join("views").join(V::NAME))),
                    None => Arc::new(InMemoryViewStore::new()),
                };
                Arc::new(ViewManager::<V>::new(store)) as Arc<dyn CatchUpView>
            }),
        ));
        self
    }

    /// Register a view backed by a caller-supplied store.
    pub fn view_with_store<V: View>(mut self, store: Arc<dyn ViewStore<V>>) -> Self {
        self.view_factories.push((
            V::NAME,
            Box::new(move |_: Option<&Path>| {
                Arc::new(ViewManager::<V>::new(store)) as Arc<dyn CatchUpView>
            }),
        ));
        self
    }

    /// Register a fully configured view manager, e.g. one with a custom
    /// locator.
    pub fn view_manager<V: View>(mut self, manager: ViewManager<V>) -> Self {
        self.view_factories.push((
            V::NAME,
            Box::new(move |_: Option<&Path>| Arc::new(manager) as Arc<dyn CatchUpView>),
        ));
        self
    }

    /// Enable aggregate snapshots under the base directory, or in memory.
    pub fn snapshots(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshots = Some(SnapshotSetup::Default(policy));
        self
    }

    /// Enable aggregate snapshots in a caller-supplied store.
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>, policy: SnapshotPolicy) -> Self {
        self.snapshots = Some(SnapshotSetup::Store(store, policy));
        self
    }

    /// Set the catch-up dispatcher configuration.
    ///
    /// If not called, [`DispatcherConfig::default()`] is used.
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Set the command processor configuration.
    ///
    /// If not called, [`ProcessorConfig::default()`] is used.
    pub fn processor_config(mut self, config: ProcessorConfig) -> Self {
        self.processor_config = config;
        self
    }

    /// Purge and rebuild every view when the runtime starts.
    pub fn purge_views_on_start(mut self, purge: bool) -> Self {
        self.purge_views_on_start = purge;
        self
    }

    /// Assemble the runtime and start the catch-up worker.
    ///
    /// The worker immediately runs a full catch-up, so views persisted by a
    /// previous run resume from their stored positions.
    ///
    /// # Errors
    ///
    /// - [`BuildError::Registry`] for duplicate owner tags or view names.
    /// - [`BuildError::Io`] if the worker thread cannot be spawned.
    pub fn build(self) -> Result<Runtime, BuildError> {
        if let Some(e) = self.registry_error {
            return Err(e.into());
        }

        let mut repository = Repository::new(self.store, self.registry);
        match self.snapshots {
            Some(SnapshotSetup::Store(store, policy)) => {
                repository = repository.with_snapshots(store, policy);
            }
            Some(SnapshotSetup::Default(policy)) => {
                let store: Arc<dyn SnapshotStore> = match &self.base_dir {
                    Some(dir) => Arc::new(FileSnapshotStore::new(dir)),
                    None => Arc::new(InMemorySnapshotStore::new()),
                };
                repository = repository.with_snapshots(store, policy);
            }
            None => {}
        }

        let dispatcher = Arc::new(CatchUpDispatcher::new(
            repository.clone(),
            self.dispatcher_config,
        ));
        for (_name, factory) in self.view_factories {
            dispatcher.add_view(factory(self.base_dir.as_deref()))?;
        }
        dispatcher.initialize(self.purge_views_on_start)?;

        let processor = CommandProcessor::new(
            repository,
            Arc::clone(&dispatcher) as Arc<dyn EventDispatcher>,
            self.processor_config,
        );
        tracing::info!(
            aggregates = processor.repository().registry().owners().count(),
            views = dispatcher.view_names().len(),
            "runtime started"
        );
        Ok(Runtime {
            processor,
            dispatcher,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("base_dir", &self.base_dir)
            .field("registry", &self.registry)
            .field(
                "views",
                &self.view_factories.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            )
            .field("dispatcher_config", &self.dispatcher_config)
            .field("processor_config", &self.processor_config)
            .finish_non_exhaustive()
    }
}

/// A running event-sourcing runtime.
///
/// Dropping the last handle stops the catch-up worker.
#[derive(Debug)]
pub struct Runtime {
    processor: CommandProcessor,
    dispatcher: Arc<CatchUpDispatcher>,
}

impl Runtime {
    /// Start configuring a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Process a command. See [`CommandProcessor::process`].
    ///
    /// # Errors
    ///
    /// See [`CommandProcessor::process_with_context`].
    pub fn process<C: Command>(
        &self,
        command: &C,
    ) -> Result<CommandProcessingResult, CommandError<C::Error>> {
        self.processor.process(command)
    }

    /// Process a command with metadata.
    ///
    /// # Errors
    ///
    /// See [`CommandProcessor::process_with_context`].
    pub fn process_with_context<C: Command>(
        &self,
        command: &C,
        context: CommandContext,
    ) -> Result<CommandProcessingResult, CommandError<C::Error>> {
        self.processor.process_with_context(command, context)
    }

    /// The aggregate repository.
    pub fn repository(&self) -> &Repository {
        self.processor.repository()
    }

    /// The catch-up dispatcher.
    pub fn dispatcher(&self) -> &CatchUpDispatcher {
        &self.dispatcher
    }

    /// The registered manager for view `V`.
    pub fn view<V: View>(&self) -> Option<Arc<ViewManager<V>>> {
        self.dispatcher.view::<V>()
    }

    /// Wait until every view has applied `result`'s events.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] if the views do not get there in time.
    pub async fn wait_until_processed(
        &self,
        result: &CommandProcessingResult,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        self.dispatcher.wait_until_processed(result, timeout).await
    }

    /// Stop the catch-up worker. Commands can still be processed, but views
    /// no longer advance.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
