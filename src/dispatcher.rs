//! Catch-up dispatcher: keeps every registered view up to date with the log.
//!
//! One dedicated worker thread drains a FIFO of [`CatchUpWork`] items. Each
//! item re-derives the lowest view position, so a failed or interrupted pass
//! leaves nothing to clean up: the next item (from a new batch or from the
//! periodic ticker) resumes from whatever was durably applied.
//!
//! The worker runs a current-thread tokio runtime of its own so that its
//! timers work no matter which runtime, if any, the caller uses.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::consistency::{self, CommandProcessingResult};
use crate::error::{ConsistencyTimeout, DispatchError, RegistryError, ViewError, WaitError};
use crate::event::{EventData, NO_SEQUENCE};
use crate::processor::EventDispatcher;
use crate::repository::Repository;
use crate::view::{CatchUpView, DispatchContext, NullProfiler, View, ViewManager, ViewProfiler};

/// Catch-up dispatcher tuning.
///
/// # Examples
///
/// ```
/// use replay_es::DispatcherConfig;
/// use std::time::Duration;
///
/// let config = DispatcherConfig {
///     batch_size: 500,
///     catch_up_interval: Duration::from_millis(250),
///     ..DispatcherConfig::default()
/// };
/// assert_eq!(config.shutdown_timeout, Duration::from_secs(4));
/// ```
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Events read from the store per streamed batch.
    ///
    /// Default: 100.
    pub batch_size: usize,

    /// How often the ticker enqueues a full catch-up.
    ///
    /// Default: 1 second.
    pub catch_up_interval: Duration,

    /// How long [`CatchUpDispatcher::shutdown`] waits for the worker.
    ///
    /// Default: 4 seconds.
    pub shutdown_timeout: Duration,

    /// Delays after consecutive failures, in order.
    ///
    /// Default: 10 × 100 ms, 5 × 1 s, 6 × 5 s.
    pub backoff_ladder: Vec<Duration>,

    /// Delay once the ladder is exhausted.
    ///
    /// Default: 30 seconds.
    pub backoff_ceiling: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let mut backoff_ladder = vec![Duration::from_millis(100); 10];
        backoff_ladder.extend([Duration::from_secs(1); 5]);
        backoff_ladder.extend([Duration::from_secs(5); 6]);
        Self {
            batch_size: 100,
            catch_up_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(4),
            backoff_ladder,
            backoff_ceiling: Duration::from_secs(30),
        }
    }
}

/// Position in the backoff ladder. Reset on success.
#[derive(Debug)]
pub(crate) struct Backoff {
    ladder: Vec<Duration>,
    ceiling: Duration,
    failures: usize,
}

impl Backoff {
    pub(crate) fn new(config: &DispatcherConfig) -> Self {
        Self {
            ladder: config.backoff_ladder.clone(),
            ceiling: config.backoff_ceiling,
            failures: 0,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self
            .ladder
            .get(self.failures)
            .copied()
            .unwrap_or(self.ceiling);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }
}

/// A unit of work for the catch-up worker.
#[derive(Debug, Clone)]
pub enum CatchUpWork {
    /// Bring every view up to the store's current high-water mark, reading
    /// positions from storage.
    FullCatchUp {
        /// Purge all views first and rebuild them from the start.
        purge_first: bool,
    },
    /// A freshly committed batch, in global order. Delivered directly when
    /// it continues exactly where the slowest view stands; otherwise the
    /// gap is streamed from the store.
    JustCatchUp {
        /// The committed events.
        events: Vec<EventData>,
    },
}

/// State shared between the dispatcher handle and its worker.
struct Shared {
    repository: Repository,
    views: RwLock<Vec<Arc<dyn CatchUpView>>>,
    items: RwLock<HashMap<String, Value>>,
    profiler: RwLock<Arc<dyn ViewProfiler>>,
    config: DispatcherConfig,
    /// Number of queued items the worker has finished, failed or not.
    /// Ticker work is not counted.
    processed: watch::Sender<u64>,
}

impl Shared {
    fn views(&self) -> Vec<Arc<dyn CatchUpView>> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Process one work item.
    fn catch_up(&self, work: &CatchUpWork) -> Result<(), DispatchError> {
        let views = self.views();
        if views.is_empty() {
            return Ok(());
        }

        let (carried, allow_cache) = match work {
            CatchUpWork::FullCatchUp { purge_first } => {
                if *purge_first {
                    for view in &views {
                        view.purge()?;
                    }
                }
                (None, false)
            }
            CatchUpWork::JustCatchUp { events } => (Some(events.as_slice()), true),
        };

        let mut positions = views
            .iter()
            .map(|view| view.position(allow_cache))
            .collect::<Result<Vec<i64>, _>>()?;
        let low = positions.iter().copied().min().unwrap_or(NO_SEQUENCE);

        let target = match carried {
            Some(events) => events
                .iter()
                .map(EventData::global_sequence)
                .max()
                .unwrap_or(NO_SEQUENCE),
            None => self.repository.event_store().last_global_seq()?,
        };
        if low >= target {
            tracing::trace!(low, target, "views already caught up");
            return Ok(());
        }

        let items = self
            .items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let profiler = Arc::clone(&self.profiler.read().unwrap_or_else(PoisonError::into_inner));
        let ctx = DispatchContext::new(&self.repository, &items);

        if let Some(events) = carried
            && events.first().map(EventData::global_sequence) == Some(low + 1)
        {
            tracing::debug!(from_position = low, target, "dispatching batch directly");
            return deliver(&views, &mut positions, &ctx, events, profiler.as_ref());
        }

        tracing::debug!(from_position = low, target, "streaming missed events");
        let batch_size = self.config.batch_size.max(1);
        let mut stream = self.repository.event_store().stream_all(low + 1)?;
        let mut chunk = Vec::with_capacity(batch_size);
        loop {
            chunk.clear();
            for event in stream.by_ref().take(batch_size) {
                chunk.push(event?);
            }
            let Some(last) = chunk.last().map(EventData::global_sequence) else {
                break;
            };
            deliver(&views, &mut positions, &ctx, &chunk, profiler.as_ref())?;
            if last >= target || chunk.len() < batch_size {
                break;
            }
        }
        Ok(())
    }
}

/// Hand each view the part of `events` above its tracked position.
fn deliver(
    views: &[Arc<dyn CatchUpView>],
    positions: &mut [i64],
    ctx: &DispatchContext<'_>,
    events: &[EventData],
    profiler: &dyn ViewProfiler,
) -> Result<(), DispatchError> {
    let Some(last) = events.last().map(EventData::global_sequence) else {
        return Ok(());
    };
    for (view, position) in views.iter().zip(positions.iter_mut()) {
        if *position >= last {
            continue;
        }
        let start = events.partition_point(|e| e.global_sequence() <= *position);
        view.dispatch(ctx, &events[start..], profiler)?;
        *position = last;
    }
    Ok(())
}

struct Worker {
    handle: JoinHandle<()>,
    done: std::sync::mpsc::Receiver<()>,
}

/// Feeds committed batches and periodic catch-ups to registered views.
///
/// Producers call [`dispatch`](EventDispatcher::dispatch) (or
/// [`enqueue`](CatchUpDispatcher::enqueue)) and never block. Nothing runs
/// until [`initialize`](CatchUpDispatcher::initialize) starts the worker.
/// Dropping the dispatcher shuts the worker down.
pub struct CatchUpDispatcher {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<CatchUpWork>,
    /// Items sent so far. Held while sending so counts match queue order.
    enqueued: Mutex<u64>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<CatchUpWork>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<Worker>>,
}

impl CatchUpDispatcher {
    /// Create a dispatcher reading from `repository`'s event store.
    pub fn new(repository: Repository, config: DispatcherConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                repository,
                views: RwLock::new(Vec::new()),
                items: RwLock::new(HashMap::new()),
                profiler: RwLock::new(Arc::new(NullProfiler)),
                config,
                processed: watch::channel(0).0,
            }),
            sender,
            enqueued: Mutex::new(0),
            receiver: Mutex::new(Some(receiver)),
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    /// Enqueue a full catch-up and start the worker thread.
    ///
    /// Calling it again has no effect.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the worker thread cannot be spawned.
    pub fn initialize(&self, purge_existing: bool) -> io::Result<()> {
        let Some(receiver) = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            tracing::warn!("catch-up dispatcher already initialized");
            return Ok(());
        };
        self.enqueue(CatchUpWork::FullCatchUp {
            purge_first: purge_existing,
        });

        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let (done_tx, done) = std::sync::mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("replay-es-catch-up".into())
            .spawn(move || {
                run_worker(&shared, receiver, shutdown_rx);
                let _ = done_tx.send(());
            })?;

        tracing::info!(
            views = self.shared.views().len(),
            purge_existing,
            "catch-up dispatcher started"
        );
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Worker { handle, done });
        Ok(())
    }

    /// Queue a work item for the worker.
    pub fn enqueue(&self, work: CatchUpWork) {
        self.enqueue_counted(work);
    }

    /// Queue `work` and return its place in the queue, counting from 1.
    fn enqueue_counted(&self, work: CatchUpWork) -> u64 {
        let mut enqueued = self.enqueued.lock().unwrap_or_else(PoisonError::into_inner);
        if self.sender.send(work).is_err() {
            tracing::debug!("catch-up worker has stopped; work item dropped");
        }
        *enqueued += 1;
        *enqueued
    }

    /// Register a view.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateView`] if a view with the same name is
    /// already registered.
    pub fn add_view(&self, view: Arc<dyn CatchUpView>) -> Result<(), RegistryError> {
        let mut views = self.shared.views.write().unwrap_or_else(PoisonError::into_inner);
        if views.iter().any(|v| v.name() == view.name()) {
            return Err(RegistryError::DuplicateView(view.name()));
        }
        tracing::debug!(view = view.name(), "view registered");
        views.push(view);
        Ok(())
    }

    /// Unregister the view called `name`. Returns `true` if it was present.
    pub fn remove_view(&self, name: &str) -> bool {
        let mut views = self.shared.views.write().unwrap_or_else(PoisonError::into_inner);
        let before = views.len();
        views.retain(|v| v.name() != name);
        before != views.len()
    }

    /// Names of all registered views, in registration order.
    pub fn view_names(&self) -> Vec<&'static str> {
        self.shared.views().iter().map(|v| v.name()).collect()
    }

    /// The registered manager for view type `V`.
    pub fn view<V: View>(&self) -> Option<Arc<ViewManager<V>>> {
        self.shared
            .views()
            .into_iter()
            .find(|v| v.name() == V::NAME)
            .and_then(|v| v.into_any().downcast::<ViewManager<V>>().ok())
    }

    /// Replace the profiler handed to every view.
    pub fn set_profiler(&self, profiler: Arc<dyn ViewProfiler>) {
        *self
            .shared
            .profiler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = profiler;
    }

    /// Make `value` available to handlers as [`ViewContext::item`](crate::ViewContext::item).
    pub fn set_context_item(&self, key: impl Into<String>, value: Value) {
        self.shared
            .items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// Wait until every registered view has applied `result`'s events.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] if the slowest view does not get there in
    /// time.
    pub async fn wait_until_processed(
        &self,
        result: &CommandProcessingResult,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        let Some(target) = consistency::target_of(result) else {
            return Ok(());
        };
        self.wait_for_all(target, timeout).await
    }

    /// Wait until the view called `name` has applied `result`'s events.
    ///
    /// # Errors
    ///
    /// - [`WaitError::UnknownView`] if no such view is registered.
    /// - [`WaitError::Timeout`] if the view does not get there in time.
    pub async fn wait_until_processed_for(
        &self,
        name: &str,
        result: &CommandProcessingResult,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        let view = self
            .shared
            .views()
            .into_iter()
            .find(|v| v.name() == name)
            .ok_or_else(|| WaitError::UnknownView(name.to_owned()))?;
        let Some(target) = consistency::target_of(result) else {
            return Ok(());
        };
        consistency::wait_for_position(target, timeout, |allow_cache| {
            view.position(allow_cache)
        })
        .await
    }

    /// Enqueue a full catch-up and wait until every view reaches the
    /// store's current high-water mark.
    ///
    /// The queue is FIFO: the call first waits for the worker to finish its
    /// own item, and with it everything queued earlier, such as the purge
    /// requested by [`initialize`](Self::initialize). Positions from before
    /// such a purge are never taken as caught up.
    ///
    /// # Errors
    ///
    /// - [`WaitError::Store`] if the high-water mark cannot be read.
    /// - [`WaitError::Timeout`] if the item is not processed, or the views
    ///   do not reach the mark, in time.
    pub async fn full_catch_up(&self, timeout: Duration) -> Result<(), WaitError> {
        let target = self.shared.repository.event_store().last_global_seq()?;
        let ticket = self.enqueue_counted(CatchUpWork::FullCatchUp { purge_first: false });
        if target == NO_SEQUENCE {
            return Ok(());
        }

        let started = tokio::time::Instant::now();
        let mut processed = self.shared.processed.subscribe();
        let drained = tokio::time::timeout(timeout, processed.wait_for(|&done| done >= ticket))
            .await
            .is_ok_and(|seen| seen.is_ok());
        if !drained {
            let reached = self.low_position(true)?;
            return Err(ConsistencyTimeout {
                target,
                reached,
                timeout,
            }
            .into());
        }
        self.wait_for_all(target, timeout.saturating_sub(started.elapsed()))
            .await
    }

    /// Lowest position over all views, or [`NO_SEQUENCE`] with none.
    fn low_position(&self, allow_cache: bool) -> Result<i64, ViewError> {
        let mut low: Option<i64> = None;
        for view in &self.shared.views() {
            let position = view.position(allow_cache)?;
            low = Some(low.map_or(position, |l| l.min(position)));
        }
        Ok(low.unwrap_or(NO_SEQUENCE))
    }

    async fn wait_for_all(&self, target: i64, timeout: Duration) -> Result<(), WaitError> {
        let views = self.shared.views();
        if views.is_empty() {
            return Ok(());
        }
        consistency::wait_for_position(target, timeout, |allow_cache| {
            let mut low = i64::MAX;
            for view in &views {
                low = low.min(view.position(allow_cache)?);
            }
            Ok(low)
        })
        .await
    }

    /// Stop the ticker and the worker loop and wait up to
    /// [`DispatcherConfig::shutdown_timeout`] for the worker to exit.
    ///
    /// An item being processed is finished first. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let timeout = self.shared.config.shutdown_timeout;
        match worker.done.recv_timeout(timeout) {
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                tracing::error!(?timeout, "catch-up worker did not stop in time; detaching");
            }
            Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    tracing::error!("catch-up worker panicked");
                }
            }
        }
    }
}

impl EventDispatcher for CatchUpDispatcher {
    fn dispatch(&self, events: &[EventData]) {
        if events.is_empty() {
            return;
        }
        let mut events = events.to_vec();
        events.sort_by_key(EventData::global_sequence);
        self.enqueue(CatchUpWork::JustCatchUp { events });
    }
}

impl Drop for CatchUpDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CatchUpDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatchUpDispatcher")
            .field("views", &self.view_names())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Body of the worker thread.
fn run_worker(
    shared: &Shared,
    mut receiver: mpsc::UnboundedReceiver<CatchUpWork>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to build catch-up runtime; worker not started");
            return;
        }
    };
    rt.block_on(worker_loop(shared, &mut receiver, &mut shutdown_rx));
}

async fn worker_loop(
    shared: &Shared,
    receiver: &mut mpsc::UnboundedReceiver<CatchUpWork>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(shared.config.catch_up_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it.
    ticker.tick().await;
    let mut backoff = Backoff::new(&shared.config);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let (work, queued) = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            work = receiver.recv() => match work {
                Some(work) => (work, true),
                None => break,
            },
            _ = ticker.tick() => (CatchUpWork::FullCatchUp { purge_first: false }, false),
        };

        let result = shared.catch_up(&work);
        if queued {
            shared.processed.send_modify(|done| *done += 1);
        }
        match result {
            Ok(()) => backoff.reset(),
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(error = %e, retry_in = ?delay, "catch-up failed; backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }
    tracing::info!("catch-up worker stopped");
}
