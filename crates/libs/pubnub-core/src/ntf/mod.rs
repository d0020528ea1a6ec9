//! Process-wide notification engine.
//!
//! One background thread watches every registered socket, ages per-context
//! transaction timers and hands ready contexts to their owners through a FIFO
//! queue. All bookkeeping lives behind a single mutex; socket polling and
//! dispatch run with that mutex released.

pub mod poller;
pub mod queue;
pub mod timer_list;

pub use poller::{Interest, Poller, Readiness, SocketOf, SocketRegistry};
#[cfg(unix)]
pub use poller::{MioPoller, MioRegistry};
pub use queue::{EventQueue, QueuedEvent};
pub use timer_list::TimerList;

use crate::config::EngineConfig;
use crate::error::PubnubError;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::sync::OnceLock;

/// Identity of a context registered with the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

impl ContextId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a context was queued. Ordered by significance: when a queued context
/// is notified again the greater kind wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Notification {
    Process,
    Writable,
    Readable,
    Timeout,
}

/// A context the engine can watch and dispatch to.
pub trait Watched: Send + Sync {
    fn context_id(&self) -> ContextId;

    fn transaction_timeout(&self) -> Duration;

    /// Called on the dispatching thread with no engine lock held.
    fn notify(&self, notification: Notification);
}

type Target = Arc<dyn Watched>;

struct Watch<S> {
    socket: S,
    interest: Interest,
    target: Target,
}

struct EngineState<P: Poller> {
    registry: P::Registry,
    watches: HashMap<ContextId, Watch<SocketOf<P>>>,
    timers: TimerList,
    queue: EventQueue<Target>,
    dispatching: Option<(ContextId, ThreadId)>,
    signaled: bool,
    shutdown: bool,
}

impl<P: Poller> EngineState<P> {
    fn queue_watched(&mut self, id: ContextId, notification: Notification) -> bool {
        match self.watches.get(&id) {
            Some(watch) => {
                let target = Arc::clone(&watch.target);
                self.queue.enqueue(id, target, notification);
                true
            }
            None => false,
        }
    }
}

struct Shared<P: Poller> {
    config: EngineConfig,
    state: Mutex<EngineState<P>>,
    wake: Condvar,
    idle: Condvar,
    drain: Mutex<()>,
}

/// Clears the dispatch marker even if the target panics.
struct DispatchGuard<'a, P: Poller> {
    shared: &'a Shared<P>,
}

impl<P: Poller> Drop for DispatchGuard<'_, P> {
    fn drop(&mut self) {
        self.shared.lock_state().dispatching = None;
        self.shared.idle.notify_all();
    }
}

impl<P: Poller> Shared<P> {
    fn lock_state(&self) -> MutexGuard<'_, EngineState<P>> {
        self.state.lock().expect("ntf state mutex poisoned")
    }

    fn signal(&self, state: &mut EngineState<P>) {
        state.signaled = true;
        self.wake.notify_one();
    }

    fn process_queue(&self) -> usize {
        let _drain = self.drain.lock().expect("ntf drain mutex poisoned");
        let mut processed = 0;
        loop {
            let event = {
                let mut state = self.lock_state();
                let Some(event) = state.queue.pop_front() else {
                    break;
                };
                state.dispatching = Some((event.id, thread::current().id()));
                event
            };
            let _guard = DispatchGuard { shared: self };
            log::debug!("ntf: dispatching {:?} to context {}", event.notification, event.id);
            event.target.notify(event.notification);
            processed += 1;
        }
        processed
    }

    fn age_timers(&self, state: &mut EngineState<P>, elapsed: Duration) -> usize {
        let expired = state.timers.age(elapsed);
        let mut queued = 0;
        for id in expired {
            if state.queue_watched(id, Notification::Timeout) {
                log::debug!("ntf: context {id} timed out");
                queued += 1;
            }
        }
        queued
    }

    fn queue_ready(&self, state: &mut EngineState<P>, ready: &mut Vec<Readiness>) {
        for event in ready.drain(..) {
            let notification = if event.readable || event.failed {
                Notification::Readable
            } else if event.writable {
                Notification::Writable
            } else {
                continue;
            };
            if !state.queue_watched(event.id, notification) {
                log::debug!("ntf: dropping readiness for unregistered context {}", event.id);
            }
        }
    }

    fn run(&self, mut poller: P) -> P {
        let mut ready = Vec::new();
        let mut last_tick = Instant::now();
        loop {
            self.process_queue();
            {
                let mut state = self.lock_state();
                if !state.signaled && !state.shutdown {
                    state = self
                        .wake
                        .wait_timeout(state, self.config.wait_interval())
                        .expect("ntf state mutex poisoned")
                        .0;
                }
                state.signaled = false;
                if state.shutdown {
                    break;
                }
            }

            ready.clear();
            if let Err(err) = poller.poll(&mut ready, self.config.poll_timeout()) {
                log::warn!("ntf: poll failed: {err}");
            }

            let mut state = self.lock_state();
            self.queue_ready(&mut state, &mut ready);
            let elapsed_ms = u64::try_from(last_tick.elapsed().as_millis()).unwrap_or(u64::MAX);
            if elapsed_ms > 0 {
                // advance by whole milliseconds so the remainder carries over
                last_tick += Duration::from_millis(elapsed_ms);
                self.age_timers(&mut state, Duration::from_millis(elapsed_ms));
            }
        }
        poller
    }
}

/// Engine generic over the readiness primitive.
///
/// Contexts register their socket together with an `Arc` of themselves; the
/// engine calls [`Watched::notify`] when the socket becomes ready or the
/// context's transaction timeout runs out. After
/// [`NotificationEngine::unregister_socket`] returns, the engine holds no
/// reference to the context and will not call it again.
pub struct NotificationEngine<P: Poller> {
    shared: Arc<Shared<P>>,
    poller: Mutex<Option<P>>,
    /// Yields the poller back when the thread exits.
    worker: Mutex<Option<JoinHandle<Option<P>>>>,
}

impl<P: Poller> NotificationEngine<P> {
    pub fn new(poller: P, config: EngineConfig) -> Result<Self, PubnubError> {
        config.validate()?;
        let registry = poller
            .registry()
            .map_err(|err| PubnubError::init(format!("failed to clone poll registry: {err}")))?;
        let state = EngineState {
            registry,
            watches: HashMap::new(),
            timers: TimerList::new(),
            queue: EventQueue::new(),
            dispatching: None,
            signaled: false,
            shutdown: false,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                wake: Condvar::new(),
                idle: Condvar::new(),
                drain: Mutex::new(()),
            }),
            poller: Mutex::new(Some(poller)),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Spawns the notification thread. Calling it while running is a no-op.
    pub fn start(&self) -> Result<(), PubnubError> {
        let mut worker = self.worker.lock().expect("ntf worker mutex poisoned");
        if worker.is_some() {
            return Ok(());
        }
        let mut slot = self.poller.lock().expect("ntf poller mutex poisoned");
        let poller = slot.take().ok_or(PubnubError::InvalidState {
            operation: "start",
            state: "poller was lost",
        })?;
        self.shared.lock_state().shutdown = false;

        let config = &self.shared.config;
        let mut builder = thread::Builder::new().name(config.thread_name.clone());
        if let Some(kb) = config.thread_stack_size_kb {
            builder = builder.stack_size(kb.saturating_mul(1024));
        }
        // The poller is handed over only once the thread exists, so a failed
        // spawn leaves it here for the next attempt.
        let (handoff, received) = mpsc::sync_channel::<P>(1);
        let shared = Arc::clone(&self.shared);
        let spawned = builder.spawn(move || received.recv().ok().map(|poller| shared.run(poller)));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                *slot = Some(poller);
                log::error!("ntf: failed to spawn notification thread: {err}");
                return Err(PubnubError::init(format!(
                    "failed to spawn notification thread: {err}"
                )));
            }
        };
        if let Err(mpsc::SendError(poller)) = handoff.send(poller) {
            *slot = Some(poller);
            let _ = handle.join();
            return Err(PubnubError::init("notification thread exited before starting"));
        }
        log::info!("ntf: notification thread '{}' started", config.thread_name);
        *worker = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().expect("ntf worker mutex poisoned").is_some()
    }

    /// Stops and joins the notification thread. Registrations are kept, so
    /// the engine can be started again.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().expect("ntf worker mutex poisoned").take() else {
            return;
        };
        {
            let mut state = self.shared.lock_state();
            state.shutdown = true;
            self.shared.signal(&mut state);
        }
        if handle.thread().id() == thread::current().id() {
            log::warn!("ntf: shutdown requested on the notification thread, not joining");
            return;
        }
        match handle.join() {
            Ok(poller) => {
                *self.poller.lock().expect("ntf poller mutex poisoned") = poller;
                log::info!("ntf: notification thread stopped");
            }
            Err(_) => log::error!("ntf: notification thread panicked"),
        }
    }

    /// Starts watching `socket` for `target` and arms its transaction timer.
    ///
    /// Registering a context that is already watched replaces the old socket.
    pub fn register_socket(
        &self,
        target: Arc<dyn Watched>,
        socket: SocketOf<P>,
        interest: Interest,
    ) -> Result<(), PubnubError> {
        let id = target.context_id();
        let timeout = target.transaction_timeout();
        let mut guard = self.shared.lock_state();
        let state = &mut *guard;
        if let Some(previous) = state.watches.remove(&id) {
            if let Err(err) = state.registry.deregister(previous.socket) {
                log::warn!("ntf: failed to deregister replaced socket of context {id}: {err}");
            }
        }
        if let Err(err) = state.registry.register(socket, id, interest) {
            state.timers.remove(id);
            state.queue.remove(id);
            return Err(err.into());
        }
        state.watches.insert(id, Watch { socket, interest, target });
        state.timers.add(id, timeout);
        self.shared.signal(state);
        log::debug!(
            "ntf: watching {socket:?} for context {id} ({interest:?}, timeout {timeout:?})"
        );
        Ok(())
    }

    /// Changes what the engine waits for on an already watched socket. The
    /// transaction timer keeps running.
    pub fn update_socket(
        &self,
        id: ContextId,
        socket: SocketOf<P>,
        interest: Interest,
    ) -> Result<(), PubnubError> {
        let mut guard = self.shared.lock_state();
        let state = &mut *guard;
        let Some(watch) = state.watches.get_mut(&id) else {
            return Err(PubnubError::InvalidState {
                operation: "update_socket",
                state: "context is not registered",
            });
        };
        state.registry.reregister(socket, id, interest)?;
        watch.socket = socket;
        watch.interest = interest;
        self.shared.signal(state);
        Ok(())
    }

    /// Forgets the context: socket watch, timer and queue entry.
    ///
    /// If another thread is dispatching to this context, waits for that
    /// dispatch to return. Calling it from inside the context's own
    /// [`Watched::notify`] is allowed.
    pub fn unregister_socket(&self, id: ContextId) {
        let mut state = self.shared.lock_state();
        let current = thread::current().id();
        while matches!(state.dispatching, Some((busy, thread)) if busy == id && thread != current) {
            state = self.shared.idle.wait(state).expect("ntf state mutex poisoned");
        }
        if let Some(watch) = state.watches.remove(&id) {
            if let Err(err) = state.registry.deregister(watch.socket) {
                log::warn!("ntf: failed to deregister socket of context {id}: {err}");
            }
        }
        state.timers.remove(id);
        state.queue.remove(id);
        log::debug!("ntf: context {id} unregistered");
    }

    /// Queues `target` for processing; a no-op apart from upgrading the
    /// notification when it is already queued.
    pub fn enqueue(&self, target: Arc<dyn Watched>, notification: Notification) -> bool {
        let mut state = self.shared.lock_state();
        let added = state.queue.enqueue(target.context_id(), target, notification);
        self.shared.signal(&mut state);
        added
    }

    /// Moves `target` to the tail of the queue.
    pub fn requeue(&self, target: Arc<dyn Watched>, notification: Notification) {
        let mut state = self.shared.lock_state();
        state.queue.requeue(target.context_id(), target, notification);
        self.shared.signal(&mut state);
    }

    /// Dispatches everything queued on the calling thread; returns how many
    /// notifications were delivered.
    pub fn process_queue(&self) -> usize {
        self.shared.process_queue()
    }

    /// Advances the timer clock by `elapsed` and queues expired contexts
    /// with [`Notification::Timeout`]. Returns how many were queued.
    pub fn age_timers(&self, elapsed: Duration) -> usize {
        let mut state = self.shared.lock_state();
        self.shared.age_timers(&mut state, elapsed)
    }

    pub fn queued_len(&self) -> usize {
        self.shared.lock_state().queue.len()
    }

    pub fn timer_len(&self) -> usize {
        self.shared.lock_state().timers.len()
    }

    pub fn watched_len(&self) -> usize {
        self.shared.lock_state().watches.len()
    }

    pub fn is_watched(&self, id: ContextId) -> bool {
        self.shared.lock_state().watches.contains_key(&id)
    }

    pub fn is_queued(&self, id: ContextId) -> bool {
        self.shared.lock_state().queue.contains(id)
    }

    pub fn timer_remaining(&self, id: ContextId) -> Option<Duration> {
        self.shared.lock_state().timers.remaining(id)
    }
}

impl<P: Poller> Drop for NotificationEngine<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P: Poller> fmt::Debug for NotificationEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationEngine")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
impl NotificationEngine<MioPoller> {
    /// The process-wide engine, created and started on first use.
    pub fn shared() -> Result<Arc<Self>, PubnubError> {
        static ENGINE: OnceLock<Arc<NotificationEngine<MioPoller>>> = OnceLock::new();
        static INIT: Mutex<()> = Mutex::new(());

        if let Some(engine) = ENGINE.get() {
            return Ok(Arc::clone(engine));
        }
        let _init = INIT.lock().expect("ntf init mutex poisoned");
        if let Some(engine) = ENGINE.get() {
            return Ok(Arc::clone(engine));
        }
        let poller = MioPoller::new()
            .map_err(|err| PubnubError::init(format!("failed to create poller: {err}")))?;
        let engine = Arc::new(Self::new(poller, EngineConfig::default())?);
        engine.start()?;
        Ok(Arc::clone(ENGINE.get_or_init(|| engine)))
    }
}
