//! Single-threaded executor that owns all channel state.
//!
//! Every channel, pending token and peer catalog lives on one dispatch
//! thread. Other threads interact with them only by queueing closures, so
//! protocol state is never mutated concurrently.

mod timer;

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tcf_config::{ChannelSettings, Config};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::channel::{ChannelId, Dispatch};
use crate::errors::ChannelError;
use crate::token::{Token, TokenCounter};

use self::timer::TimerQueue;

pub(crate) const RUNTIME_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::runtime");

pub(crate) type Task = Box<dyn FnOnce(&mut Dispatch) + Send>;

enum Job {
    Run(Task),
    Delayed { deadline: Instant, task: Task },
    Stop,
}

/// Errors reported by [`Runtime`] operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A blocking call was made from the dispatch thread itself.
    #[error("blocking call on the dispatch thread would deadlock")]
    DispatchThread,
    /// The runtime has been shut down.
    #[error("runtime stopped")]
    Stopped,
    /// The queued closure panicked before producing a value.
    #[error("queued task panicked")]
    TaskPanicked,
    /// The dispatch thread could not be spawned.
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Settings for [`Runtime::start`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Limits applied to channels opened on the runtime.
    pub settings: ChannelSettings,
    /// Name given to the dispatch thread.
    pub thread_name: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            settings: ChannelSettings::default(),
            thread_name: "tcf-dispatch".to_owned(),
        }
    }
}

impl RuntimeOptions {
    /// Derives options from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            settings: config.channel(),
            ..Self::default()
        }
    }
}

struct RuntimeInner {
    sender: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread: OnceCell<ThreadId>,
    tokens: TokenCounter,
    channels: AtomicU64,
    settings: ChannelSettings,
}

/// Handle to the dispatch thread.
///
/// Handles are cheap to clone. The dispatch thread keeps running until
/// [`Runtime::shutdown`] is called.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Runtime")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Spawns the dispatch thread.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Spawn`] if the thread cannot be created.
    pub fn start(options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let (sender, receiver) = mpsc::channel();
        let runtime = Self {
            inner: Arc::new(RuntimeInner {
                sender: Mutex::new(Some(sender)),
                handle: Mutex::new(None),
                thread: OnceCell::new(),
                tokens: TokenCounter::default(),
                channels: AtomicU64::new(1),
                settings: options.settings,
            }),
        };
        let handle = thread::Builder::new()
            .name(options.thread_name)
            .spawn(move || run_dispatch(&receiver))
            .map_err(RuntimeError::Spawn)?;
        // Set before any caller can observe the runtime.
        if runtime.inner.thread.set(handle.thread().id()).is_err() {
            debug!(target: RUNTIME_TARGET, "dispatch thread id already recorded");
        }
        *lock(&runtime.inner.handle) = Some(handle);
        info!(target: RUNTIME_TARGET, "runtime started");
        Ok(runtime)
    }

    /// Channel limits configured for this runtime.
    #[must_use]
    pub fn settings(&self) -> &ChannelSettings {
        &self.inner.settings
    }

    /// Returns `true` until [`Runtime::shutdown`] has been requested.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.inner.sender).is_some()
    }

    /// Returns `true` when called on the dispatch thread.
    #[must_use]
    pub fn is_dispatch_thread(&self) -> bool {
        self.inner
            .thread
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    /// Issues the next process-wide token.
    #[must_use]
    pub fn next_token(&self) -> Token {
        self.inner.tokens.next_token()
    }

    pub(crate) fn token_counter(&self) -> TokenCounter {
        self.inner.tokens.clone()
    }

    pub(crate) fn next_channel_id(&self) -> ChannelId {
        ChannelId::new(self.inner.channels.fetch_add(1, Ordering::Relaxed))
    }

    /// Queues `task` to run on the dispatch thread.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Stopped`] after shutdown.
    pub fn invoke_later(&self, task: impl FnOnce() + Send + 'static) -> Result<(), RuntimeError> {
        self.send(Job::Run(Box::new(move |_| task())))
            .map_err(|_| RuntimeError::Stopped)
    }

    /// Queues `task` to run on the dispatch thread once `delay` has elapsed.
    ///
    /// Tasks whose deadlines coincide run in submission order.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Stopped`] after shutdown.
    pub fn invoke_later_with_delay(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), RuntimeError> {
        let deadline = Instant::now() + delay;
        self.send(Job::Delayed {
            deadline,
            task: Box::new(move |_| task()),
        })
        .map_err(|_| RuntimeError::Stopped)
    }

    /// Runs `task` on the dispatch thread and blocks until it returns.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::DispatchThread`] when called from the dispatch
    /// thread, [`RuntimeError::Stopped`] after shutdown, and
    /// [`RuntimeError::TaskPanicked`] if `task` panicked.
    pub fn invoke_and_wait<T>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> Result<T, RuntimeError>
    where
        T: Send + 'static,
    {
        self.call(move |_| task())
    }

    /// Blocks until every task queued before this call has run.
    ///
    /// # Errors
    ///
    /// See [`Runtime::invoke_and_wait`].
    pub fn sync(&self) -> Result<(), RuntimeError> {
        self.invoke_and_wait(|| ())
    }

    /// Stops the dispatch thread.
    ///
    /// Every open channel is closed with [`ChannelError::RuntimeStopped`]
    /// before the thread exits. Pending delayed tasks are discarded. Calling
    /// this more than once has no further effect.
    pub fn shutdown(&self) {
        let Some(sender) = lock(&self.inner.sender).take() else {
            return;
        };
        if sender.send(Job::Stop).is_err() {
            debug!(target: RUNTIME_TARGET, "dispatch thread already gone");
        }
        drop(sender);
        if self.is_dispatch_thread() {
            return;
        }
        let handle = lock(&self.inner.handle).take();
        if let Some(join) = handle
            && join.join().is_err()
        {
            error!(target: RUNTIME_TARGET, "dispatch thread panicked");
        }
    }

    /// Queues `task` with access to channel state.
    ///
    /// After shutdown the task runs immediately on the calling thread against
    /// an empty dispatch context, so operations on closed channels still
    /// complete their callbacks.
    pub(crate) fn submit(&self, task: impl FnOnce(&mut Dispatch) + Send + 'static) {
        if let Err(Job::Run(rejected)) = self.send(Job::Run(Box::new(task))) {
            let mut detached = Dispatch::detached();
            run_task(&mut detached, rejected);
        }
    }

    /// Runs `task` with access to channel state and waits for its value.
    pub(crate) fn call<T>(
        &self,
        task: impl FnOnce(&mut Dispatch) -> T + Send + 'static,
    ) -> Result<T, RuntimeError>
    where
        T: Send + 'static,
    {
        if self.is_dispatch_thread() {
            return Err(RuntimeError::DispatchThread);
        }
        let (reply, receiver) = mpsc::sync_channel(1);
        self.send(Job::Run(Box::new(move |dispatch| {
            if reply.send(task(dispatch)).is_err() {
                debug!(target: RUNTIME_TARGET, "blocking caller went away");
            }
        })))
        .map_err(|_| RuntimeError::Stopped)?;
        receiver.recv().map_err(|_| RuntimeError::TaskPanicked)
    }

    fn send(&self, job: Job) -> Result<(), Job> {
        let guard = lock(&self.inner.sender);
        match guard.as_ref() {
            Some(sender) => sender.send(job).map_err(|rejected| rejected.0),
            None => Err(job),
        }
    }
}

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_task(dispatch: &mut Dispatch, task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(|| task(dispatch))).is_err() {
        error!(target: RUNTIME_TARGET, "queued task panicked");
    }
}

fn run_dispatch(receiver: &Receiver<Job>) {
    let mut dispatch = Dispatch::new();
    let mut timers = TimerQueue::default();
    debug!(target: RUNTIME_TARGET, "dispatch thread running");
    loop {
        while let Some(task) = timers.pop_due(Instant::now()) {
            run_task(&mut dispatch, task);
        }
        let job = match timers.next_deadline() {
            Some(deadline) => {
                match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(job) => job,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(job) => job,
                Err(_) => break,
            },
        };
        match job {
            Job::Run(task) => run_task(&mut dispatch, task),
            Job::Delayed { deadline, task } => timers.push(deadline, task),
            Job::Stop => break,
        }
    }
    let discarded = timers.clear();
    dispatch.close_all(&ChannelError::RuntimeStopped);
    info!(
        target: RUNTIME_TARGET,
        discarded_timers = discarded,
        "runtime stopped"
    );
}
