//! Channel handles and the state machine behind them.
//!
//! A [`Channel`] is a cheap handle. The protocol state it refers to lives on
//! the runtime's dispatch thread; every mutating operation on the handle is
//! queued there. The
//! handle itself only exposes read-only snapshots (state, congestion level,
//! remote peer and services) that the dispatch thread publishes.

mod dispatch;
mod io;
mod listener;
mod machine;
mod redirect;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use tracing::{debug, error, info};

use crate::errors::ChannelError;
use crate::frame::Frame;
use crate::locator::{LOCATOR_SERVICE, LocatorProxy, LocatorServer, Peer, RedirectTarget};
use crate::runtime::{Runtime, lock};
use crate::service::{CommandServer, Proxy, ServiceRegistry};
use crate::token::Token;
use crate::transport::{Transport, TransportError};

pub(crate) use self::dispatch::Dispatch;
pub use self::listener::{ChannelListener, CommandListener, EventError, EventListener, TraceListener};
pub(crate) use self::machine::ChannelCore;
pub(crate) use self::redirect::PendingRedirect;

pub(crate) const CHANNEL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::channel");

/// Runtime-unique channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Numeric value of the id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "#{}", self.0)
    }
}

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the remote handshake or for a redirect to complete.
    Opening,
    /// Ready for traffic.
    Open,
    /// Terminal.
    Closed,
}

impl ChannelState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Opening => 0,
            Self::Open => 1,
            Self::Closed => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Opening,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

/// Snapshots published by the dispatch thread for any thread to read.
pub(crate) struct ChannelShared {
    state: AtomicU8,
    congestion: AtomicI32,
    remote_peer: Mutex<Arc<Peer>>,
    remote_services: Mutex<Vec<String>>,
    close_error: Mutex<Option<ChannelError>>,
    backlog: AtomicUsize,
}

impl ChannelShared {
    fn new(peer: Arc<Peer>) -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Opening.as_u8()),
            congestion: AtomicI32::new(0),
            remote_peer: Mutex::new(peer),
            remote_services: Mutex::new(Vec::new()),
            close_error: Mutex::new(None),
            backlog: AtomicUsize::new(0),
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn set_congestion(&self, level: i32) {
        self.congestion.store(level, Ordering::Release);
    }

    pub(crate) fn set_remote_peer(&self, peer: Arc<Peer>) {
        *lock(&self.remote_peer) = peer;
    }

    pub(crate) fn set_remote_services(&self, services: Vec<String>) {
        *lock(&self.remote_services) = services;
    }

    pub(crate) fn set_close_error(&self, error: Option<ChannelError>) {
        *lock(&self.close_error) = error;
    }

    pub(crate) fn frame_queued(&self) {
        self.backlog.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks one queued frame as dispatched and returns the remaining backlog.
    pub(crate) fn frame_dispatched(&self) -> usize {
        let previous = self
            .backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or_else(|count| count);
        previous.saturating_sub(1)
    }

    /// Error handed to work that arrives after the channel is gone.
    pub(crate) fn termination_error(&self) -> ChannelError {
        if self.state() == ChannelState::Closed {
            lock(&self.close_error)
                .clone()
                .unwrap_or(ChannelError::Closed)
        } else {
            ChannelError::RuntimeStopped
        }
    }
}

/// Handle to one logical channel.
///
/// Handles are cheap to clone and may be used from any thread. Operations
/// that change channel state are queued to the runtime's dispatch thread
/// and take effect in submission order.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    runtime: Runtime,
    shared: Arc<ChannelShared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("remote_peer", &self.remote_peer().id())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Starts a channel over a connected transport.
    ///
    /// The channel enters [`ChannelState::Opening`] and immediately sends its
    /// handshake listing the services in `services`. A built-in `Locator`
    /// server is added when `services` does not provide one.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::RuntimeStopped`] when the runtime has shut
    /// down, or a transport error when the I/O threads cannot be spawned.
    pub fn open(
        runtime: &Runtime,
        transport: Transport,
        peer: Arc<Peer>,
        mut services: ServiceRegistry,
    ) -> Result<Self, ChannelError> {
        if !runtime.is_running() {
            return Err(ChannelError::RuntimeStopped);
        }
        let settings = *runtime.settings();
        let channel = Self {
            id: runtime.next_channel_id(),
            runtime: runtime.clone(),
            shared: Arc::new(ChannelShared::new(peer)),
        };
        info!(
            target: CHANNEL_TARGET,
            channel = %channel.id,
            transport = transport.description(),
            peer = channel.remote_peer().id(),
            "opening channel"
        );
        services.ensure(LOCATOR_SERVICE, || Arc::new(LocatorServer));
        let (reader, writer, shutdown) = transport.into_parts(settings.max_message_size);
        let (outbound, queue) = mpsc::channel();
        let core = ChannelCore::new(
            channel.clone(),
            services,
            outbound,
            runtime.token_counter(),
            settings.inbound_backlog_limit,
        );
        runtime.submit(move |dispatch| dispatch.register(core));
        let spawned = io::spawn_writer(&channel, writer, queue, shutdown)
            .and_then(|()| io::spawn_reader(&channel, reader));
        if let Err(source) = spawned {
            let failure = ChannelError::transport(TransportError::Io(source));
            channel.terminate(failure.clone());
            return Err(failure);
        }
        Ok(channel)
    }

    /// Runtime-unique id of this channel.
    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// Runtime the channel is dispatched on.
    #[must_use]
    pub const fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Peer the channel currently talks to, updated by redirects.
    #[must_use]
    pub fn remote_peer(&self) -> Arc<Peer> {
        Arc::clone(&lock(&self.shared.remote_peer))
    }

    /// Service names advertised by the remote handshake.
    #[must_use]
    pub fn remote_services(&self) -> Vec<String> {
        lock(&self.shared.remote_services).clone()
    }

    /// Congestion level last advertised by the remote peer.
    ///
    /// Values above zero ask senders to delay further commands.
    #[must_use]
    pub fn congestion_level(&self) -> i32 {
        self.shared.congestion.load(Ordering::Acquire)
    }

    /// Inbound frames read from the transport but not yet dispatched.
    #[must_use]
    pub fn inbound_backlog(&self) -> usize {
        self.shared.backlog.load(Ordering::Acquire)
    }

    /// Error the channel closed with; `None` while open or after a clean
    /// close.
    #[must_use]
    pub fn close_error(&self) -> Option<ChannelError> {
        lock(&self.shared.close_error).clone()
    }

    /// Locator client bound to this channel.
    #[must_use]
    pub fn locator(&self) -> LocatorProxy {
        LocatorProxy::new(self.clone())
    }

    /// Registers a lifecycle listener.
    pub fn add_channel_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.with_core(move |core| core.add_channel_listener(listener));
    }

    /// Removes a lifecycle listener added earlier.
    pub fn remove_channel_listener(&self, listener: &Arc<dyn ChannelListener>) {
        let target = Arc::clone(listener);
        self.with_core(move |core| core.remove_channel_listener(&target));
    }

    /// Registers a listener for events from `service`.
    pub fn add_event_listener(&self, service: &str, listener: Arc<dyn EventListener>) {
        let service_name = service.to_owned();
        self.with_core(move |core| core.add_event_listener(service_name, listener));
    }

    /// Removes an event listener added earlier.
    pub fn remove_event_listener(&self, service: &str, listener: &Arc<dyn EventListener>) {
        let service_name = service.to_owned();
        let target = Arc::clone(listener);
        self.with_core(move |core| core.remove_event_listener(&service_name, &target));
    }

    /// Registers a traffic observer.
    pub fn add_trace_listener(&self, listener: Arc<dyn TraceListener>) {
        self.with_core(move |core| core.add_trace_listener(listener));
    }

    /// Removes a traffic observer added earlier.
    pub fn remove_trace_listener(&self, listener: &Arc<dyn TraceListener>) {
        let target = Arc::clone(listener);
        self.with_core(move |core| core.remove_trace_listener(&target));
    }

    /// Adds a local service after the channel has been opened.
    ///
    /// Names that are already served keep their existing server.
    pub fn add_command_server(&self, service: &str, server: Arc<dyn CommandServer>) {
        let service_name = service.to_owned();
        self.with_core(move |core| core.add_command_server(service_name, server));
    }

    /// Installs or clears the fallback for unclaimed traffic.
    pub fn set_proxy(&self, proxy: Option<Arc<dyn Proxy>>) {
        self.with_core(move |core| core.set_proxy(proxy));
    }

    /// Sends a command and returns its token.
    ///
    /// `listener` receives the reply. If the channel is already closed it is
    /// terminated with the closing error instead; commands issued while the
    /// channel is opening are held and sent once it opens.
    pub fn send_command(
        &self,
        service: &str,
        name: &str,
        data: Vec<u8>,
        listener: Box<dyn CommandListener>,
    ) -> Token {
        let token = self.runtime.next_token();
        let frame = Frame::Command {
            token: token.id().to_owned(),
            service: service.to_owned(),
            name: name.to_owned(),
            data,
        };
        let id = self.id;
        let shared = Arc::clone(&self.shared);
        let issued = token.clone();
        self.runtime.submit(move |dispatch| match dispatch.core_mut(id) {
            Some(core) => core.send_command(issued, frame, listener),
            None => {
                let error = shared.termination_error();
                debug!(target: CHANNEL_TARGET, channel = %id, token = %issued, "command on closed channel");
                guarded("command listener", move || listener.terminated(&issued, error));
            }
        });
        token
    }

    /// Sends the final result for a command received from the peer.
    pub fn send_result(&self, token: &Token, data: Vec<u8>) {
        let frame = Frame::Result {
            token: token.id().to_owned(),
            data,
        };
        self.with_core(move |core| core.send_reply(frame));
    }

    /// Sends an intermediate result for a command received from the peer.
    pub fn send_progress(&self, token: &Token, data: Vec<u8>) {
        let frame = Frame::Progress {
            token: token.id().to_owned(),
            data,
        };
        self.with_core(move |core| core.send_reply(frame));
    }

    /// Tells the peer a received command is not recognised.
    pub fn reject_command(&self, token: &Token) {
        let frame = Frame::NotFound {
            token: token.id().to_owned(),
        };
        self.with_core(move |core| core.send_reply(frame));
    }

    /// Broadcasts an event to the peer.
    pub fn send_event(&self, service: &str, name: &str, data: Vec<u8>) {
        let frame = Frame::Event {
            service: service.to_owned(),
            name: name.to_owned(),
            data,
        };
        self.with_core(move |core| core.send_reply(frame));
    }

    /// Asks the remote end to splice this channel to another peer.
    ///
    /// Redirects run one at a time, after the current remote end has
    /// completed its handshake. On success the remote peer identity changes
    /// and the channel reopens once the new peer's handshake arrives; on
    /// failure `done` receives the error and the channel is unchanged.
    pub fn redirect(
        &self,
        target: RedirectTarget,
        done: impl FnOnce(Option<ChannelError>) + Send + 'static,
    ) {
        self.queue_redirect(PendingRedirect::new(target, None, Some(Box::new(done))));
    }

    /// Queues a redirect hop towards a known peer; failure closes the channel.
    pub(crate) fn redirect_hop(&self, peer: Arc<Peer>) {
        let target = RedirectTarget::Id(peer.id().to_owned());
        self.queue_redirect(PendingRedirect::new(target, Some(peer), None));
    }

    fn queue_redirect(&self, pending: PendingRedirect) {
        let id = self.id;
        let shared = Arc::clone(&self.shared);
        self.runtime.submit(move |dispatch| {
            if dispatch.contains(id) {
                dispatch.apply(id, move |core| core.redirect(pending));
            } else {
                pending.abandon(shared.termination_error());
            }
        });
    }

    /// Closes the channel cleanly.
    ///
    /// Pending commands are terminated with [`ChannelError::Closed`] and
    /// listeners are notified with `None`. Closing twice has no further
    /// effect.
    pub fn close(&self) {
        let id = self.id;
        self.runtime
            .submit(move |dispatch| dispatch.close_channel(id, None));
    }

    /// Closes the channel with an error.
    pub fn terminate(&self, error: ChannelError) {
        let id = self.id;
        self.runtime
            .submit(move |dispatch| dispatch.close_channel(id, Some(error)));
    }

    pub(crate) fn shared(&self) -> &ChannelShared {
        &self.shared
    }

    pub(crate) fn with_core(&self, task: impl FnOnce(&mut ChannelCore) + Send + 'static) {
        let id = self.id;
        self.runtime.submit(move |dispatch| match dispatch.core_mut(id) {
            Some(core) => task(core),
            None => debug!(target: CHANNEL_TARGET, channel = %id, "operation on closed channel ignored"),
        });
    }
}

/// Runs a user callback, logging and swallowing a panic.
pub(crate) fn guarded<T>(what: &str, callback: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!(target: CHANNEL_TARGET, callback = what, "callback panicked");
            None
        }
    }
}
