//! Listeners that record what the channel tells them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::channel::{ChannelListener, EventError, EventListener, TraceListener};
use crate::command::CommandError;
use crate::errors::ChannelError;
use crate::frame::Frame;
use crate::locator::{LocatorListener, Peer};

const PATIENCE: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Polls `condition` until it holds or the patience runs out.
pub fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Records channel lifecycle notifications.
#[derive(Default)]
pub struct RecordingChannelListener {
    opened: AtomicUsize,
    closed: Mutex<Vec<Option<String>>>,
    congestion: Mutex<Vec<i32>>,
}

impl RecordingChannelListener {
    /// Number of `on_channel_opened` calls.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Close notifications, each rendered as its error message.
    pub fn closed(&self) -> Vec<Option<String>> {
        lock(&self.closed).clone()
    }

    /// Congestion levels reported so far.
    pub fn congestion(&self) -> Vec<i32> {
        lock(&self.congestion).clone()
    }
}

impl ChannelListener for RecordingChannelListener {
    fn on_channel_opened(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_channel_closed(&self, error: Option<&ChannelError>) {
        lock(&self.closed).push(error.map(ToString::to_string));
    }

    fn congestion_level(&self, level: i32) {
        lock(&self.congestion).push(level);
    }
}

/// How a [`RecordingEventListener`] reacts after recording an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Accept the event.
    Accept,
    /// Report a listener-local failure.
    Fail,
    /// Panic inside the callback.
    Panic,
}

/// Records event names delivered for one service.
pub struct RecordingEventListener {
    reaction: Reaction,
    events: Mutex<Vec<String>>,
}

impl RecordingEventListener {
    /// Creates a listener with the given reaction.
    pub const fn new(reaction: Reaction) -> Self {
        Self {
            reaction,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Event names seen so far.
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }
}

impl EventListener for RecordingEventListener {
    fn event(&self, name: &str, _data: &[u8]) -> Result<(), EventError> {
        lock(&self.events).push(name.to_owned());
        match self.reaction {
            Reaction::Accept => Ok(()),
            Reaction::Fail => Err(EventError::Failed("listener refused".to_owned())),
            Reaction::Panic => panic!("listener blew up"),
        }
    }
}

/// Records peer notifications from the locator.
#[derive(Default)]
pub struct RecordingLocatorListener {
    added: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl RecordingLocatorListener {
    /// Ids of added peers, in order.
    pub fn added(&self) -> Vec<String> {
        lock(&self.added).clone()
    }

    /// Ids of removed peers, in order.
    pub fn removed(&self) -> Vec<String> {
        lock(&self.removed).clone()
    }
}

impl LocatorListener for RecordingLocatorListener {
    fn peer_added(&self, peer: &Arc<Peer>) {
        lock(&self.added).push(peer.id().to_owned());
    }

    fn peer_removed(&self, id: &str) {
        lock(&self.removed).push(id.to_owned());
    }
}

/// Records frame traffic as `"<direction> <type> <service>.<name>"` lines.
#[derive(Default)]
pub struct RecordingTraceListener {
    lines: Mutex<Vec<String>>,
}

impl RecordingTraceListener {
    /// Lines recorded so far, in callback order.
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    fn record(&self, direction: &str, frame: &Frame) {
        let mut line = format!("{direction} {}", frame.message_type());
        if let (Some(service), Some(name)) = (frame.service(), frame.name()) {
            line.push_str(&format!(" {service}.{name}"));
        }
        lock(&self.lines).push(line);
    }
}

impl TraceListener for RecordingTraceListener {
    fn on_message_received(&self, frame: &Frame) {
        self.record("received", frame);
    }

    fn on_message_sent(&self, frame: &Frame) {
        self.record("sent", frame);
    }

    fn on_channel_closed(&self, error: Option<&ChannelError>) {
        let line = match error {
            Some(error) => format!("closed {error}"),
            None => "closed".to_owned(),
        };
        lock(&self.lines).push(line);
    }
}

/// Outcome of a command as seen by its completion callback.
pub type Outcome = (Option<CommandError>, Vec<Value>);

/// Collects command outcomes from completion callbacks.
pub struct Outcomes {
    sender: Sender<Outcome>,
    receiver: Receiver<Outcome>,
}

impl Default for Outcomes {
    fn default() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }
}

impl Outcomes {
    /// Returns a completion callback feeding this collector.
    pub fn callback(&self) -> impl FnOnce(Option<CommandError>, Vec<Value>) + Send + 'static {
        let sender = self.sender.clone();
        move |error, args| sender.send((error, args)).expect("outcome collector")
    }

    /// Waits for the next outcome.
    pub fn next(&self) -> Outcome {
        self.receiver
            .recv_timeout(PATIENCE)
            .expect("command should complete")
    }

    /// Returns `true` when no outcome is waiting.
    pub fn is_idle(&self) -> bool {
        self.receiver.try_recv().is_err()
    }
}
