//! BDD test world holding a channel and the script driving its remote end.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use serde_json::Value;

use crate::channel::{Channel, ChannelListener, ChannelState, EventListener};
use crate::command::Command;
use crate::errors::ChannelError;
use crate::locator::LocatorListener;
use crate::runtime::{Runtime, RuntimeOptions};
use crate::service::ServiceRegistry;

use super::recording::{
    Outcome, Outcomes, Reaction, RecordingChannelListener, RecordingEventListener,
    RecordingLocatorListener, eventually,
};
use super::remote::{ScriptedRemote, connect};

/// Shared state exercised by BDD step implementations.
pub struct TestWorld {
    /// Runtime dispatching the channel.
    pub runtime: Runtime,
    /// Channel under test.
    pub channel: Channel,
    /// Script playing the remote end.
    pub remote: ScriptedRemote,
    /// Lifecycle recorder registered on the channel.
    pub listener: Arc<RecordingChannelListener>,
    /// Completions of commands sent through [`TestWorld::send`].
    pub outcomes: Outcomes,
    /// Last outcome taken from [`TestWorld::outcomes`].
    pub last_outcome: Option<Outcome>,
    /// Event listeners registered by steps, in registration order.
    pub event_listeners: Vec<Arc<RecordingEventListener>>,
    /// Peer catalog recorder, once registered.
    pub locator_listener: Option<Arc<RecordingLocatorListener>>,
    /// Last result frame the remote end received.
    pub last_reply: Option<(String, Vec<Value>)>,
    /// Command frames the remote end received, as `(service, name, args)`.
    pub received_commands: Vec<(String, String, Vec<Value>)>,
    redirects: Option<Receiver<Option<ChannelError>>>,
}

impl TestWorld {
    /// Starts a runtime and opens a channel to a fresh scripted remote.
    pub fn new() -> Self {
        let runtime = Runtime::start(RuntimeOptions::default()).expect("runtime should start");
        let (channel, remote) = connect(&runtime, ServiceRegistry::new());
        let listener = Arc::new(RecordingChannelListener::default());
        channel.add_channel_listener(Arc::clone(&listener) as Arc<dyn ChannelListener>);
        Self {
            runtime,
            channel,
            remote,
            listener,
            outcomes: Outcomes::default(),
            last_outcome: None,
            event_listeners: Vec::new(),
            locator_listener: None,
            last_reply: None,
            received_commands: Vec::new(),
            redirects: None,
        }
    }

    /// Completes the handshake and waits until the channel is open.
    pub fn open(&mut self) {
        self.remote.handshake(&["Diag", "RunControl"]);
        self.wait_for_state(ChannelState::Open);
    }

    /// Waits until the channel reaches `state`.
    pub fn wait_for_state(&self, state: ChannelState) {
        let channel = self.channel.clone();
        eventually(&format!("channel state {state}"), move || channel.state() == state);
    }

    /// Sends a command through the generic builder.
    pub fn send(&self, service: &str, name: &str, args: Vec<Value>) {
        Command::new(&self.channel, service, name)
            .args(args)
            .send(self.outcomes.callback())
            .expect("command should encode");
    }

    /// Reads the next command on the remote end and records it.
    pub fn receive_command(&mut self) -> (String, Vec<Value>) {
        let (token, service, name, args) = self.remote.expect_command();
        self.received_commands.push((service, name, args.clone()));
        (token, args)
    }

    /// Waits for the next command completion.
    pub fn take_outcome(&mut self) -> &Outcome {
        self.last_outcome.insert(self.outcomes.next())
    }

    /// Starts a redirect whose completion is collected by the world.
    pub fn redirect(&mut self, target: &str) {
        let (sender, receiver) = mpsc::channel();
        self.channel.redirect(target.into(), move |error| {
            sender.send(error).expect("redirect collector");
        });
        self.redirects = Some(receiver);
    }

    /// Waits for the pending redirect to complete.
    pub fn redirect_outcome(&self) -> Option<ChannelError> {
        self.redirects
            .as_ref()
            .expect("a redirect should be pending")
            .recv_timeout(Duration::from_secs(5))
            .expect("redirect should complete")
    }

    /// Registers an event listener with the given reaction.
    pub fn listen(&mut self, service: &str, reaction: Reaction) {
        let listener = Arc::new(RecordingEventListener::new(reaction));
        self.channel
            .add_event_listener(service, Arc::clone(&listener) as Arc<dyn EventListener>);
        self.event_listeners.push(listener);
    }

    /// Registers a peer catalog recorder.
    pub fn watch_peers(&mut self) {
        let listener = Arc::new(RecordingLocatorListener::default());
        self.channel
            .locator()
            .add_listener(Arc::clone(&listener) as Arc<dyn LocatorListener>);
        self.locator_listener = Some(listener);
    }
}

impl Drop for TestWorld {
    fn drop(&mut self) {
        self.channel.close();
        self.runtime.shutdown();
    }
}
