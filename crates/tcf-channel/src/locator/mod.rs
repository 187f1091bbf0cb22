//! Peer discovery and channel redirection.
//!
//! Every channel carries a `Locator` service. The remote end announces the
//! peers it can reach through `peerAdded`, `peerChanged`, `peerRemoved` and
//! `peerHeartBeat` events; a [`LocatorProxy`] keeps that catalog for its
//! channel and can redirect the channel to one of those peers.

mod peer;
mod server;
mod state;

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::channel::Channel;
use crate::command::{Command, CommandError};
use crate::errors::ChannelError;
use crate::runtime::RuntimeError;
use crate::token::Token;

pub use self::peer::{
    ATTR_AGENT_ID, ATTR_HOST, ATTR_ID, ATTR_NAME, ATTR_OS_NAME, ATTR_PORT, ATTR_PROXY,
    ATTR_SERVICE_MANAGER_ID, ATTR_TRANSPORT_NAME, Connector, Peer, PeerError, SocketConnector,
};
pub use self::server::LocatorServer;
pub(crate) use self::state::LocatorState;

pub(crate) const LOCATOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::locator");

/// Name of the locator service.
pub const LOCATOR_SERVICE: &str = "Locator";
pub(crate) const HELLO_EVENT: &str = "Hello";
pub(crate) const SYNC_COMMAND: &str = "sync";
pub(crate) const GET_PEERS_COMMAND: &str = "getPeers";
pub(crate) const REDIRECT_COMMAND: &str = "redirect";

/// Destination of a redirect.
#[derive(Debug, Clone, PartialEq)]
pub enum RedirectTarget {
    /// A peer known to the remote end, by id.
    Id(String),
    /// A peer described by its attributes.
    Attributes(Map<String, Value>),
}

impl fmt::Display for RedirectTarget {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => formatter.write_str(id),
            Self::Attributes(attributes) => match attributes.get(ATTR_ID).and_then(Value::as_str) {
                Some(id) => formatter.write_str(id),
                None => formatter.write_str("<anonymous peer>"),
            },
        }
    }
}

impl From<&str> for RedirectTarget {
    fn from(id: &str) -> Self {
        Self::Id(id.to_owned())
    }
}

/// Observes the peer catalog of one channel.
///
/// Callbacks run on the dispatch thread. A panicking listener is logged and
/// does not prevent delivery to the others.
pub trait LocatorListener: Send + Sync {
    /// A peer became reachable.
    fn peer_added(&self, _peer: &Arc<Peer>) {}

    /// A known peer changed its attributes.
    fn peer_changed(&self, _peer: &Arc<Peer>) {}

    /// A peer went away.
    fn peer_removed(&self, _id: &str) {}

    /// A known peer is still alive.
    fn peer_heart_beat(&self, _id: &str) {}
}

/// Locator client for one channel.
#[derive(Debug, Clone)]
pub struct LocatorProxy {
    channel: Channel,
}

impl LocatorProxy {
    pub(crate) const fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Registers a catalog listener.
    ///
    /// The first listener triggers a single `getPeers` query once the
    /// channel is open; later changes arrive as events only.
    pub fn add_listener(&self, listener: Arc<dyn LocatorListener>) {
        self.channel
            .with_core(move |core| core.add_locator_listener(listener));
    }

    /// Removes a catalog listener added earlier.
    pub fn remove_listener(&self, listener: &Arc<dyn LocatorListener>) {
        let target = Arc::clone(listener);
        self.channel
            .with_core(move |core| core.remove_locator_listener(&target));
    }

    /// Snapshot of the peers known on this channel.
    ///
    /// # Errors
    ///
    /// Fails when called from the dispatch thread or after shutdown; see
    /// [`crate::Runtime::invoke_and_wait`].
    pub fn peers(&self) -> Result<Vec<Arc<Peer>>, RuntimeError> {
        let id = self.channel.id();
        self.channel.runtime().call(move |dispatch| {
            dispatch
                .core_mut(id)
                .map(|core| core.locator().peers())
                .unwrap_or_default()
        })
    }

    /// Looks one peer up by id.
    ///
    /// # Errors
    ///
    /// See [`LocatorProxy::peers`].
    pub fn peer(&self, peer_id: &str) -> Result<Option<Arc<Peer>>, RuntimeError> {
        let id = self.channel.id();
        let wanted = peer_id.to_owned();
        self.channel.runtime().call(move |dispatch| {
            dispatch
                .core_mut(id)
                .and_then(|core| core.locator().peer(&wanted))
        })
    }

    /// Round-trips a `sync` command to the remote locator.
    ///
    /// A failure closes the channel before `done` runs.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] if the command cannot be encoded.
    pub fn sync(
        &self,
        done: impl FnOnce(Option<CommandError>) + Send + 'static,
    ) -> Result<Token, CommandError> {
        let handle = self.channel.clone();
        Command::new(&self.channel, LOCATOR_SERVICE, SYNC_COMMAND)
            .without_error_slot()
            .send(move |error, _| {
                if let Some(failure) = &error {
                    handle.terminate(failure.clone().into_channel_error());
                }
                done(error);
            })
            .map_err(CommandError::Malformed)
    }

    /// Redirects the channel; see [`Channel::redirect`].
    pub fn redirect(
        &self,
        target: impl Into<RedirectTarget>,
        done: impl FnOnce(Option<ChannelError>) + Send + 'static,
    ) {
        self.channel.redirect(target.into(), done);
    }
}
