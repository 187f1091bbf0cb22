//! Peer descriptors and the transports that reach them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tcf_config::{ChannelSettings, EndpointParseError, PeerEndpoint};
use thiserror::Error;
use tracing::debug;

use super::LOCATOR_TARGET;
use crate::channel::Channel;
use crate::errors::ChannelError;
use crate::runtime::Runtime;
use crate::service::ServiceRegistry;
use crate::transport::{self, Transport, TransportError};

/// Unique peer id.
pub const ATTR_ID: &str = "ID";
/// Id of the service manager that registered the peer.
pub const ATTR_SERVICE_MANAGER_ID: &str = "ServiceManagerID";
/// Id of the agent hosting the peer.
pub const ATTR_AGENT_ID: &str = "AgentID";
/// Human-readable peer name.
pub const ATTR_NAME: &str = "Name";
/// Operating system of the peer.
pub const ATTR_OS_NAME: &str = "OSName";
/// Transport used to reach the peer, e.g. `TCP`.
pub const ATTR_TRANSPORT_NAME: &str = "TransportName";
/// Host name or address.
pub const ATTR_HOST: &str = "Host";
/// Port number, as text.
pub const ATTR_PORT: &str = "Port";
/// Present when the peer forwards traffic to other peers.
pub const ATTR_PROXY: &str = "Proxy";

/// Errors raised while describing or reaching a peer.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The attribute map has no string `ID`.
    #[error("peer attributes have no string ID")]
    MissingId,
    /// The attributes do not describe a usable endpoint.
    #[error(transparent)]
    Endpoint(#[from] EndpointParseError),
    /// Connecting to the peer failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The channel could not be opened.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Descriptor of a reachable endpoint.
///
/// A peer discovered through a channel keeps a link to the peer that channel
/// was connected to, so it can later be reached by reconnecting to that
/// parent and redirecting.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    attributes: Map<String, Value>,
    parent: Option<Arc<Peer>>,
}

impl Peer {
    /// Builds a root peer from its attributes.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::MissingId`] when `ID` is absent or not a string.
    pub fn from_attributes(attributes: Map<String, Value>) -> Result<Self, PeerError> {
        match attributes.get(ATTR_ID) {
            Some(Value::String(_)) => Ok(Self {
                attributes,
                parent: None,
            }),
            _ => Err(PeerError::MissingId),
        }
    }

    /// Describes a TCP endpoint.
    #[must_use]
    pub fn tcp(id: &str, host: &str, port: u16) -> Self {
        let mut attributes = Map::new();
        attributes.insert(ATTR_ID.to_owned(), Value::from(id));
        attributes.insert(ATTR_TRANSPORT_NAME.to_owned(), Value::from("TCP"));
        attributes.insert(ATTR_HOST.to_owned(), Value::from(host));
        attributes.insert(ATTR_PORT.to_owned(), Value::from(port.to_string()));
        Self {
            attributes,
            parent: None,
        }
    }

    pub(crate) const fn derived(attributes: Map<String, Value>, parent: Option<Arc<Self>>) -> Self {
        Self { attributes, parent }
    }

    /// Returns a copy reached through `parent`.
    #[must_use]
    pub fn with_parent(mut self, parent: Arc<Self>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Peer id; empty when the descriptor carries none.
    #[must_use]
    pub fn id(&self) -> &str {
        self.attribute(ATTR_ID).unwrap_or_default()
    }

    /// Full attribute map.
    #[must_use]
    pub const fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// String attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.attribute(ATTR_NAME)
    }

    /// Transport name, e.g. `TCP`.
    #[must_use]
    pub fn transport_name(&self) -> Option<&str> {
        self.attribute(ATTR_TRANSPORT_NAME)
    }

    /// Host attribute.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.attribute(ATTR_HOST)
    }

    /// Port attribute.
    #[must_use]
    pub fn port(&self) -> Option<&str> {
        self.attribute(ATTR_PORT)
    }

    /// Peer through whose channel this one was discovered.
    #[must_use]
    pub const fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    /// Returns a copy with replaced attributes and the same parent.
    #[must_use]
    pub fn with_attributes(&self, attributes: Map<String, Value>) -> Self {
        Self {
            attributes,
            parent: self.parent.clone(),
        }
    }

    /// Opens a channel to this peer.
    ///
    /// The root of the parent chain is connected through `connector`; each
    /// further hop is reached by a redirect once the previous hop has
    /// completed its handshake. A hop that fails closes the channel with
    /// [`ChannelError::Redirect`].
    ///
    /// # Errors
    ///
    /// Returns a [`PeerError`] when the root cannot be connected or the
    /// channel cannot be started.
    pub fn open_channel(
        self: &Arc<Self>,
        runtime: &Runtime,
        connector: &dyn Connector,
        services: ServiceRegistry,
    ) -> Result<Channel, PeerError> {
        let mut hops = vec![Arc::clone(self)];
        while let Some(parent) = hops.last().and_then(|peer| peer.parent().cloned()) {
            hops.push(parent);
        }
        let root = hops.pop().unwrap_or_else(|| Arc::clone(self));
        debug!(
            target: LOCATOR_TARGET,
            peer = self.id(),
            root = root.id(),
            hops = hops.len(),
            "opening channel"
        );
        let transport = connector.connect(&root)?;
        let channel = Channel::open(runtime, transport, root, services)?;
        for hop in hops.into_iter().rev() {
            channel.redirect_hop(hop);
        }
        Ok(channel)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(formatter, "{name} ({})", self.id()),
            None => formatter.write_str(self.id()),
        }
    }
}

/// Establishes byte transports to root peers.
pub trait Connector: Send + Sync {
    /// Connects to `peer`.
    ///
    /// # Errors
    ///
    /// Returns a [`PeerError`] when the peer cannot be reached.
    fn connect(&self, peer: &Peer) -> Result<Transport, PeerError>;
}

/// Connects to peers over TCP or Unix sockets using their attributes.
#[derive(Debug, Clone, Copy)]
pub struct SocketConnector {
    timeout: Duration,
}

impl SocketConnector {
    /// Creates a connector with an explicit connection timeout.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Creates a connector using the configured timeout.
    #[must_use]
    pub const fn from_settings(settings: &ChannelSettings) -> Self {
        Self::new(settings.connect_timeout())
    }
}

impl Connector for SocketConnector {
    fn connect(&self, peer: &Peer) -> Result<Transport, PeerError> {
        let endpoint = PeerEndpoint::from_peer_attributes(peer.transport_name(), peer.host(), peer.port())?;
        Ok(transport::connect(&endpoint, self.timeout)?)
    }
}
