//! Client core for a TCF-style remote debug protocol.
//!
//! A [`Channel`] multiplexes asynchronous commands, results and events over
//! one byte transport. All protocol state is owned by a single dispatch
//! thread started through [`Runtime::start`]; channel handles, commands and
//! locator proxies queue their work there, so listeners and command
//! handlers never run concurrently with each other.
//!
//! The crate is organised bottom-up:
//!
//! - [`codec`] and [`frame`] define the argument encoding and the message
//!   layout.
//! - [`transport`] carries escaped messages over sockets or any
//!   `Read`/`Write` pair.
//! - [`runtime`] owns the dispatch thread and the token counter.
//! - [`channel`], [`service`] and [`command`] implement the connection state
//!   machine, local services and outgoing requests.
//! - [`locator`] tracks peers announced by the remote end and routes
//!   channels through them.

pub mod channel;
pub mod codec;
pub mod command;
pub mod errors;
pub mod frame;
pub mod locator;
pub mod runtime;
pub mod service;
pub mod telemetry;
pub mod token;
pub mod transport;

#[cfg(test)]
mod tests;

pub use channel::{
    Channel, ChannelId, ChannelListener, ChannelState, CommandListener, EventError,
    EventListener, TraceListener,
};
pub use codec::{Binary, CodecError, decode_args, encode_args};
pub use command::{Command, CommandError};
pub use errors::{ChannelError, ErrorReport, error_codes, to_error};
pub use frame::{Frame, FrameError, MessageType};
pub use locator::{
    Connector, LOCATOR_SERVICE, LocatorListener, LocatorProxy, Peer, PeerError, RedirectTarget,
    SocketConnector,
};
pub use runtime::{Runtime, RuntimeError, RuntimeOptions};
pub use service::{CommandContext, CommandServer, Proxy, ServiceError, ServiceRegistry};
pub use token::Token;
pub use transport::{Transport, TransportError};
