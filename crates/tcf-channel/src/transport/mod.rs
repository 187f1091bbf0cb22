//! Byte transports carrying escaped protocol messages.
//!
//! A [`Transport`] is a connected duplex stream split into a reading half
//! and a writing half, plus an optional hook that tears the connection down
//! so a blocked reader wakes up when the channel closes.

mod errors;
mod stream;

use std::fmt;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tcf_config::PeerEndpoint;
use tracing::debug;

pub use self::errors::TransportError;
pub use self::stream::{MessageReader, MessageWriter, ReadOutcome};

pub(crate) const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

pub(crate) type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Connected duplex byte stream.
pub struct Transport {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    shutdown: Option<ShutdownHook>,
    description: String,
}

impl fmt::Debug for Transport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Transport")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Builds a transport from independent reading and writing halves.
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        description: impl Into<String>,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            shutdown: None,
            description: description.into(),
        }
    }

    /// Registers a hook run once when the channel stops using the transport.
    #[must_use]
    pub fn with_shutdown(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.shutdown = Some(Box::new(hook));
        self
    }

    /// Wraps a connected TCP stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the socket cannot be duplicated.
    pub fn tcp(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let description = stream
            .peer_addr()
            .map_or_else(|_| "tcp".to_owned(), |addr| format!("tcp://{addr}"));
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self::new(reader, stream, description).with_shutdown(move || {
            if let Err(error) = control.shutdown(Shutdown::Both) {
                debug!(target: TRANSPORT_TARGET, %error, "tcp shutdown failed");
            }
        }))
    }

    /// Wraps a connected Unix domain socket.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the socket cannot be duplicated.
    #[cfg(unix)]
    pub fn unix(stream: std::os::unix::net::UnixStream, description: impl Into<String>) -> Result<Self, TransportError> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self::new(reader, stream, description).with_shutdown(move || {
            if let Err(error) = control.shutdown(Shutdown::Both) {
                debug!(target: TRANSPORT_TARGET, %error, "unix socket shutdown failed");
            }
        }))
    }

    /// Human-readable description of the remote end.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn into_parts(
        self,
        max_message_size: usize,
    ) -> (
        MessageReader<Box<dyn Read + Send>>,
        MessageWriter<Box<dyn Write + Send>>,
        Option<ShutdownHook>,
    ) {
        (
            MessageReader::new(self.reader, max_message_size),
            MessageWriter::new(self.writer),
            self.shutdown,
        )
    }
}

/// Opens a transport to a declared endpoint.
///
/// # Errors
///
/// Returns a [`TransportError`] when the host does not resolve, the connection
/// fails or times out, or the endpoint kind is unsupported on this platform.
pub fn connect(endpoint: &PeerEndpoint, timeout: Duration) -> Result<Transport, TransportError> {
    debug!(target: TRANSPORT_TARGET, %endpoint, "connecting");
    match endpoint {
        PeerEndpoint::Tcp { host, port } => {
            let stream = connect_tcp(host, *port, timeout)?;
            Transport::tcp(stream)
        }
        PeerEndpoint::Unix { path } => connect_unix(endpoint, path.as_std_path()),
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            host: host.to_owned(),
            port,
            source: Some(source),
        })?
        .collect();
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(error) => last_error = Some((addr, error)),
        }
    }
    match last_error {
        Some((addr, source)) => Err(TransportError::Connect {
            endpoint: addr.to_string(),
            source,
        }),
        None => Err(TransportError::Resolve {
            host: host.to_owned(),
            port,
            source: None,
        }),
    }
}

#[cfg(unix)]
fn connect_unix(
    endpoint: &PeerEndpoint,
    path: &std::path::Path,
) -> Result<Transport, TransportError> {
    let stream = std::os::unix::net::UnixStream::connect(path).map_err(|source| {
        TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        }
    })?;
    Transport::unix(stream, endpoint.to_string())
}

#[cfg(not(unix))]
fn connect_unix(
    endpoint: &PeerEndpoint,
    _path: &std::path::Path,
) -> Result<Transport, TransportError> {
    Err(TransportError::UnsupportedEndpoint(endpoint.to_string()))
}
