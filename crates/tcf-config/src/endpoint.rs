use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Declarative address of a peer's byte transport.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum PeerEndpoint {
    /// Unix domain socket endpoint.
    Unix {
        /// Filesystem path of the socket.
        path: Utf8PathBuf,
    },
    /// TCP socket endpoint.
    Tcp {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl PeerEndpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP socket endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Returns the Unix socket path when the endpoint uses the Unix transport.
    #[must_use]
    pub fn unix_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Unix { path } => Some(path.as_ref()),
            Self::Tcp { .. } => None,
        }
    }

    /// Builds an endpoint from the `TransportName`, `Host` and `Port`
    /// attributes advertised by a peer.
    ///
    /// # Errors
    ///
    /// Returns an [`EndpointParseError`] when the transport is not supported or
    /// a required attribute is missing or malformed.
    pub fn from_peer_attributes(
        transport: Option<&str>,
        host: Option<&str>,
        port: Option<&str>,
    ) -> Result<Self, EndpointParseError> {
        let transport_name = transport.unwrap_or("TCP");
        match transport_name.to_ascii_lowercase().as_str() {
            "tcp" | "ssl" => {
                let host_name = host.unwrap_or("127.0.0.1");
                let port_text =
                    port.ok_or_else(|| EndpointParseError::MissingPort(host_name.to_owned()))?;
                let port_number = port_text
                    .parse()
                    .map_err(|_| EndpointParseError::InvalidPort(port_text.to_owned()))?;
                Ok(Self::tcp(host_name, port_number))
            }
            "unix" => {
                let path = host
                    .filter(|candidate| !candidate.is_empty())
                    .ok_or_else(|| EndpointParseError::MissingUnixPath(transport_name.to_owned()))?;
                Ok(Self::unix(path))
            }
            _ => Err(EndpointParseError::UnsupportedScheme(transport_name.to_owned())),
        }
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix://{path}"),
            Self::Tcp { host, port } => write!(formatter, "tcp://{host}:{port}"),
        }
    }
}

impl FromStr for PeerEndpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input)?;
        if url.cannot_be_a_base() {
            // Agent-style addresses such as `TCP:127.0.0.1:1534`.
            return parse_agent_address(url.scheme(), url.path(), input);
        }
        match url.scheme() {
            "unix" => {
                let path = url.path();
                if path.is_empty() {
                    return Err(EndpointParseError::MissingUnixPath(input.to_owned()));
                }
                Ok(Self::unix(path))
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| EndpointParseError::MissingHost(input.to_owned()))?;
                let port = url
                    .port()
                    .ok_or_else(|| EndpointParseError::MissingPort(input.to_owned()))?;
                Ok(Self::tcp(host, port))
            }
            other => Err(EndpointParseError::UnsupportedScheme(other.to_owned())),
        }
    }
}

fn parse_agent_address(
    scheme: &str,
    rest: &str,
    input: &str,
) -> Result<PeerEndpoint, EndpointParseError> {
    match scheme {
        "tcp" => {
            let (host, port_text) = rest
                .rsplit_once(':')
                .ok_or_else(|| EndpointParseError::MissingPort(input.to_owned()))?;
            if host.is_empty() {
                return Err(EndpointParseError::MissingHost(input.to_owned()));
            }
            let port = port_text
                .parse()
                .map_err(|_| EndpointParseError::InvalidPort(port_text.to_owned()))?;
            Ok(PeerEndpoint::tcp(host, port))
        }
        "unix" => {
            if rest.is_empty() {
                return Err(EndpointParseError::MissingUnixPath(input.to_owned()));
            }
            Ok(PeerEndpoint::unix(rest))
        }
        other => Err(EndpointParseError::UnsupportedScheme(other.to_owned())),
    }
}

/// Errors encountered while parsing a [`PeerEndpoint`] from text.
#[derive(Debug, Error)]
pub enum EndpointParseError {
    /// Scheme was not recognised.
    #[error("unsupported transport '{0}'")]
    UnsupportedScheme(String),
    /// TCP host name was missing.
    #[error("missing TCP host in '{0}'")]
    MissingHost(String),
    /// TCP port was missing from the address.
    #[error("missing TCP port in '{0}'")]
    MissingPort(String),
    /// TCP port was not a number in range.
    #[error("invalid TCP port '{0}'")]
    InvalidPort(String),
    /// Unix socket path was absent.
    #[error("missing Unix socket path in '{0}'")]
    MissingUnixPath(String),
    /// URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}
