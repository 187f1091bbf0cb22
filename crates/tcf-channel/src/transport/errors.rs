//! Error types for byte transports.

use std::io;

use thiserror::Error;

use crate::errors::error_codes;

/// Errors raised while moving messages over a byte stream.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Reading from or writing to the stream failed.
    #[error("transport I/O failed: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the stream.
    #[error("end of stream")]
    EndOfStream,
    /// A message exceeded the configured size limit.
    #[error("message exceeds {limit} bytes")]
    MessageTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },
    /// The stream contained an unknown escape sequence.
    #[error("invalid escape sequence 0x03 0x{0:02x}")]
    InvalidEscape(u8),
    /// A host name did not resolve to any socket address.
    #[error("failed to resolve {host}:{port}")]
    Resolve {
        /// Host name.
        host: String,
        /// Port number.
        port: u16,
        /// Resolver error, when one was reported.
        #[source]
        source: Option<io::Error>,
    },
    /// Connecting to an endpoint failed.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// Endpoint description.
        endpoint: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The endpoint kind is not available on this platform.
    #[error("unsupported endpoint {0}")]
    UnsupportedEndpoint(String),
}

impl TransportError {
    /// Returns `true` when the stream ended normally.
    #[must_use]
    pub const fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// Error code used when the failure is reported to a peer.
    #[must_use]
    pub const fn error_code(&self) -> i64 {
        match self {
            Self::EndOfStream => error_codes::EOF,
            Self::MessageTooLarge { .. } => error_codes::BUFFER_OVERFLOW,
            Self::InvalidEscape(_) => error_codes::PROTOCOL,
            Self::Io(_)
            | Self::Resolve { .. }
            | Self::Connect { .. }
            | Self::UnsupportedEndpoint(_) => error_codes::OTHER,
        }
    }
}
