//! Callback contracts notified by a channel.
//!
//! Every callback runs on the dispatch thread. Implementations must not block
//! on the runtime (for example through [`crate::Runtime::invoke_and_wait`]);
//! they may freely queue further work through a [`crate::Channel`] handle.

use thiserror::Error;

use crate::errors::ChannelError;
use crate::frame::Frame;
use crate::token::Token;

/// Observes channel lifecycle and outbound congestion.
pub trait ChannelListener: Send + Sync {
    /// The channel finished its handshake or a redirect completed.
    fn on_channel_opened(&self) {}

    /// The channel closed; `error` is `None` for a clean close.
    fn on_channel_closed(&self, _error: Option<&ChannelError>) {}

    /// The remote peer changed its advertised congestion level.
    ///
    /// Levels above zero ask the caller to delay further commands.
    fn congestion_level(&self, _level: i32) {}
}

/// Failure reported by an [`EventListener`].
#[derive(Debug, Clone, Error)]
pub enum EventError {
    /// The listener does not understand this event name.
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    /// The event arguments do not match the listener's contract.
    #[error("malformed event arguments: {0}")]
    Malformed(String),
    /// The listener failed for its own reasons.
    #[error("event listener failed: {0}")]
    Failed(String),
}

impl EventError {
    /// Returns `true` when the failure means the peer broke the protocol.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::UnknownEvent(_) | Self::Malformed(_))
    }
}

/// Receives events broadcast by one remote service.
pub trait EventListener: Send + Sync {
    /// Handles one event.
    ///
    /// # Errors
    ///
    /// Returning a protocol violation closes the channel. Other errors are
    /// logged and delivery continues with the next listener.
    fn event(&self, name: &str, data: &[u8]) -> Result<(), EventError>;
}

/// Observes raw traffic for diagnostics.
pub trait TraceListener: Send + Sync {
    /// A frame was received.
    fn on_message_received(&self, _frame: &Frame) {}

    /// A frame was queued for sending.
    fn on_message_sent(&self, _frame: &Frame) {}

    /// The channel closed.
    fn on_channel_closed(&self, _error: Option<&ChannelError>) {}
}

/// Receives the reply to one command.
///
/// Exactly one of [`CommandListener::result`] and
/// [`CommandListener::terminated`] is called, after any number of
/// [`CommandListener::progress`] calls.
pub trait CommandListener: Send {
    /// An intermediate result arrived.
    fn progress(&mut self, _token: &Token, _data: &[u8]) {}

    /// The final result arrived.
    fn result(self: Box<Self>, token: &Token, data: &[u8]);

    /// The command will never complete, e.g. because the channel closed.
    fn terminated(self: Box<Self>, token: &Token, error: ChannelError);
}
