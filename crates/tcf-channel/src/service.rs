//! Local command handlers and the service registry.
//!
//! Services answer commands received from the remote peer. A channel looks a
//! command up by exact service name in its [`ServiceRegistry`]; commands for
//! unregistered services fall back to the channel's [`Proxy`], if any, and
//! are otherwise answered with an `INV_COMMAND` error.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::channel::Channel;
use crate::codec::{self, CodecError};
use crate::errors::{ChannelError, ErrorReport, error_codes};
use crate::frame::Frame;
use crate::token::Token;

pub(crate) const SERVICE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::service");

/// Errors raised by service registration and command handlers.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A server is already registered under this name.
    #[error("service '{0}' is already registered")]
    Duplicate(String),
    /// No server or proxy handles the named service.
    #[error("Service not available: {0}")]
    Unavailable(String),
    /// The command arguments could not be decoded.
    #[error("invalid command arguments: {0}")]
    Arguments(#[from] CodecError),
    /// The handler failed with a structured report.
    #[error("{0}")]
    Failed(Box<ErrorReport>),
    /// The handler panicked.
    #[error("command handler panicked")]
    Panicked,
}

impl ServiceError {
    /// Builds a handler failure with a code and message.
    #[must_use]
    pub fn failed(code: i64, message: impl Into<String>) -> Self {
        Self::Failed(Box::new(ErrorReport::new(code, message)))
    }

    /// Converts the failure into the report sent back to the caller.
    #[must_use]
    pub fn to_report(&self, service: &str) -> ErrorReport {
        match self {
            Self::Failed(report) => report.as_ref().clone(),
            Self::Unavailable(name) => {
                let mut report =
                    ErrorReport::new(error_codes::INV_COMMAND, "Service not available: {0}");
                report.params = vec![Value::from(name.clone())];
                report
            }
            Self::Arguments(_) => ErrorReport::new(error_codes::JSON_SYNTAX, self.to_string())
                .with_service(service),
            Self::Duplicate(_) | Self::Panicked => {
                ErrorReport::new(error_codes::OTHER, self.to_string()).with_service(service)
            }
        }
    }
}

/// Handles commands addressed to one local service.
pub trait CommandServer: Send + Sync {
    /// Handles a command.
    ///
    /// The handler may answer through `context` before returning, or keep
    /// `token` and answer later through the [`Channel`] handle.
    ///
    /// # Errors
    ///
    /// If the handler fails without having answered, the caller receives a
    /// result carrying the error report.
    fn command(
        &self,
        context: &mut CommandContext<'_>,
        token: &Token,
        name: &str,
        data: &[u8],
    ) -> Result<(), ServiceError>;
}

/// Fallback receiving traffic no registered service or listener claims.
pub trait Proxy: Send + Sync {
    /// Handles a command for a service without a local server.
    ///
    /// # Errors
    ///
    /// Handled like [`CommandServer::command`] failures.
    fn on_command(
        &self,
        context: &mut CommandContext<'_>,
        token: &Token,
        service: &str,
        name: &str,
        data: &[u8],
    ) -> Result<(), ServiceError>;

    /// Receives an event for a service without listeners.
    fn on_event(&self, _service: &str, _name: &str, _data: &[u8]) {}

    /// The channel closed; `error` is `None` for a clean close.
    fn on_channel_closed(&self, _error: Option<&ChannelError>) {}
}

/// Name-indexed set of local services.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    servers: BTreeMap<String, Arc<dyn CommandServer>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ServiceRegistry")
            .field("services", &self.servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `server` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Duplicate`] if the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        server: Arc<dyn CommandServer>,
    ) -> Result<(), ServiceError> {
        let key = name.into();
        if self.servers.contains_key(&key) {
            return Err(ServiceError::Duplicate(key));
        }
        self.servers.insert(key, server);
        Ok(())
    }

    /// Looks a server up by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandServer>> {
        self.servers.get(name).cloned()
    }

    /// Returns `true` when `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub(crate) fn ensure(&mut self, name: &str, server: impl FnOnce() -> Arc<dyn CommandServer>) {
        if !self.servers.contains_key(name) {
            self.servers.insert(name.to_owned(), server());
        }
    }
}

/// Reply surface handed to a command handler.
///
/// Frames produced here are sent, in order, once the handler returns.
pub struct CommandContext<'a> {
    channel: &'a Channel,
    token: Token,
    frames: Vec<Frame>,
    answered: bool,
}

impl<'a> CommandContext<'a> {
    pub(crate) const fn new(channel: &'a Channel, token: Token) -> Self {
        Self {
            channel,
            token,
            frames: Vec::new(),
            answered: false,
        }
    }

    /// Channel the command arrived on.
    #[must_use]
    pub const fn channel(&self) -> &Channel {
        self.channel
    }

    /// Token of the command being handled.
    #[must_use]
    pub const fn token(&self) -> &Token {
        &self.token
    }

    /// Returns `true` once a final reply has been produced.
    #[must_use]
    pub const fn is_answered(&self) -> bool {
        self.answered
    }

    /// Answers the command with the given result arguments.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the arguments cannot be encoded.
    pub fn send_result(&mut self, args: Option<&[Value]>) -> Result<(), CodecError> {
        let data = codec::encode_args(args)?;
        self.finish(Frame::Result {
            token: self.token.id().to_owned(),
            data,
        });
        Ok(())
    }

    /// Sends an intermediate result.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the arguments cannot be encoded.
    pub fn send_progress(&mut self, args: Option<&[Value]>) -> Result<(), CodecError> {
        let data = codec::encode_args(args)?;
        if self.answered {
            warn!(target: SERVICE_TARGET, token = %self.token, "progress after final reply ignored");
            return Ok(());
        }
        self.frames.push(Frame::Progress {
            token: self.token.id().to_owned(),
            data,
        });
        Ok(())
    }

    /// Tells the caller the command is not recognised.
    pub fn reject(&mut self) {
        self.finish(Frame::NotFound {
            token: self.token.id().to_owned(),
        });
    }

    /// Broadcasts an event alongside the reply.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the arguments cannot be encoded.
    pub fn send_event(
        &mut self,
        service: &str,
        name: &str,
        args: Option<&[Value]>,
    ) -> Result<(), CodecError> {
        let data = codec::encode_args(args)?;
        self.frames.push(Frame::Event {
            service: service.to_owned(),
            name: name.to_owned(),
            data,
        });
        Ok(())
    }

    fn finish(&mut self, frame: Frame) {
        if self.answered {
            warn!(target: SERVICE_TARGET, token = %self.token, "second reply ignored");
            return;
        }
        self.answered = true;
        self.frames.push(frame);
    }

    pub(crate) fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}
