//! Generic request type with a completion continuation.
//!
//! Service clients build a [`Command`], attach arguments and send it with a
//! closure receiving the outcome. The closure runs exactly once, on the
//! dispatch thread.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::channel::{CHANNEL_TARGET, Channel, CommandListener};
use crate::codec::{self, CodecError};
use crate::errors::{ChannelError, ErrorReport, to_error};
use crate::token::Token;

/// Why a command did not produce a successful result.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// The channel closed before the reply arrived.
    #[error("command terminated: {0}")]
    Terminated(ChannelError),
    /// The remote service reported an error.
    #[error("{0}")]
    Remote(Box<ErrorReport>),
    /// The reply could not be decoded, or the request could not be encoded.
    #[error("malformed arguments: {0}")]
    Malformed(CodecError),
}

impl CommandError {
    /// Converts the failure into a channel closing reason.
    #[must_use]
    pub fn into_channel_error(self) -> ChannelError {
        match self {
            Self::Terminated(error) => error,
            Self::Remote(report) => ChannelError::Remote(report),
            Self::Malformed(error) => ChannelError::MalformedArguments(error),
        }
    }

    /// The remote error report, when there is one.
    #[must_use]
    pub fn report(&self) -> Option<&ErrorReport> {
        match self {
            Self::Remote(report) | Self::Terminated(ChannelError::Remote(report)) => {
                Some(report.as_ref())
            }
            Self::Terminated(_) | Self::Malformed(_) => None,
        }
    }
}

type ProgressHook = Box<dyn FnMut(Vec<Value>) + Send>;

/// Builder for one outgoing command.
pub struct Command<'a> {
    channel: &'a Channel,
    service: String,
    name: String,
    args: Vec<Value>,
    error_slot: bool,
    progress: Option<ProgressHook>,
}

impl<'a> Command<'a> {
    /// Starts a command for `service.name` on `channel`.
    #[must_use]
    pub fn new(channel: &'a Channel, service: &str, name: &str) -> Self {
        Self {
            channel,
            service: service.to_owned(),
            name: name.to_owned(),
            args: Vec::new(),
            error_slot: true,
            progress: None,
        }
    }

    /// Replaces the argument list.
    #[must_use]
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Appends one argument.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedArgumentType`] if `value` has no JSON
    /// representation.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, CodecError> {
        self.args.push(codec::to_argument(value)?);
        Ok(self)
    }

    /// Declares that the reply does not start with an error report.
    #[must_use]
    pub const fn without_error_slot(mut self) -> Self {
        self.error_slot = false;
        self
    }

    /// Receives decoded intermediate results.
    #[must_use]
    pub fn on_progress(mut self, hook: impl FnMut(Vec<Value>) + Send + 'static) -> Self {
        self.progress = Some(Box::new(hook));
        self
    }

    /// Encodes and sends the command.
    ///
    /// `done` receives the error, if any, and the decoded result arguments.
    /// Unless the command was built with [`Command::without_error_slot`], the
    /// first result argument is interpreted with [`to_error`]; the full
    /// argument list is passed on either way.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the arguments cannot be encoded; nothing
    /// is sent in that case.
    pub fn send(
        self,
        done: impl FnOnce(Option<CommandError>, Vec<Value>) + Send + 'static,
    ) -> Result<Token, CodecError> {
        let data = codec::encode_args(Some(self.args.as_slice()))?;
        let completion = Completion {
            error_slot: self.error_slot,
            progress: self.progress,
            done,
        };
        Ok(self
            .channel
            .send_command(&self.service, &self.name, data, Box::new(completion)))
    }
}

struct Completion<F> {
    error_slot: bool,
    progress: Option<ProgressHook>,
    done: F,
}

impl<F> CommandListener for Completion<F>
where
    F: FnOnce(Option<CommandError>, Vec<Value>) + Send,
{
    fn progress(&mut self, token: &Token, data: &[u8]) {
        let Some(hook) = self.progress.as_mut() else {
            return;
        };
        match codec::decode_args(data) {
            Ok(args) => hook(args),
            Err(error) => warn!(target: CHANNEL_TARGET, %token, %error, "malformed progress ignored"),
        }
    }

    fn result(self: Box<Self>, _token: &Token, data: &[u8]) {
        let Self {
            error_slot, done, ..
        } = *self;
        match codec::decode_args(data) {
            Ok(args) => {
                let error = if error_slot {
                    args.first()
                        .and_then(to_error)
                        .map(|report| CommandError::Remote(Box::new(report)))
                } else {
                    None
                };
                done(error, args);
            }
            Err(error) => done(Some(CommandError::Malformed(error)), Vec::new()),
        }
    }

    fn terminated(self: Box<Self>, _token: &Token, error: ChannelError) {
        let Self { done, .. } = *self;
        done(Some(CommandError::Terminated(error)), Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::errors::error_codes;

    type Outcome = (Option<CommandError>, Vec<Value>);

    fn completion(error_slot: bool) -> (Box<dyn CommandListener>, mpsc::Receiver<Outcome>) {
        let (sender, receiver) = mpsc::channel();
        let listener = Completion {
            error_slot,
            progress: None,
            done: move |error, args| sender.send((error, args)).expect("outcome"),
        };
        (Box::new(listener), receiver)
    }

    #[rstest]
    fn error_slot_is_decoded() {
        let (listener, outcome) = completion(true);
        let report = ErrorReport::new(error_codes::INV_COMMAND, "no such command");
        let data = codec::encode_args(Some([report.to_value(), json!(1)].as_slice())).expect("encode");
        listener.result(&Token::new("1"), &data);
        let (error, args) = outcome.recv().expect("outcome");
        assert_eq!(
            error.and_then(|failure| failure.report().map(|found| found.code)),
            Some(error_codes::INV_COMMAND)
        );
        assert_eq!(args.len(), 2);
    }

    #[rstest]
    fn commands_without_error_slot_keep_the_first_argument() {
        let (listener, outcome) = completion(false);
        let data = codec::encode_args(Some([json!("text")].as_slice())).expect("encode");
        listener.result(&Token::new("1"), &data);
        let (error, args) = outcome.recv().expect("outcome");
        assert!(error.is_none());
        assert_eq!(args, vec![json!("text")]);
    }

    #[rstest]
    fn malformed_replies_are_reported() {
        let (listener, outcome) = completion(true);
        listener.result(&Token::new("1"), b"{oops\0");
        let (error, args) = outcome.recv().expect("outcome");
        assert!(matches!(error, Some(CommandError::Malformed(_))));
        assert!(args.is_empty());
    }

    #[rstest]
    fn termination_carries_the_channel_error() {
        let (listener, outcome) = completion(true);
        listener.terminated(&Token::new("1"), ChannelError::Closed);
        let (error, _) = outcome.recv().expect("outcome");
        assert!(matches!(
            error,
            Some(CommandError::Terminated(ChannelError::Closed))
        ));
    }
}
