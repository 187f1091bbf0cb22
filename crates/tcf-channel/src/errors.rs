//! Structured error reports and the channel error taxonomy.
//!
//! Remote services report failures as a JSON object in the first result
//! argument. [`to_error`] turns that argument into an [`ErrorReport`], and
//! [`ErrorReport::to_value`] produces the same shape when this side answers a
//! command with an error.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::codec::CodecError;
use crate::frame::FrameError;
use crate::transport::TransportError;

/// Numeric error codes carried in the `Code` field of an error report.
pub mod error_codes {
    /// Unclassified failure.
    pub const OTHER: i64 = 1;
    /// A JSON document could not be parsed.
    pub const JSON_SYNTAX: i64 = 2;
    /// The peer violated the framing or message protocol.
    pub const PROTOCOL: i64 = 3;
    /// A message exceeded the receiver's buffer.
    pub const BUFFER_OVERFLOW: i64 = 4;
    /// The channel closed before the command completed.
    pub const CHANNEL_CLOSED: i64 = 5;
    /// The command was cancelled.
    pub const COMMAND_CANCELLED: i64 = 6;
    /// The requested peer is not known.
    pub const UNKNOWN_PEER: i64 = 7;
    /// Base64 text could not be decoded.
    pub const BASE64: i64 = 8;
    /// The transport reached end of stream.
    pub const EOF: i64 = 9;
    /// The request is valid but not supported by this endpoint.
    pub const UNSUPPORTED: i64 = 23;
    /// The command or service is not recognised.
    pub const INV_COMMAND: i64 = 25;
}

/// Error object exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorReport {
    /// Error code, see [`error_codes`].
    pub code: i64,
    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub time: u64,
    /// Message text; `{n}` placeholders are filled from `params`.
    #[serde(default)]
    pub format: String,
    /// Values substituted into `format`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
    /// Name of the service that raised the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Severity reported by the remote side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<i64>,
    /// Code in an alternative (vendor) code space.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_code: Option<i64>,
    /// Organisation owning `alt_code`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_org: Option<String>,
    /// Underlying error, when the remote side chains them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<Box<Self>>,
}

impl ErrorReport {
    /// Creates a report stamped with the current time.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            code,
            time: millis,
            format: message.into(),
            params: Vec::new(),
            service: None,
            severity: None,
            alt_code: None,
            alt_org: None,
            caused_by: None,
        }
    }

    /// Attaches the name of the reporting service.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Returns the message with placeholders substituted.
    #[must_use]
    pub fn message(&self) -> String {
        format_message(&self.format, &self.params)
    }

    /// Encodes the report as a JSON object suitable for a result argument.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("Code".to_owned(), Value::from(self.code));
        object.insert("Time".to_owned(), Value::from(self.time));
        object.insert("Format".to_owned(), Value::from(self.format.clone()));
        if !self.params.is_empty() {
            object.insert("Params".to_owned(), Value::Array(self.params.clone()));
        }
        if let Some(service) = &self.service {
            object.insert("Service".to_owned(), Value::from(service.clone()));
        }
        if let Some(severity) = self.severity {
            object.insert("Severity".to_owned(), Value::from(severity));
        }
        if let Some(alt_code) = self.alt_code {
            object.insert("AltCode".to_owned(), Value::from(alt_code));
        }
        if let Some(alt_org) = &self.alt_org {
            object.insert("AltOrg".to_owned(), Value::from(alt_org.clone()));
        }
        if let Some(cause) = &self.caused_by {
            object.insert("CausedBy".to_owned(), cause.to_value());
        }
        Value::Object(object)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} (code {})", self.message(), self.code)?;
        if let Some(cause) = &self.caused_by {
            write!(formatter, ": caused by {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorReport {}

/// Converts the error slot of a result into a structured report.
///
/// `null` means success. Objects are read as error reports; bare integers and
/// strings are accepted as a code or a message respectively. Any other value
/// yields a report describing the malformed error object.
#[must_use]
pub fn to_error(value: &Value) -> Option<ErrorReport> {
    match value {
        Value::Null => None,
        Value::Object(_) => Some(
            serde_json::from_value::<ErrorReport>(value.clone()).unwrap_or_else(|error| {
                ErrorReport::new(error_codes::OTHER, format!("Invalid error report: {error}"))
            }),
        ),
        Value::Number(number) => Some(match number.as_i64() {
            Some(code) => ErrorReport::new(code, format!("Error code {code}")),
            None => ErrorReport::new(error_codes::OTHER, format!("Invalid error code: {number}")),
        }),
        Value::String(message) => Some(ErrorReport::new(error_codes::OTHER, message.clone())),
        other => Some(ErrorReport::new(
            error_codes::OTHER,
            format!("Invalid error object: {other}"),
        )),
    }
}

fn format_message(format: &str, params: &[Value]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut rest = format;
    while let Some(start) = rest.find('{') {
        let (head, tail) = rest.split_at(start);
        out.push_str(head);
        let Some(end) = tail.find('}') else {
            out.push_str(tail);
            return out;
        };
        let (placeholder, after) = tail.split_at(end + 1);
        let index = placeholder
            .trim_start_matches('{')
            .trim_end_matches('}')
            .parse::<usize>()
            .ok();
        match index.and_then(|position| params.get(position)) {
            Some(Value::String(text)) => out.push_str(text),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(placeholder),
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Reason a channel closed or a pending command was terminated.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The byte transport failed or reached end of stream.
    #[error("transport failure: {0}")]
    Transport(#[source] Arc<TransportError>),
    /// A frame could not be decoded.
    #[error("protocol violation: {0}")]
    Frame(#[from] FrameError),
    /// The peer broke a message-level rule.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// Description of the violation.
        reason: String,
    },
    /// A frame carried an argument blob that is not a JSON sequence.
    #[error("malformed arguments: {0}")]
    MalformedArguments(#[from] CodecError),
    /// A listener rejected an event name it does not understand.
    #[error("unknown event {service}.{name}")]
    UnknownEvent {
        /// Service that emitted the event.
        service: String,
        /// Unrecognised event name.
        name: String,
    },
    /// The remote peer reported an error.
    #[error("remote error: {0}")]
    Remote(Box<ErrorReport>),
    /// The channel was closed locally.
    #[error("channel closed")]
    Closed,
    /// The runtime owning the channel shut down.
    #[error("runtime stopped")]
    RuntimeStopped,
    /// Routing the channel through a peer failed.
    #[error("redirect to '{target}' failed: {reason}")]
    Redirect {
        /// Peer id or description that was targeted.
        target: String,
        /// Why the hop failed.
        reason: String,
    },
}

impl ChannelError {
    /// Builds a protocol violation from a description.
    #[must_use]
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Wraps a transport failure.
    #[must_use]
    pub fn transport(error: TransportError) -> Self {
        Self::Transport(Arc::new(error))
    }

    /// Wraps a remote error report.
    #[must_use]
    pub fn remote(report: ErrorReport) -> Self {
        Self::Remote(Box::new(report))
    }

    /// Returns the error as a wire report, e.g. for forwarding to a peer.
    #[must_use]
    pub fn to_report(&self) -> ErrorReport {
        let code = match self {
            Self::Remote(report) => return report.as_ref().clone(),
            Self::Transport(error) => error.error_code(),
            Self::RuntimeStopped => error_codes::OTHER,
            Self::Frame(_) | Self::Protocol { .. } | Self::UnknownEvent { .. } => {
                error_codes::PROTOCOL
            }
            Self::MalformedArguments(_) => error_codes::JSON_SYNTAX,
            Self::Closed => error_codes::CHANNEL_CLOSED,
            Self::Redirect { .. } => error_codes::UNKNOWN_PEER,
        };
        ErrorReport::new(code, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn null_is_success() {
        assert!(to_error(&Value::Null).is_none());
    }

    #[rstest]
    fn reads_structured_report() {
        let value = json!({
            "Code": error_codes::INV_COMMAND,
            "Time": 1_700_000_000_000_u64,
            "Format": "Service not available: {0}",
            "Params": ["Diag"],
            "Service": "Locator",
        });
        let report = to_error(&value).expect("object should map to a report");
        assert_eq!(report.code, error_codes::INV_COMMAND);
        assert_eq!(report.message(), "Service not available: Diag");
        assert_eq!(report.service.as_deref(), Some("Locator"));
    }

    #[rstest]
    #[case(json!(7), error_codes::UNKNOWN_PEER)]
    #[case(json!("boom"), error_codes::OTHER)]
    #[case(json!([1, 2]), error_codes::OTHER)]
    #[case(json!({"Format": "no code"}), error_codes::OTHER)]
    fn accepts_loose_error_shapes(#[case] value: Value, #[case] code: i64) {
        let report = to_error(&value).expect("non-null values are errors");
        assert_eq!(report.code, code);
    }

    #[rstest]
    fn report_value_reads_back() {
        let mut report = ErrorReport::new(error_codes::PROTOCOL, "bad frame {0}");
        report.params = vec![json!(3)];
        report.caused_by = Some(Box::new(ErrorReport::new(error_codes::EOF, "eof")));
        let decoded = to_error(&report.to_value()).expect("report should decode");
        assert_eq!(decoded, report);
        assert_eq!(decoded.message(), "bad frame 3");
    }

    #[rstest]
    fn unmatched_placeholders_are_kept() {
        let report = ErrorReport::new(error_codes::OTHER, "{1} and {x} and {");
        assert_eq!(report.message(), "{1} and {x} and {");
    }

    #[rstest]
    fn clean_close_maps_to_channel_closed() {
        assert_eq!(
            ChannelError::Closed.to_report().code,
            error_codes::CHANNEL_CLOSED
        );
    }
}
