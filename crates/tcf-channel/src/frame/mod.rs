//! Protocol frame layout.
//!
//! A frame body starts with a one-byte type tag followed by NUL and a fixed
//! set of NUL-terminated header fields. Whatever follows the header is the
//! argument blob, itself a JSON sequence (see [`crate::codec`]).

use std::fmt;

use thiserror::Error;

#[cfg(test)]
mod tests;

/// Type tag of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Command issued by the sender.
    Command,
    /// Intermediate result for a pending command.
    Progress,
    /// Final result for a pending command.
    Result,
    /// The receiver did not recognise a command.
    NotFound,
    /// Broadcast notification.
    Event,
    /// Inbound congestion advertisement.
    Flow,
}

impl MessageType {
    /// Returns the wire tag.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Command => b'C',
            Self::Progress => b'P',
            Self::Result => b'R',
            Self::NotFound => b'N',
            Self::Event => b'E',
            Self::Flow => b'F',
        }
    }

    /// Parses a wire tag.
    #[must_use]
    pub const fn from_byte(tag: u8) -> Option<Self> {
        match tag {
            b'C' => Some(Self::Command),
            b'P' => Some(Self::Progress),
            b'R' => Some(Self::Result),
            b'N' => Some(Self::NotFound),
            b'E' => Some(Self::Event),
            b'F' => Some(Self::Flow),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", char::from(self.as_byte()))
    }
}

/// Errors raised while decoding a frame body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The frame body was empty.
    #[error("empty frame")]
    Empty,
    /// The type tag is not one of the known message types.
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    /// A header field was not terminated by NUL.
    #[error("'{message_type}' frame is missing its {field} field")]
    MissingField {
        /// Type of the truncated frame.
        message_type: MessageType,
        /// Name of the missing field.
        field: &'static str,
    },
    /// A header field was not valid UTF-8.
    #[error("'{message_type}' frame has a non-UTF-8 {field} field")]
    InvalidField {
        /// Type of the offending frame.
        message_type: MessageType,
        /// Name of the offending field.
        field: &'static str,
    },
    /// A flow control frame carried a non-integer level.
    #[error("invalid congestion level '{0}'")]
    InvalidLevel(String),
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Command request.
    Command {
        /// Correlation token.
        token: String,
        /// Target service.
        service: String,
        /// Command name.
        name: String,
        /// Encoded arguments.
        data: Vec<u8>,
    },
    /// Intermediate result.
    Progress {
        /// Correlation token.
        token: String,
        /// Encoded arguments.
        data: Vec<u8>,
    },
    /// Final result.
    Result {
        /// Correlation token.
        token: String,
        /// Encoded arguments.
        data: Vec<u8>,
    },
    /// The command with this token is not recognised.
    NotFound {
        /// Correlation token.
        token: String,
    },
    /// Service event.
    Event {
        /// Emitting service.
        service: String,
        /// Event name.
        name: String,
        /// Encoded arguments.
        data: Vec<u8>,
    },
    /// Sender's inbound congestion level.
    Flow {
        /// Advertised level.
        level: i32,
    },
}

impl Frame {
    /// Returns the frame's type tag.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Command { .. } => MessageType::Command,
            Self::Progress { .. } => MessageType::Progress,
            Self::Result { .. } => MessageType::Result,
            Self::NotFound { .. } => MessageType::NotFound,
            Self::Event { .. } => MessageType::Event,
            Self::Flow { .. } => MessageType::Flow,
        }
    }

    /// Returns the correlation token, if the frame type carries one.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Command { token, .. }
            | Self::Progress { token, .. }
            | Self::Result { token, .. }
            | Self::NotFound { token } => Some(token),
            Self::Event { .. } | Self::Flow { .. } => None,
        }
    }

    /// Returns the service name, if the frame type carries one.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::Command { service, .. } | Self::Event { service, .. } => Some(service),
            _ => None,
        }
    }

    /// Returns the command or event name, if the frame type carries one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Command { name, .. } | Self::Event { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns the argument blob; empty for frames without arguments.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Command { data, .. }
            | Self::Progress { data, .. }
            | Self::Result { data, .. }
            | Self::Event { data, .. } => data,
            Self::NotFound { .. } | Self::Flow { .. } => &[],
        }
    }

    /// Encodes the frame body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.data().len());
        out.push(self.message_type().as_byte());
        out.push(0);
        match self {
            Self::Command {
                token,
                service,
                name,
                data,
            } => {
                push_field(&mut out, token);
                push_field(&mut out, service);
                push_field(&mut out, name);
                out.extend_from_slice(data);
            }
            Self::Progress { token, data } | Self::Result { token, data } => {
                push_field(&mut out, token);
                out.extend_from_slice(data);
            }
            Self::NotFound { token } => push_field(&mut out, token),
            Self::Event {
                service,
                name,
                data,
            } => {
                push_field(&mut out, service);
                push_field(&mut out, name);
                out.extend_from_slice(data);
            }
            Self::Flow { level } => push_field(&mut out, &level.to_string()),
        }
        out
    }

    /// Decodes a frame body.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] when the tag is unknown or a header field is
    /// missing or malformed.
    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        let (&tag, after_tag) = body.split_first().ok_or(FrameError::Empty)?;
        let message_type = MessageType::from_byte(tag).ok_or(FrameError::UnknownType(tag))?;
        let mut cursor = FieldCursor {
            message_type,
            rest: after_tag.strip_prefix(&[0]).ok_or(FrameError::MissingField {
                message_type,
                field: "separator",
            })?,
        };
        let frame = match message_type {
            MessageType::Command => Self::Command {
                token: cursor.field("token")?,
                service: cursor.field("service")?,
                name: cursor.field("name")?,
                data: cursor.remainder(),
            },
            MessageType::Progress => Self::Progress {
                token: cursor.field("token")?,
                data: cursor.remainder(),
            },
            MessageType::Result => Self::Result {
                token: cursor.field("token")?,
                data: cursor.remainder(),
            },
            MessageType::NotFound => Self::NotFound {
                token: cursor.field("token")?,
            },
            MessageType::Event => Self::Event {
                service: cursor.field("service")?,
                name: cursor.field("name")?,
                data: cursor.remainder(),
            },
            MessageType::Flow => {
                let text = cursor.field("level")?;
                let level = text
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidLevel(text.clone()))?;
                Self::Flow { level }
            }
        };
        Ok(frame)
    }
}

fn push_field(out: &mut Vec<u8>, field: &str) {
    out.extend_from_slice(field.as_bytes());
    out.push(0);
}

struct FieldCursor<'a> {
    message_type: MessageType,
    rest: &'a [u8],
}

impl FieldCursor<'_> {
    fn field(&mut self, field: &'static str) -> Result<String, FrameError> {
        let message_type = self.message_type;
        let end = self
            .rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(FrameError::MissingField {
                message_type,
                field,
            })?;
        let (raw, tail) = self.rest.split_at(end);
        self.rest = tail.get(1..).unwrap_or_default();
        String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidField {
            message_type,
            field,
        })
    }

    fn remainder(&self) -> Vec<u8> {
        self.rest.to_vec()
    }
}
