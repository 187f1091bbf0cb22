//! JSON-sequence argument encoding.
//!
//! Command, result and event arguments travel as a sequence of compact JSON
//! documents, each terminated by a NUL byte. Binary blobs are carried as
//! standard base64 text inside the JSON documents.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;


/// Errors raised while encoding or decoding argument sequences.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// A segment of an argument sequence is not valid JSON.
    #[error("argument {index} is not valid JSON: {source}")]
    MalformedArguments {
        /// Zero-based position of the offending segment.
        index: usize,
        /// Parser error.
        #[source]
        source: Arc<serde_json::Error>,
    },
    /// The argument sequence is not valid UTF-8.
    #[error("argument sequence is not valid UTF-8")]
    InvalidUtf8,
    /// A value cannot be represented as a protocol argument.
    #[error("unsupported argument type: {0}")]
    UnsupportedArgumentType(String),
    /// Base64 text could not be decoded.
    #[error("invalid base64 payload: {0}")]
    InvalidBinary(#[from] base64::DecodeError),
}

/// Encodes an argument list as a NUL-terminated JSON sequence.
///
/// `None` and an empty slice both produce the empty byte string, the marker
/// for a message without arguments.
///
/// # Errors
///
/// Returns [`CodecError::UnsupportedArgumentType`] if a value cannot be
/// written as JSON (for example a non-finite number smuggled in through a
/// custom serializer).
pub fn encode_args(args: Option<&[Value]>) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Vec::new();
    for arg in args.unwrap_or_default() {
        serde_json::to_writer(&mut buffer, arg)
            .map_err(|error| CodecError::UnsupportedArgumentType(error.to_string()))?;
        buffer.push(0);
    }
    Ok(buffer)
}

/// Decodes a JSON sequence into its argument values.
///
/// A single trailing NUL is ignored. Empty segments decode to `null`.
///
/// # Errors
///
/// Returns [`CodecError::MalformedArguments`] naming the first segment that
/// is not valid JSON, or [`CodecError::InvalidUtf8`] for non-UTF-8 input.
pub fn decode_args(data: &[u8]) -> Result<Vec<Value>, CodecError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let body = data.strip_suffix(&[0]).unwrap_or(data);
    let text = std::str::from_utf8(body).map_err(|_| CodecError::InvalidUtf8)?;
    text.split('\0')
        .enumerate()
        .map(|(index, segment)| {
            if segment.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(segment).map_err(|error| CodecError::MalformedArguments {
                index,
                source: Arc::new(error),
            })
        })
        .collect()
}

/// Converts a typed value into a protocol argument.
///
/// # Errors
///
/// Returns [`CodecError::UnsupportedArgumentType`] for values JSON cannot
/// represent, such as maps with non-string keys.
pub fn to_argument<T: Serialize + ?Sized>(value: &T) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(|error| CodecError::UnsupportedArgumentType(error.to_string()))
}

/// Encodes bytes as a base64 argument value.
#[must_use]
pub fn encode_binary(bytes: &[u8]) -> Value {
    Value::String(STANDARD.encode(bytes))
}

/// Decodes an argument value that carries binary data.
///
/// `null` decodes to an empty buffer.
///
/// # Errors
///
/// Returns [`CodecError::InvalidBinary`] for malformed base64 text and
/// [`CodecError::UnsupportedArgumentType`] for values that are neither a
/// string nor `null`.
pub fn decode_binary(value: &Value) -> Result<Vec<u8>, CodecError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(text) => Ok(STANDARD.decode(text)?),
        other => Err(CodecError::UnsupportedArgumentType(format!(
            "expected base64 text, found {other}"
        ))),
    }
}

/// Byte buffer that serializes as base64 text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Binary(#[serde(with = "base64_bytes")] pub Vec<u8>);

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Binary {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Serde adapter for `Vec<u8>` fields carried as base64 text.
pub mod base64_bytes {
    use super::{Deserialize, Deserializer, Engine, STANDARD, Serializer};

    /// Serializes bytes as standard base64 without line breaks.
    ///
    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserializes base64 text into bytes.
    ///
    /// # Errors
    ///
    /// Fails when the input is not a string or not valid base64.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
