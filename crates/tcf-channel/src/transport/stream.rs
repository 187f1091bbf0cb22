//! Escaped message framing over a byte stream.
//!
//! Message bodies are written verbatim except for the escape byte `0x03`,
//! which introduces a two-byte sequence:
//!
//! ```text
//! 03 00  literal 0x03
//! 03 01  end of message
//! 03 02  end of stream
//! ```

use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};

use super::errors::TransportError;

const ESC: u8 = 3;
const ESC_LITERAL: u8 = 0;
const ESC_END_OF_MESSAGE: u8 = 1;
const ESC_END_OF_STREAM: u8 = 2;

/// Outcome of reading from a message stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete message body.
    Message(Vec<u8>),
    /// The peer signalled or caused end of stream.
    EndOfStream,
}

/// Reads escaped messages from a byte stream.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    max_message_size: usize,
}

impl<R: Read> MessageReader<R> {
    /// Wraps a reader, rejecting messages longer than `max_message_size`.
    pub fn new(reader: R, max_message_size: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_message_size,
        }
    }

    /// Reads the next message, blocking until it is complete.
    ///
    /// End of stream is reported both for the explicit marker and for the
    /// stream closing between messages.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when reading fails or the stream ends
    /// mid-message, [`TransportError::InvalidEscape`] for unknown escape pairs,
    /// and [`TransportError::MessageTooLarge`] when the size limit is exceeded.
    pub fn read_message(&mut self) -> Result<ReadOutcome, TransportError> {
        let mut body = Vec::new();
        loop {
            let Some(byte) = self.read_byte()? else {
                if body.is_empty() {
                    return Ok(ReadOutcome::EndOfStream);
                }
                return Err(truncated());
            };
            let decoded = if byte == ESC {
                match self.read_byte()?.ok_or_else(truncated)? {
                    ESC_LITERAL => ESC,
                    ESC_END_OF_MESSAGE => return Ok(ReadOutcome::Message(body)),
                    ESC_END_OF_STREAM => return Ok(ReadOutcome::EndOfStream),
                    other => return Err(TransportError::InvalidEscape(other)),
                }
            } else {
                byte
            };
            if body.len() >= self.max_message_size {
                return Err(TransportError::MessageTooLarge {
                    limit: self.max_message_size,
                });
            }
            body.push(decoded);
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        let mut byte = [0_u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    let [value] = byte;
                    return Ok(Some(value));
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => return Err(TransportError::Io(error)),
            }
        }
    }
}

fn truncated() -> TransportError {
    TransportError::Io(io::Error::new(
        ErrorKind::UnexpectedEof,
        "stream ended inside a message",
    ))
}

/// Writes escaped messages to a byte stream.
pub struct MessageWriter<W: Write> {
    inner: BufWriter<W>,
}

impl<W: Write> MessageWriter<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::new(writer),
        }
    }

    /// Writes one message body followed by the end-of-message marker.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if writing or flushing fails.
    pub fn write_message(&mut self, body: &[u8]) -> Result<(), TransportError> {
        for chunk in body.split_inclusive(|byte| *byte == ESC) {
            match chunk.split_last() {
                Some((&ESC, head)) => {
                    self.inner.write_all(head)?;
                    self.inner.write_all(&[ESC, ESC_LITERAL])?;
                }
                _ => self.inner.write_all(chunk)?,
            }
        }
        self.inner.write_all(&[ESC, ESC_END_OF_MESSAGE])?;
        self.inner.flush()?;
        Ok(())
    }

    /// Writes the end-of-stream marker.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if writing or flushing fails.
    pub fn write_end_of_stream(&mut self) -> Result<(), TransportError> {
        self.inner.write_all(&[ESC, ESC_END_OF_STREAM])?;
        self.inner.flush()?;
        Ok(())
    }
}
