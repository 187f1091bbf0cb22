//! Reader and writer threads moving frames between a transport and the
//! dispatch thread.

use std::io::{self, Read, Write};
use std::sync::mpsc::Receiver;
use std::thread;

use tracing::{debug, trace, warn};

use super::{CHANNEL_TARGET, Channel};
use crate::errors::ChannelError;
use crate::frame::Frame;
use crate::transport::{MessageReader, MessageWriter, ReadOutcome, ShutdownHook, TransportError};

/// Work for the writer thread.
pub(crate) enum Outbound {
    /// An encoded frame body.
    Message(Vec<u8>),
    /// Write the end-of-stream marker and stop.
    EndOfStream,
}

pub(super) fn spawn_writer(
    channel: &Channel,
    mut writer: MessageWriter<Box<dyn Write + Send>>,
    queue: Receiver<Outbound>,
    shutdown: Option<ShutdownHook>,
) -> io::Result<()> {
    let handle = channel.clone();
    thread::Builder::new()
        .name(format!("tcf-writer-{}", channel.id().get()))
        .spawn(move || {
            while let Ok(item) = queue.recv() {
                match item {
                    Outbound::Message(body) => {
                        if let Err(error) = writer.write_message(&body) {
                            warn!(target: CHANNEL_TARGET, channel = %handle.id(), %error, "write failed");
                            handle.terminate(ChannelError::transport(error));
                            break;
                        }
                    }
                    Outbound::EndOfStream => {
                        if let Err(error) = writer.write_end_of_stream() {
                            debug!(target: CHANNEL_TARGET, channel = %handle.id(), %error, "end of stream not written");
                        }
                        break;
                    }
                }
            }
            if let Some(hook) = shutdown {
                hook();
            }
            debug!(target: CHANNEL_TARGET, channel = %handle.id(), "writer stopped");
        })?;
    Ok(())
}

pub(super) fn spawn_reader(
    channel: &Channel,
    mut reader: MessageReader<Box<dyn Read + Send>>,
) -> io::Result<()> {
    let handle = channel.clone();
    thread::Builder::new()
        .name(format!("tcf-reader-{}", channel.id().get()))
        .spawn(move || {
            let failure = loop {
                match reader.read_message() {
                    Ok(ReadOutcome::Message(body)) => {
                        let frame = Frame::decode(&body);
                        let malformed = frame.is_err();
                        trace!(target: CHANNEL_TARGET, channel = %handle.id(), bytes = body.len(), "frame read");
                        handle.shared().frame_queued();
                        let id = handle.id();
                        handle
                            .runtime()
                            .submit(move |dispatch| dispatch.deliver(id, frame));
                        if malformed {
                            return;
                        }
                    }
                    Ok(ReadOutcome::EndOfStream) => break TransportError::EndOfStream,
                    Err(error) => break error,
                }
            };
            debug!(target: CHANNEL_TARGET, channel = %handle.id(), error = %failure, "reader stopped");
            handle.terminate(ChannelError::transport(failure));
        })?;
    Ok(())
}
