//! Scripted remote end speaking raw frames over a socket pair.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::channel::Channel;
use crate::codec;
use crate::frame::Frame;
use crate::locator::{LOCATOR_SERVICE, Peer};
use crate::runtime::Runtime;
use crate::service::ServiceRegistry;
use crate::transport::{MessageReader, MessageWriter, ReadOutcome, Transport};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MESSAGE: usize = 1 << 20;

/// Identifier of the peer the scripted remote starts out as.
pub const REMOTE_PEER_ID: &str = "remote";

/// Remote half of a channel under test.
pub struct ScriptedRemote {
    reader: MessageReader<UnixStream>,
    writer: MessageWriter<UnixStream>,
}

/// Opens a channel whose remote end is driven by the returned script.
#[must_use]
pub fn connect(runtime: &Runtime, services: ServiceRegistry) -> (Channel, ScriptedRemote) {
    let (transport, script) = pair();
    let peer = Arc::new(Peer::tcp(REMOTE_PEER_ID, "127.0.0.1", 1534));
    let channel = Channel::open(runtime, transport, peer, services).expect("channel should open");
    (channel, script)
}

/// Returns an unopened transport and the script playing its far end.
#[must_use]
pub fn pair() -> (Transport, ScriptedRemote) {
    let (local, remote) = UnixStream::pair().expect("socket pair");
    remote
        .set_read_timeout(Some(READ_TIMEOUT))
        .expect("read timeout");
    let transport = Transport::unix(local, "socket pair").expect("transport");
    let reading = remote.try_clone().expect("clone socket");
    let script = ScriptedRemote {
        reader: MessageReader::new(reading, MAX_MESSAGE),
        writer: MessageWriter::new(remote),
    };
    (transport, script)
}

impl ScriptedRemote {
    /// Reads the next frame the channel sent.
    pub fn recv(&mut self) -> Frame {
        match self.reader.read_message().expect("frame from channel") {
            ReadOutcome::Message(body) => Frame::decode(&body).expect("well-formed frame"),
            ReadOutcome::EndOfStream => panic!("channel ended the stream"),
        }
    }

    /// Reads frames until the stream ends, returning what arrived first.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let ReadOutcome::Message(body) = self.reader.read_message().expect("read") {
            frames.push(Frame::decode(&body).expect("well-formed frame"));
        }
        frames
    }

    /// Sends one frame to the channel.
    pub fn send(&mut self, frame: &Frame) {
        self.writer
            .write_message(&frame.encode())
            .expect("frame to channel");
    }

    /// Sends a raw message body, well-formed or not.
    pub fn send_raw(&mut self, body: &[u8]) {
        self.writer.write_message(body).expect("message to channel");
    }

    /// Consumes the channel's handshake and returns the advertised services.
    pub fn expect_hello(&mut self) -> Vec<Value> {
        let (service, name, args) = self.expect_event();
        assert_eq!((service.as_str(), name.as_str()), (LOCATOR_SERVICE, "Hello"));
        match args.as_slice() {
            [Value::Array(names)] => names.clone(),
            other => panic!("unexpected handshake arguments: {other:?}"),
        }
    }

    /// Sends the remote handshake.
    pub fn hello(&mut self, services: &[&str]) {
        self.event(LOCATOR_SERVICE, "Hello", &[json!(services)]);
    }

    /// Completes both halves of the handshake.
    pub fn handshake(&mut self, services: &[&str]) {
        self.expect_hello();
        self.hello(services);
    }

    /// Reads the next frame and requires it to be an event.
    pub fn expect_event(&mut self) -> (String, String, Vec<Value>) {
        match self.recv() {
            Frame::Event {
                service,
                name,
                data,
            } => (service, name, decode(&data)),
            other => panic!("expected an event, got {other:?}"),
        }
    }

    /// Reads the next frame and requires it to be a command.
    pub fn expect_command(&mut self) -> (String, String, String, Vec<Value>) {
        match self.recv() {
            Frame::Command {
                token,
                service,
                name,
                data,
            } => (token, service, name, decode(&data)),
            other => panic!("expected a command, got {other:?}"),
        }
    }

    /// Reads the next frame and requires it to be a result.
    pub fn expect_result(&mut self) -> (String, Vec<Value>) {
        match self.recv() {
            Frame::Result { token, data } => (token, decode(&data)),
            other => panic!("expected a result, got {other:?}"),
        }
    }

    /// Reads frames until a flow frame arrives, returning its level and the
    /// frames skipped on the way.
    pub fn expect_flow(&mut self) -> (i32, Vec<Frame>) {
        let mut skipped = Vec::new();
        loop {
            match self.recv() {
                Frame::Flow { level } => return (level, skipped),
                other => skipped.push(other),
            }
        }
    }

    /// Sends a command to the channel.
    pub fn command(&mut self, token: &str, service: &str, name: &str, args: &[Value]) {
        self.send(&Frame::Command {
            token: token.to_owned(),
            service: service.to_owned(),
            name: name.to_owned(),
            data: encode(args),
        });
    }

    /// Answers a command the channel sent.
    pub fn reply(&mut self, token: &str, args: &[Value]) {
        self.send(&Frame::Result {
            token: token.to_owned(),
            data: encode(args),
        });
    }

    /// Sends an event to the channel.
    pub fn event(&mut self, service: &str, name: &str, args: &[Value]) {
        self.send(&Frame::Event {
            service: service.to_owned(),
            name: name.to_owned(),
            data: encode(args),
        });
    }

    /// Writes the end-of-stream marker.
    pub fn hang_up(&mut self) {
        self.writer.write_end_of_stream().expect("end of stream");
    }

    /// Advertises the remote end's inbound congestion.
    pub fn flow(&mut self, level: i32) {
        self.send(&Frame::Flow { level });
    }
}

/// Encodes arguments the way a remote peer would.
#[must_use]
pub fn encode(args: &[Value]) -> Vec<u8> {
    codec::encode_args(Some(args)).expect("encode arguments")
}

fn decode(data: &[u8]) -> Vec<Value> {
    codec::decode_args(data).expect("decode arguments")
}
