//! Shared fixtures and helpers for channel tests.

mod recording;
mod remote;
mod world;

use rstest::fixture;

use crate::runtime::{Runtime, RuntimeOptions};

pub use recording::{
    Outcomes, Reaction, RecordingChannelListener, RecordingEventListener, RecordingTraceListener,
    eventually,
};
pub use remote::{REMOTE_PEER_ID, ScriptedRemote, connect, encode, pair};
pub use world::TestWorld;

/// Runtime shut down by the test once it is done.
#[fixture]
pub fn runtime() -> Runtime {
    Runtime::start(RuntimeOptions::default()).expect("runtime should start")
}
