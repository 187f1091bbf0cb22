//! Channel table owned by the dispatch thread.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::{CHANNEL_TARGET, ChannelCore, ChannelId};
use crate::errors::ChannelError;
use crate::frame::{Frame, FrameError};

/// State reachable from tasks queued on the runtime.
///
/// Only the dispatch thread holds a live `Dispatch`. After shutdown, queued
/// operations run against a detached instance that owns no channels, so
/// they resolve their callbacks with the termination error instead of being
/// lost.
pub(crate) struct Dispatch {
    channels: HashMap<ChannelId, ChannelCore>,
    detached: bool,
}

impl Dispatch {
    pub(crate) fn new() -> Self {
        Self {
            channels: HashMap::new(),
            detached: false,
        }
    }

    pub(crate) fn detached() -> Self {
        Self {
            channels: HashMap::new(),
            detached: true,
        }
    }

    /// Takes ownership of a freshly opened channel and sends its handshake.
    pub(crate) fn register(&mut self, mut core: ChannelCore) {
        let id = core.id();
        if self.detached {
            core.close(Some(ChannelError::RuntimeStopped));
            return;
        }
        core.start();
        if self.channels.insert(id, core).is_some() {
            warn!(target: CHANNEL_TARGET, channel = %id, "channel id registered twice");
        }
    }

    pub(crate) fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub(crate) fn core_mut(&mut self, id: ChannelId) -> Option<&mut ChannelCore> {
        self.channels.get_mut(&id)
    }

    /// Runs a fallible operation on a channel, closing it on failure.
    pub(crate) fn apply(
        &mut self,
        id: ChannelId,
        operation: impl FnOnce(&mut ChannelCore) -> Result<(), ChannelError>,
    ) {
        let Some(core) = self.channels.get_mut(&id) else {
            debug!(target: CHANNEL_TARGET, channel = %id, "operation on closed channel ignored");
            return;
        };
        if let Err(error) = operation(core) {
            self.close_channel(id, Some(error));
        }
    }

    /// Hands one decoded inbound frame to its channel.
    pub(crate) fn deliver(&mut self, id: ChannelId, frame: Result<Frame, FrameError>) {
        let Some(core) = self.channels.get_mut(&id) else {
            debug!(target: CHANNEL_TARGET, channel = %id, "frame for closed channel dropped");
            return;
        };
        let backlog = core.handle().shared().frame_dispatched();
        let outcome = frame
            .map_err(ChannelError::from)
            .and_then(|decoded| core.handle_frame(decoded));
        match outcome {
            Ok(()) => core.update_inbound_congestion(backlog),
            Err(error) => self.close_channel(id, Some(error)),
        }
    }

    /// Closes a channel; later calls for the same id do nothing.
    pub(crate) fn close_channel(&mut self, id: ChannelId, error: Option<ChannelError>) {
        match self.channels.remove(&id) {
            Some(core) => core.close(error),
            None => debug!(target: CHANNEL_TARGET, channel = %id, "channel already closed"),
        }
    }

    pub(crate) fn close_all(&mut self, error: &ChannelError) {
        let mut ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.close_channel(id, Some(error.clone()));
        }
    }
}
