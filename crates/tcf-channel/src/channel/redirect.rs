//! Redirect requests waiting for their turn on a channel.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{CHANNEL_TARGET, guarded};
use crate::errors::ChannelError;
use crate::locator::{ATTR_ID, Peer, RedirectTarget};

pub(crate) type RedirectDone = Box<dyn FnOnce(Option<ChannelError>) + Send>;

/// One queued redirect.
///
/// Requests without a completion callback are hops of a peer chain opened
/// through [`Peer::open_channel`]; their failure closes the channel.
pub(crate) struct PendingRedirect {
    target: RedirectTarget,
    peer: Option<Arc<Peer>>,
    done: Option<RedirectDone>,
}

impl PendingRedirect {
    pub(crate) fn new(
        target: RedirectTarget,
        peer: Option<Arc<Peer>>,
        done: Option<RedirectDone>,
    ) -> Self {
        Self { target, peer, done }
    }

    /// Argument of the `Locator.redirect` command.
    pub(crate) fn argument(&self) -> Value {
        match &self.target {
            RedirectTarget::Id(id) => Value::from(id.as_str()),
            RedirectTarget::Attributes(attributes) => Value::Object(attributes.clone()),
        }
    }

    /// Peer the channel talks to once the redirect succeeded.
    ///
    /// An explicit peer wins, then a peer from the catalog of the current
    /// remote end; otherwise a descriptor is derived from the target and
    /// linked to the peer the request travelled through.
    pub(crate) fn resolve_peer(
        &self,
        known: Option<Arc<Peer>>,
        parent: &Arc<Peer>,
    ) -> Arc<Peer> {
        if let Some(peer) = &self.peer {
            return Arc::clone(peer);
        }
        if let Some(peer) = known {
            return peer;
        }
        let attributes = match &self.target {
            RedirectTarget::Attributes(attributes) => attributes.clone(),
            RedirectTarget::Id(id) => {
                let mut attributes = serde_json::Map::new();
                attributes.insert(ATTR_ID.to_owned(), Value::from(id.as_str()));
                attributes
            }
        };
        Arc::new(Peer::derived(attributes, Some(Arc::clone(parent))))
    }

    pub(crate) const fn target(&self) -> &RedirectTarget {
        &self.target
    }

    pub(crate) fn succeed(self) {
        if let Some(done) = self.done {
            guarded("redirect callback", move || done(None));
        }
    }

    /// Reports a failure.
    ///
    /// Returns the error that must close the channel when the request was a
    /// peer-chain hop.
    pub(crate) fn fail(self, error: ChannelError) -> Option<ChannelError> {
        match self.done {
            Some(done) => {
                guarded("redirect callback", move || done(Some(error)));
                None
            }
            None => Some(ChannelError::Redirect {
                target: self.target.to_string(),
                reason: error.to_string(),
            }),
        }
    }

    /// Reports a failure on a channel that is already gone.
    pub(crate) fn abandon(self, error: ChannelError) {
        if let Some(reason) = self.fail(error) {
            debug!(target: CHANNEL_TARGET, %reason, "redirect hop abandoned");
        }
    }
}
