//! Peer catalog learned from the remote locator.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::peer::ATTR_ID;
use super::{LOCATOR_SERVICE, LOCATOR_TARGET, LocatorListener, Peer};
use crate::channel::guarded;
use crate::codec;
use crate::errors::{ChannelError, to_error};

const PEER_ADDED: &str = "peerAdded";
const PEER_CHANGED: &str = "peerChanged";
const PEER_REMOVED: &str = "peerRemoved";
const PEER_HEART_BEAT: &str = "peerHeartBeat";

/// Catalog of peers announced by one channel's remote end.
#[derive(Default)]
pub(crate) struct LocatorState {
    peers: BTreeMap<String, Arc<Peer>>,
    listeners: Vec<Arc<dyn LocatorListener>>,
    peers_requested: bool,
}

impl LocatorState {
    pub(crate) fn add_listener(&mut self, listener: Arc<dyn LocatorListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn remove_listener(&mut self, listener: &Arc<dyn LocatorListener>) {
        let target = Arc::as_ptr(listener).cast::<()>();
        self.listeners
            .retain(|candidate| Arc::as_ptr(candidate).cast::<()>() != target);
    }

    /// Returns `true` when listeners exist but no catalog query was issued.
    pub(crate) fn needs_peers(&self) -> bool {
        !self.listeners.is_empty() && !self.peers_requested
    }

    pub(crate) const fn mark_requested(&mut self) {
        self.peers_requested = true;
    }

    pub(crate) fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.values().cloned().collect()
    }

    pub(crate) fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.get(id).cloned()
    }

    /// Forgets the catalog after the channel moved to another remote end.
    pub(crate) fn reset(&mut self) {
        self.peers.clear();
        self.peers_requested = false;
    }

    /// Applies one locator event.
    ///
    /// Every event carries exactly one argument; anything else, or an
    /// unknown event name, is a protocol violation.
    pub(crate) fn handle_event(
        &mut self,
        name: &str,
        data: &[u8],
        parent: &Arc<Peer>,
    ) -> Result<(), ChannelError> {
        let args = codec::decode_args(data)?;
        let [argument] = args.as_slice() else {
            return Err(ChannelError::protocol(format!(
                "{LOCATOR_SERVICE}.{name} expects one argument, got {}",
                args.len()
            )));
        };
        match name {
            PEER_ADDED => {
                let attributes = peer_attributes(name, argument)?;
                self.peer_added(attributes, parent);
            }
            PEER_CHANGED => {
                let attributes = peer_attributes(name, argument)?;
                self.peer_changed(attributes);
            }
            PEER_REMOVED => {
                let id = peer_id(name, argument)?;
                self.peer_removed(id);
            }
            PEER_HEART_BEAT => {
                let id = peer_id(name, argument)?;
                self.peer_heart_beat(id);
            }
            _ => {
                return Err(ChannelError::UnknownEvent {
                    service: LOCATOR_SERVICE.to_owned(),
                    name: name.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Applies the reply to the catalog query: `[error, [peer, ...]]`.
    pub(crate) fn apply_peers(&mut self, data: &[u8], parent: &Arc<Peer>) -> Result<(), ChannelError> {
        let args = codec::decode_args(data)?;
        if let Some(report) = args.first().and_then(to_error) {
            warn!(target: LOCATOR_TARGET, error = %report, "peer catalog query failed");
            return Ok(());
        }
        let Some(Value::Array(entries)) = args.get(1) else {
            return Err(ChannelError::protocol("Locator.getPeers reply has no peer list"));
        };
        for entry in entries {
            let attributes = peer_attributes("getPeers", entry)?;
            if attributes_id(&attributes).is_some_and(|id| self.peers.contains_key(id)) {
                continue;
            }
            self.peer_added(attributes, parent);
        }
        debug!(target: LOCATOR_TARGET, peers = self.peers.len(), "peer catalog loaded");
        Ok(())
    }

    fn peer_added(&mut self, attributes: Map<String, Value>, parent: &Arc<Peer>) {
        let Some(id) = attributes_id(&attributes).map(str::to_owned) else {
            return;
        };
        if self.peers.contains_key(&id) {
            warn!(target: LOCATOR_TARGET, peer = %id, "peer added twice, keeping the first entry");
            return;
        }
        let peer = Arc::new(Peer::derived(attributes, Some(Arc::clone(parent))));
        self.peers.insert(id, Arc::clone(&peer));
        for listener in &self.listeners {
            guarded("locator listener", || listener.peer_added(&peer));
        }
    }

    fn peer_changed(&mut self, attributes: Map<String, Value>) {
        let Some(id) = attributes_id(&attributes).map(str::to_owned) else {
            return;
        };
        let Some(current) = self.peers.get(&id) else {
            debug!(target: LOCATOR_TARGET, peer = %id, "change for unknown peer ignored");
            return;
        };
        let peer = Arc::new(current.with_attributes(attributes));
        self.peers.insert(id, Arc::clone(&peer));
        for listener in &self.listeners {
            guarded("locator listener", || listener.peer_changed(&peer));
        }
    }

    fn peer_removed(&mut self, id: &str) {
        if self.peers.remove(id).is_none() {
            debug!(target: LOCATOR_TARGET, peer = id, "removal of unknown peer ignored");
            return;
        }
        for listener in &self.listeners {
            guarded("locator listener", || listener.peer_removed(id));
        }
    }

    fn peer_heart_beat(&self, id: &str) {
        if !self.peers.contains_key(id) {
            debug!(target: LOCATOR_TARGET, peer = id, "heart beat for unknown peer ignored");
            return;
        }
        for listener in &self.listeners {
            guarded("locator listener", || listener.peer_heart_beat(id));
        }
    }
}

fn attributes_id(attributes: &Map<String, Value>) -> Option<&str> {
    attributes.get(ATTR_ID).and_then(Value::as_str)
}

fn peer_attributes(event: &str, value: &Value) -> Result<Map<String, Value>, ChannelError> {
    match value {
        Value::Object(attributes) if attributes_id(attributes).is_some() => Ok(attributes.clone()),
        _ => Err(ChannelError::protocol(format!(
            "{LOCATOR_SERVICE}.{event} expects a peer object with a string ID"
        ))),
    }
}

fn peer_id<'a>(event: &str, value: &'a Value) -> Result<&'a str, ChannelError> {
    value.as_str().ok_or_else(|| {
        ChannelError::protocol(format!("{LOCATOR_SERVICE}.{event} expects a peer id"))
    })
}
