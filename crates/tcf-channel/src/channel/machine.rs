//! Per-channel protocol state, owned by the dispatch thread.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::io::Outbound;
use super::{
    CHANNEL_TARGET, Channel, ChannelId, ChannelListener, ChannelState, CommandListener,
    EventError, EventListener, PendingRedirect, TraceListener, guarded,
};
use crate::codec;
use crate::errors::{ChannelError, ErrorReport, error_codes, to_error};
use crate::frame::Frame;
use crate::locator::{
    HELLO_EVENT, LOCATOR_SERVICE, LocatorListener, LocatorState, REDIRECT_COMMAND,
    GET_PEERS_COMMAND, RedirectTarget,
};
use crate::service::{CommandContext, CommandServer, Proxy, ServiceError, ServiceRegistry};
use crate::token::{Token, TokenCounter, TokenRegistry};

/// Receiver of the reply to a command this channel sent.
pub(crate) enum ReplyHandler {
    /// A caller-supplied listener.
    Listener(Box<dyn CommandListener>),
    /// The in-flight redirect.
    Redirect(PendingRedirect),
    /// The peer catalog query issued for locator listeners.
    Peers,
}

pub(crate) struct ChannelCore {
    handle: Channel,
    state: ChannelState,
    services: ServiceRegistry,
    proxy: Option<Arc<dyn Proxy>>,
    channel_listeners: Vec<Arc<dyn ChannelListener>>,
    event_listeners: HashMap<String, Vec<Arc<dyn EventListener>>>,
    trace_listeners: Vec<Arc<dyn TraceListener>>,
    tokens: TokenRegistry<ReplyHandler>,
    outbound: Sender<Outbound>,
    held: Vec<Frame>,
    redirects: VecDeque<PendingRedirect>,
    redirect_in_flight: bool,
    remote_ready: bool,
    remote_congestion: i32,
    inbound_limit: usize,
    advertised_congestion: i32,
    locator: LocatorState,
}

impl ChannelCore {
    pub(crate) fn new(
        handle: Channel,
        services: ServiceRegistry,
        outbound: Sender<Outbound>,
        counter: TokenCounter,
        inbound_limit: usize,
    ) -> Self {
        Self {
            handle,
            state: ChannelState::Opening,
            services,
            proxy: None,
            channel_listeners: Vec::new(),
            event_listeners: HashMap::new(),
            trace_listeners: Vec::new(),
            tokens: TokenRegistry::new(counter),
            outbound,
            held: Vec::new(),
            redirects: VecDeque::new(),
            redirect_in_flight: false,
            remote_ready: false,
            remote_congestion: 0,
            inbound_limit,
            advertised_congestion: 0,
            locator: LocatorState::default(),
        }
    }

    pub(crate) const fn id(&self) -> ChannelId {
        self.handle.id()
    }

    pub(crate) const fn handle(&self) -> &Channel {
        &self.handle
    }

    pub(crate) const fn locator(&self) -> &LocatorState {
        &self.locator
    }

    /// Sends the handshake advertising local services.
    pub(crate) fn start(&mut self) {
        let names: Vec<Value> = self.services.names().into_iter().map(Value::from).collect();
        match codec::encode_args(Some([Value::Array(names)].as_slice())) {
            Ok(data) => self.transmit(Frame::Event {
                service: LOCATOR_SERVICE.to_owned(),
                name: HELLO_EVENT.to_owned(),
                data,
            }),
            Err(error) => warn!(target: CHANNEL_TARGET, channel = %self.id(), %error, "handshake not encoded"),
        }
    }

    pub(crate) fn add_channel_listener(&mut self, listener: Arc<dyn ChannelListener>) {
        self.channel_listeners.push(listener);
    }

    pub(crate) fn remove_channel_listener(&mut self, listener: &Arc<dyn ChannelListener>) {
        self.channel_listeners
            .retain(|candidate| !same(candidate, listener));
    }

    pub(crate) fn add_event_listener(&mut self, service: String, listener: Arc<dyn EventListener>) {
        self.event_listeners.entry(service).or_default().push(listener);
    }

    pub(crate) fn remove_event_listener(&mut self, service: &str, listener: &Arc<dyn EventListener>) {
        if let Some(listeners) = self.event_listeners.get_mut(service) {
            listeners.retain(|candidate| !same(candidate, listener));
            if listeners.is_empty() {
                self.event_listeners.remove(service);
            }
        }
    }

    pub(crate) fn add_trace_listener(&mut self, listener: Arc<dyn TraceListener>) {
        self.trace_listeners.push(listener);
    }

    pub(crate) fn remove_trace_listener(&mut self, listener: &Arc<dyn TraceListener>) {
        self.trace_listeners
            .retain(|candidate| !same(candidate, listener));
    }

    pub(crate) fn add_command_server(&mut self, service: String, server: Arc<dyn CommandServer>) {
        if let Err(error) = self.services.register(service, server) {
            warn!(target: CHANNEL_TARGET, channel = %self.id(), %error, "command server not added");
        }
    }

    pub(crate) fn set_proxy(&mut self, proxy: Option<Arc<dyn Proxy>>) {
        self.proxy = proxy;
    }

    pub(crate) fn add_locator_listener(&mut self, listener: Arc<dyn LocatorListener>) {
        self.locator.add_listener(listener);
        if self.state == ChannelState::Open && self.locator.needs_peers() {
            self.request_peers();
        }
    }

    pub(crate) fn remove_locator_listener(&mut self, listener: &Arc<dyn LocatorListener>) {
        self.locator.remove_listener(listener);
    }

    /// Registers `token` and sends the command, or holds it while opening.
    pub(crate) fn send_command(
        &mut self,
        token: Token,
        frame: Frame,
        listener: Box<dyn CommandListener>,
    ) {
        if let Err(ReplyHandler::Listener(rejected)) =
            self.tokens.register(token.clone(), ReplyHandler::Listener(listener))
        {
            warn!(target: CHANNEL_TARGET, channel = %self.id(), %token, "token already pending");
            let error = ChannelError::protocol(format!("token {token} is already pending"));
            guarded("command listener", move || rejected.terminated(&token, error));
            return;
        }
        self.queue_command(frame);
    }

    /// Sends a reply or event; these are never held.
    pub(crate) fn send_reply(&self, frame: Frame) {
        self.transmit(frame);
    }

    pub(crate) fn redirect(&mut self, pending: PendingRedirect) -> Result<(), ChannelError> {
        self.redirects.push_back(pending);
        self.pump_redirects()
    }

    /// Applies one inbound frame.
    ///
    /// An error is a protocol violation and closes the channel.
    pub(crate) fn handle_frame(&mut self, frame: Frame) -> Result<(), ChannelError> {
        for listener in &self.trace_listeners {
            guarded("trace listener", || listener.on_message_received(&frame));
        }
        trace!(
            target: CHANNEL_TARGET,
            channel = %self.id(),
            kind = %frame.message_type(),
            token = frame.token(),
            service = frame.service(),
            name = frame.name(),
            "frame received"
        );
        match frame {
            Frame::Command {
                token,
                service,
                name,
                data,
            } => {
                self.handle_command(Token::new(token), &service, &name, &data);
                Ok(())
            }
            Frame::Progress { token, data } => {
                self.handle_progress(&token, &data);
                Ok(())
            }
            Frame::Result { token, data } => self.handle_result(&token, &data),
            Frame::NotFound { token } => self.handle_not_found(&token),
            Frame::Event {
                service,
                name,
                data,
            } => self.handle_event(&service, &name, &data),
            Frame::Flow { level } => {
                self.handle_flow(level);
                Ok(())
            }
        }
    }

    fn handle_command(&self, token: Token, service: &str, name: &str, data: &[u8]) {
        let handle = self.handle.clone();
        let mut context = CommandContext::new(&handle, token.clone());
        let outcome = if let Some(server) = self.services.get(service) {
            guarded("command server", || {
                server.command(&mut context, &token, name, data)
            })
        } else if let Some(proxy) = &self.proxy {
            guarded("proxy", || {
                proxy.on_command(&mut context, &token, service, name, data)
            })
        } else {
            Some(Err(ServiceError::Unavailable(service.to_owned())))
        };
        let failure = match outcome {
            Some(Ok(())) => None,
            Some(Err(error)) => Some(error),
            None => Some(ServiceError::Panicked),
        };
        let answered = context.is_answered();
        for frame in context.into_frames() {
            self.transmit(frame);
        }
        let Some(error) = failure else {
            return;
        };
        if answered {
            warn!(target: CHANNEL_TARGET, channel = %self.id(), %token, service, name, %error, "command failed after replying");
            return;
        }
        debug!(target: CHANNEL_TARGET, channel = %self.id(), %token, service, name, %error, "command failed");
        match codec::encode_args(Some([error.to_report(service).to_value()].as_slice())) {
            Ok(reply) => self.transmit(Frame::Result {
                token: token.id().to_owned(),
                data: reply,
            }),
            Err(encode_error) => warn!(target: CHANNEL_TARGET, %encode_error, "error report not encoded"),
        }
    }

    fn handle_progress(&mut self, id: &str, data: &[u8]) {
        if let Some((token, ReplyHandler::Listener(listener))) = self.tokens.progress(id) {
            guarded("command listener", || listener.progress(token, data));
        }
    }

    fn handle_result(&mut self, id: &str, data: &[u8]) -> Result<(), ChannelError> {
        let Some((token, handler)) = self.tokens.resolve(id) else {
            return Ok(());
        };
        match handler {
            ReplyHandler::Listener(listener) => {
                guarded("command listener", move || listener.result(&token, data));
                Ok(())
            }
            ReplyHandler::Redirect(pending) => self.finish_redirect(pending, data),
            ReplyHandler::Peers => {
                let parent = self.handle.remote_peer();
                self.locator.apply_peers(data, &parent)
            }
        }
    }

    fn handle_not_found(&mut self, id: &str) -> Result<(), ChannelError> {
        let Some((token, handler)) = self.tokens.resolve(id) else {
            return Ok(());
        };
        let error = ChannelError::remote(ErrorReport::new(
            error_codes::INV_COMMAND,
            "Command not recognised",
        ));
        match handler {
            ReplyHandler::Listener(listener) => {
                guarded("command listener", move || listener.terminated(&token, error));
                Ok(())
            }
            ReplyHandler::Redirect(pending) => self.fail_redirect(pending, error),
            ReplyHandler::Peers => {
                warn!(target: CHANNEL_TARGET, channel = %self.id(), "remote has no peer catalog");
                Ok(())
            }
        }
    }

    fn handle_event(&mut self, service: &str, name: &str, data: &[u8]) -> Result<(), ChannelError> {
        let listeners = self
            .event_listeners
            .get(service)
            .cloned()
            .unwrap_or_default();
        if service == LOCATOR_SERVICE {
            if name == HELLO_EVENT {
                return self.on_hello(data);
            }
            let parent = self.handle.remote_peer();
            self.locator.handle_event(name, data, &parent)?;
            return self.notify_event_listeners(&listeners, service, name, data);
        }
        if listeners.is_empty() {
            match &self.proxy {
                Some(proxy) => {
                    guarded("proxy", || proxy.on_event(service, name, data));
                }
                None => debug!(target: CHANNEL_TARGET, channel = %self.id(), service, name, "event without listeners dropped"),
            }
            return Ok(());
        }
        self.notify_event_listeners(&listeners, service, name, data)
    }

    fn notify_event_listeners(
        &self,
        listeners: &[Arc<dyn EventListener>],
        service: &str,
        name: &str,
        data: &[u8],
    ) -> Result<(), ChannelError> {
        for listener in listeners {
            match guarded("event listener", || listener.event(name, data)) {
                Some(Err(EventError::UnknownEvent(_))) => {
                    return Err(ChannelError::UnknownEvent {
                        service: service.to_owned(),
                        name: name.to_owned(),
                    });
                }
                Some(Err(error)) if error.is_protocol_violation() => {
                    return Err(ChannelError::protocol(format!("{service}.{name}: {error}")));
                }
                Some(Err(error)) => {
                    warn!(target: CHANNEL_TARGET, channel = %self.id(), service, name, %error, "event listener failed");
                }
                Some(Ok(())) | None => {}
            }
        }
        Ok(())
    }

    fn on_hello(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if self.remote_ready {
            return Err(ChannelError::protocol("unexpected Locator.Hello"));
        }
        let args = codec::decode_args(data)?;
        let [Value::Array(names)] = args.as_slice() else {
            return Err(ChannelError::protocol(
                "Locator.Hello expects one array of service names",
            ));
        };
        let services = names
            .iter()
            .map(|entry| entry.as_str().map(str::to_owned))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ChannelError::protocol("Locator.Hello service names must be strings"))?;
        debug!(target: CHANNEL_TARGET, channel = %self.id(), services = services.len(), "remote handshake received");
        self.handle.shared().set_remote_services(services);
        self.remote_ready = true;
        self.pump_redirects()
    }

    fn handle_flow(&mut self, level: i32) {
        let clamped = level.clamp(-100, 100);
        if clamped == self.remote_congestion {
            return;
        }
        self.remote_congestion = clamped;
        self.handle.shared().set_congestion(clamped);
        debug!(target: CHANNEL_TARGET, channel = %self.id(), level = clamped, "remote congestion changed");
        for listener in &self.channel_listeners {
            guarded("channel listener", || listener.congestion_level(clamped));
        }
    }

    /// Advertises the inbound backlog to the remote when its level changes.
    pub(crate) fn update_inbound_congestion(&mut self, backlog: usize) {
        let level = inbound_level(backlog, self.inbound_limit);
        if level == self.advertised_congestion {
            return;
        }
        self.advertised_congestion = level;
        self.transmit(Frame::Flow { level });
    }

    fn pump_redirects(&mut self) -> Result<(), ChannelError> {
        if self.redirect_in_flight || !self.remote_ready {
            return Ok(());
        }
        match self.redirects.pop_front() {
            Some(pending) => self.issue_redirect(pending),
            None => {
                if self.state == ChannelState::Opening {
                    self.become_open();
                }
                Ok(())
            }
        }
    }

    fn issue_redirect(&mut self, pending: PendingRedirect) -> Result<(), ChannelError> {
        let data = match codec::encode_args(Some([pending.argument()].as_slice())) {
            Ok(data) => data,
            Err(error) => return self.fail_redirect(pending, error.into()),
        };
        info!(target: CHANNEL_TARGET, channel = %self.id(), target = %pending.target(), "redirecting");
        let token = self.tokens.new_token(ReplyHandler::Redirect(pending));
        self.redirect_in_flight = true;
        self.transmit(Frame::Command {
            token: token.id().to_owned(),
            service: LOCATOR_SERVICE.to_owned(),
            name: REDIRECT_COMMAND.to_owned(),
            data,
        });
        Ok(())
    }

    fn finish_redirect(&mut self, pending: PendingRedirect, data: &[u8]) -> Result<(), ChannelError> {
        let args = match codec::decode_args(data) {
            Ok(args) => args,
            Err(error) => return self.fail_redirect(pending, error.into()),
        };
        if let Some(report) = args.first().and_then(to_error) {
            return self.fail_redirect(pending, ChannelError::remote(report));
        }
        let parent = self.handle.remote_peer();
        let known = match pending.target() {
            RedirectTarget::Id(id) => self.locator.peer(id),
            RedirectTarget::Attributes(_) => None,
        };
        let peer = pending.resolve_peer(known, &parent);
        info!(target: CHANNEL_TARGET, channel = %self.id(), peer = peer.id(), "redirect complete");
        self.redirect_in_flight = false;
        self.remote_ready = false;
        self.set_state(ChannelState::Opening);
        self.handle.shared().set_remote_peer(peer);
        self.handle.shared().set_remote_services(Vec::new());
        self.locator.reset();
        pending.succeed();
        Ok(())
    }

    fn fail_redirect(&mut self, pending: PendingRedirect, error: ChannelError) -> Result<(), ChannelError> {
        warn!(target: CHANNEL_TARGET, channel = %self.id(), target = %pending.target(), %error, "redirect failed");
        self.redirect_in_flight = false;
        if let Some(fatal) = pending.fail(error) {
            return Err(fatal);
        }
        self.pump_redirects()
    }

    fn become_open(&mut self) {
        self.set_state(ChannelState::Open);
        info!(target: CHANNEL_TARGET, channel = %self.id(), held = self.held.len(), "channel open");
        for frame in mem::take(&mut self.held) {
            self.transmit(frame);
        }
        for listener in &self.channel_listeners {
            guarded("channel listener", || listener.on_channel_opened());
        }
        if self.locator.needs_peers() {
            self.request_peers();
        }
    }

    fn request_peers(&mut self) {
        self.locator.mark_requested();
        let token = self.tokens.new_token(ReplyHandler::Peers);
        self.queue_command(Frame::Command {
            token: token.id().to_owned(),
            service: LOCATOR_SERVICE.to_owned(),
            name: GET_PEERS_COMMAND.to_owned(),
            data: Vec::new(),
        });
    }

    fn queue_command(&mut self, frame: Frame) {
        if self.state == ChannelState::Open {
            self.transmit(frame);
        } else {
            self.held.push(frame);
        }
    }

    fn set_state(&mut self, state: ChannelState) {
        self.state = state;
        self.handle.shared().set_state(state);
    }

    fn transmit(&self, frame: Frame) {
        for listener in &self.trace_listeners {
            guarded("trace listener", || listener.on_message_sent(&frame));
        }
        trace!(
            target: CHANNEL_TARGET,
            channel = %self.id(),
            kind = %frame.message_type(),
            token = frame.token(),
            "frame sent"
        );
        if self.outbound.send(Outbound::Message(frame.encode())).is_err() {
            debug!(target: CHANNEL_TARGET, channel = %self.id(), "writer gone, frame dropped");
        }
    }

    /// Moves the channel to `Closed` and notifies everyone waiting on it.
    pub(crate) fn close(mut self, error: Option<ChannelError>) {
        match &error {
            Some(reason) => warn!(target: CHANNEL_TARGET, channel = %self.id(), error = %reason, "channel closed"),
            None => info!(target: CHANNEL_TARGET, channel = %self.id(), "channel closed"),
        }
        self.handle.shared().set_close_error(error.clone());
        self.set_state(ChannelState::Closed);
        if self.outbound.send(Outbound::EndOfStream).is_err() {
            debug!(target: CHANNEL_TARGET, channel = %self.id(), "writer already stopped");
        }
        let termination = error.clone().unwrap_or(ChannelError::Closed);
        for (token, handler) in self.tokens.terminate_all() {
            match handler {
                ReplyHandler::Listener(listener) => {
                    let reason = termination.clone();
                    guarded("command listener", move || listener.terminated(&token, reason));
                }
                ReplyHandler::Redirect(pending) => pending.abandon(termination.clone()),
                ReplyHandler::Peers => {}
            }
        }
        for pending in self.redirects.drain(..) {
            pending.abandon(termination.clone());
        }
        for listener in &self.channel_listeners {
            guarded("channel listener", || listener.on_channel_closed(error.as_ref()));
        }
        for listener in &self.trace_listeners {
            guarded("trace listener", || listener.on_channel_closed(error.as_ref()));
        }
        if let Some(proxy) = &self.proxy {
            guarded("proxy", || proxy.on_channel_closed(error.as_ref()));
        }
    }
}

/// Level advertised for an inbound backlog: zero up to `limit`, then rising
/// linearly to 100 at twice the limit.
fn inbound_level(backlog: usize, limit: usize) -> i32 {
    if backlog <= limit {
        return 0;
    }
    let excess = backlog.saturating_sub(limit).saturating_mul(100);
    let level = excess.checked_div(limit).unwrap_or(100).min(100);
    i32::try_from(level).unwrap_or(100)
}

fn same<T: ?Sized>(left: &Arc<T>, right: &Arc<T>) -> bool {
    Arc::as_ptr(left).cast::<()>() == Arc::as_ptr(right).cast::<()>()
}
