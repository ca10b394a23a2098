//! Connection manager.
//!
//! One actor task owns the transport, the handshake, the reconnect timer and
//! the pending-request table. [`GatewayClient`] handles talk to it over a
//! command channel, so every frame and every command is processed one at a
//! time, in order, on that task. Subscriber callbacks run on it too.

use crate::{
    broadcast::{Broadcaster, Subscription},
    config::GatewayConfig,
    correlator::{Correlator, PendingSummary, Reply},
    error::{GatewayError, RequestError, TransportError},
    settings::SettingsStore,
    transport::{Connector, Transport, TransportEvent, WsConnector},
};
use claws_core::{
    wire::{self, CHALLENGE_EVENT, CONNECT_METHOD},
    ConnectionStatus, Envelope, ResponseFrame,
};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::{fmt, future::pending, pin::Pin, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep, sleep_until, Instant, Sleep},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Ready,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingChallenge => "awaiting_challenge",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Command {
    Connect,
    Disconnect,
    Request {
        method: String,
        params: Value,
        reply: Reply,
    },
    Pending {
        reply: oneshot::Sender<Vec<PendingSummary>>,
    },
}

/// Cloneable handle to one gateway connection. The connection is torn down
/// once every handle has been dropped.
#[derive(Clone)]
pub struct GatewayClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    broadcaster: Broadcaster,
}

impl GatewayClient {
    /// WebSocket-backed client. Must be called from within a tokio runtime.
    pub fn new(config: GatewayConfig, settings: impl SettingsStore) -> Self {
        Self::with_connector(config, settings, WsConnector)
    }

    pub fn with_connector(
        config: GatewayConfig,
        settings: impl SettingsStore,
        connector: impl Connector,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Idle);
        let broadcaster = Broadcaster::new();
        let connection = Connection {
            correlator: Correlator::new(config.request_timeout),
            config,
            settings: Box::new(settings),
            connector: Box::new(connector),
            broadcaster: broadcaster.clone(),
            state_tx,
            opening: None,
            transport: None,
            auth_request_id: None,
            handshake_deadline: None,
            reconnect: None,
            caller_closed: false,
        };
        tokio::spawn(connection.run(command_rx));
        Self {
            commands,
            state,
            broadcaster,
        }
    }

    /// No-op while a transport is open or opening.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Closes the transport and cancels any scheduled reconnect.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Ready
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), GatewayError> {
        let mut state = self.state.clone();
        let ready = async move {
            state
                .wait_for(|state| *state == ConnectionState::Ready)
                .await
                .map(|_| ())
                .map_err(|_| GatewayError::Shutdown)
        };
        tokio::time::timeout(timeout, ready)
            .await
            .map_err(|_| GatewayError::ReadyTimeout(timeout))?
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(callback)
    }

    /// Every broadcast envelope, forwarded into a channel.
    pub fn events(&self) -> (mpsc::UnboundedReceiver<Envelope>, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |envelope| {
            let _ = tx.send(envelope.clone());
        });
        (rx, subscription)
    }

    /// Sends `method` and waits for its response, a timeout, or connection loss.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RequestError> {
        if !self.is_connected() {
            return Err(RequestError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| RequestError::ConnectionClosed)?;
        rx.await.unwrap_or(Err(RequestError::ConnectionClosed))
    }

    pub async fn pending_requests(&self) -> Vec<PendingSummary> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Pending { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct Connection {
    config: GatewayConfig,
    settings: Box<dyn SettingsStore>,
    connector: Box<dyn Connector>,
    broadcaster: Broadcaster,
    state_tx: watch::Sender<ConnectionState>,
    correlator: Correlator,
    opening: Option<BoxFuture<'static, Result<Transport, TransportError>>>,
    transport: Option<Transport>,
    auth_request_id: Option<String>,
    /// Covers both the wait for the challenge and the wait for its answer.
    handshake_deadline: Option<Instant>,
    reconnect: Option<Pin<Box<Sleep>>>,
    caller_closed: bool,
}

impl Connection {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                opened = poll_opening(&mut self.opening) => self.on_opened(opened),
                event = recv_inbound(&mut self.transport) => self.on_transport_event(event),
                _ = wait_reconnect(&mut self.reconnect) => {
                    self.reconnect = None;
                    info!("gateway_reconnect_attempt");
                    self.connect();
                }
                _ = wait_deadline(deadline) => self.on_deadline(),
            }
        }
        debug!("gateway_client_dropped");
        self.caller_closed = true;
        self.reconnect = None;
        self.opening = None;
        self.transport = None;
        self.correlator.reject_all(RequestError::ConnectionClosed);
        self.set_state(ConnectionState::Closed);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.caller_closed = false;
                self.connect();
            }
            Command::Disconnect => self.disconnect(),
            Command::Request {
                method,
                params,
                reply,
            } => self.send_request(method, params, reply),
            Command::Pending { reply } => {
                let _ = reply.send(self.correlator.snapshot());
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!("gateway_state: {previous} -> {next}");
        }
    }

    fn emit_status(&self, status: ConnectionStatus) {
        self.broadcaster.emit(&Envelope::status(status));
    }

    fn connect(&mut self) {
        if self.opening.is_some() || self.transport.is_some() {
            debug!("gateway_connect_skipped: state={}", self.state());
            return;
        }
        self.reconnect = None;
        self.set_state(ConnectionState::Connecting);
        self.emit_status(ConnectionStatus::Connecting);
        match self.settings.load().resolve() {
            Ok(resolved) => {
                info!("gateway_connecting: {}", resolved.url);
                self.opening = Some(self.connector.connect(resolved.url));
            }
            Err(err) => {
                warn!("gateway_endpoint_error: {err}");
                self.handle_close();
            }
        }
    }

    fn disconnect(&mut self) {
        self.caller_closed = true;
        self.reconnect = None;
        if self.opening.is_some() || self.transport.is_some() {
            info!("gateway_disconnect");
            self.handle_close();
        } else if self.state() != ConnectionState::Idle {
            self.set_state(ConnectionState::Closed);
        }
    }

    fn on_opened(&mut self, opened: Result<Transport, TransportError>) {
        self.opening = None;
        match opened {
            Ok(transport) => {
                self.transport = Some(transport);
                self.handshake_deadline = Some(Instant::now() + self.config.request_timeout);
                self.set_state(ConnectionState::AwaitingChallenge);
                self.emit_status(ConnectionStatus::WaitingChallenge);
            }
            Err(err) => {
                warn!("gateway_connect_error: {err}");
                self.handle_close();
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Text(text) => self.on_frame(&text),
            TransportEvent::Error(err) => {
                warn!("gateway_transport_error: {err}");
                self.handle_close();
            }
            TransportEvent::Closed => {
                info!("gateway_transport_closed");
                self.handle_close();
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        let envelope = match wire::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("gateway_frame_dropped: {err}");
                return;
            }
        };
        match &envelope {
            Envelope::Event(frame) if frame.event == CHALLENGE_EVENT => self.on_challenge(),
            Envelope::Res(frame) if self.is_handshake_response(frame) => {
                self.on_handshake_response(frame)
            }
            Envelope::Res(frame) => {
                self.correlator.resolve(frame);
            }
            Envelope::Req(frame) => {
                debug!("gateway_unexpected_request: method={}", frame.method);
            }
            Envelope::Event(_) => {}
        }
        self.broadcaster.emit(&envelope);
    }

    fn on_challenge(&mut self) {
        if self.state() != ConnectionState::AwaitingChallenge {
            debug!("gateway_challenge_ignored: state={}", self.state());
            return;
        }
        let token = self.settings.load().token.unwrap_or_default();
        let id = self.correlator.next_id("auth");
        let envelope = Envelope::request(
            id.clone(),
            CONNECT_METHOD,
            self.config.connect_params_value(&token),
        );
        if let Err(err) = self.send_envelope(&envelope) {
            warn!("gateway_auth_send_error: {err}");
            return;
        }
        self.auth_request_id = Some(id);
        self.set_state(ConnectionState::Authenticating);
    }

    fn is_handshake_response(&self, frame: &ResponseFrame) -> bool {
        self.auth_request_id.as_deref() == Some(frame.id.as_str())
    }

    fn on_handshake_response(&mut self, frame: &ResponseFrame) {
        self.auth_request_id = None;
        self.handshake_deadline = None;
        if frame.ok {
            self.set_state(ConnectionState::Ready);
            info!("gateway_connected");
            self.emit_status(ConnectionStatus::Connected);
        } else {
            warn!("gateway_auth_failed: {}", frame.error_detail());
            self.emit_status(ConnectionStatus::AuthFailed);
            self.handle_close();
        }
    }

    fn send_request(&mut self, method: String, params: Value, reply: Reply) {
        if self.state() != ConnectionState::Ready {
            let _ = reply.send(Err(RequestError::NotConnected));
            return;
        }
        if let Some(limit) = self.config.max_in_flight {
            if self.correlator.len() >= limit {
                warn!("gateway_request_rejected: method={method} in_flight_limit={limit}");
                let _ = reply.send(Err(RequestError::Backpressure { limit }));
                return;
            }
        }
        let id = self.correlator.register(&method, reply);
        let envelope = Envelope::request(id.clone(), method, params);
        if let Err(err) = self.send_envelope(&envelope) {
            self.correlator.fail(&id, err);
        }
    }

    fn send_envelope(&self, envelope: &Envelope) -> Result<(), RequestError> {
        let text = wire::encode(envelope).map_err(|err| RequestError::Encode(err.to_string()))?;
        let transport = self
            .transport
            .as_ref()
            .ok_or(RequestError::ConnectionClosed)?;
        transport
            .send(text)
            .map_err(|_| RequestError::ConnectionClosed)
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.correlator.next_deadline(), self.handshake_deadline) {
            (Some(request), Some(handshake)) => Some(request.min(handshake)),
            (request, handshake) => request.or(handshake),
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        let expired = self.correlator.expire(now);
        if expired > 0 {
            info!("gateway_requests_timed_out: count={expired}");
        }
        if self.handshake_deadline.is_some_and(|deadline| deadline <= now) {
            warn!("gateway_handshake_timeout: state={}", self.state());
            self.handle_close();
        }
    }

    /// Every path that loses the transport ends here.
    fn handle_close(&mut self) {
        self.opening = None;
        self.transport = None;
        self.auth_request_id = None;
        self.handshake_deadline = None;
        self.set_state(ConnectionState::Closed);
        self.emit_status(ConnectionStatus::Disconnected);
        let rejected = self.correlator.reject_all(RequestError::ConnectionClosed);
        if rejected > 0 {
            info!("gateway_pending_rejected: count={rejected}");
        }
        if !self.caller_closed {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect.is_some() {
            return;
        }
        debug!(
            "gateway_reconnect_scheduled: delay_ms={}",
            self.config.reconnect_delay.as_millis()
        );
        self.reconnect = Some(Box::pin(sleep(self.config.reconnect_delay)));
    }
}

async fn poll_opening(
    opening: &mut Option<BoxFuture<'static, Result<Transport, TransportError>>>,
) -> Result<Transport, TransportError> {
    match opening {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn recv_inbound(transport: &mut Option<Transport>) -> TransportEvent {
    match transport {
        Some(transport) => transport
            .inbound
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed),
        None => pending().await,
    }
}

async fn wait_reconnect(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
