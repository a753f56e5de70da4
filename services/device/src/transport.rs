//! Device-side connection transport.
//!
//! One tokio task owns the socket and every timer for a connection; the rest
//! of the crate talks to it through a command channel and observes it through
//! an event channel plus a state watch.  All suspension happens at socket
//! I/O, the heartbeat interval, the reconnect/settle timers, and channel
//! receives — `disconnect()` cancels all of them.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting
//! Connecting   ──sockOpen──▶ AwaitingConnected   (device sends `connect`)
//! AwaitingConnected ──connected msg──▶ Connected
//! Connecting   ──timeout/err──▶ Error ──backoff──▶ Connecting
//! Connected    ──sockClose──▶ Disconnected ──backoff──▶ Connecting
//! Connected    ──fatal / auth──▶ Error (terminal until reset_auth)
//! any          ──disconnect()──▶ Disconnected
//! ```
//!
//! Reconnect backoff is `min(2^(attempt-1), 30)` seconds; a successful
//! handshake resets the attempt counter.  `force_reconnect()` skips the
//! backoff and applies a single 500 ms settle delay.

use crate::session_url;
use futures_util::{SinkExt, StreamExt};
use hl_protocol::{
    Codec, Connect, Connected, Envelope, ErrorMessage, MessageBody, Ping, Platform, Reload,
    Severity, UpdatePayload, consts,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket endpoint, e.g. `wss://host/ws/v1/devices`.  The session id
    /// is appended as a query parameter.
    pub server_url: String,
    pub session_id: String,
    /// Bearer token, conveyed inside the `connect` payload.
    pub token: String,
    pub device_id: String,
    pub device_name: Option<String>,
    pub platform: Platform,
    pub client_version: String,
    /// `false` for legacy endpoints: the socket counts as connected as soon
    /// as it opens, and the session layer drives a `join` handshake instead.
    pub connect_handshake: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn new(
        server_url: impl Into<String>,
        session_id: impl Into<String>,
        token: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            session_id: session_id.into(),
            token: token.into(),
            device_id: device_id.into(),
            device_name: None,
            platform: Platform::Unknown,
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            connect_handshake: true,
            heartbeat_interval: consts::HEARTBEAT_INTERVAL,
            heartbeat_timeout: consts::HEARTBEAT_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Disconnected,
    Connecting,
    AwaitingConnected,
    Connected,
    Error,
}

#[derive(Debug)]
pub enum TransportEvent {
    /// Socket open on a legacy endpoint (no `connect`/`connected` handshake).
    Opened,
    /// Modern handshake completed.
    Connected(Connected),
    Update(UpdatePayload),
    Pong { server_time: u64 },
    JoinAccepted,
    JoinRejected { reason: String },
    /// Recoverable server-side error, surfaced as a notification.
    ServerError(ErrorMessage),
    Reload(Reload),
    /// Authentication or fatal failure; auto-reconnect is disabled.
    AuthFailed { code: String },
    Disconnected { reconnecting: bool },
}

enum Command {
    Connect,
    Disconnect,
    ForceReconnect,
    Send(Envelope),
}

#[derive(Clone)]
pub struct Transport {
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<TransportState>,
    session_id: String,
    auth_failed: Arc<AtomicBool>,
    last_received_sequence: Arc<AtomicI64>,
}

impl Transport {
    /// Spawn the connection task.  The transport starts `Disconnected`;
    /// nothing touches the network until [`Transport::connect`] is called.
    pub fn spawn(config: TransportConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(TransportState::Disconnected);
        let auth_failed = Arc::new(AtomicBool::new(false));
        let last_received_sequence = Arc::new(AtomicI64::new(-1));
        let session_id = config.session_id.clone();

        let runner = Runner {
            config,
            command_rx,
            event_tx,
            state_tx,
            auth_failed: auth_failed.clone(),
            last_received_sequence: last_received_sequence.clone(),
            codec: Codec::lenient(),
            attempt: 0,
        };
        tokio::spawn(runner.run());

        (
            Self {
                command_tx,
                state_rx,
                session_id,
                auth_failed,
                last_received_sequence,
            },
            event_rx,
        )
    }

    pub fn connect(&self) {
        let _ = self.command_tx.send(Command::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Disconnect);
    }

    /// Reconnect immediately, skipping any pending backoff.
    pub fn force_reconnect(&self) {
        let _ = self.command_tx.send(Command::ForceReconnect);
    }

    /// Queue an outbound message.  Dropped with a warning if the transport is
    /// not connected when the connection task picks it up.
    pub fn send(&self, message: Envelope) {
        let _ = self.command_tx.send(Command::Send(message));
    }

    pub fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    pub fn authentication_failed(&self) -> bool {
        self.auth_failed.load(Ordering::SeqCst)
    }

    /// Clear the auth-failure latch so a fresh provisioning flow can retry.
    pub fn reset_auth(&self) {
        self.auth_failed.store(false, Ordering::SeqCst);
    }

    /// Highest update sequence observed on this transport, if any.
    pub fn last_received_sequence(&self) -> Option<u64> {
        let raw = self.last_received_sequence.load(Ordering::SeqCst);
        u64::try_from(raw).ok()
    }

    /// Narrow send-capability handle for the update pipeline: it can emit
    /// messages into this session and knows nothing else about the transport.
    pub fn sink(&self) -> TransportSink {
        TransportSink {
            session_id: self.session_id.clone(),
            command_tx: self.command_tx.clone(),
        }
    }
}

/// Send-capability handle (`send` + session id only).
#[derive(Clone)]
pub struct TransportSink {
    session_id: String,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl crate::pipeline::MessageSink for TransportSink {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(&self, body: MessageBody) {
        let envelope = Envelope::new(self.session_id.clone(), body);
        let _ = self.command_tx.send(Command::Send(envelope));
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

enum ConnectOutcome {
    Established(Box<WsStream>, Option<Connected>),
    Failed(String),
    Fatal,
    Disconnect,
}

enum SessionEnd {
    Closed,
    Disconnect,
    Fatal,
    ForceReconnect,
}

struct Runner {
    config: TransportConfig,
    command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<TransportEvent>,
    state_tx: watch::Sender<TransportState>,
    auth_failed: Arc<AtomicBool>,
    last_received_sequence: Arc<AtomicI64>,
    codec: Codec,
    attempt: u32,
}

impl Runner {
    async fn run(mut self) {
        // Idle until the caller asks for a connection; the task ends when the
        // handle is dropped.
        while let Some(command) = self.command_rx.recv().await {
            match command {
                Command::Connect => {
                    if self.auth_failed.load(Ordering::SeqCst) {
                        warn!("connect ignored: authentication failed, reset_auth() first");
                        continue;
                    }
                    self.connection_cycle().await;
                }
                Command::Send(_) => {
                    warn!("dropping outbound message: transport not connected");
                }
                Command::Disconnect | Command::ForceReconnect => {}
            }
        }
    }

    async fn connection_cycle(&mut self) {
        self.attempt = 0;
        loop {
            self.set_state(TransportState::Connecting);
            match self.connect_once().await {
                ConnectOutcome::Established(ws, connected) => {
                    self.attempt = 0;
                    self.set_state(TransportState::Connected);
                    match connected {
                        Some(connected) => {
                            if connected.initial_schema.is_some() {
                                self.last_received_sequence.store(0, Ordering::SeqCst);
                            }
                            info!(connection_id = %connected.connection_id, "session established");
                            self.emit(TransportEvent::Connected(connected)).await;
                        }
                        None => self.emit(TransportEvent::Opened).await,
                    }
                    match self.connected_loop(*ws).await {
                        SessionEnd::Disconnect => {
                            self.set_state(TransportState::Disconnected);
                            self.emit(TransportEvent::Disconnected { reconnecting: false }).await;
                            return;
                        }
                        SessionEnd::Fatal => {
                            self.set_state(TransportState::Error);
                            return;
                        }
                        SessionEnd::Closed => {
                            self.set_state(TransportState::Disconnected);
                            self.emit(TransportEvent::Disconnected { reconnecting: true }).await;
                        }
                        SessionEnd::ForceReconnect => {
                            self.set_state(TransportState::Disconnected);
                            if !self.pause(consts::FORCE_RECONNECT_SETTLE).await {
                                return;
                            }
                            continue;
                        }
                    }
                }
                ConnectOutcome::Fatal => {
                    self.set_state(TransportState::Error);
                    return;
                }
                ConnectOutcome::Disconnect => {
                    self.set_state(TransportState::Disconnected);
                    return;
                }
                ConnectOutcome::Failed(reason) => {
                    warn!(attempt = self.attempt + 1, %reason, "connect attempt failed");
                    self.set_state(TransportState::Error);
                }
            }

            self.attempt += 1;
            let delay = reconnect_delay(self.attempt);
            debug!(attempt = self.attempt, delay_s = delay.as_secs(), "scheduling reconnect");
            if !self.pause(delay).await {
                return;
            }
        }
    }

    /// Sleep for `delay`, still servicing commands.  Returns `false` when a
    /// disconnect arrived and the cycle must end.
    async fn pause(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return true,
                command = self.command_rx.recv() => match command {
                    None | Some(Command::Disconnect) => {
                        self.set_state(TransportState::Disconnected);
                        return false;
                    }
                    Some(Command::ForceReconnect) => {
                        tokio::time::sleep(consts::FORCE_RECONNECT_SETTLE).await;
                        return true;
                    }
                    Some(Command::Send(_)) => {
                        warn!("dropping outbound message: transport not connected");
                    }
                    Some(Command::Connect) => {}
                },
            }
        }
    }

    async fn connect_once(&mut self) -> ConnectOutcome {
        let url = session_url(&self.config.server_url, &self.config.session_id);
        let connect_fut = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url),
        );
        tokio::pin!(connect_fut);

        let mut ws = loop {
            tokio::select! {
                result = &mut connect_fut => match result {
                    Ok(Ok((ws, _response))) => break ws,
                    Ok(Err(e)) => return ConnectOutcome::Failed(e.to_string()),
                    Err(_) => return ConnectOutcome::Failed("socket open timed out".to_owned()),
                },
                command = self.command_rx.recv() => match command {
                    None | Some(Command::Disconnect) => return ConnectOutcome::Disconnect,
                    Some(Command::Send(_)) => {
                        warn!("dropping outbound message: transport not connected");
                    }
                    Some(_) => {}
                },
            }
        };

        if !self.config.connect_handshake {
            // Legacy endpoint: the session layer performs the join handshake.
            return ConnectOutcome::Established(Box::new(ws), None);
        }

        let connect = Envelope::new(
            self.config.session_id.clone(),
            MessageBody::Connect(Connect {
                device_id: self.config.device_id.clone(),
                platform: self.config.platform,
                device_name: self.config.device_name.clone(),
                client_version: self.config.client_version.clone(),
                token: self.config.token.clone(),
            }),
        );
        if let Err(reason) = self.write(&mut ws, &connect).await {
            return ConnectOutcome::Failed(reason);
        }
        self.set_state(TransportState::AwaitingConnected);

        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    return ConnectOutcome::Failed("timed out awaiting connected".to_owned());
                }
                message = ws.next() => match message {
                    None => return ConnectOutcome::Failed("socket closed during handshake".to_owned()),
                    Some(Err(e)) => return ConnectOutcome::Failed(e.to_string()),
                    Some(Ok(Message::Text(text))) => match self.codec.decode(&text) {
                        Ok(decoded) => match decoded.message.body {
                            MessageBody::Connected(connected) => {
                                return ConnectOutcome::Established(Box::new(ws), Some(connected));
                            }
                            MessageBody::Error(error) if error.is_auth_failure() || error.is_fatal() => {
                                self.fail_terminally(&error).await;
                                let _ = ws.close(None).await;
                                return ConnectOutcome::Fatal;
                            }
                            MessageBody::Error(error) => {
                                self.emit(TransportEvent::ServerError(error)).await;
                            }
                            other => debug!(kind = other.kind(), "ignoring message during handshake"),
                        },
                        Err(e) => warn!(error = %e, "discarding invalid handshake message"),
                    },
                    Some(Ok(Message::Close(_))) => {
                        return ConnectOutcome::Failed("socket closed during handshake".to_owned());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                },
                command = self.command_rx.recv() => match command {
                    None | Some(Command::Disconnect) => {
                        let _ = ws.close(None).await;
                        return ConnectOutcome::Disconnect;
                    }
                    Some(Command::Send(_)) => {
                        warn!("dropping outbound message: transport not connected");
                    }
                    Some(_) => {}
                },
            }
        }
    }

    async fn connected_loop(&mut self, mut ws: WsStream) -> SessionEnd {
        let mut last_pong = Instant::now();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                message = ws.next() => match message {
                    None => return SessionEnd::Closed,
                    Some(Err(e)) => {
                        warn!(error = %e, "socket error");
                        return SessionEnd::Closed;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match self.codec.decode(&text) {
                            Ok(decoded) => {
                                for note in &decoded.notes {
                                    warn!(%note, "protocol validation note");
                                }
                                if let Some(end) = self.handle_inbound(decoded.message.body, &mut last_pong).await {
                                    let _ = ws.close(None).await;
                                    return end;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "discarding invalid inbound message");
                                let reply = Envelope::new(
                                    self.config.session_id.clone(),
                                    MessageBody::Error(ErrorMessage::new(
                                        e.error_code(),
                                        e.to_string(),
                                        Severity::Error,
                                        true,
                                    )),
                                );
                                let _ = self.write(&mut ws, &reply).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => return SessionEnd::Closed,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                },
                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > self.config.heartbeat_timeout {
                        warn!(
                            stale_s = last_pong.elapsed().as_secs(),
                            "heartbeat timeout, dropping connection"
                        );
                        let _ = ws.close(None).await;
                        return SessionEnd::Closed;
                    }
                    let ping = Envelope::new(
                        self.config.session_id.clone(),
                        MessageBody::Ping(Ping {
                            status: Some(hl_protocol::DeviceStatus::Idle),
                        }),
                    );
                    if self.write(&mut ws, &ping).await.is_err() {
                        return SessionEnd::Closed;
                    }
                }
                command = self.command_rx.recv() => match command {
                    None | Some(Command::Disconnect) => {
                        let _ = ws.close(None).await;
                        return SessionEnd::Disconnect;
                    }
                    Some(Command::ForceReconnect) => {
                        let _ = ws.close(None).await;
                        return SessionEnd::ForceReconnect;
                    }
                    Some(Command::Send(envelope)) => {
                        if self.write(&mut ws, &envelope).await.is_err() {
                            return SessionEnd::Closed;
                        }
                    }
                    Some(Command::Connect) => {}
                },
            }
        }
    }

    /// Returns `Some(end)` when the message terminates the connection.
    async fn handle_inbound(
        &mut self,
        body: MessageBody,
        last_pong: &mut Instant,
    ) -> Option<SessionEnd> {
        match body {
            MessageBody::Pong(pong) => {
                *last_pong = Instant::now();
                self.emit(TransportEvent::Pong {
                    server_time: pong.server_time,
                })
                .await;
                None
            }
            MessageBody::Update(update) => {
                let sequence = update.payload.sequence();
                self.last_received_sequence
                    .fetch_max(i64::try_from(sequence).unwrap_or(i64::MAX), Ordering::SeqCst);
                self.emit(TransportEvent::Update(update.payload)).await;
                None
            }
            MessageBody::Connected(connected) => {
                debug!(connection_id = %connected.connection_id, "connected message on live session");
                self.emit(TransportEvent::Connected(connected)).await;
                None
            }
            MessageBody::Error(error) if error.is_auth_failure() => {
                self.fail_terminally(&error).await;
                Some(SessionEnd::Fatal)
            }
            MessageBody::Error(error) if error.is_fatal() => {
                warn!(code = %error.code, "fatal server error");
                self.emit(TransportEvent::ServerError(error)).await;
                Some(SessionEnd::Fatal)
            }
            MessageBody::Error(error) => {
                self.emit(TransportEvent::ServerError(error)).await;
                None
            }
            MessageBody::Reload(reload) => {
                self.emit(TransportEvent::Reload(reload)).await;
                None
            }
            MessageBody::JoinAccepted(_) => {
                self.emit(TransportEvent::JoinAccepted).await;
                None
            }
            MessageBody::JoinRejected(rejected) => {
                self.auth_failed.store(true, Ordering::SeqCst);
                self.emit(TransportEvent::JoinRejected {
                    reason: rejected.reason,
                })
                .await;
                Some(SessionEnd::Fatal)
            }
            other => {
                debug!(kind = other.kind(), "ignoring message");
                None
            }
        }
    }

    async fn fail_terminally(&mut self, error: &ErrorMessage) {
        warn!(code = %error.code, "authentication/fatal failure, disabling reconnect");
        self.auth_failed.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::AuthFailed {
            code: error.code.clone(),
        })
        .await;
    }

    async fn write(&mut self, ws: &mut WsStream, message: &Envelope) -> Result<(), String> {
        let text = self.codec.encode(message).map_err(|e| e.to_string())?;
        ws.send(Message::Text(text.into()))
            .await
            .map_err(|e| e.to_string())
    }

    fn set_state(&self, state: TransportState) {
        let _ = self.state_tx.send(state);
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

/// Delay before the `attempt`-th consecutive reconnect (attempt counted
/// from 1): `min(2^(attempt-1), 30)` seconds.
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << exponent).min(consts::RECONNECT_CAP.as_secs()))
}
