//! Authenticated session lifecycle above the transport.
//!
//! Joining is implicit on the modern `connect`/`connected` handshake; legacy
//! endpoints get an explicit `join` with a 5-second timeout, after which a
//! `joinRejected{"join timeout"}` is synthesized.  Session events are
//! monotonic per lifetime: a rejected session never emits `Joined` afterward.

use crate::store::{self, SchemaStore};
use crate::transport::{Transport, TransportConfig, TransportEvent};
use hl_protocol::{
    Capabilities, ClientType, Envelope, ErrorMessage, FullUpdate, Join, MessageBody, Platform,
    Reload, UpdatePayload, consts,
};
use hl_schema::Schema;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub session_id: String,
    pub token: String,
    pub device_id: String,
    pub device_name: Option<String>,
    pub platform: Platform,
    pub client_version: String,
    pub client_type: ClientType,
    /// Use the legacy `join` handshake instead of `connect`/`connected`.
    pub legacy_join: bool,
    pub join_timeout: Duration,
}

impl SessionConfig {
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
            client_type: ClientType::Device,
            legacy_join: false,
            join_timeout: consts::JOIN_TIMEOUT,
        }
    }

    fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::new(
            self.server_url.clone(),
            self.session_id.clone(),
            self.token.clone(),
            self.device_id.clone(),
        );
        config.device_name = self.device_name.clone();
        config.platform = self.platform;
        config.client_version = self.client_version.clone();
        config.connect_handshake = !self.legacy_join;
        config
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    Joined {
        connection_id: Option<String>,
        capabilities: Option<Capabilities>,
    },
    JoinRejected {
        reason: String,
    },
    /// An update to feed the pipeline.  The initial schema delivered with
    /// `connected` arrives here as a full update at sequence 0.
    Update(UpdatePayload),
    ServerError(ErrorMessage),
    ReloadRequested(Reload),
    Disconnected {
        reconnecting: bool,
    },
}

pub struct SessionController {
    config: SessionConfig,
    transport: Transport,
    store: Arc<dyn SchemaStore>,
}

impl SessionController {
    /// Spawn the transport and the event pump.  Nothing touches the network
    /// until [`SessionController::connect_and_join`].
    pub fn start(
        config: SessionConfig,
        store: Arc<dyn SchemaStore>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (transport, transport_events) = Transport::spawn(config.transport_config());
        let (events_tx, events_rx) = mpsc::channel(64);

        let pump = Pump {
            session_id: config.session_id.clone(),
            token: config.token.clone(),
            client_type: config.client_type,
            legacy_join: config.legacy_join,
            join_timeout: config.join_timeout,
            transport: transport.clone(),
            events_tx,
        };
        tokio::spawn(pump.run(transport_events));

        (
            Self {
                config,
                transport,
                store,
            },
            events_rx,
        )
    }

    /// Open the transport; the join handshake runs automatically.
    pub fn connect_and_join(&self) {
        self.transport.connect();
    }

    /// Terminal for this request; a later `connect_and_join` starts fresh.
    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    /// Persist the last-known-good schema.  Best-effort: failures are logged
    /// and must never block update application.
    pub fn save_schema(&self, schema: &Schema) {
        if let Err(e) = store::save_schema(self.store.as_ref(), schema) {
            warn!(error = %e, "failed to persist schema");
        }
    }

    /// The previously persisted schema, for offline rendering at startup.
    pub fn load_cached_schema(&self) -> Option<Schema> {
        match store::load_cached_schema(self.store.as_ref()) {
            Ok(schema) => schema,
            Err(e) => {
                warn!(error = %e, "failed to load cached schema");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event pump
// ---------------------------------------------------------------------------

struct Pump {
    session_id: String,
    token: String,
    client_type: ClientType,
    legacy_join: bool,
    join_timeout: Duration,
    transport: Transport,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl Pump {
    async fn run(self, mut transport_events: mpsc::Receiver<TransportEvent>) {
        let mut join_deadline: Option<Instant> = None;
        let mut rejected = false;

        loop {
            let event = tokio::select! {
                event = transport_events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                () = async {
                    match join_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    join_deadline = None;
                    rejected = true;
                    warn!("no join response within the timeout");
                    self.emit(SessionEvent::JoinRejected {
                        reason: "join timeout".to_owned(),
                    })
                    .await;
                    self.transport.disconnect();
                    continue;
                }
            };

            match event {
                TransportEvent::Opened => {
                    if self.legacy_join {
                        debug!("socket open, sending legacy join");
                        self.transport.send(Envelope::new(
                            self.session_id.clone(),
                            MessageBody::Join(Join {
                                token: self.token.clone(),
                                client_type: self.client_type,
                            }),
                        ));
                        join_deadline = Some(Instant::now() + self.join_timeout);
                    }
                }
                TransportEvent::Connected(connected) => {
                    rejected = false;
                    self.emit(SessionEvent::Joined {
                        connection_id: Some(connected.connection_id),
                        capabilities: Some(connected.capabilities),
                    })
                    .await;
                    if let Some(schema) = connected.initial_schema {
                        self.emit(SessionEvent::Update(UpdatePayload::Full(FullUpdate {
                            schema,
                            sequence: 0,
                            preserve_state: false,
                            checksum: None,
                        })))
                        .await;
                    }
                }
                TransportEvent::JoinAccepted => {
                    join_deadline = None;
                    rejected = false;
                    self.emit(SessionEvent::Joined {
                        connection_id: None,
                        capabilities: None,
                    })
                    .await;
                }
                TransportEvent::JoinRejected { reason } => {
                    join_deadline = None;
                    rejected = true;
                    self.emit(SessionEvent::JoinRejected { reason }).await;
                }
                TransportEvent::AuthFailed { code } => {
                    join_deadline = None;
                    rejected = true;
                    self.emit(SessionEvent::JoinRejected { reason: code }).await;
                }
                TransportEvent::Update(update) => {
                    self.emit(SessionEvent::Update(update)).await;
                }
                TransportEvent::ServerError(error) => {
                    self.emit(SessionEvent::ServerError(error)).await;
                }
                TransportEvent::Reload(reload) => {
                    self.emit(SessionEvent::ReloadRequested(reload)).await;
                }
                TransportEvent::Disconnected { reconnecting } => {
                    join_deadline = None;
                    if !rejected {
                        self.emit(SessionEvent::Disconnected { reconnecting }).await;
                    }
                }
                TransportEvent::Pong { .. } => {}
            }
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event).await;
    }
}
