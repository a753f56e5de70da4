// mock_dev_server: a mock hot-reload server for testing device clients.
//
// Accepts WebSocket connections on 127.0.0.1:<random port>, answers the
// `connect`/`join` handshake according to a configurable behavior, records
// every inbound message, and lets tests push updates to the most recent
// connection.

use futures_util::{SinkExt, StreamExt};
use hl_protocol::{
    Capabilities, Connected, Envelope, ErrorMessage, JoinAccepted, MessageBody, Pong, Severity,
    UpdateMessage, UpdatePayload, error_codes, now_ms,
};
use hl_schema::Schema;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;

/// How the mock answers a device handshake.
#[derive(Debug, Clone, Default)]
pub enum HandshakeBehavior {
    /// Reply `connected` (or `joinAccepted` to a legacy `join`).
    #[default]
    Accept,
    /// Like `Accept`, with an initial schema in the `connected` payload.
    AcceptWithSchema(Schema),
    /// Reply with a fatal `INVALID_TOKEN` error.
    RejectAuth,
    /// Never reply to the handshake.
    Silent,
}

#[derive(Debug, Clone, Default)]
pub struct MockServerOptions {
    pub handshake: HandshakeBehavior,
    /// Set to `true` to ignore protocol pings (heartbeat-timeout tests).
    pub ignore_pings: bool,
}

type OutboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<Envelope>>>>;

/// A mock dev server for integration testing.
///
/// Binds to port 0 (random) and exposes the bound address.  Each test spins
/// up its own isolated instance; one handler task per connection.
pub struct MockDevServer {
    addr: SocketAddr,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    outbound: OutboundSlot,
    connection_count: Arc<AtomicUsize>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockDevServer {
    pub async fn start(options: MockServerOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let outbound: OutboundSlot = Arc::new(Mutex::new(None));
        let connection_count = Arc::new(AtomicUsize::new(0));

        let task = {
            let outbound = outbound.clone();
            let connection_count = connection_count.clone();
            tokio::spawn(async move {
                Self::accept_loop(listener, options, inbound_tx, outbound, connection_count).await;
            })
        };

        Ok(Self {
            addr,
            inbound_rx: Mutex::new(inbound_rx),
            outbound,
            connection_count,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint URL without the session query parameter.
    pub fn url(&self) -> String {
        format!("ws://{}/ws/v1/devices", self.addr)
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Next recorded inbound message, if one arrives within the timeout.
    pub async fn recv_inbound(&self, timeout: std::time::Duration) -> Option<Envelope> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Push an update to the most recent connection.
    pub async fn push_update(&self, session_id: &str, payload: UpdatePayload) {
        let envelope = Envelope::new(
            session_id,
            MessageBody::Update(UpdateMessage { payload }),
        );
        self.push(envelope).await;
    }

    /// Push an arbitrary message to the most recent connection.
    pub async fn push(&self, envelope: Envelope) {
        if let Some(tx) = self.outbound.lock().await.as_ref() {
            let _ = tx.send(envelope);
        }
    }

    /// Drop the most recent connection's write side, closing its socket.
    pub async fn close_current(&self) {
        self.outbound.lock().await.take();
    }

    // -- internal --

    async fn accept_loop(
        listener: TcpListener,
        options: MockServerOptions,
        inbound_tx: mpsc::UnboundedSender<Envelope>,
        outbound: OutboundSlot,
        connection_count: Arc<AtomicUsize>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    connection_count.fetch_add(1, Ordering::SeqCst);
                    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
                    *outbound.lock().await = Some(conn_tx);
                    let options = options.clone();
                    let inbound_tx = inbound_tx.clone();
                    tokio::spawn(async move {
                        // Connection errors are expected in tests (client drops).
                        let _ =
                            Self::handle_connection(stream, options, inbound_tx, conn_rx).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        options: MockServerOptions,
        inbound_tx: mpsc::UnboundedSender<Envelope>,
        mut conn_rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                outbound = conn_rx.recv() => match outbound {
                    Some(envelope) => {
                        let text = serde_json::to_string(&envelope)?;
                        write.send(Message::Text(text.into())).await?;
                    }
                    // close_current() dropped the sender: close the socket.
                    None => {
                        let _ = write.close().await;
                        return Ok(());
                    }
                },
                inbound = read.next() => {
                    let Some(message) = inbound else { return Ok(()) };
                    let text = match message? {
                        Message::Text(text) => text,
                        Message::Close(_) => return Ok(()),
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await?;
                            continue;
                        }
                        _ => continue,
                    };
                    let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
                        continue;
                    };
                    let session_id = envelope.session_id.clone();
                    let body = envelope.body.clone();
                    let _ = inbound_tx.send(envelope);

                    if let Some(reply) = Self::reply_for(&options, &session_id, &body) {
                        let text = serde_json::to_string(&reply)?;
                        write.send(Message::Text(text.into())).await?;
                    }
                }
            }
        }
    }

    fn reply_for(
        options: &MockServerOptions,
        session_id: &str,
        body: &MessageBody,
    ) -> Option<Envelope> {
        match body {
            MessageBody::Connect(_) => match &options.handshake {
                HandshakeBehavior::Accept => Some(Envelope::new(
                    session_id,
                    MessageBody::Connected(Self::connected(None)),
                )),
                HandshakeBehavior::AcceptWithSchema(schema) => Some(Envelope::new(
                    session_id,
                    MessageBody::Connected(Self::connected(Some(schema.clone()))),
                )),
                HandshakeBehavior::RejectAuth => Some(Self::auth_error(session_id)),
                HandshakeBehavior::Silent => None,
            },
            MessageBody::Join(_) => match &options.handshake {
                HandshakeBehavior::Accept | HandshakeBehavior::AcceptWithSchema(_) => Some(
                    Envelope::new(session_id, MessageBody::JoinAccepted(JoinAccepted {})),
                ),
                HandshakeBehavior::RejectAuth => Some(Self::auth_error(session_id)),
                HandshakeBehavior::Silent => None,
            },
            MessageBody::Ping(_) if !options.ignore_pings => Some(Envelope::new(
                session_id,
                MessageBody::Pong(Pong {
                    server_time: now_ms(),
                }),
            )),
            _ => None,
        }
    }

    fn connected(initial_schema: Option<Schema>) -> Connected {
        Connected {
            connection_id: uuid::Uuid::new_v4().to_string(),
            initial_schema,
            capabilities: Capabilities {
                incremental_updates: true,
                compression: false,
                state_preservation: true,
            },
        }
    }

    fn auth_error(session_id: &str) -> Envelope {
        Envelope::new(
            session_id,
            MessageBody::Error(ErrorMessage::new(
                error_codes::INVALID_TOKEN,
                "unknown or revoked token",
                Severity::Fatal,
                false,
            )),
        )
    }
}
