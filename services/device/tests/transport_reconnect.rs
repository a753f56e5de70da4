//! Transport lifecycle tests against a real in-process mock server:
//! handshake, reconnect after drop, heartbeat timeout, and the auth latch.

use device::{Transport, TransportConfig, TransportEvent, TransportState};
use hl_protocol::{Envelope, MessageBody, Ping};
use hl_test_utils::{HandshakeBehavior, MockDevServer, MockServerOptions};
use std::time::Duration;
use tokio::sync::mpsc;

const SESSION: &str = "session-12345678";

fn config(server: &MockDevServer) -> TransportConfig {
    let mut config = TransportConfig::new(server.url(), SESSION, "token-1", "device-1");
    config.connect_timeout = Duration::from_secs(2);
    config
}

async fn next_event(
    events: &mut mpsc::Receiver<TransportEvent>,
    timeout: Duration,
) -> TransportEvent {
    tokio::time::timeout(timeout, events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event channel closed")
}

async fn wait_for_connected(events: &mut mpsc::Receiver<TransportEvent>) -> hl_protocol::Connected {
    loop {
        match next_event(events, Duration::from_secs(5)).await {
            TransportEvent::Connected(connected) => return connected,
            _ => {}
        }
    }
}

#[tokio::test]
async fn connects_and_completes_the_handshake() {
    let server = MockDevServer::start(MockServerOptions::default()).await.unwrap();
    let (transport, mut events) = Transport::spawn(config(&server));
    transport.connect();

    let connected = wait_for_connected(&mut events).await;
    assert!(!connected.connection_id.is_empty());
    assert_eq!(transport.state(), TransportState::Connected);

    // The server saw exactly one connect with the token in the payload.
    let inbound = server.recv_inbound(Duration::from_secs(2)).await.unwrap();
    match inbound.body {
        MessageBody::Connect(connect) => {
            assert_eq!(connect.token, "token-1");
            assert_eq!(connect.device_id, "device-1");
        }
        other => panic!("expected connect, got {other:?}"),
    }
    assert_eq!(inbound.session_id, SESSION);

    transport.disconnect();
}

#[tokio::test]
async fn reconnects_with_backoff_after_server_drop() {
    let server = MockDevServer::start(MockServerOptions::default()).await.unwrap();
    let (transport, mut events) = Transport::spawn(config(&server));
    transport.connect();
    let _ = wait_for_connected(&mut events).await;
    assert_eq!(server.connection_count(), 1);

    server.close_current().await;

    // Drop is observed, then the first retry lands after ~1 s of backoff.
    loop {
        match next_event(&mut events, Duration::from_secs(5)).await {
            TransportEvent::Disconnected { reconnecting } => {
                assert!(reconnecting);
                break;
            }
            _ => {}
        }
    }
    let _ = wait_for_connected(&mut events).await;
    assert!(server.connection_count() >= 2);
    assert_eq!(transport.state(), TransportState::Connected);

    transport.disconnect();
}

#[tokio::test]
async fn heartbeat_timeout_drops_the_connection() {
    let server = MockDevServer::start(MockServerOptions {
        handshake: HandshakeBehavior::Accept,
        ignore_pings: true,
    })
    .await
    .unwrap();
    let mut cfg = config(&server);
    cfg.heartbeat_interval = Duration::from_millis(50);
    cfg.heartbeat_timeout = Duration::from_millis(120);
    let (transport, mut events) = Transport::spawn(cfg);
    transport.connect();
    let _ = wait_for_connected(&mut events).await;

    // Without pongs the connection must leave Connected within a tick of the
    // timeout, then reconnect.
    loop {
        match next_event(&mut events, Duration::from_secs(5)).await {
            TransportEvent::Disconnected { reconnecting: true } => break,
            _ => {}
        }
    }
    let _ = wait_for_connected(&mut events).await;
    assert!(server.connection_count() >= 2);

    transport.disconnect();
}

#[tokio::test]
async fn auth_failure_latches_and_stops_reconnecting() {
    let server = MockDevServer::start(MockServerOptions {
        handshake: HandshakeBehavior::RejectAuth,
        ignore_pings: false,
    })
    .await
    .unwrap();
    let (transport, mut events) = Transport::spawn(config(&server));
    transport.connect();

    loop {
        match next_event(&mut events, Duration::from_secs(5)).await {
            TransportEvent::AuthFailed { code } => {
                assert_eq!(code, "INVALID_TOKEN");
                break;
            }
            _ => {}
        }
    }
    assert!(transport.authentication_failed());
    assert_eq!(transport.state(), TransportState::Error);

    // No retry is scheduled: the connection count stays put.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(server.connection_count(), 1);

    // connect() is ignored while the latch is set.
    transport.connect();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connection_count(), 1);

    // After reset_auth a fresh provisioning flow may retry.
    transport.reset_auth();
    assert!(!transport.authentication_failed());
    transport.connect();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.connection_count(), 2);

    transport.disconnect();
}

#[tokio::test]
async fn outbound_messages_are_dropped_while_disconnected() {
    let server = MockDevServer::start(MockServerOptions::default()).await.unwrap();
    let (transport, mut events) = Transport::spawn(config(&server));

    // Sent before connect: must be dropped, not buffered for later.
    transport.send(Envelope::new(SESSION, MessageBody::Ping(Ping { status: None })));
    transport.connect();
    let _ = wait_for_connected(&mut events).await;

    // The first (and only) thing the server received is the connect itself.
    let first = server.recv_inbound(Duration::from_secs(2)).await.unwrap();
    assert!(matches!(first.body, MessageBody::Connect(_)));
    assert!(server.recv_inbound(Duration::from_millis(300)).await.is_none());

    transport.disconnect();
}

#[tokio::test]
async fn disconnect_cancels_a_pending_reconnect() {
    // Nothing listens on this port; connects fail fast.
    let mut cfg = TransportConfig::new(
        "ws://127.0.0.1:9/ws/v1/devices",
        SESSION,
        "token-1",
        "device-1",
    );
    cfg.connect_timeout = Duration::from_millis(300);
    let (transport, _events) = Transport::spawn(cfg);
    transport.connect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.disconnect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.state(), TransportState::Disconnected);
}
