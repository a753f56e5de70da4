//! End-to-end publish pipeline over the wire: strategy selection, sequence
//! assignment, ack recording, and reload resynchronization.

use futures_util::{SinkExt, StreamExt};
use hl_protocol::{
    Ack, Codec, Connect, Envelope, MessageBody, Platform, Reload, ReloadReason, UpdatePayload,
};
use hl_schema::{Node, Schema, UpdateStrategy};
use server::{AppState, PublishOutcome, ServerConfig};
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_server() -> (AppState, String) {
    let state = AppState::new(ServerConfig::default());
    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (state, addr.to_string())
}

async fn connect_device(addr: &str, session_id: &str, token: &str) -> WsClient {
    let url = format!("ws://{addr}/ws/v1/devices?session={session_id}");
    let (mut ws, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    let connect = Envelope::new(
        session_id,
        MessageBody::Connect(Connect {
            device_id: "device-1".to_owned(),
            platform: Platform::Ios,
            device_name: None,
            client_version: "1.0.0".to_owned(),
            token: token.to_owned(),
        }),
    );
    let text = Codec::lenient().encode(&connect).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
    ws
}

async fn recv(ws: &mut WsClient) -> Envelope {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("socket closed")
            .expect("socket error");
        match message {
            Message::Text(text) => return Codec::lenient().decode(&text).unwrap().message,
            _ => {}
        }
    }
}

async fn recv_update(ws: &mut WsClient) -> UpdatePayload {
    loop {
        match recv(ws).await.body {
            MessageBody::Update(update) => return update.payload,
            _ => {}
        }
    }
}

fn schema(padding: i64) -> Schema {
    Schema::new(
        "1.0",
        vec![Node::new("root", "View").with_prop("padding", json!(padding))],
    )
}

#[tokio::test]
async fn initial_schema_rides_in_connected_and_updates_follow() {
    let (state, addr) = start_server().await;
    let (session_id, token) = state.create_session(None).await;
    state.publish_schema(&session_id, schema(1)).await.unwrap();

    let mut ws = connect_device(&addr, &session_id, &token).await;
    match recv(&mut ws).await.body {
        MessageBody::Connected(connected) => {
            let initial = connected.initial_schema.unwrap();
            assert_eq!(initial.nodes[0].props["padding"], json!(1));
        }
        other => panic!("expected connected, got {other:?}"),
    }

    // A small change streams as an incremental at the next sequence.
    let outcome = state.publish_schema(&session_id, schema(2)).await.unwrap();
    assert!(matches!(
        outcome,
        PublishOutcome::Sent {
            strategy: UpdateStrategy::Incremental,
            sequence: 1,
            receivers: 1,
        }
    ));
    match recv_update(&mut ws).await {
        UpdatePayload::Incremental(inc) => {
            assert_eq!(inc.sequence, 1);
            assert!(inc.preserve_state);
            assert_eq!(inc.delta.modified.len(), 1);
        }
        other => panic!("expected incremental, got {other:?}"),
    }
}

#[tokio::test]
async fn navigation_change_broadcasts_a_checksummed_full_update() {
    let (state, addr) = start_server().await;
    let (session_id, token) = state.create_session(None).await;
    state.publish_schema(&session_id, schema(1)).await.unwrap();

    let mut ws = connect_device(&addr, &session_id, &token).await;
    let _connected = recv(&mut ws).await;

    let mut with_nav = schema(1);
    with_nav.navigation = Some(json!({"route": "/detail"}));
    state
        .publish_schema(&session_id, with_nav.clone())
        .await
        .unwrap();

    match recv_update(&mut ws).await {
        UpdatePayload::Full(full) => {
            assert_eq!(full.sequence, 1);
            assert_eq!(full.checksum.as_deref(), Some(hl_schema::checksum(&with_nav).as_str()));
            assert_eq!(full.schema.navigation, Some(json!({"route": "/detail"})));
        }
        other => panic!("expected full, got {other:?}"),
    }
}

#[tokio::test]
async fn acks_are_recorded_and_reload_resyncs_with_a_bumped_sequence() {
    let (state, addr) = start_server().await;
    let (session_id, token) = state.create_session(None).await;
    state.publish_schema(&session_id, schema(1)).await.unwrap();

    let mut ws = connect_device(&addr, &session_id, &token).await;
    let _connected = recv(&mut ws).await;

    state.publish_schema(&session_id, schema(2)).await.unwrap();
    let update = recv_update(&mut ws).await;
    assert_eq!(update.sequence(), 1);

    // Ack it, then ask for a reload; the resync full must carry a sequence
    // the device has not applied yet.
    let ack = Envelope::new(
        session_id.clone(),
        MessageBody::Ack(Ack {
            sequence: 1,
            success: true,
            error: None,
            apply_time_ms: Some(7),
        }),
    );
    let text = Codec::lenient().encode(&ack).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();

    let reload = Envelope::new(
        session_id.clone(),
        MessageBody::Reload(Reload {
            reason: ReloadReason::Error,
            error: Some("3 consecutive incremental failures".to_owned()),
        }),
    );
    let text = Codec::lenient().encode(&reload).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();

    match recv_update(&mut ws).await {
        UpdatePayload::Full(full) => {
            assert_eq!(full.sequence, 2);
            assert!(full.preserve_state);
            assert_eq!(full.schema.nodes[0].props["padding"], json!(2));
        }
        other => panic!("expected full resync, got {other:?}"),
    }

    let status = state.session_status(&session_id).await.unwrap();
    assert_eq!(status.last_sequence, 2);
}

#[tokio::test]
async fn every_member_receives_published_updates() {
    let (state, addr) = start_server().await;
    let (session_id, token) = state.create_session(None).await;
    state.publish_schema(&session_id, schema(1)).await.unwrap();

    let mut first = connect_device(&addr, &session_id, &token).await;
    let mut second = connect_device(&addr, &session_id, &token).await;
    let _ = recv(&mut first).await;
    let _ = recv(&mut second).await;

    let outcome = state.publish_schema(&session_id, schema(3)).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Sent { receivers: 2, .. }));

    assert_eq!(recv_update(&mut first).await.sequence(), 1);
    assert_eq!(recv_update(&mut second).await.sequence(), 1);
}
