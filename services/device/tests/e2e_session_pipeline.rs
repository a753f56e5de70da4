//! Full device-side loop over a real socket: handshake, initial schema
//! application, a pushed incremental, and acks flowing back to the server.

use device::{
    MemoryStore, MirrorInterpreter, PipelineConfig, SessionConfig, SessionController,
    SessionEvent, UpdatePipeline,
};
use hl_protocol::{IncrementalUpdate, MessageBody, UpdatePayload};
use hl_schema::{Node, Schema, compute_delta};
use hl_test_utils::{HandshakeBehavior, MockDevServer, MockServerOptions};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SESSION: &str = "session-12345678";

fn initial_schema() -> Schema {
    Schema::new("1.0", vec![Node::new("root", "View")])
}

fn updated_schema() -> Schema {
    let mut schema = initial_schema();
    schema.nodes[0].props.insert("padding".to_owned(), json!(16));
    schema
}

#[tokio::test]
async fn updates_flow_through_the_pipeline_and_acks_return_over_the_wire() {
    let server = MockDevServer::start(MockServerOptions {
        handshake: HandshakeBehavior::AcceptWithSchema(initial_schema()),
        ignore_pings: false,
    })
    .await
    .unwrap();

    let store = Arc::new(MemoryStore::new());
    let (controller, mut session_events) = SessionController::start(
        SessionConfig::new(server.url(), SESSION, "token-1", "device-1"),
        store.clone(),
    );

    // Pipeline wired to the transport's send capability: acks and reload
    // requests go out over the live connection.
    let sink = Arc::new(controller.transport().sink());
    let (pipeline, mut results) = UpdatePipeline::new(
        MirrorInterpreter::new(),
        sink,
        store,
        PipelineConfig {
            debounce_window: Duration::from_millis(20),
            ..PipelineConfig::default()
        },
    );
    let (updates_tx, updates_rx) = mpsc::channel(16);
    let driver = tokio::spawn(pipeline.run(updates_rx));

    // Forward session updates into the pipeline.
    tokio::spawn(async move {
        while let Some(event) = session_events.recv().await {
            if let SessionEvent::Update(update) = event {
                let _ = updates_tx.send(update).await;
            }
        }
    });

    controller.connect_and_join();

    // The initial schema (sequence 0) applies and is acked over the wire.
    let first = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.success);
    assert_eq!(first.sequence, 0);

    let ack = wait_for_ack(&server).await;
    assert_eq!(ack.sequence, 0);
    assert!(ack.success);

    // A pushed incremental applies against the pipeline-owned schema.
    let delta = compute_delta(&initial_schema(), &updated_schema());
    server
        .push_update(
            SESSION,
            UpdatePayload::Incremental(IncrementalUpdate {
                delta,
                sequence: 1,
                preserve_state: true,
            }),
        )
        .await;

    let second = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(second.success);
    assert_eq!(second.sequence, 1);

    let ack = wait_for_ack(&server).await;
    assert_eq!(ack.sequence, 1);
    assert!(ack.success);
    assert!(ack.apply_time_ms.is_some());

    controller.disconnect();
    driver.abort();
}

async fn wait_for_ack(server: &MockDevServer) -> hl_protocol::Ack {
    loop {
        let envelope = server
            .recv_inbound(Duration::from_secs(5))
            .await
            .expect("expected an inbound message");
        if let MessageBody::Ack(ack) = envelope.body {
            return ack;
        }
    }
}
