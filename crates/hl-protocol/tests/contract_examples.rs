//! Contract golden tests: decode each frozen wire example, verify the typed
//! shape, serialize back, and confirm round-trip fidelity against the
//! original JSON.

use hl_protocol::{
    Codec, ErrorMessage, MessageBody, Platform, ReloadReason, Severity, UpdatePayload,
};

/// Decode an example in strict mode and assert the typed form re-encodes to
/// the same JSON value.
fn round_trip(json_text: &str) -> hl_protocol::Envelope {
    let codec = Codec::strict();
    let decoded = codec.decode(json_text).expect("example should decode");
    let serialized = codec.encode(&decoded.message).expect("re-encode");

    let original: serde_json::Value = serde_json::from_str(json_text).unwrap();
    let round: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(original, round, "round-trip mismatch");
    decoded.message
}

#[test]
fn connect_round_trip() {
    let msg = round_trip(
        r#"{
            "type": "connect",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000000,
            "version": "1.0.0",
            "deviceId": "D1",
            "platform": "android",
            "deviceName": "Pixel 9",
            "clientVersion": "1.0.0",
            "token": "T1"
        }"#,
    );
    match msg.body {
        MessageBody::Connect(connect) => {
            assert_eq!(connect.platform, Platform::Android);
            assert_eq!(connect.device_id, "D1");
            assert_eq!(connect.token, "T1");
        }
        other => panic!("expected connect, got {other:?}"),
    }
}

#[test]
fn connected_with_initial_schema_round_trip() {
    let msg = round_trip(
        r#"{
            "type": "connected",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000001,
            "version": "1.0.0",
            "connectionId": "C1",
            "initialSchema": {
                "version": "1.0",
                "timestamp": 0,
                "nodes": [{"id": "r", "type": "View", "props": {}, "children": []}]
            },
            "capabilities": {
                "incrementalUpdates": true,
                "compression": false,
                "statePreservation": true
            }
        }"#,
    );
    match msg.body {
        MessageBody::Connected(connected) => {
            assert_eq!(connected.connection_id, "C1");
            let schema = connected.initial_schema.expect("initial schema");
            assert_eq!(schema.nodes[0].id, "r");
            assert!(connected.capabilities.incremental_updates);
            assert!(!connected.capabilities.compression);
        }
        other => panic!("expected connected, got {other:?}"),
    }
}

#[test]
fn full_update_round_trip() {
    let msg = round_trip(
        r#"{
            "type": "update",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000002,
            "version": "1.0.0",
            "updateType": "full",
            "schema": {
                "version": "1.0",
                "timestamp": 0,
                "nodes": [{"id": "r", "type": "View", "props": {"padding": 16}, "children": []}]
            },
            "sequence": 2,
            "preserveState": false,
            "checksum": "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef"
        }"#,
    );
    match msg.body {
        MessageBody::Update(update) => match update.payload {
            UpdatePayload::Full(full) => {
                assert_eq!(full.sequence, 2);
                assert!(!full.preserve_state);
                assert!(full.checksum.is_some());
            }
            other => panic!("expected full update, got {other:?}"),
        },
        other => panic!("expected update, got {other:?}"),
    }
}

#[test]
fn incremental_update_round_trip() {
    let msg = round_trip(
        r#"{
            "type": "update",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000003,
            "version": "1.0.0",
            "updateType": "incremental",
            "delta": {
                "added": [],
                "modified": [{"id": "r", "type": "View", "props": {"padding": 16}, "children": []}],
                "removed": []
            },
            "sequence": 3,
            "preserveState": true
        }"#,
    );
    match msg.body {
        MessageBody::Update(update) => match update.payload {
            UpdatePayload::Incremental(inc) => {
                assert_eq!(inc.sequence, 3);
                assert!(inc.preserve_state);
                assert_eq!(inc.delta.modified.len(), 1);
                assert_eq!(inc.delta.change_count(), 1);
            }
            other => panic!("expected incremental update, got {other:?}"),
        },
        other => panic!("expected update, got {other:?}"),
    }
}

#[test]
fn ack_round_trip() {
    let msg = round_trip(
        r#"{
            "type": "ack",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000004,
            "version": "1.0.0",
            "sequence": 3,
            "success": true,
            "applyTimeMs": 12
        }"#,
    );
    match msg.body {
        MessageBody::Ack(ack) => {
            assert_eq!(ack.sequence, 3);
            assert!(ack.success);
            assert_eq!(ack.apply_time_ms, Some(12));
            assert!(ack.error.is_none());
        }
        other => panic!("expected ack, got {other:?}"),
    }
}

#[test]
fn reload_round_trip() {
    let msg = round_trip(
        r#"{
            "type": "reload",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000005,
            "version": "1.0.0",
            "reason": "error",
            "error": "3 consecutive incremental failures"
        }"#,
    );
    match msg.body {
        MessageBody::Reload(reload) => {
            assert_eq!(reload.reason, ReloadReason::Error);
            assert!(reload.error.is_some());
        }
        other => panic!("expected reload, got {other:?}"),
    }
}

#[test]
fn error_round_trip() {
    let msg = round_trip(
        r#"{
            "type": "error",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000006,
            "version": "1.0.0",
            "code": "INVALID_TOKEN",
            "message": "unknown or revoked token",
            "severity": "fatal",
            "recoverable": false
        }"#,
    );
    match msg.body {
        MessageBody::Error(error) => {
            assert!(error.is_auth_failure());
            assert!(error.is_fatal());
            assert_eq!(error.severity, Severity::Fatal);
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn legacy_join_shapes_round_trip() {
    let join = round_trip(
        r#"{
            "type": "join",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000007,
            "version": "1.0.0",
            "token": "T1",
            "clientType": "device"
        }"#,
    );
    assert!(matches!(join.body, MessageBody::Join(_)));

    let accepted = round_trip(
        r#"{
            "type": "joinAccepted",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000008,
            "version": "1.0.0"
        }"#,
    );
    assert!(matches!(accepted.body, MessageBody::JoinAccepted(_)));

    let rejected = round_trip(
        r#"{
            "type": "joinRejected",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000009,
            "version": "1.0.0",
            "reason": "join timeout"
        }"#,
    );
    match rejected.body {
        MessageBody::JoinRejected(r) => assert_eq!(r.reason, "join timeout"),
        other => panic!("expected joinRejected, got {other:?}"),
    }
}

#[test]
fn pong_round_trip() {
    let msg = round_trip(
        r#"{
            "type": "pong",
            "sessionId": "11111111-1111-4111-8111-111111111111",
            "timestamp": 1720000000010,
            "version": "1.0.0",
            "serverTime": 1720000000010
        }"#,
    );
    match msg.body {
        MessageBody::Pong(pong) => assert_eq!(pong.server_time, 1_720_000_000_010),
        other => panic!("expected pong, got {other:?}"),
    }
}

#[test]
fn generated_session_ids_pass_validation() {
    // UUID-v4 form is the recommended (not required) session id shape.
    let id = uuid::Uuid::new_v4().to_string();
    assert!(hl_protocol::validate_session_id(&id).is_ok());

    let err = Codec::strict()
        .decode(&format!(
            r#"{{"type":"pong","sessionId":"{}","timestamp":1,"version":"1.0.0","serverTime":1}}"#,
            "x".repeat(200)
        ))
        .unwrap_err();
    assert!(matches!(err, hl_protocol::CodecError::InvalidSessionId(200)));
}

#[test]
fn error_reply_shape_for_invalid_inbound() {
    // An endpoint that fails validation replies with INVALID_MESSAGE,
    // recoverable, and discards the inbound message.
    let err = Codec::strict().decode("[1,2,3]").unwrap_err();
    let reply = ErrorMessage::new(err.error_code(), err.to_string(), Severity::Error, true);
    assert_eq!(reply.code, "INVALID_MESSAGE");
    assert!(reply.recoverable);
}
