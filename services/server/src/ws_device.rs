//! Device WebSocket endpoint.
//!
//! `GET /ws/v1/devices?session=<id>`.  The first message must be a `connect`
//! (modern) or `join` (legacy) carrying the session token; afterwards the
//! loop serves heartbeats, records acks, answers reload requests with a
//! fresh full update, and relays published updates from the session fan-out.

use crate::state::{AppState, AuthFailure};
use crate::rate_limit::TokenBucket;
use crate::ws_common::{recv_text_with_timeout, send_envelope, send_ws_error};
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use hl_protocol::{
    Codec, Envelope, JoinAccepted, JoinRejected, MessageBody, Pong, Severity, error_codes, now_ms,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct DeviceQuery {
    session: Option<String>,
}

pub async fn ws_device_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<DeviceQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_device_socket(socket, state, query.session))
}

async fn handle_device_socket(
    mut socket: WebSocket,
    state: AppState,
    session_param: Option<String>,
) {
    // Inbound validation is strict on the server side.
    let codec = Codec::strict();

    let Some(session_id) = session_param else {
        send_ws_error(
            &mut socket,
            &codec,
            "unknown-session",
            error_codes::INVALID_MESSAGE,
            "missing session query parameter",
            Severity::Fatal,
            false,
        )
        .await;
        return;
    };

    let Ok(first) = recv_text_with_timeout(&mut socket, state.config.handshake_timeout).await
    else {
        send_ws_error(
            &mut socket,
            &codec,
            &session_id,
            error_codes::CONNECTION_TIMEOUT,
            "no handshake message received",
            Severity::Fatal,
            false,
        )
        .await;
        return;
    };

    let decoded = match codec.decode(&first) {
        Ok(decoded) => decoded,
        Err(e) => {
            send_ws_error(
                &mut socket,
                &codec,
                &session_id,
                e.error_code(),
                &e.to_string(),
                Severity::Error,
                true,
            )
            .await;
            return;
        }
    };
    for note in &decoded.notes {
        warn!(%session_id, %note, "handshake validation note");
    }
    if decoded.message.session_id != session_id {
        send_ws_error(
            &mut socket,
            &codec,
            &session_id,
            error_codes::INVALID_MESSAGE,
            "envelope session does not match the endpoint session",
            Severity::Error,
            true,
        )
        .await;
        return;
    }

    // Both handshake shapes are supported for interop.
    let (device_id, token, legacy) = match decoded.message.body {
        MessageBody::Connect(connect) => (connect.device_id, connect.token, false),
        MessageBody::Join(join) => (join.client_type.as_str().to_owned(), join.token, true),
        other => {
            warn!(%session_id, kind = other.kind(), "unexpected handshake message");
            send_ws_error(
                &mut socket,
                &codec,
                &session_id,
                error_codes::INVALID_MESSAGE,
                "expected connect or join",
                Severity::Error,
                true,
            )
            .await;
            return;
        }
    };

    if let Err(failure) = state.authenticate(&session_id, &token).await {
        let code = match failure {
            AuthFailure::NotFound => error_codes::SESSION_NOT_FOUND,
            AuthFailure::BadToken => error_codes::INVALID_TOKEN,
        };
        warn!(%session_id, %device_id, code, "handshake rejected");
        if legacy {
            let rejection = Envelope::new(
                session_id.clone(),
                MessageBody::JoinRejected(JoinRejected {
                    reason: code.to_owned(),
                }),
            );
            let _ = send_envelope(&mut socket, &codec, &rejection).await;
        } else {
            send_ws_error(
                &mut socket,
                &codec,
                &session_id,
                code,
                "authentication failed",
                Severity::Fatal,
                false,
            )
            .await;
        }
        return;
    }

    let Some((joined, outbound_rx)) = state.join(&session_id, &device_id).await else {
        send_ws_error(
            &mut socket,
            &codec,
            &session_id,
            error_codes::SESSION_NOT_FOUND,
            "session disappeared during handshake",
            Severity::Fatal,
            false,
        )
        .await;
        return;
    };
    let connection_id = joined.connection_id.clone();

    let accepted = if legacy {
        // Legacy joiners get no `connected` payload; ship the current schema
        // as a full update right after acceptance.
        let ok = send_envelope(
            &mut socket,
            &codec,
            &Envelope::new(session_id.clone(), MessageBody::JoinAccepted(JoinAccepted {})),
        )
        .await;
        if ok && joined.initial_schema.is_some() {
            match state.resync_full(&session_id).await {
                Some(envelope) => send_envelope(&mut socket, &codec, &envelope).await,
                None => ok,
            }
        } else {
            ok
        }
    } else {
        send_envelope(
            &mut socket,
            &codec,
            &Envelope::new(
                session_id.clone(),
                MessageBody::Connected(hl_protocol::Connected {
                    connection_id: connection_id.clone(),
                    initial_schema: joined.initial_schema,
                    capabilities: state.config.capabilities,
                }),
            ),
        )
        .await
    };
    if !accepted {
        state.leave(&session_id, &connection_id).await;
        return;
    }

    info!(%session_id, %connection_id, "device session established");
    device_loop(socket, &state, &session_id, &connection_id, outbound_rx).await;
    state.leave(&session_id, &connection_id).await;
    info!(%session_id, %connection_id, "device session ended");
}

async fn device_loop(
    mut socket: WebSocket,
    state: &AppState,
    session_id: &str,
    connection_id: &str,
    mut outbound_rx: mpsc::Receiver<Envelope>,
) {
    let codec = Codec::strict();
    let mut bucket = TokenBucket::new(state.config.inbound_rate);

    loop {
        tokio::select! {
            inbound = tokio::time::timeout(state.config.silence_timeout, socket.recv()) => {
                match inbound {
                    Err(_) => {
                        warn!(%session_id, %connection_id, "connection silent past timeout");
                        return;
                    }
                    Ok(None) => return,
                    Ok(Some(Err(e))) => {
                        warn!(%session_id, %connection_id, error = %e, "socket error");
                        return;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => return,
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if !bucket.allow() {
                            send_ws_error(
                                &mut socket,
                                &codec,
                                session_id,
                                error_codes::RATE_LIMIT_EXCEEDED,
                                "inbound message rate exceeded",
                                Severity::Warning,
                                true,
                            )
                            .await;
                            continue;
                        }
                        handle_text(&mut socket, &codec, state, session_id, connection_id, &text)
                            .await;
                    }
                    Ok(Some(Ok(_))) => {}
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(envelope) = outbound else { return };
                if !send_envelope(&mut socket, &codec, &envelope).await {
                    return;
                }
            }
        }
    }
}

async fn handle_text(
    socket: &mut WebSocket,
    codec: &Codec,
    state: &AppState,
    session_id: &str,
    connection_id: &str,
    text: &str,
) {
    let decoded = match codec.decode(text) {
        Ok(decoded) => decoded,
        Err(e) => {
            // Invalid messages are answered and discarded; they do not
            // terminate the connection.
            debug!(%session_id, error = %e, "discarding invalid inbound message");
            send_ws_error(
                socket,
                codec,
                session_id,
                e.error_code(),
                &e.to_string(),
                Severity::Error,
                true,
            )
            .await;
            return;
        }
    };
    for note in &decoded.notes {
        warn!(%session_id, %note, "protocol validation note");
    }

    match decoded.message.body {
        MessageBody::Ping(ping) => {
            debug!(%session_id, status = ?ping.status, "ping");
            state.touch(session_id).await;
            let pong = Envelope::new(
                session_id,
                MessageBody::Pong(Pong {
                    server_time: now_ms(),
                }),
            );
            let _ = send_envelope(socket, codec, &pong).await;
        }
        MessageBody::Ack(ack) => {
            state.record_ack(session_id, connection_id, &ack).await;
        }
        MessageBody::Reload(reload) => {
            info!(%session_id, reason = ?reload.reason, "device requested reload");
            if let Some(envelope) = state.resync_full(session_id).await {
                let _ = send_envelope(socket, codec, &envelope).await;
            }
        }
        MessageBody::Error(error) => {
            warn!(%session_id, code = %error.code, "device reported error");
        }
        other => {
            warn!(%session_id, kind = other.kind(), "unexpected message kind");
        }
    }
}
