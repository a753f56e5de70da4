use axum::extract::ws::{Message, WebSocket};
use hl_protocol::{Codec, Envelope, ErrorMessage, MessageBody, Severity};
use std::time::Duration;

pub async fn send_envelope(socket: &mut WebSocket, codec: &Codec, envelope: &Envelope) -> bool {
    match codec.encode(envelope) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => false,
    }
}

pub async fn send_ws_error(
    socket: &mut WebSocket,
    codec: &Codec,
    session_id: &str,
    code: &str,
    message: &str,
    severity: Severity,
    recoverable: bool,
) {
    let envelope = Envelope::new(
        session_id,
        MessageBody::Error(ErrorMessage::new(code, message, severity, recoverable)),
    );
    let _ = send_envelope(socket, codec, &envelope).await;
}

fn parse_text_message(msg: Option<Result<Message, axum::Error>>) -> Result<String, ()> {
    match msg {
        Some(Ok(Message::Text(text))) => Ok(text.to_string()),
        _ => Err(()),
    }
}

pub async fn recv_text_with_timeout(
    socket: &mut WebSocket,
    timeout: Duration,
) -> Result<String, ()> {
    match tokio::time::timeout(timeout, socket.recv()).await {
        Ok(msg) => parse_text_message(msg),
        Err(_) => Err(()),
    }
}
