//! Localhost control API for session lifecycle and schema publishing.
//!
//! This is how an external authoring tool drives the core:
//!   POST /api/v1/sessions                 - create a session
//!   GET  /api/v1/sessions/{id}            - session status
//!   PUT  /api/v1/sessions/{id}/schema     - publish a schema revision

use crate::http::response::{not_found, too_many_requests};
use crate::state::{AppState, PublishError, PublishOutcome};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hl_protocol::error_codes;
use hl_schema::{Schema, UpdateStrategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Pre-shared token; generated when omitted.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub token: String,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let (session_id, token) = state.create_session(request.token).await;
    (
        StatusCode::CREATED,
        Json(CreateSessionResponse { session_id, token }),
    )
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.session_status(&session_id).await {
        Some(status) => Json(status).into_response(),
        None => not_found(error_codes::SESSION_NOT_FOUND, "no such session"),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReply {
    pub update_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub receivers: usize,
}

pub async fn publish_schema(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(schema): Json<Schema>,
) -> Response {
    match state.publish_schema(&session_id, schema).await {
        Ok(PublishOutcome::Sent {
            sequence,
            strategy,
            receivers,
        }) => Json(PublishReply {
            update_type: match strategy {
                UpdateStrategy::Full => "full",
                UpdateStrategy::Incremental => "incremental",
            },
            sequence: Some(sequence),
            receivers,
        })
        .into_response(),
        Ok(PublishOutcome::Unchanged) => Json(PublishReply {
            update_type: "unchanged",
            sequence: None,
            receivers: 0,
        })
        .into_response(),
        Err(PublishError::SessionNotFound) => {
            not_found(error_codes::SESSION_NOT_FOUND, "no such session")
        }
        Err(PublishError::RateLimited) => too_many_requests("publish rate exceeded"),
    }
}
