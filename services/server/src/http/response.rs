use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Frozen HTTP error envelope used by all non-2xx responses.
#[derive(Debug, Serialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
}

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.into(),
            message: message.into(),
        }),
    )
        .into_response()
}

pub fn not_found(code: &str, message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, code, message)
}

pub fn too_many_requests(message: impl Into<String>) -> Response {
    json_error(
        StatusCode::TOO_MANY_REQUESTS,
        hl_protocol::error_codes::RATE_LIMIT_EXCEEDED,
        message,
    )
}
