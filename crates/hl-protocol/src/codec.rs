//! Byte-level encoding and validated decoding of wire messages.
//!
//! Decoding goes through `serde_json::Value` first so structural failures can
//! be reported with the right error code before typed deserialization runs.
//! Strict mode additionally rejects fields the protocol does not define, by
//! re-encoding the decoded message and requiring the input's key set to be a
//! subset of it (an input key carrying `null` is treated as absent).

use crate::{Envelope, PROTOCOL_VERSION, consts, error_codes};
use serde_json::Value;
use thiserror::Error;

/// Unknown-field policy for inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Accept unknown fields (forward-compatible endpoints).
    #[default]
    Lenient,
    /// Reject unknown fields.
    Strict,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message of {len} bytes exceeds the {max}-byte cap")]
    TooLarge { len: usize, max: usize },
    #[error("not valid JSON: {0}")]
    MalformedBytes(String),
    #[error("missing or unknown message type")]
    UnknownType,
    #[error("invalid {kind} message: {detail}")]
    Invalid { kind: String, detail: String },
    #[error("unsupported protocol version {found} (expected major {expected_major})")]
    VersionMismatch { found: String, expected_major: u64 },
    #[error("session id length {0} outside {min}..={max}", min = consts::SESSION_ID_MIN, max = consts::SESSION_ID_MAX)]
    InvalidSessionId(usize),
    #[error("unknown field `{0}` in strict mode")]
    UnknownField(String),
}

impl CodecError {
    /// The wire error code an endpoint should reply with.
    pub fn error_code(&self) -> &'static str {
        match self {
            CodecError::VersionMismatch { .. } => error_codes::UNSUPPORTED_VERSION,
            _ => error_codes::INVALID_MESSAGE,
        }
    }
}

/// A decoded message plus non-fatal validation notes (e.g. a tolerated MINOR
/// version mismatch).
#[derive(Debug)]
pub struct Decoded {
    pub message: Envelope,
    pub notes: Vec<String>,
}

/// Message <-> text translation with validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    mode: ValidationMode,
}

const KNOWN_TYPES: &[&str] = &[
    "connect",
    "connected",
    "update",
    "ack",
    "ping",
    "pong",
    "reload",
    "error",
    "join",
    "joinAccepted",
    "joinRejected",
];

impl Codec {
    pub fn new(mode: ValidationMode) -> Self {
        Self { mode }
    }

    pub fn lenient() -> Self {
        Self::new(ValidationMode::Lenient)
    }

    pub fn strict() -> Self {
        Self::new(ValidationMode::Strict)
    }

    pub fn encode(&self, message: &Envelope) -> Result<String, CodecError> {
        let text = serde_json::to_string(message)
            .map_err(|e| CodecError::MalformedBytes(e.to_string()))?;
        if text.len() > consts::MAX_MESSAGE_BYTES {
            return Err(CodecError::TooLarge {
                len: text.len(),
                max: consts::MAX_MESSAGE_BYTES,
            });
        }
        Ok(text)
    }

    pub fn decode(&self, text: &str) -> Result<Decoded, CodecError> {
        if text.len() > consts::MAX_MESSAGE_BYTES {
            return Err(CodecError::TooLarge {
                len: text.len(),
                max: consts::MAX_MESSAGE_BYTES,
            });
        }
        let value: Value =
            serde_json::from_str(text).map_err(|e| CodecError::MalformedBytes(e.to_string()))?;
        let object = value.as_object().ok_or(CodecError::UnknownType)?;

        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CodecError::UnknownType)?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(CodecError::UnknownType);
        }

        let invalid = |detail: &str| CodecError::Invalid {
            kind: kind.to_owned(),
            detail: detail.to_owned(),
        };

        let mut notes = Vec::new();
        let version = object
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing version"))?;
        check_version(version, &mut notes)?;

        let session_id = object
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing sessionId"))?;
        validate_session_id(session_id)?;

        if !object.get("timestamp").is_some_and(Value::is_u64) {
            return Err(invalid("timestamp must be an unsigned integer"));
        }

        let message: Envelope = serde_json::from_value(value.clone()).map_err(|e| {
            CodecError::Invalid {
                kind: kind.to_owned(),
                detail: e.to_string(),
            }
        })?;

        if self.mode == ValidationMode::Strict {
            let reencoded = serde_json::to_value(&message)
                .map_err(|e| CodecError::MalformedBytes(e.to_string()))?;
            check_unknown_fields(&value, &reencoded)?;
        }

        Ok(Decoded { message, notes })
    }
}

/// Session ids are opaque printable tokens, 8 to 128 characters.
pub fn validate_session_id(session_id: &str) -> Result<(), CodecError> {
    let len = session_id.len();
    if (consts::SESSION_ID_MIN..=consts::SESSION_ID_MAX).contains(&len) {
        Ok(())
    } else {
        Err(CodecError::InvalidSessionId(len))
    }
}

fn check_version(found: &str, notes: &mut Vec<String>) -> Result<(), CodecError> {
    let (expected_major, expected_minor) = split_version(PROTOCOL_VERSION).unwrap_or((1, 0));
    let Some((major, minor)) = split_version(found) else {
        return Err(CodecError::VersionMismatch {
            found: found.to_owned(),
            expected_major,
        });
    };
    if major != expected_major {
        return Err(CodecError::VersionMismatch {
            found: found.to_owned(),
            expected_major,
        });
    }
    if minor != expected_minor {
        notes.push(format!(
            "minor protocol version mismatch: peer {found}, local {PROTOCOL_VERSION}"
        ));
    }
    Ok(())
}

fn split_version(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Every key in `input` must exist in `reencoded` (recursively); a key whose
/// input value is `null` may be absent there, since optional fields are
/// omitted on re-encode.
fn check_unknown_fields(input: &Value, reencoded: &Value) -> Result<(), CodecError> {
    match (input, reencoded) {
        (Value::Object(input_map), Value::Object(reencoded_map)) => {
            for (key, input_value) in input_map {
                match reencoded_map.get(key) {
                    Some(reencoded_value) => check_unknown_fields(input_value, reencoded_value)?,
                    None if input_value.is_null() => {}
                    None => return Err(CodecError::UnknownField(key.clone())),
                }
            }
            Ok(())
        }
        (Value::Array(input_items), Value::Array(reencoded_items)) => {
            for (input_item, reencoded_item) in input_items.iter().zip(reencoded_items) {
                check_unknown_fields(input_item, reencoded_item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
