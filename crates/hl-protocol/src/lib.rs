// hl-protocol: hot-reload wire protocol types and serialization.
//
// Every wire message is one JSON object with a `type` discriminator plus the
// common envelope fields (`sessionId`, `timestamp`, `version`).  The enum
// variants map 1:1 to the frozen v1 message kinds; field names are camelCase
// end to end.

mod codec;

pub use codec::{Codec, CodecError, Decoded, ValidationMode, validate_session_id};

use hl_schema::{Schema, SchemaDelta};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire protocol version.  Equal MAJOR is required for interop; a MINOR
/// mismatch is tolerated with a validation note.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Protocol constants shared by both endpoints.
pub mod consts {
    use std::time::Duration;

    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const RECONNECT_BASE: Duration = Duration::from_secs(1);
    pub const RECONNECT_CAP: Duration = Duration::from_secs(30);
    /// Settle delay applied when a forced reconnect skips the backoff.
    pub const FORCE_RECONNECT_SETTLE: Duration = Duration::from_millis(500);
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);
    pub const METRIC_RING_CAPACITY: usize = 50;
    pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;
    pub const SESSION_ID_MIN: usize = 8;
    pub const SESSION_ID_MAX: usize = 128;
    pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(8 * 60 * 60);
    /// Inbound ceiling per connection, messages per second.
    pub const INBOUND_RATE: u32 = 100;
    /// Steady-state publish ceiling per session, updates per second.
    pub const PUBLISH_RATE: u32 = 10;
    /// Consecutive incremental failures before the device requests a reload.
    pub const RELOAD_FAILURE_THRESHOLD: u32 = 3;
}

/// Frozen v1 error codes.
pub mod error_codes {
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const AUTHENTICATION_FAILED: &str = "AUTHENTICATION_FAILED";
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const SCHEMA_VALIDATION_FAILED: &str = "SCHEMA_VALIDATION_FAILED";
    pub const UPDATE_FAILED: &str = "UPDATE_FAILED";
    pub const CHECKSUM_MISMATCH: &str = "CHECKSUM_MISMATCH";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const CONNECTION_TIMEOUT: &str = "CONNECTION_TIMEOUT";
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One wire message: the common envelope fields plus a tagged body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub session_id: String,
    /// Send time in ms since epoch.
    pub timestamp: u64,
    /// Protocol version of the sender.
    pub version: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Envelope {
    /// Build a message stamped with the current time and protocol version.
    pub fn new(session_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: now_ms(),
            version: PROTOCOL_VERSION.to_owned(),
            body,
        }
    }
}

/// All wire message kinds in the v1 protocol, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageBody {
    Connect(Connect),
    Connected(Connected),
    Update(UpdateMessage),
    Ack(Ack),
    Ping(Ping),
    Pong(Pong),
    Reload(Reload),
    Error(ErrorMessage),
    Join(Join),
    JoinAccepted(JoinAccepted),
    JoinRejected(JoinRejected),
}

impl MessageBody {
    /// The wire value of the `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Connect(_) => "connect",
            MessageBody::Connected(_) => "connected",
            MessageBody::Update(_) => "update",
            MessageBody::Ack(_) => "ack",
            MessageBody::Ping(_) => "ping",
            MessageBody::Pong(_) => "pong",
            MessageBody::Reload(_) => "reload",
            MessageBody::Error(_) => "error",
            MessageBody::Join(_) => "join",
            MessageBody::JoinAccepted(_) => "joinAccepted",
            MessageBody::JoinRejected(_) => "joinRejected",
        }
    }
}

// ---------------------------------------------------------------------------
// Device -> Server
// ---------------------------------------------------------------------------

/// Authenticated device handshake, sent as the first message after the socket
/// opens.  The bearer token travels here, never in the URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connect {
    pub device_id: String,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub client_version: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Macos,
    Windows,
    Linux,
    Web,
    Unknown,
}

/// Per-update acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub sequence: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_time_ms: Option<u64>,
}

/// Liveness probe (device -> server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Idle,
    Rendering,
    Updating,
}

/// Resynchronization request; the server answers with a full update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reload {
    pub reason: ReloadReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadReason {
    Error,
    Manual,
    Incompatible,
}

/// Legacy session join, used when the transport has not already delivered
/// `connect` authentication.  Both handshake shapes are supported for interop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    pub token: String,
    pub client_type: ClientType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Device,
    Editor,
}

impl ClientType {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientType::Device => "device",
            ClientType::Editor => "editor",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> Device
// ---------------------------------------------------------------------------

/// Handshake acceptance.  Carries the initial schema (sequence 0) when the
/// session already has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_schema: Option<Schema>,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub incremental_updates: bool,
    pub compression: bool,
    pub state_preservation: bool,
}

/// Liveness reply (server -> device).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub server_time: u64,
}

/// Legacy join acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAccepted {}

/// Legacy join rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRejected {
    pub reason: String,
}

/// Protocol error (either direction).
///
/// | Severity/recoverable        | Handling                                 |
/// |-----------------------------|------------------------------------------|
/// | auth code (any severity)    | close, no auto-reconnect                 |
/// | `fatal` and not recoverable | close, no auto-reconnect                 |
/// | anything else               | surfaced as a notification, stay up      |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    /// One of the frozen v1 error codes.
    pub code: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

impl ErrorMessage {
    pub fn new(code: &str, message: impl Into<String>, severity: Severity, recoverable: bool) -> Self {
        Self {
            code: code.to_owned(),
            message: message.into(),
            severity,
            details: None,
            recoverable,
        }
    }

    /// Authentication failures terminate the connection without auto-retry.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.code.as_str(),
            error_codes::INVALID_TOKEN
                | error_codes::SESSION_NOT_FOUND
                | error_codes::AUTHENTICATION_FAILED
        )
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal && !self.recoverable
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// A schema update, either a full replacement or an incremental delta,
/// discriminated by `updateType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    #[serde(flatten)]
    pub payload: UpdatePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "updateType", rename_all = "camelCase")]
pub enum UpdatePayload {
    Full(FullUpdate),
    Incremental(IncrementalUpdate),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullUpdate {
    pub schema: Schema,
    pub sequence: u64,
    pub preserve_state: bool,
    /// Canonical checksum of `schema`; verified by the device when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalUpdate {
    pub delta: SchemaDelta,
    pub sequence: u64,
    pub preserve_state: bool,
}

impl UpdatePayload {
    pub fn sequence(&self) -> u64 {
        match self {
            UpdatePayload::Full(u) => u.sequence,
            UpdatePayload::Incremental(u) => u.sequence,
        }
    }

    pub fn preserve_state(&self) -> bool {
        match self {
            UpdatePayload::Full(u) => u.preserve_state,
            UpdatePayload::Incremental(u) => u.preserve_state,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdatePayload::Full(_) => "full",
            UpdatePayload::Incremental(_) => "incremental",
        }
    }
}
