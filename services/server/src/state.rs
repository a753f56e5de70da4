//! In-memory session registry.
//!
//! A session groups one or more device connections around a single schema
//! timeline.  The server owns the canonical schema and assigns sequence
//! numbers under the registry lock, so fan-out order equals sequence order
//! for every member.  Sessions idle past the TTL are swept.

use crate::auth::{generate_token, token_matches};
use crate::rate_limit::TokenBucket;
use hl_protocol::{
    Ack, Capabilities, Envelope, FullUpdate, IncrementalUpdate, MessageBody, UpdateMessage,
    UpdatePayload, consts,
};
use hl_schema::{Schema, UpdateStrategy, compute_delta, select_strategy};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MEMBER_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub session_ttl: Duration,
    pub handshake_timeout: Duration,
    /// Connections silent for longer than this are dropped.
    pub silence_timeout: Duration,
    pub inbound_rate: u32,
    pub publish_rate: u32,
    pub capabilities: Capabilities,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_ttl: consts::SESSION_IDLE_TTL,
            handshake_timeout: Duration::from_secs(60),
            silence_timeout: Duration::from_secs(90),
            inbound_rate: consts::INBOUND_RATE,
            publish_rate: consts::PUBLISH_RATE,
            capabilities: Capabilities {
                incremental_updates: true,
                compression: false,
                state_preservation: true,
            },
        }
    }
}

struct Member {
    device_id: String,
    tx: mpsc::Sender<Envelope>,
    last_acked: Option<u64>,
}

struct SessionEntry {
    token: String,
    current_schema: Option<Schema>,
    last_sequence: u64,
    members: HashMap<String, Member>,
    publish_bucket: TokenBucket,
    last_activity: Instant,
}

#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error("session not found")]
    NotFound,
    #[error("invalid token")]
    BadToken,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("session not found")]
    SessionNotFound,
    #[error("publish rate limit exceeded")]
    RateLimited,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent {
        sequence: u64,
        strategy: UpdateStrategy,
        receivers: usize,
    },
    /// The published schema is content-equal to the current one.
    Unchanged,
}

/// What a joining connection needs to know.
pub struct JoinedMember {
    pub connection_id: String,
    pub initial_schema: Option<Schema>,
    pub last_sequence: u64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub members: usize,
    pub last_sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    /// Create a session with the supplied token (or a generated one).
    /// Returns `(session_id, token)`.
    pub async fn create_session(&self, token: Option<String>) -> (String, String) {
        let session_id = Uuid::new_v4().to_string();
        let token = token.unwrap_or_else(generate_token);
        let entry = SessionEntry {
            token: token.clone(),
            current_schema: None,
            last_sequence: 0,
            members: HashMap::new(),
            publish_bucket: TokenBucket::new(self.config.publish_rate),
            last_activity: Instant::now(),
        };
        self.sessions.write().await.insert(session_id.clone(), entry);
        info!(%session_id, "session created");
        (session_id, token)
    }

    pub async fn authenticate(&self, session_id: &str, token: &str) -> Result<(), AuthFailure> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(session_id).ok_or(AuthFailure::NotFound)?;
        if !token_matches(&entry.token, token) {
            return Err(AuthFailure::BadToken);
        }
        entry.last_activity = Instant::now();
        Ok(())
    }

    /// Attach a connection to a session.  The returned receiver is the
    /// connection's outbound update queue.
    pub async fn join(
        &self,
        session_id: &str,
        device_id: &str,
    ) -> Option<(JoinedMember, mpsc::Receiver<Envelope>)> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(session_id)?;
        let connection_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(MEMBER_QUEUE_DEPTH);
        entry.members.insert(
            connection_id.clone(),
            Member {
                device_id: device_id.to_owned(),
                tx,
                last_acked: None,
            },
        );
        entry.last_activity = Instant::now();
        info!(%session_id, %connection_id, %device_id, "device joined");
        Some((
            JoinedMember {
                connection_id,
                initial_schema: entry.current_schema.clone(),
                last_sequence: entry.last_sequence,
            },
            rx,
        ))
    }

    pub async fn leave(&self, session_id: &str, connection_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.members.remove(connection_id);
            entry.last_activity = Instant::now();
            info!(%session_id, %connection_id, "device left");
        }
    }

    pub async fn record_ack(&self, session_id: &str, connection_id: &str, ack: &Ack) {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(session_id) else {
            return;
        };
        entry.last_activity = Instant::now();
        if let Some(member) = entry.members.get_mut(connection_id) {
            member.last_acked = Some(member.last_acked.map_or(ack.sequence, |s| s.max(ack.sequence)));
            if ack.success {
                debug!(
                    %session_id,
                    device_id = %member.device_id,
                    sequence = ack.sequence,
                    apply_time_ms = ack.apply_time_ms,
                    "update acked"
                );
            } else {
                warn!(
                    %session_id,
                    device_id = %member.device_id,
                    sequence = ack.sequence,
                    error = ack.error.as_deref().unwrap_or("unknown"),
                    "update failed on device"
                );
            }
        }
    }

    pub async fn touch(&self, session_id: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Publish a new schema revision to every member.
    ///
    /// Computes the delta against the current schema, picks full vs
    /// incremental (an incremental that does not reproduce the target
    /// falls back to full), assigns the next sequence, and fans out.
    pub async fn publish_schema(
        &self,
        session_id: &str,
        schema: Schema,
    ) -> Result<PublishOutcome, PublishError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or(PublishError::SessionNotFound)?;
        entry.last_activity = Instant::now();
        if !entry.publish_bucket.allow() {
            return Err(PublishError::RateLimited);
        }

        let payload = match &entry.current_schema {
            None => {
                // First broadcast: unconditionally full at sequence 0, no
                // state to preserve.
                UpdatePayload::Full(FullUpdate {
                    checksum: Some(hl_schema::checksum(&schema)),
                    schema: schema.clone(),
                    sequence: entry.last_sequence,
                    preserve_state: false,
                })
            }
            Some(current) => {
                let delta = compute_delta(current, &schema);
                if delta.is_empty() {
                    return Ok(PublishOutcome::Unchanged);
                }
                let sequence = entry.last_sequence + 1;
                match select_strategy(&delta) {
                    UpdateStrategy::Incremental if delta_reproduces(current, &delta, &schema) => {
                        UpdatePayload::Incremental(IncrementalUpdate {
                            delta,
                            sequence,
                            preserve_state: true,
                        })
                    }
                    _ => UpdatePayload::Full(FullUpdate {
                        checksum: Some(hl_schema::checksum(&schema)),
                        schema: schema.clone(),
                        sequence,
                        preserve_state: true,
                    }),
                }
            }
        };

        let sequence = payload.sequence();
        let strategy = match &payload {
            UpdatePayload::Full(_) => UpdateStrategy::Full,
            UpdatePayload::Incremental(_) => UpdateStrategy::Incremental,
        };
        let envelope = Envelope::new(
            session_id,
            MessageBody::Update(UpdateMessage { payload }),
        );
        let receivers = fan_out(session_id, entry, &envelope);

        entry.current_schema = Some(schema);
        entry.last_sequence = sequence;
        debug!(%session_id, sequence, ?strategy, receivers, "schema published");
        Ok(PublishOutcome::Sent {
            sequence,
            strategy,
            receivers,
        })
    }

    /// Build a fresh full update for a device that asked to resynchronize.
    ///
    /// The sequence is bumped so device-side duplicate suppression cannot
    /// swallow the resync.
    pub async fn resync_full(&self, session_id: &str) -> Option<Envelope> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(session_id)?;
        let schema = entry.current_schema.clone()?;
        entry.last_sequence += 1;
        entry.last_activity = Instant::now();
        Some(Envelope::new(
            session_id,
            MessageBody::Update(UpdateMessage {
                payload: UpdatePayload::Full(FullUpdate {
                    checksum: Some(hl_schema::checksum(&schema)),
                    schema,
                    sequence: entry.last_sequence,
                    preserve_state: true,
                }),
            }),
        ))
    }

    pub async fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id)?;
        Some(SessionStatus {
            session_id: session_id.to_owned(),
            members: entry.members.len(),
            last_sequence: entry.last_sequence,
            checksum: entry.current_schema.as_ref().map(hl_schema::checksum),
        })
    }

    /// Drop sessions idle beyond the TTL.  Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let ttl = self.config.session_ttl;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|session_id, entry| {
            let keep = entry.last_activity.elapsed() <= ttl;
            if !keep {
                info!(%session_id, "session expired");
            }
            keep
        });
        before - sessions.len()
    }
}

/// Periodic TTL sweep.
pub fn spawn_ttl_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = state.sweep_expired().await;
            if removed > 0 {
                info!(removed, "swept expired sessions");
            }
        }
    })
}

/// Deliver under the registry lock so sequence order equals queue order for
/// every member.  A member whose queue is full misses the update and will
/// catch up via reload.
fn fan_out(session_id: &str, entry: &SessionEntry, envelope: &Envelope) -> usize {
    let mut receivers = 0;
    for (connection_id, member) in &entry.members {
        match member.tx.try_send(envelope.clone()) {
            Ok(()) => receivers += 1,
            Err(e) => warn!(
                %session_id,
                %connection_id,
                error = %e,
                "dropping update for slow or closed member"
            ),
        }
    }
    receivers
}

/// An incremental is only shippable if replaying its delta on the current
/// schema reproduces the published one (e.g. root-list reordering is not
/// representable as a delta).
fn delta_reproduces(current: &Schema, delta: &hl_schema::SchemaDelta, target: &Schema) -> bool {
    match hl_schema::apply_delta(current, delta) {
        Ok(applied) => hl_schema::canonically_equal(&applied, target),
        Err(_) => false,
    }
}
