//! The ordered, acknowledged update pipeline.
//!
//! The pipeline is the single owner of the device's current schema: full
//! updates replace it atomically and incremental updates advance it through
//! the pure delta application, while the interpreter is invoked as a
//! collaborator that only produces views.  Every update is acknowledged with
//! its apply time; duplicates are re-acked idempotently; bursts of
//! incremental updates are coalesced inside a debounce window that never
//! crosses a full-update boundary.

use crate::interpreter::{Interpreter, RenderedView};
use crate::metrics::{ApplyMetric, MetricsRing, UpdateKind};
use crate::store::{self, SchemaStore};
use hl_protocol::{
    Ack, FullUpdate, IncrementalUpdate, MessageBody, Reload, ReloadReason, UpdatePayload,
    consts, error_codes, now_ms,
};
use hl_schema::Schema;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Send capability
// ---------------------------------------------------------------------------

/// The narrow capability the pipeline holds for talking back to the server:
/// enqueue a message into the session, nothing more.
pub trait MessageSink: Send + Sync {
    fn session_id(&self) -> &str;
    fn send(&self, body: MessageBody);
}

/// In-memory sink that records every message, for tests and diagnostics.
#[derive(Default)]
pub struct RecordingSink {
    session_id: String,
    messages: Mutex<Vec<MessageBody>>,
}

impl RecordingSink {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<MessageBody> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn acks(&self) -> Vec<Ack> {
        self.messages()
            .into_iter()
            .filter_map(|body| match body {
                MessageBody::Ack(ack) => Some(ack),
                _ => None,
            })
            .collect()
    }

    pub fn reloads(&self) -> Vec<Reload> {
        self.messages()
            .into_iter()
            .filter_map(|body| match body {
                MessageBody::Reload(reload) => Some(reload),
                _ => None,
            })
            .collect()
    }
}

impl MessageSink for RecordingSink {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(&self, body: MessageBody) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(body);
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one application cycle (a full update, one incremental update,
/// or a coalesced batch of incrementals).
#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub success: bool,
    /// Highest sequence the cycle covered.
    pub sequence: u64,
    pub update_type: UpdateKind,
    pub view: Option<RenderedView>,
    pub error: Option<String>,
    pub apply_time_ms: u64,
    /// Number of sequences coalesced into this cycle (1 outside bursts).
    pub coalesced: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub debounce_window: Duration,
    pub reload_failure_threshold: u32,
    pub metrics_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_window: consts::DEBOUNCE_WINDOW,
            reload_failure_threshold: consts::RELOAD_FAILURE_THRESHOLD,
            metrics_capacity: consts::METRIC_RING_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct UpdatePipeline<I: Interpreter> {
    interpreter: I,
    sink: Arc<dyn MessageSink>,
    store: Arc<dyn SchemaStore>,
    config: PipelineConfig,
    results_tx: mpsc::Sender<UpdateResult>,
    current_schema: Option<Schema>,
    last_good_view: Option<RenderedView>,
    last_applied: Option<u64>,
    consecutive_failures: u32,
    sequence_gap: bool,
    metrics: MetricsRing,
    pending: Vec<IncrementalUpdate>,
    pending_since: Option<Instant>,
}

impl<I: Interpreter> UpdatePipeline<I> {
    pub fn new(
        interpreter: I,
        sink: Arc<dyn MessageSink>,
        store: Arc<dyn SchemaStore>,
        config: PipelineConfig,
    ) -> (Self, mpsc::Receiver<UpdateResult>) {
        let metrics_capacity = config.metrics_capacity;
        let (results_tx, results_rx) = mpsc::channel(32);
        (
            Self {
                interpreter,
                sink,
                store,
                config,
                results_tx,
                current_schema: None,
                last_good_view: None,
                last_applied: None,
                consecutive_failures: 0,
                sequence_gap: false,
                metrics: MetricsRing::new(metrics_capacity),
                pending: Vec::new(),
                pending_since: None,
            },
            results_rx,
        )
    }

    /// Render the cached last-known-good schema before any connection exists.
    /// No ack is sent; the server never saw this apply.
    pub fn bootstrap_cached(&mut self) {
        match store::load_cached_schema(self.store.as_ref()) {
            Ok(Some(schema)) => match self.interpreter.interpret(&schema, false) {
                Ok(view) => {
                    info!(nodes = schema.node_count(), "rendered cached schema offline");
                    self.current_schema = Some(schema);
                    self.last_good_view = Some(view);
                }
                Err(e) => warn!(error = %e, "cached schema failed to render"),
            },
            Ok(None) => debug!("no cached schema"),
            Err(e) => warn!(error = %e, "failed to load cached schema"),
        }
    }

    /// Drive the pipeline from an inbound update stream until it closes.
    pub async fn run(mut self, mut updates: mpsc::Receiver<UpdatePayload>) {
        loop {
            let deadline = self
                .pending_since
                .map(|since| since + self.config.debounce_window);
            tokio::select! {
                update = updates.recv() => match update {
                    Some(update) => self.ingest(update).await,
                    None => {
                        self.flush_pending().await;
                        return;
                    }
                },
                () = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.flush_pending().await;
                }
            }
        }
    }

    /// Feed one update envelope through ordering and debouncing.
    pub async fn ingest(&mut self, update: UpdatePayload) {
        match update {
            UpdatePayload::Full(full) => {
                // Debouncing never crosses a full boundary.
                self.flush_pending().await;
                self.apply_full(full).await;
            }
            UpdatePayload::Incremental(incremental) => {
                let sequence = incremental.sequence;
                if self.is_duplicate(sequence)
                    || self.pending.iter().any(|p| p.sequence == sequence)
                {
                    debug!(sequence, "duplicate sequence, re-acking idempotently");
                    self.ack(sequence, true, None, None);
                    return;
                }
                self.note_gap(sequence);
                if self.pending.is_empty() {
                    self.pending_since = Some(Instant::now());
                }
                self.pending.push(incremental);
            }
        }
    }

    /// Apply whatever is sitting in the debounce window.
    pub async fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            self.pending_since = None;
            return;
        }
        let mut batch = std::mem::take(&mut self.pending);
        self.pending_since = None;
        // Out-of-order arrivals inside the window apply in sequence order.
        batch.sort_by_key(|update| update.sequence);
        self.apply_incremental_batch(batch).await;
    }

    pub fn current_schema(&self) -> Option<&Schema> {
        self.current_schema.as_ref()
    }

    pub fn last_good_view(&self) -> Option<&RenderedView> {
        self.last_good_view.as_ref()
    }

    pub fn last_applied_sequence(&self) -> Option<u64> {
        self.last_applied
    }

    pub fn metrics(&self) -> Vec<ApplyMetric> {
        self.metrics.snapshot()
    }

    // -----------------------------------------------------------------------
    // Application
    // -----------------------------------------------------------------------

    async fn apply_full(&mut self, full: FullUpdate) {
        let start = Instant::now();
        let sequence = full.sequence;

        if self.is_duplicate(sequence) {
            debug!(sequence, "duplicate full update, re-acking idempotently");
            self.ack(sequence, true, None, None);
            return;
        }
        self.note_gap(sequence);

        if let Some(expected) = &full.checksum {
            let actual = hl_schema::checksum(&full.schema);
            if *expected != actual {
                warn!(sequence, %expected, %actual, "full update checksum mismatch");
                let elapsed = elapsed_ms(start);
                self.ack(
                    sequence,
                    false,
                    Some(error_codes::CHECKSUM_MISMATCH.to_owned()),
                    Some(elapsed),
                );
                self.record_metric(sequence, UpdateKind::Full, elapsed, false, Some(error_codes::CHECKSUM_MISMATCH.to_owned()));
                self.emit_result(UpdateResult {
                    success: false,
                    sequence,
                    update_type: UpdateKind::Full,
                    view: None,
                    error: Some(error_codes::CHECKSUM_MISMATCH.to_owned()),
                    apply_time_ms: elapsed,
                    coalesced: 1,
                })
                .await;
                // A corrupted full leaves nothing to build on: resynchronize.
                self.request_reload("full update checksum mismatch");
                return;
            }
        }

        self.current_schema = Some(full.schema.clone());
        match self.interpreter.interpret(&full.schema, full.preserve_state) {
            Ok(view) => {
                self.last_good_view = Some(view.clone());
                self.persist_current();
                self.last_applied = Some(sequence);
                self.consecutive_failures = 0;
                self.sequence_gap = false;
                let elapsed = elapsed_ms(start);
                self.ack(sequence, true, None, Some(elapsed));
                self.record_metric(sequence, UpdateKind::Full, elapsed, true, None);
                self.emit_result(UpdateResult {
                    success: true,
                    sequence,
                    update_type: UpdateKind::Full,
                    view: Some(view),
                    error: None,
                    apply_time_ms: elapsed,
                    coalesced: 1,
                })
                .await;
            }
            Err(e) => {
                // The schema slot keeps the server's truth; the view does not
                // advance and nothing is persisted.
                let error = e.to_string();
                warn!(sequence, %error, "full update failed to render");
                self.consecutive_failures += 1;
                let elapsed = elapsed_ms(start);
                self.ack(sequence, false, Some(error.clone()), Some(elapsed));
                self.record_metric(sequence, UpdateKind::Full, elapsed, false, Some(error.clone()));
                self.emit_result(UpdateResult {
                    success: false,
                    sequence,
                    update_type: UpdateKind::Full,
                    view: None,
                    error: Some(error),
                    apply_time_ms: elapsed,
                    coalesced: 1,
                })
                .await;
            }
        }
    }

    async fn apply_incremental_batch(&mut self, batch: Vec<IncrementalUpdate>) {
        let start = Instant::now();
        let coalesced = batch.len();
        let last_sequence = batch.last().map_or(0, |update| update.sequence);

        if self.current_schema.is_none() {
            let error = format!("{}: no base schema", error_codes::UPDATE_FAILED);
            warn!(sequence = last_sequence, "incremental update without a base schema");
            let elapsed = elapsed_ms(start);
            for update in &batch {
                self.ack(update.sequence, false, Some(error.clone()), Some(elapsed));
                self.record_metric(
                    update.sequence,
                    UpdateKind::Incremental,
                    elapsed,
                    false,
                    Some(error.clone()),
                );
            }
            self.consecutive_failures += 1;
            self.emit_result(UpdateResult {
                success: false,
                sequence: last_sequence,
                update_type: UpdateKind::Incremental,
                view: None,
                error: Some(error),
                apply_time_ms: elapsed,
                coalesced,
            })
            .await;
            self.maybe_request_reload("incremental update without a base schema");
            return;
        }

        let mut final_view: Option<RenderedView> = None;
        let mut failure: Option<(usize, String)> = None;

        for (index, update) in batch.iter().enumerate() {
            let Some(base) = self.current_schema.as_ref() else {
                break;
            };
            let step = hl_schema::apply_delta(base, &update.delta).map_err(|e| e.to_string());
            let outcome = step.and_then(|applied| {
                self.interpreter
                    .apply_delta(&update.delta, update.preserve_state)
                    .map(|view| (applied, view))
                    .map_err(|e| e.to_string())
            });
            match outcome {
                Ok((applied, view)) => {
                    self.current_schema = Some(applied);
                    self.last_applied = Some(update.sequence);
                    final_view = Some(view);
                    self.ack(update.sequence, true, None, Some(elapsed_ms(start)));
                    self.record_metric(
                        update.sequence,
                        UpdateKind::Incremental,
                        elapsed_ms(start),
                        true,
                        None,
                    );
                }
                Err(error) => {
                    self.ack(
                        update.sequence,
                        false,
                        Some(error.clone()),
                        Some(elapsed_ms(start)),
                    );
                    self.record_metric(
                        update.sequence,
                        UpdateKind::Incremental,
                        elapsed_ms(start),
                        false,
                        Some(error.clone()),
                    );
                    failure = Some((index, error));
                    break;
                }
            }
        }

        match failure {
            None => {
                if let Some(view) = &final_view {
                    self.last_good_view = Some(view.clone());
                }
                self.persist_current();
                self.consecutive_failures = 0;
                let elapsed = elapsed_ms(start);
                self.emit_result(UpdateResult {
                    success: true,
                    sequence: last_sequence,
                    update_type: UpdateKind::Incremental,
                    view: final_view,
                    error: None,
                    apply_time_ms: elapsed,
                    coalesced,
                })
                .await;
            }
            Some((index, error)) => {
                // Everything after the failing delta has no valid base; fail
                // those sequences too, but count the cycle once.
                for update in &batch[index + 1..] {
                    self.ack(
                        update.sequence,
                        false,
                        Some("previous delta in batch failed".to_owned()),
                        None,
                    );
                    self.record_metric(
                        update.sequence,
                        UpdateKind::Incremental,
                        elapsed_ms(start),
                        false,
                        Some("previous delta in batch failed".to_owned()),
                    );
                }
                warn!(sequence = last_sequence, %error, "incremental apply failed");
                self.consecutive_failures += 1;
                let elapsed = elapsed_ms(start);
                self.emit_result(UpdateResult {
                    success: false,
                    sequence: last_sequence,
                    update_type: UpdateKind::Incremental,
                    view: None,
                    error: Some(error.clone()),
                    apply_time_ms: elapsed,
                    coalesced,
                })
                .await;
                self.maybe_request_reload(&error);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    fn is_duplicate(&self, sequence: u64) -> bool {
        self.last_applied.is_some_and(|applied| sequence <= applied)
    }

    fn note_gap(&mut self, sequence: u64) {
        let expected = self
            .pending
            .iter()
            .map(|p| p.sequence)
            .max()
            .or(self.last_applied)
            .map_or(0, |s| s + 1);
        if sequence > expected {
            warn!(sequence, expected, "sequence gap detected, applying opportunistically");
            self.sequence_gap = true;
        }
    }

    /// Reload when failures crossed the threshold or a gap made the base
    /// suspect; always resets the failure streak once requested.
    fn maybe_request_reload(&mut self, error: &str) {
        if self.sequence_gap || self.consecutive_failures >= self.config.reload_failure_threshold {
            self.request_reload(error);
        }
    }

    fn request_reload(&mut self, error: &str) {
        info!(%error, "requesting full reload");
        self.sink.send(MessageBody::Reload(Reload {
            reason: ReloadReason::Error,
            error: Some(error.to_owned()),
        }));
        self.consecutive_failures = 0;
        self.sequence_gap = false;
    }

    fn ack(&self, sequence: u64, success: bool, error: Option<String>, apply_time_ms: Option<u64>) {
        self.sink.send(MessageBody::Ack(Ack {
            sequence,
            success,
            error,
            apply_time_ms,
        }));
    }

    fn persist_current(&self) {
        if let Some(schema) = &self.current_schema {
            // Best-effort: a failed write must not block the update path.
            if let Err(e) = store::save_schema(self.store.as_ref(), schema) {
                warn!(error = %e, "failed to persist last-good schema");
            }
        }
    }

    fn record_metric(
        &mut self,
        sequence: u64,
        update_type: UpdateKind,
        apply_time_ms: u64,
        success: bool,
        error: Option<String>,
    ) {
        self.metrics.record(ApplyMetric {
            sequence,
            update_type,
            apply_time_ms,
            success,
            error,
            timestamp: now_ms(),
        });
    }

    async fn emit_result(&self, result: UpdateResult) {
        let _ = self.results_tx.send(result).await;
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
