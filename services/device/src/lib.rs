pub mod interpreter;
pub mod metrics;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod transport;

pub use interpreter::{Interpreter, InterpreterError, MirrorInterpreter, RenderedView};
pub use metrics::{ApplyMetric, MetricsRing, UpdateKind};
pub use pipeline::{MessageSink, PipelineConfig, RecordingSink, UpdatePipeline, UpdateResult};
pub use session::{SessionConfig, SessionController, SessionEvent};
pub use store::{LAST_SCHEMA_KEY, MemoryStore, SchemaStore, SqliteStore, StoreError};
pub use transport::{Transport, TransportConfig, TransportEvent, TransportState};

/// Builds the WebSocket endpoint URL for a session.
///
/// The session id travels as a query parameter; the bearer token never
/// appears in the URL (it rides inside the `connect` payload).
pub fn session_url(base: &str, session_id: &str) -> String {
    if base.contains('?') {
        format!("{base}&session={session_id}")
    } else {
        format!("{base}?session={session_id}")
    }
}
