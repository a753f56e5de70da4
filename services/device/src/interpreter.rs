//! The seam to the external schema interpreter.
//!
//! The interpreter is out of scope for this core: it is modeled as a pure
//! collaborator that turns a schema (or a delta against its own model) into a
//! rendered view.  `preserve_state` is an explicit argument on every call —
//! the hint that the interpreter should keep its render-context variables and
//! re-bind widget identity by node id — never ambient global state.

use hl_schema::{Schema, SchemaDelta};
use thiserror::Error;

/// Opaque handle to a rendered view.
///
/// The core never inspects a view beyond identity bookkeeping; `revision`
/// distinguishes renders and `node_count` is a cheap summary for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedView {
    pub revision: u64,
    pub node_count: usize,
}

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("render failed: {0}")]
    Render(String),
    #[error("delta apply failed: {0}")]
    Delta(String),
}

pub trait Interpreter: Send {
    /// Build a view from a complete schema.
    fn interpret(
        &mut self,
        schema: &Schema,
        preserve_state: bool,
    ) -> Result<RenderedView, InterpreterError>;

    /// Mutate the interpreter's own schema model by a delta and return the
    /// updated view.
    fn apply_delta(
        &mut self,
        delta: &SchemaDelta,
        preserve_state: bool,
    ) -> Result<RenderedView, InterpreterError>;
}

/// Reference interpreter: mirrors the schema via the pure delta application
/// and counts revisions.
///
/// Used by the test suites and as the collaborator for offline bootstrap in
/// the device binary.  `fail_next` injects a one-shot failure.
#[derive(Default)]
pub struct MirrorInterpreter {
    schema: Option<Schema>,
    revision: u64,
    fail_next: Option<String>,
}

impl MirrorInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The interpreter's own schema model (for assertions).
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Fail the next `interpret`/`apply_delta` call with the given message.
    pub fn fail_next(&mut self, message: impl Into<String>) {
        self.fail_next = Some(message.into());
    }

    fn take_injected_failure(&mut self) -> Option<String> {
        self.fail_next.take()
    }
}

impl Interpreter for MirrorInterpreter {
    fn interpret(
        &mut self,
        schema: &Schema,
        _preserve_state: bool,
    ) -> Result<RenderedView, InterpreterError> {
        if let Some(message) = self.take_injected_failure() {
            return Err(InterpreterError::Render(message));
        }
        self.schema = Some(schema.clone());
        self.revision += 1;
        Ok(RenderedView {
            revision: self.revision,
            node_count: schema.node_count(),
        })
    }

    fn apply_delta(
        &mut self,
        delta: &SchemaDelta,
        _preserve_state: bool,
    ) -> Result<RenderedView, InterpreterError> {
        if let Some(message) = self.take_injected_failure() {
            return Err(InterpreterError::Delta(message));
        }
        let base = self
            .schema
            .as_ref()
            .ok_or_else(|| InterpreterError::Delta("no schema to apply a delta to".to_owned()))?;
        let next = hl_schema::apply_delta(base, delta)
            .map_err(|e| InterpreterError::Delta(e.to_string()))?;
        let node_count = next.node_count();
        self.schema = Some(next);
        self.revision += 1;
        Ok(RenderedView {
            revision: self.revision,
            node_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hl_schema::{Node, SchemaDelta, compute_delta};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new("1.0", vec![Node::new("root", "View")])
    }

    #[test]
    fn interpret_then_apply_delta_tracks_schema() {
        let mut interp = MirrorInterpreter::new();
        let view = interp.interpret(&schema(), false).unwrap();
        assert_eq!(view.revision, 1);
        assert_eq!(view.node_count, 1);

        let mut next = schema();
        next.nodes[0].props.insert("padding".to_owned(), json!(16));
        let delta = compute_delta(&schema(), &next);
        let view = interp.apply_delta(&delta, true).unwrap();
        assert_eq!(view.revision, 2);
        assert_eq!(
            interp.schema().unwrap().nodes[0].props["padding"],
            json!(16)
        );
    }

    #[test]
    fn apply_delta_without_a_schema_fails() {
        let mut interp = MirrorInterpreter::new();
        let err = interp.apply_delta(&SchemaDelta::default(), false).unwrap_err();
        assert!(matches!(err, InterpreterError::Delta(_)));
    }

    #[test]
    fn injected_failure_fires_once() {
        let mut interp = MirrorInterpreter::new();
        interp.fail_next("boom");
        assert!(interp.interpret(&schema(), false).is_err());
        assert!(interp.interpret(&schema(), false).is_ok());
    }
}
