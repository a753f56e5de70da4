//! Pure delta application.
//!
//! `apply_delta(base, delta)` produces the schema the delta describes without
//! touching any interpreter state.  The law paired with `compute_delta`:
//! for schemas A and B with stable root identity,
//! `apply_delta(A, compute_delta(A, B))` is canonically equal to B.

use crate::{Node, Schema, SchemaDelta};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplyError {
    /// The delta modifies a node the base schema does not contain.
    #[error("modified node '{0}' not present in base schema")]
    MissingModified(String),
}

/// Apply a delta to a base schema, producing the updated schema.
///
/// Removed ids are pruned everywhere, modified nodes are replaced wholesale
/// (their new subtree comes with them), and added nodes that did not arrive
/// inside a modified parent are appended to the root list.  Metadata changes
/// apply last; an explicit `null` clears `theme`/`navigation`.
pub fn apply_delta(base: &Schema, delta: &SchemaDelta) -> Result<Schema, ApplyError> {
    let mut schema = base.clone();

    if !delta.removed.is_empty() {
        let removed: HashSet<&str> = delta.removed.iter().map(String::as_str).collect();
        prune(&mut schema.nodes, &removed);
    }

    for modified in &delta.modified {
        if !replace(&mut schema.nodes, modified) {
            return Err(ApplyError::MissingModified(modified.id.clone()));
        }
    }

    // Non-root additions ride in with their modified parent; anything still
    // missing is a new root.
    for added in &delta.added {
        if !schema.contains(&added.id) {
            schema.nodes.push(added.clone());
        }
    }

    if let Some(meta) = &delta.metadata_changes {
        if let Some(version) = &meta.version {
            schema.version = version.clone();
        }
        if let Some(theme) = &meta.theme {
            schema.theme = non_null(theme);
        }
        if let Some(navigation) = &meta.navigation {
            schema.navigation = non_null(navigation);
        }
    }

    Ok(schema)
}

fn non_null(value: &Value) -> Option<Value> {
    if value.is_null() { None } else { Some(value.clone()) }
}

fn prune(nodes: &mut Vec<Node>, removed: &HashSet<&str>) {
    nodes.retain(|node| !removed.contains(node.id.as_str()));
    for node in nodes {
        prune(&mut node.children, removed);
    }
}

fn replace(nodes: &mut [Node], replacement: &Node) -> bool {
    for node in nodes {
        if node.id == replacement.id {
            *node = replacement.clone();
            return true;
        }
        if replace(&mut node.children, replacement) {
            return true;
        }
    }
    false
}
