//! Structural diff of two schemas.
//!
//! `compute_delta` builds flat id-indexes over every node in both schemas and
//! classifies each id as added, removed, or modified.  `node_equal` is the
//! per-node comparison: cheap field checks short-circuit before any value
//! comparison, and children are compared by id at the same index — deep
//! changes surface on the child itself via the flat index, not the parent.

use crate::{Node, Schema};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Change-count ceiling below which an incremental update is worthwhile.
pub const INCREMENTAL_THRESHOLD: usize = 10;

/// Minimal description of the changes between two schemas.
///
/// Invariants: `added` and `modified` are disjoint by id; `removed` ids are
/// disjoint from both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDelta {
    #[serde(default)]
    pub added: Vec<Node>,
    #[serde(default)]
    pub modified: Vec<Node>,
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_changes: Option<MetadataChanges>,
}

/// Top-level metadata edits carried alongside node changes.
///
/// Each field carries the new value when it changed; an absent field means
/// unchanged.  A cleared `theme`/`navigation` is an explicit JSON `null`
/// (`Some(Value::Null)`), which is why deserialization must distinguish
/// present-null from absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub theme: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub navigation: Option<Value>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl MetadataChanges {
    pub fn is_empty(&self) -> bool {
        self.version.is_none() && self.theme.is_none() && self.navigation.is_none()
    }
}

impl SchemaDelta {
    /// Number of node-level changes (metadata changes excluded).
    pub fn change_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_count() == 0 && self.metadata_changes.is_none()
    }
}

/// Which wire form the server should ship for a given delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    Full,
    Incremental,
}

/// Compare two schemas and produce the minimal delta.  O(N+M) in node counts.
pub fn compute_delta(old: &Schema, new: &Schema) -> SchemaDelta {
    let old_by_id = old.index();
    let new_by_id = new.index();

    let mut added = Vec::new();
    let mut modified = Vec::new();
    new.for_each_node(&mut |node| match old_by_id.get(node.id.as_str()) {
        None => added.push(node.clone()),
        Some(previous) if !node_equal(previous, node) => modified.push(node.clone()),
        Some(_) => {}
    });

    let mut removed = Vec::new();
    old.for_each_node(&mut |node| {
        if !new_by_id.contains_key(node.id.as_str()) {
            removed.push(node.id.clone());
        }
    });

    SchemaDelta {
        added,
        modified,
        removed,
        metadata_changes: metadata_changes(old, new),
    }
}

fn metadata_changes(old: &Schema, new: &Schema) -> Option<MetadataChanges> {
    let mut changes = MetadataChanges::default();
    if old.version != new.version {
        changes.version = Some(new.version.clone());
    }
    if old.theme != new.theme {
        changes.theme = Some(new.theme.clone().unwrap_or(Value::Null));
    }
    if old.navigation != new.navigation {
        changes.navigation = Some(new.navigation.clone().unwrap_or(Value::Null));
    }
    if changes.is_empty() { None } else { Some(changes) }
}

/// Per-node equality with short-circuiting cheap checks.
///
/// Children are compared by id at the same index only; a grandchild edit is
/// the grandchild's own modification, not the parent's.
pub fn node_equal(a: &Node, b: &Node) -> bool {
    if a.node_type != b.node_type {
        return false;
    }
    if a.children.len() != b.children.len() {
        return false;
    }
    if a.props.len() != b.props.len() {
        return false;
    }
    if a.children.iter().zip(&b.children).any(|(x, y)| x.id != y.id) {
        return false;
    }
    a.props.iter().all(|(key, value)| b.props.get(key) == Some(value))
}

/// `true` iff the delta is small enough to ship incrementally: non-empty,
/// under the threshold, and without a navigation change (navigation edits
/// restructure the view tree and always go out as a full update).
pub fn should_use_incremental(delta: &SchemaDelta, threshold: usize) -> bool {
    if delta
        .metadata_changes
        .as_ref()
        .is_some_and(|m| m.navigation.is_some())
    {
        return false;
    }
    let count = delta.change_count();
    count > 0 && count < threshold
}

/// Strategy selection at the default threshold.
pub fn select_strategy(delta: &SchemaDelta) -> UpdateStrategy {
    if should_use_incremental(delta, INCREMENTAL_THRESHOLD) {
        UpdateStrategy::Incremental
    } else {
        UpdateStrategy::Full
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(id: &str) -> Node {
        Node::new(id, "Text")
    }

    fn base() -> Schema {
        Schema::new(
            "1.0",
            vec![Node::new("root", "View").with_children(vec![leaf("a"), leaf("b")])],
        )
    }

    #[test]
    fn identical_schemas_produce_empty_delta() {
        let delta = compute_delta(&base(), &base());
        assert!(delta.is_empty());
    }

    #[test]
    fn prop_change_is_a_modification() {
        let old = base();
        let mut new = base();
        new.nodes[0].children[0].props.insert("text".to_owned(), json!("hi"));
        let delta = compute_delta(&old, &new);
        assert_eq!(delta.added.len(), 0);
        assert_eq!(delta.removed.len(), 0);
        // The leaf changed, and the parent did not (children ids unchanged).
        assert_eq!(delta.modified.len(), 1);
        assert_eq!(delta.modified[0].id, "a");
    }

    #[test]
    fn new_child_marks_parent_modified_and_child_added() {
        let old = base();
        let mut new = base();
        new.nodes[0].children.push(leaf("c"));
        let delta = compute_delta(&old, &new);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].id, "c");
        assert_eq!(delta.modified.len(), 1);
        assert_eq!(delta.modified[0].id, "root");
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn removed_subtree_lists_every_node_id() {
        let old = base();
        let mut new = base();
        new.nodes[0].children.clear();
        let delta = compute_delta(&old, &new);
        let mut removed = delta.removed.clone();
        removed.sort();
        assert_eq!(removed, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(delta.modified.len(), 1);
    }

    #[test]
    fn reordered_children_modify_only_the_parent() {
        let old = base();
        let mut new = base();
        new.nodes[0].children.swap(0, 1);
        let delta = compute_delta(&old, &new);
        assert_eq!(delta.modified.len(), 1);
        assert_eq!(delta.modified[0].id, "root");
        assert!(delta.added.is_empty());
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn metadata_version_and_theme_changes_are_recorded_by_value() {
        let old = base();
        let mut new = base();
        new.version = "1.1".to_owned();
        new.theme = Some(json!({"mode": "dark"}));
        let delta = compute_delta(&old, &new);
        let meta = delta.metadata_changes.unwrap();
        assert_eq!(meta.version.as_deref(), Some("1.1"));
        assert_eq!(meta.theme, Some(json!({"mode": "dark"})));
        assert!(meta.navigation.is_none());
    }

    #[test]
    fn cleared_theme_is_an_explicit_null() {
        let mut old = base();
        old.theme = Some(json!({"mode": "dark"}));
        let new = base();
        let delta = compute_delta(&old, &new);

        // Present-null must survive a wire round-trip.
        let text = serde_json::to_string(&delta).unwrap();
        let meta = delta.metadata_changes.unwrap();
        assert_eq!(meta.theme, Some(Value::Null));

        let parsed: SchemaDelta = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.metadata_changes.unwrap().theme, Some(Value::Null));
    }

    #[test]
    fn node_equal_short_circuits_on_type_and_shape() {
        let a = leaf("x");
        let mut b = leaf("x");
        b.node_type = "Image".to_owned();
        assert!(!node_equal(&a, &b));

        let a = Node::new("x", "View").with_children(vec![leaf("c1")]);
        let b = Node::new("x", "View");
        assert!(!node_equal(&a, &b));
    }

    #[test]
    fn node_equal_compares_nested_prop_values_structurally() {
        let a = leaf("x").with_prop("style", json!({"a": 1, "b": [1, 2]}));
        let b = leaf("x").with_prop("style", json!({"b": [1, 2], "a": 1}));
        assert!(node_equal(&a, &b));

        let c = leaf("x").with_prop("style", json!({"a": 1, "b": [2, 1]}));
        assert!(!node_equal(&a, &c));
    }

    #[test]
    fn threshold_selection_matches_contract() {
        // 3 changes, no metadata: incremental.
        let small = SchemaDelta {
            added: vec![leaf("n1")],
            modified: vec![leaf("n2"), leaf("n3")],
            ..SchemaDelta::default()
        };
        assert!(should_use_incremental(&small, 10));
        assert_eq!(select_strategy(&small), UpdateStrategy::Incremental);

        // Navigation change forces full regardless of count.
        let mut with_nav = small.clone();
        with_nav.metadata_changes = Some(MetadataChanges {
            navigation: Some(json!({"route": "/home"})),
            ..MetadataChanges::default()
        });
        assert!(!should_use_incremental(&with_nav, 10));
        assert_eq!(select_strategy(&with_nav), UpdateStrategy::Full);

        // 15 changes: full.
        let big = SchemaDelta {
            added: (0..15).map(|i| leaf(&format!("n{i}"))).collect(),
            ..SchemaDelta::default()
        };
        assert!(!should_use_incremental(&big, 10));
        assert_eq!(select_strategy(&big), UpdateStrategy::Full);

        // Empty delta: nothing to ship incrementally.
        assert!(!should_use_incremental(&SchemaDelta::default(), 10));
    }
}
