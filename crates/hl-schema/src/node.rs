use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// An immutable UI description: a forest of [`Node`]s plus top-level metadata.
///
/// The wire form is camelCase JSON.  `timestamp` records when the schema was
/// authored (ms since epoch) and is normalized to 0 in the canonical form, so
/// it never participates in content identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema format revision, e.g. "1.0".  Not the protocol version.
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation: Option<Value>,
    #[serde(default)]
    pub timestamp: u64,
    /// Root nodes.  Order is semantic.
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// A typed element with a stable opaque id, named properties, and ordered
/// children.
///
/// Invariant: `id` is unique within a schema.  Child order is semantic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Schema {
    pub fn new(version: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            version: version.into(),
            theme: None,
            navigation: None,
            timestamp: 0,
            nodes,
        }
    }

    /// Total node count across the whole forest.
    pub fn node_count(&self) -> usize {
        let mut n = 0;
        self.for_each_node(&mut |_| n += 1);
        n
    }

    /// Flat index of every node (not just roots) by id.
    ///
    /// If an id violates the uniqueness invariant, the first occurrence in
    /// depth-first order wins.
    pub fn index(&self) -> HashMap<&str, &Node> {
        let mut index = HashMap::new();
        self.for_each_node(&mut |node| {
            index.entry(node.id.as_str()).or_insert(node);
        });
        index
    }

    pub fn contains(&self, id: &str) -> bool {
        let mut found = false;
        self.for_each_node(&mut |node| {
            if node.id == id {
                found = true;
            }
        });
        found
    }

    /// Depth-first visit over every node in the forest.
    pub fn for_each_node<'a>(&'a self, f: &mut impl FnMut(&'a Node)) {
        fn walk<'a>(node: &'a Node, f: &mut impl FnMut(&'a Node)) {
            f(node);
            for child in &node.children {
                walk(child, f);
            }
        }
        for node in &self.nodes {
            walk(node, f);
        }
    }
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            props: Map::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style prop assignment, mostly for tests and fixtures.
    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.children = children;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Schema {
        Schema::new(
            "1.0",
            vec![
                Node::new("root", "View").with_children(vec![
                    Node::new("title", "Text").with_prop("text", json!("hello")),
                    Node::new("body", "Text"),
                ]),
                Node::new("fab", "Button"),
            ],
        )
    }

    #[test]
    fn node_count_covers_whole_forest() {
        assert_eq!(sample().node_count(), 4);
    }

    #[test]
    fn index_is_flat_over_all_depths() {
        let schema = sample();
        let index = schema.index();
        assert_eq!(index.len(), 4);
        assert_eq!(index["title"].node_type, "Text");
        assert_eq!(index["fab"].node_type, "Button");
    }

    #[test]
    fn contains_finds_nested_ids() {
        let schema = sample();
        assert!(schema.contains("body"));
        assert!(!schema.contains("missing"));
    }

    #[test]
    fn wire_form_uses_type_field_and_defaults() {
        let schema: Schema = serde_json::from_value(json!({
            "version": "1.0",
            "nodes": [{"id": "r", "type": "View"}]
        }))
        .unwrap();
        assert_eq!(schema.nodes[0].node_type, "View");
        assert!(schema.nodes[0].props.is_empty());
        assert!(schema.nodes[0].children.is_empty());
        assert_eq!(schema.timestamp, 0);

        let round = serde_json::to_value(&schema).unwrap();
        assert_eq!(round["nodes"][0]["type"], "View");
    }
}
