// Persisted graph document format.
//
// A graph file is a node document whose container fields (nodes, edges,
// groups, comments) are populated. Leaf nodes leave them empty. Socket ids
// are "<node_id>.<socket_name>".

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Build a socket id from its node id and socket name.
pub fn socket_id(node_id: &str, socket_name: &str) -> String {
    format!("{}.{}", node_id, socket_name)
}

/// Split a socket id into (node_id, socket_name).
///
/// Node ids are uuids and never contain a dot, so the first dot is the
/// separator.
pub fn split_socket_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('.')
}

/// A dynamically added input socket stored alongside the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicInputDoc {
    pub name: String,
    #[serde(rename = "type", default = "default_socket_type")]
    pub socket_type: String,
}

fn default_socket_type() -> String {
    "any".to_string()
}

/// A UI group box. Inert to execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDoc {
    #[serde(default = "default_group_title")]
    pub title: String,
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
    #[serde(default = "default_width")]
    pub width: i64,
    #[serde(default = "default_height")]
    pub height: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default = "default_font_size")]
    pub font_size: i64,
    #[serde(default)]
    pub inherited: bool,
}

fn default_group_title() -> String {
    "Group".to_string()
}

fn default_font_size() -> i64 {
    24
}

/// A UI comment. Inert to execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentDoc {
    #[serde(default = "default_comment_text")]
    pub text: String,
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
    #[serde(default = "default_width")]
    pub width: i64,
    #[serde(default)]
    pub inherited: bool,
}

fn default_comment_text() -> String {
    "Comment".to_string()
}

fn default_width() -> i64 {
    200
}

fn default_height() -> i64 {
    100
}

fn default_node_title() -> String {
    "Node".to_string()
}

/// A node as persisted. Graph-typed nodes populate the container fields;
/// saving a child of an `extends` chain filters `inherited` content back out
/// so only the authored delta is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDoc {
    #[serde(default = "default_node_title")]
    pub title: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub properties: IndexMap<String, Value>,
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
    #[serde(default = "default_width")]
    pub width: i64,
    #[serde(default = "default_height")]
    pub height: i64,
    #[serde(default)]
    pub collapsed: bool,
    #[serde(default)]
    pub inherited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dynamic_inputs: Vec<DynamicInputDoc>,

    // Container fields (graph-typed nodes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub nodes: IndexMap<String, NodeDoc>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub edges: IndexMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<CommentDoc>,
}

impl Default for NodeDoc {
    fn default() -> Self {
        Self {
            title: default_node_title(),
            id: String::new(),
            properties: IndexMap::new(),
            x: 0,
            y: 0,
            width: default_width(),
            height: default_height(),
            collapsed: false,
            inherited: false,
            registry: None,
            base_type: String::new(),
            dynamic_inputs: Vec::new(),
            extends: None,
            nodes: IndexMap::new(),
            edges: IndexMap::new(),
            groups: Vec::new(),
            comments: Vec::new(),
        }
    }
}

impl NodeDoc {
    /// True when the document describes a container (graph) node.
    pub fn is_container(&self) -> bool {
        !self.nodes.is_empty() || !self.edges.is_empty() || self.extends.is_some()
    }

    /// Merge a base document into this one, marking everything that came
    /// from the base as inherited. Nodes already present in `self` win;
    /// base edges are unioned under their output socket key.
    pub fn merge_inherited(&mut self, base: &NodeDoc) {
        for (node_id, node) in &base.nodes {
            if !self.nodes.contains_key(node_id) {
                let mut node = node.clone();
                node.inherited = true;
                self.nodes.insert(node_id.clone(), node);
            }
        }

        for (output_id, input_ids) in &base.edges {
            let entry = self.edges.entry(output_id.clone()).or_default();
            for input_id in input_ids {
                if !entry.contains(input_id) {
                    entry.push(input_id.clone());
                }
            }
        }

        for group in &base.groups {
            let mut group = group.clone();
            group.inherited = true;
            self.groups.push(group);
        }

        for comment in &base.comments {
            let mut comment = comment.clone();
            comment.inherited = true;
            self.comments.push(comment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_id_round_trip() {
        let id = socket_id("abc-123", "value");
        assert_eq!(split_socket_id(&id), Some(("abc-123", "value")));
    }

    #[test]
    fn node_doc_defaults() {
        let doc: NodeDoc = serde_json::from_str(r#"{"id": "n1"}"#).unwrap();
        assert_eq!(doc.title, "Node");
        assert_eq!(doc.width, 200);
        assert!(!doc.is_container());
    }

    #[test]
    fn merge_marks_base_content_inherited() {
        let mut child: NodeDoc = serde_json::from_str(
            r#"{"id": "child", "nodes": {"c": {"id": "c"}}, "edges": {"a.out": ["c.in"]}}"#,
        )
        .unwrap();
        let base: NodeDoc = serde_json::from_str(
            r#"{"id": "base", "nodes": {"a": {"id": "a"}, "b": {"id": "b"}},
                "edges": {"a.out": ["b.in"]}}"#,
        )
        .unwrap();

        child.merge_inherited(&base);

        assert!(child.nodes["a"].inherited);
        assert!(child.nodes["b"].inherited);
        assert!(!child.nodes["c"].inherited);
        // child's own edge survives, base edge is unioned in
        assert_eq!(child.edges["a.out"], vec!["c.in", "b.in"]);
    }

    #[test]
    fn container_round_trip() {
        let json = r#"{
            "registry": "scene/mainLoop",
            "base_type": "core/Loop",
            "title": "Main Loop",
            "nodes": {"n1": {"id": "n1", "registry": "core/Input"}},
            "edges": {"n1.value": ["n2.state"]}
        }"#;
        let doc: NodeDoc = serde_json::from_str(json).unwrap();
        assert!(doc.is_container());
        let out = serde_json::to_string(&doc).unwrap();
        let doc2: NodeDoc = serde_json::from_str(&out).unwrap();
        assert_eq!(doc, doc2);
    }
}
