// Flattened wire format for graph editors.
//
// Instead of nesting containers, every node is emitted into one flat list
// tagged with its parent graph id, and wiring is a list of from/to socket
// id pairs. This is the representation the node editor UI speaks.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::doc::{CommentDoc, GroupDoc};

/// A single connection between two sockets ("node_id.socket_name").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDoc {
    pub from: String,
    pub to: String,
}

impl ConnectionDoc {
    pub fn new(from_node: &str, from_socket: &str, to_node: &str, to_socket: &str) -> Self {
        Self {
            from: crate::doc::socket_id(from_node, from_socket),
            to: crate::doc::socket_id(to_node, to_socket),
        }
    }

    pub fn from_parts(&self) -> Option<(&str, &str)> {
        crate::doc::split_socket_id(&self.from)
    }

    pub fn to_parts(&self) -> Option<(&str, &str)> {
        crate::doc::split_socket_id(&self.to)
    }
}

/// A node in the flat list. `parent` is the id of the containing graph,
/// or None for top-level nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatNodeDoc {
    pub id: String,
    pub registry: String,
    #[serde(default)]
    pub properties: IndexMap<String, Value>,
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub collapsed: bool,
    #[serde(default)]
    pub inherited: bool,
}

/// The full flat document: nodes + connections plus the top-level graph's
/// own identity, properties and UI furniture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatGraphDoc {
    #[serde(default)]
    pub nodes: Vec<FlatNodeDoc>,
    #[serde(default)]
    pub connections: Vec<ConnectionDoc>,
    #[serde(default)]
    pub groups: Vec<GroupDoc>,
    #[serde(default)]
    pub comments: Vec<CommentDoc>,
    #[serde(default)]
    pub properties: IndexMap<String, Value>,
    #[serde(default)]
    pub fields: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default)]
    pub base_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_parsing() {
        let conn = ConnectionDoc::new("n1", "value", "n2", "state");
        assert_eq!(conn.from_parts(), Some(("n1", "value")));
        assert_eq!(conn.to_parts(), Some(("n2", "state")));
    }

    #[test]
    fn flat_doc_round_trip() {
        let json = r#"{
            "registry": "utils/myModule",
            "base_type": "core/Graph",
            "title": "My Module",
            "nodes": [
                {"id": "n1", "registry": "core/Input", "title": "IN", "x": 10, "y": 20}
            ],
            "connections": [
                {"from": "n1.value", "to": "n2.state"}
            ]
        }"#;
        let doc: FlatGraphDoc = serde_json::from_str(json).unwrap();
        assert_eq!(doc.nodes.len(), 1);
        assert_eq!(doc.nodes[0].parent, None);
        let doc2: FlatGraphDoc =
            serde_json::from_str(&serde_json::to_string(&doc).unwrap()).unwrap();
        assert_eq!(doc, doc2);
    }
}
