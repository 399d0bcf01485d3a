// Node type registry.
//
// Maps slash-delimited registry paths to factories. A factory either
// instantiates a native behavior (leaf node) or hydrates a graph from a
// stored JSON definition, so visually-authored modules are usable
// anywhere a hand-written node type is. Scene-local registrations shadow
// global ones of the same path.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use storygraph_types::NodeDoc;
use tracing::{error, warn};

use crate::error::NodeError;
use crate::graph::{Graph, GraphKind, GraphNode};
use crate::node::{Node, NodeBehavior};
use crate::value::Value;

/// Construction-time overrides for a node instance, carried from a
/// persisted document or an editor payload.
#[derive(Debug, Clone, Default)]
pub struct NodeSeed {
    pub id: Option<String>,
    pub title: Option<String>,
    pub x: i64,
    pub y: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub collapsed: bool,
    pub inherited: bool,
    pub properties: IndexMap<String, Value>,
}

impl NodeSeed {
    pub fn from_doc(doc: &NodeDoc) -> Self {
        Self {
            id: if doc.id.is_empty() {
                None
            } else {
                Some(doc.id.clone())
            },
            title: Some(doc.title.clone()),
            x: doc.x,
            y: doc.y,
            width: Some(doc.width),
            height: Some(doc.height),
            collapsed: doc.collapsed,
            inherited: doc.inherited,
            properties: doc
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json_property(v)))
                .collect(),
        }
    }

    fn apply_to_leaf(&self, node: &mut Node) {
        if let Some(id) = &self.id {
            let old_id = node.id.clone();
            node.id = id.clone();
            for socket in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                if socket.node_id == old_id {
                    socket.node_id = id.clone();
                }
            }
        }
        if let Some(title) = &self.title {
            node.title = title.clone();
        }
        node.x = self.x;
        node.y = self.y;
        if let Some(width) = self.width {
            node.width = width;
        }
        if let Some(height) = self.height {
            node.height = height;
        }
        node.collapsed = self.collapsed;
        node.inherited = self.inherited;
        for (name, value) in &self.properties {
            node.properties.insert(name.clone(), value.clone());
        }
    }

    fn apply_to_graph(&self, graph: &mut Graph) {
        if let Some(id) = &self.id {
            let old_id = graph.id.clone();
            graph.id = id.clone();
            for socket in graph
                .computed_inputs
                .iter_mut()
                .chain(graph.computed_outputs.iter_mut())
            {
                if socket.node_id == old_id {
                    socket.node_id = id.clone();
                }
            }
        }
        if let Some(title) = &self.title {
            graph.title = title.clone();
        }
        graph.x = self.x;
        graph.y = self.y;
        if let Some(width) = self.width {
            graph.width = width;
        }
        if let Some(height) = self.height {
            graph.height = height;
        }
        graph.collapsed = self.collapsed;
        graph.inherited = self.inherited;
        for (name, value) in &self.properties {
            graph.properties.insert(name.clone(), value.clone());
        }
    }
}

pub type NodeFactory =
    Arc<dyn Fn(&Registry, NodeSeed) -> Result<GraphNode, NodeError> + Send + Sync>;

/// One registered node type.
pub struct NodeType {
    pub path: String,
    pub base_type: String,
    pub export_definition: bool,
    factory: NodeFactory,
}

impl NodeType {
    pub fn new(
        path: impl Into<String>,
        base_type: impl Into<String>,
        export_definition: bool,
        factory: NodeFactory,
    ) -> Self {
        Self {
            path: path.into(),
            base_type: base_type.into(),
            export_definition,
            factory,
        }
    }

    pub fn create(&self, registry: &Registry, seed: NodeSeed) -> Result<GraphNode, NodeError> {
        (self.factory)(registry, seed)
    }
}

const KNOWN_BASE_TYPES: &[&str] = &[
    "core/Node",
    "core/Graph",
    "core/Loop",
    "core/Event",
    "core/EventTrigger",
    "core/functions/Function",
    "command/Command",
    "scene/SceneLoop",
];

/// Global registry plus a scene-local overlay; scene entries shadow
/// global entries of the same path.
#[derive(Default)]
pub struct Registry {
    entries: DashMap<String, Arc<NodeType>>,
    scene_entries: DashMap<String, Arc<NodeType>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the whole standard node library registered.
    pub fn with_builtins() -> Arc<Registry> {
        crate::signals::register_engine_signals();
        let registry = Arc::new(Registry::new());
        crate::nodes::register_all(&registry).expect("builtin node registration");
        crate::run::register(&registry).expect("function node registration");
        crate::event::register(&registry).expect("event node registration");
        crate::scene::register(&registry).expect("scene node registration");
        registry
    }

    /// Reject empty paths, single-segment paths, and prefix collisions in
    /// either direction: a new path may neither sit above nor below an
    /// already-registered path.
    pub fn validate_registry_path(&self, path: &str) -> Result<(), NodeError> {
        if path.is_empty() {
            return Err(NodeError::Registry("Empty registry path".into()));
        }
        if path.split('/').count() < 2 {
            return Err(NodeError::Registry(
                "Registry path must contain at least two parts (e.g., 'my/node')".into(),
            ));
        }
        let check = |existing: &str| -> Result<(), NodeError> {
            if existing.starts_with(&format!("{}/", path))
                || path.starts_with(&format!("{}/", existing))
            {
                return Err(NodeError::Registry(format!(
                    "Registry path {} is colliding with {}",
                    path, existing
                )));
            }
            Ok(())
        };
        for entry in self.entries.iter() {
            check(entry.key())?;
        }
        for entry in self.scene_entries.iter() {
            check(entry.key())?;
        }
        Ok(())
    }

    fn insert(&self, node_type: NodeType, scene: bool) -> Result<Arc<NodeType>, NodeError> {
        let path = node_type.path.clone();
        let container = if scene {
            &self.scene_entries
        } else {
            &self.entries
        };
        // re-registering the same path replaces it; colliding with a
        // different depth does not
        if !self.entries.contains_key(&path) && !self.scene_entries.contains_key(&path) {
            self.validate_registry_path(&path)?;
        }
        let node_type = Arc::new(node_type);
        container.insert(path, Arc::clone(&node_type));
        Ok(node_type)
    }

    /// Register a native leaf behavior under a path.
    pub fn register_behavior(
        &self,
        path: &str,
        behavior: Arc<dyn NodeBehavior>,
        base_type: &str,
    ) -> Result<(), NodeError> {
        let path_owned = path.to_string();
        let base_type_owned = base_type.to_string();
        let factory: NodeFactory = Arc::new(move |_registry, seed| {
            let mut node = Node::create(Arc::clone(&behavior))?;
            node.registry = path_owned.clone();
            node.base_type = base_type_owned.clone();
            seed.apply_to_leaf(&mut node);
            Ok(GraphNode::Leaf(node))
        });
        self.insert(
            NodeType {
                path: path.to_string(),
                base_type: base_type.to_string(),
                export_definition: true,
                factory,
            },
            false,
        )?;
        Ok(())
    }

    /// Register a graph-valued factory (used for dynamic definitions and
    /// natively-constructed module types).
    pub fn register_node_type(&self, node_type: NodeType, scene: bool) -> Result<Arc<NodeType>, NodeError> {
        self.insert(node_type, scene)
    }

    pub fn get(&self, path: &str) -> Option<Arc<NodeType>> {
        self.scene_entries
            .get(path)
            .or_else(|| self.entries.get(path))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.scene_entries.contains_key(path) || self.entries.contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .chain(self.scene_entries.iter().map(|e| e.key().clone()))
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn paths_by_base_type(&self, base_type: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .entries
            .iter()
            .chain(self.scene_entries.iter())
            .filter(|e| e.value().base_type == base_type)
            .map(|e| e.key().clone())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn clear_scene_entries(&self) {
        self.scene_entries.clear();
    }

    /// Instantiate a node of the given registered type.
    pub fn create(&self, path: &str, seed: NodeSeed) -> Result<GraphNode, NodeError> {
        let node_type = self
            .get(path)
            .ok_or_else(|| NodeError::Registry(format!("Node type '{}' not found", path)))?;
        node_type.create(self, seed)
    }

    // ── dynamic definitions ────────────────────────────────────────────

    /// Import a JSON node definition as a registered type. Whole custom
    /// Graph/Loop definitions authored visually become node types usable
    /// inside other graphs, nested arbitrarily.
    pub fn import_node_definition(
        &self,
        doc: &NodeDoc,
        scene: bool,
        reimport: bool,
    ) -> Result<Arc<NodeType>, NodeError> {
        let path = doc
            .registry
            .clone()
            .ok_or_else(|| NodeError::Registry("node definition missing registry".into()))?;

        if !reimport {
            if let Some(existing) = self.get(&path) {
                return Ok(existing);
            }
        }

        let base_type = doc.base_type.clone();
        if !KNOWN_BASE_TYPES.contains(&base_type.as_str()) {
            return Err(NodeError::Registry(format!(
                "Cannot import node data with base type {}",
                base_type
            )));
        }

        let stored = doc.clone();
        let factory: NodeFactory = Arc::new(move |registry, seed| {
            let mut graph = hydrate_graph(registry, &stored)?;
            seed.apply_to_graph(&mut graph);
            graph.reinitialize()?;
            Ok(GraphNode::Graph(Arc::new(graph)))
        });

        self.insert(
            NodeType {
                path,
                base_type,
                export_definition: true,
                factory,
            },
            scene,
        )
    }

    /// Load every scene-local node definition file from a directory.
    /// Definitions referencing each other may import out of order, so
    /// failures are retried until a pass imports nothing new.
    pub fn import_scene_node_definitions(&self, nodes_dir: &Path) -> Result<(), NodeError> {
        self.clear_scene_entries();
        if !nodes_dir.exists() {
            return Ok(());
        }

        let mut pending: Vec<NodeDoc> = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(nodes_dir)
            .map_err(|e| NodeError::Registry(format!("cannot read {}: {}", nodes_dir.display(), e)))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        entries.sort();

        for path in entries {
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot read node definition");
                    continue;
                }
            };
            let doc: NodeDoc = match serde_json::from_str(&raw) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "invalid node definition");
                    continue;
                }
            };
            if doc.registry.is_none() {
                warn!(path = %path.display(), "node definition missing registry, skipping");
                continue;
            }
            if self.import_node_definition(&doc, true, false).is_err() {
                pending.push(doc);
            }
        }

        let mut made_progress = true;
        while !pending.is_empty() && made_progress {
            made_progress = false;
            pending.retain(|doc| match self.import_node_definition(doc, true, false) {
                Ok(_) => {
                    made_progress = true;
                    false
                }
                Err(err) => {
                    error!(registry = ?doc.registry, error = %err, "failed to import node definition");
                    true
                }
            });
        }
        Ok(())
    }

    /// Dump every exportable node type for an editor palette.
    pub fn export_node_definitions(&self) -> serde_json::Value {
        let mut nodes = serde_json::Map::new();
        for path in self.paths() {
            let Some(node_type) = self.get(&path) else { continue };
            if !node_type.export_definition {
                continue;
            }
            let instance = match node_type.create(self, NodeSeed::default()) {
                Ok(instance) => instance,
                Err(err) => {
                    warn!(path = %path, error = %err, "failed to instantiate node class");
                    continue;
                }
            };

            let mut fields = serde_json::Map::new();
            match &instance {
                GraphNode::Leaf(leaf) => {
                    for name in leaf.properties.keys() {
                        fields.insert(name.clone(), leaf.field(name).to_json());
                    }
                }
                GraphNode::Graph(graph) => {
                    for (name, field) in &graph.fields {
                        fields.insert(name.clone(), field.to_json());
                    }
                    for (name, field) in graph.module_properties() {
                        fields.insert(name, field.to_json());
                    }
                }
            }

            let mut dump = match instance {
                GraphNode::Leaf(leaf) => {
                    // leaf dump reuses the doc serializer via a scratch
                    // container
                    let mut scratch = Graph::new(GraphKind::Graph);
                    let id = scratch.add_leaf(leaf);
                    let doc = scratch.to_doc(false);
                    serde_json::to_value(&doc.nodes[&id]).unwrap_or_default()
                }
                GraphNode::Graph(graph) => {
                    serde_json::to_value(graph.to_doc(false)).unwrap_or_default()
                }
            };

            if let Some(map) = dump.as_object_mut() {
                map.remove("nodes");
                map.remove("edges");
                map.insert("fields".to_string(), serde_json::Value::Object(fields));
            }
            nodes.insert(path, dump);
        }
        serde_json::json!({ "nodes": serde_json::Value::Object(nodes) })
    }
}

/// Build a live Graph from a document, resolving each contained node
/// through the registry. Inline container content wins over registered
/// definitions, matching how dynamic definitions layer overrides.
pub fn hydrate_graph(registry: &Registry, doc: &NodeDoc) -> Result<Graph, NodeError> {
    let base_type = if doc.base_type.is_empty() {
        doc.registry
            .as_ref()
            .and_then(|path| registry.get(path))
            .map(|t| t.base_type.clone())
            .unwrap_or_else(|| "core/Graph".to_string())
    } else {
        doc.base_type.clone()
    };

    let mut graph = Graph::new(GraphKind::from_base_type(&base_type));
    if !doc.id.is_empty() {
        graph.id = doc.id.clone();
    }
    graph.title = doc.title.clone();
    graph.registry = doc.registry.clone().unwrap_or_default();
    graph.x = doc.x;
    graph.y = doc.y;
    graph.width = doc.width;
    graph.height = doc.height;
    graph.collapsed = doc.collapsed;
    graph.inherited = doc.inherited;
    graph.extends = doc.extends.clone();
    graph.properties = doc
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_json_property(v)))
        .collect();

    for (node_id, node_doc) in &doc.nodes {
        let mut node_doc = node_doc.clone();
        if node_doc.id.is_empty() {
            node_doc.id = node_id.clone();
        }
        let node = if node_doc.is_container() {
            let mut child = hydrate_graph(registry, &node_doc)?;
            child.reinitialize()?;
            GraphNode::Graph(Arc::new(child))
        } else {
            let registry_path = node_doc.registry.clone().ok_or_else(|| {
                NodeError::Registry(format!("Could not validate node: {}", node_id))
            })?;
            registry.create(&registry_path, NodeSeed::from_doc(&node_doc))?
        };
        graph.add_node(node);
    }

    graph.edges = doc.edges.clone();
    graph.groups = doc.groups.clone();
    graph.comments = doc.comments.clone();
    graph.reinitialize()?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_deeper_path_under_existing_fails() {
        let registry = Registry::with_builtins();
        registry
            .register_behavior(
                "a/b",
                Arc::new(crate::nodes::core::Route),
                "core/Node",
            )
            .unwrap();
        let err = registry
            .register_behavior(
                "a/b/c",
                Arc::new(crate::nodes::core::Route),
                "core/Node",
            )
            .unwrap_err();
        assert!(err.to_string().contains("colliding"));
    }

    #[test]
    fn registering_ancestor_of_existing_fails() {
        let registry = Registry::with_builtins();
        registry
            .register_behavior(
                "x/y/z",
                Arc::new(crate::nodes::core::Route),
                "core/Node",
            )
            .unwrap();
        let err = registry
            .register_behavior(
                "x/y",
                Arc::new(crate::nodes::core::Route),
                "core/Node",
            )
            .unwrap_err();
        assert!(err.to_string().contains("colliding"));
    }

    #[test]
    fn single_segment_path_rejected() {
        let registry = Registry::new();
        assert!(registry.validate_registry_path("lonely").is_err());
        assert!(registry.validate_registry_path("").is_err());
        assert!(registry.validate_registry_path("my/node").is_ok());
    }

    #[test]
    fn scene_entries_shadow_global() {
        let registry = Registry::with_builtins();
        let doc: NodeDoc = serde_json::from_str(
            r#"{"registry": "core/Route", "base_type": "core/Graph", "title": "Shadowed"}"#,
        )
        .unwrap();
        registry.import_node_definition(&doc, true, true).unwrap();
        let node = registry.create("core/Route", NodeSeed::default()).unwrap();
        assert_eq!(node.title(), "Shadowed");
        registry.clear_scene_entries();
        let node = registry.create("core/Route", NodeSeed::default()).unwrap();
        assert_eq!(node.title(), "Route");
    }

    #[test]
    fn unknown_node_type_errors() {
        let registry = Registry::new();
        let err = registry
            .create("missing/node", NodeSeed::default())
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
