// Graph container.
//
// A Graph owns its nodes and edges and is itself usable as a node: its
// external sockets are computed from contained Input/Output marker nodes.
// Structure is frozen once execution starts (nested graphs are Arc-shared);
// all mutable execution state lives in GraphState.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::{Bfs, EdgeRef, Reversed};
use storygraph_types::{CommentDoc, GroupDoc, NodeDoc, split_socket_id};
use tracing::warn;
use uuid::Uuid;

use crate::error::NodeError;
use crate::node::{Node, PropertyField, Socket, SocketRef, SocketType};
use crate::state::GraphState;
use crate::value::Value;

pub const INPUT_REGISTRY: &str = "core/Input";
pub const OUTPUT_REGISTRY: &str = "core/Output";
pub const MODULE_PROPERTY_REGISTRY: &str = "core/ModuleProperty";
pub const STAGE_REGISTRY: &str = "core/Stage";

pub type StateCallback =
    Arc<dyn for<'a> Fn(&'a GraphState) -> BoxFuture<'a, ()> + Send + Sync>;
pub type ErrorCallback =
    Arc<dyn for<'a> Fn(&'a GraphState, &'a NodeError) -> BoxFuture<'a, ()> + Send + Sync>;
pub type ExitCondition = Arc<dyn Fn(&GraphState) -> bool + Send + Sync>;

/// Loop pacing and exit configuration.
#[derive(Clone)]
pub struct LoopConfig {
    /// Yield between chains each iteration.
    pub sleep: Duration,
    pub exit_condition: Option<ExitCondition>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            sleep: Duration::from_millis(1),
            exit_condition: None,
        }
    }
}

/// Listener bookkeeping for the failure-storm guard.
#[derive(Default)]
pub struct ListenGuard {
    pub last_failure: Mutex<Option<std::time::Instant>>,
}

/// What flavor of container this graph is. Determines base type, loop
/// semantics and how the graph behaves when nested as a node.
pub enum GraphKind {
    Graph,
    Loop(LoopConfig),
    Listen(ListenGuard),
    Function,
    Command,
    SceneLoop(LoopConfig),
}

impl GraphKind {
    pub fn base_type(&self) -> &'static str {
        match self {
            GraphKind::Graph => "core/Graph",
            GraphKind::Loop(_) => "core/Loop",
            GraphKind::Listen(_) => "core/Event",
            GraphKind::Function => "core/functions/Function",
            GraphKind::Command => "command/Command",
            GraphKind::SceneLoop(_) => "scene/SceneLoop",
        }
    }

    pub fn from_base_type(base_type: &str) -> GraphKind {
        match base_type {
            "core/Loop" => GraphKind::Loop(LoopConfig::default()),
            "core/Event" => GraphKind::Listen(ListenGuard::default()),
            "core/functions/Function" => GraphKind::Function,
            "command/Command" => GraphKind::Command,
            "scene/SceneLoop" => GraphKind::SceneLoop(LoopConfig::default()),
            _ => GraphKind::Graph,
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, GraphKind::Loop(_) | GraphKind::SceneLoop(_))
    }
}

/// An element of a graph: a leaf node or a nested graph.
pub enum GraphNode {
    Leaf(Node),
    Graph(Arc<Graph>),
}

impl GraphNode {
    pub fn id(&self) -> &str {
        match self {
            GraphNode::Leaf(node) => &node.id,
            GraphNode::Graph(graph) => &graph.id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            GraphNode::Leaf(node) => &node.title,
            GraphNode::Graph(graph) => &graph.title,
        }
    }

    pub fn registry(&self) -> &str {
        match self {
            GraphNode::Leaf(node) => &node.registry,
            GraphNode::Graph(graph) => &graph.registry,
        }
    }

    pub fn base_type(&self) -> &str {
        match self {
            GraphNode::Leaf(node) => &node.base_type,
            GraphNode::Graph(graph) => graph.kind.base_type(),
        }
    }

    pub fn inherited(&self) -> bool {
        match self {
            GraphNode::Leaf(node) => node.inherited,
            GraphNode::Graph(graph) => graph.inherited,
        }
    }

    pub fn inputs(&self) -> &[Socket] {
        match self {
            GraphNode::Leaf(node) => &node.inputs,
            GraphNode::Graph(graph) => &graph.computed_inputs,
        }
    }

    pub fn outputs(&self) -> &[Socket] {
        match self {
            GraphNode::Leaf(node) => &node.outputs,
            GraphNode::Graph(graph) => &graph.computed_outputs,
        }
    }

    pub fn input_socket(&self, name: &str) -> Option<&Socket> {
        self.inputs().iter().find(|s| s.name == name)
    }

    pub fn output_socket(&self, name: &str) -> Option<&Socket> {
        self.outputs().iter().find(|s| s.name == name)
    }

    pub fn isolated(&self) -> bool {
        match self {
            GraphNode::Leaf(node) => node.isolated(),
            GraphNode::Graph(graph) => {
                matches!(graph.kind, GraphKind::Listen(_) | GraphKind::Command)
            }
        }
    }

    pub fn stored_property(&self, name: &str) -> Value {
        match self {
            GraphNode::Leaf(node) => node.stored_property(name),
            GraphNode::Graph(graph) => {
                graph.properties.get(name).cloned().unwrap_or(Value::Unresolved)
            }
        }
    }

    /// Property value with state-scoped override.
    pub fn property(&self, state: &GraphState, name: &str) -> Value {
        state
            .node_property(self.id(), name)
            .unwrap_or_else(|| self.stored_property(name))
    }

    pub fn as_leaf(&self) -> Option<&Node> {
        match self {
            GraphNode::Leaf(node) => Some(node),
            GraphNode::Graph(_) => None,
        }
    }

    pub fn as_graph(&self) -> Option<&Arc<Graph>> {
        match self {
            GraphNode::Leaf(_) => None,
            GraphNode::Graph(graph) => Some(graph),
        }
    }
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.title(), self.id())
    }
}

/// Container of nodes and their wiring.
pub struct Graph {
    pub id: String,
    pub title: String,
    pub registry: String,
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
    pub collapsed: bool,
    pub inherited: bool,
    pub properties: IndexMap<String, Value>,
    pub fields: IndexMap<String, PropertyField>,
    pub extends: Option<String>,

    pub nodes: IndexMap<String, GraphNode>,
    /// output socket id → input socket ids (fan-out).
    pub edges: IndexMap<String, Vec<String>>,
    /// Edge pairs merged in from an `extends` base; filtered out on save.
    pub inherited_edges: HashSet<(String, String)>,
    pub groups: Vec<GroupDoc>,
    pub comments: Vec<CommentDoc>,

    pub kind: GraphKind,

    /// External sockets derived from Input/Output marker nodes.
    pub computed_inputs: Vec<Socket>,
    pub computed_outputs: Vec<Socket>,

    pub callbacks: Vec<StateCallback>,
    pub error_handlers: Vec<ErrorCallback>,

    interrupt: AtomicBool,
}

impl Graph {
    pub fn new(kind: GraphKind) -> Self {
        let title = match &kind {
            GraphKind::Graph => "Graph",
            GraphKind::Loop(_) => "Loop",
            GraphKind::Listen(_) => "Listen",
            GraphKind::Function => "Function",
            GraphKind::Command => "Command",
            GraphKind::SceneLoop(_) => "Scene Loop",
        };
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            registry: String::new(),
            x: 0,
            y: 0,
            width: 200,
            height: 100,
            collapsed: false,
            inherited: false,
            properties: IndexMap::new(),
            fields: IndexMap::new(),
            extends: None,
            nodes: IndexMap::new(),
            edges: IndexMap::new(),
            inherited_edges: HashSet::new(),
            groups: Vec::new(),
            comments: Vec::new(),
            kind,
            computed_inputs: Vec::new(),
            computed_outputs: Vec::new(),
            callbacks: Vec::new(),
            error_handlers: Vec::new(),
            interrupt: AtomicBool::new(false),
        }
    }

    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::SeqCst)
    }

    // ── structure ──────────────────────────────────────────────────────

    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.nodes.get(node_id)
    }

    pub fn add_node(&mut self, node: GraphNode) -> String {
        let id = node.id().to_string();
        self.nodes.insert(id.clone(), node);
        id
    }

    pub fn add_leaf(&mut self, node: Node) -> String {
        self.add_node(GraphNode::Leaf(node))
    }

    pub fn add_graph(&mut self, graph: Graph) -> String {
        self.add_node(GraphNode::Graph(Arc::new(graph)))
    }

    pub fn find_nodes<'a>(
        &'a self,
        filter: impl Fn(&GraphNode) -> bool + 'a,
    ) -> impl Iterator<Item = &'a GraphNode> {
        self.nodes.values().filter(move |node| filter(node))
    }

    pub fn input_nodes(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter_map(|n| n.as_leaf())
            .filter(|n| n.registry == INPUT_REGISTRY)
            .collect()
    }

    pub fn output_nodes(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter_map(|n| n.as_leaf())
            .filter(|n| n.registry == OUTPUT_REGISTRY)
            .collect()
    }

    pub fn module_property_nodes(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter_map(|n| n.as_leaf())
            .filter(|n| n.registry == MODULE_PROPERTY_REGISTRY)
            .collect()
    }

    /// Graph-level configuration fields derived from ModuleProperty nodes.
    pub fn module_properties(&self) -> IndexMap<String, PropertyField> {
        let mut properties = IndexMap::new();
        for node in self.module_property_nodes() {
            let name = match node.stored_property("property_name") {
                Value::String(s) if !s.is_empty() => s,
                _ => continue,
            };
            if properties.contains_key(&name) {
                warn!(name = %name, "duplicate module property");
                continue;
            }
            let field_type = node
                .stored_property("property_type")
                .as_str()
                .unwrap_or("str")
                .to_string();
            let mut field = PropertyField::new(name.clone(), field_type);
            if let Some(desc) = node.stored_property("description").as_str() {
                field.description = desc.to_string();
            }
            field.default = node.stored_property("default");
            if let Value::List(choices) = node.stored_property("choices") {
                field.choices = Some(choices);
            }
            properties.insert(name, field);
        }
        properties
    }

    pub fn input_socket(&self, name: &str) -> Option<&Socket> {
        self.computed_inputs.iter().find(|s| s.name == name)
    }

    pub fn output_socket(&self, name: &str) -> Option<&Socket> {
        self.computed_outputs.iter().find(|s| s.name == name)
    }

    /// Connect an output socket to an input socket. One output may fan
    /// out to many inputs; an input reads from a single source.
    pub fn connect(&mut self, from: SocketRef, to: SocketRef) -> Result<(), NodeError> {
        let output_id = from.full_id();
        let input_id = to.full_id();
        let entry = self.edges.entry(output_id).or_default();
        if !entry.contains(&input_id) {
            entry.push(input_id);
        }
        self.set_socket_source(&to, from)
    }

    pub fn connect_ids(
        &mut self,
        from_node: &str,
        from_socket: &str,
        to_node: &str,
        to_socket: &str,
    ) -> Result<(), NodeError> {
        self.connect(
            SocketRef::new(from_node, from_socket),
            SocketRef::new(to_node, to_socket),
        )
    }

    fn set_socket_source(&mut self, input: &SocketRef, source: SocketRef) -> Result<(), NodeError> {
        let Some(node) = self.nodes.get_mut(&input.node_id) else {
            return Err(NodeError::Graph(format!(
                "input node {} not found",
                input.node_id
            )));
        };
        let sockets = match node {
            GraphNode::Leaf(node) => &mut node.inputs,
            GraphNode::Graph(graph) => {
                let graph = Arc::get_mut(graph).ok_or_else(|| {
                    NodeError::Graph("graph is frozen; wiring must happen before execution".into())
                })?;
                &mut graph.computed_inputs
            }
        };
        match sockets.iter_mut().find(|s| s.name == input.name) {
            Some(socket) => {
                socket.source = Some(source);
                Ok(())
            }
            None => {
                warn!(socket = %input.full_id(), "input socket not found");
                Ok(())
            }
        }
    }

    /// Rebuild computed IO sockets and re-establish `source` references
    /// from the edge map. Called after loading or structural edits,
    /// before execution.
    pub fn reinitialize(&mut self) -> Result<(), NodeError> {
        self.recompute_io();
        self.ensure_connections()
    }

    /// Wire any connections implied by edges that are not yet reflected
    /// in socket `source` references.
    pub fn ensure_connections(&mut self) -> Result<(), NodeError> {
        let pairs: Vec<(SocketRef, SocketRef)> = self
            .edges
            .iter()
            .flat_map(|(output_id, input_ids)| {
                let from = split_socket_id(output_id)
                    .map(|(node, socket)| SocketRef::new(node, socket));
                input_ids.iter().filter_map(move |input_id| {
                    let from = from.clone()?;
                    let (node, socket) = split_socket_id(input_id)?;
                    Some((from, SocketRef::new(node, socket)))
                })
            })
            .collect();
        for (from, to) in pairs {
            self.set_socket_source(&to, from)?;
        }
        Ok(())
    }

    fn marker_sockets(&self, nodes: Vec<&Node>, output: bool) -> Vec<Socket> {
        let mut nodes = nodes;
        nodes.sort_by_key(|n| n.stored_property("num").as_int().unwrap_or(0));
        nodes
            .into_iter()
            .map(|node| {
                let (name_key, type_key) = if output {
                    ("output_name", "output_type")
                } else {
                    ("input_name", "input_type")
                };
                let name = node
                    .stored_property(name_key)
                    .as_str()
                    .unwrap_or("state")
                    .to_string();
                let mut socket = Socket::new(name);
                socket.node_id = self.id.clone();
                if let Some(t) = node.stored_property(type_key).as_str() {
                    socket.socket_type = SocketType::One(t.to_string());
                }
                if !output {
                    socket.optional = node.stored_property("input_optional").as_bool();
                    if let Some(group) = node.stored_property("input_group").as_str() {
                        if !group.is_empty() {
                            socket.group = Some(group.to_string());
                        }
                    }
                }
                socket
            })
            .collect()
    }

    /// Compute this graph's external sockets from its Input/Output marker
    /// nodes (Function graphs expose only the `fn` socket).
    pub fn recompute_io(&mut self) {
        match self.kind {
            GraphKind::Function | GraphKind::Command => {
                self.computed_inputs = Vec::new();
                let mut socket = Socket::new("fn").with_type("function");
                socket.node_id = self.id.clone();
                self.computed_outputs = vec![socket];
            }
            _ => {
                let existing_sources: HashMap<String, Option<SocketRef>> = self
                    .computed_inputs
                    .iter()
                    .map(|s| (s.name.clone(), s.source.clone()))
                    .collect();
                let mut inputs = self.marker_sockets(self.input_nodes(), false);
                for socket in &mut inputs {
                    if let Some(source) = existing_sources.get(&socket.name) {
                        socket.source = source.clone();
                    }
                }
                self.computed_inputs = inputs;
                self.computed_outputs = self.marker_sockets(self.output_nodes(), true);
            }
        }
    }

    // ── directed graph over nodes ──────────────────────────────────────

    /// Node-level directed graph built from the edges. Only nodes that
    /// participate in at least one edge appear.
    pub fn build_digraph(&self) -> BuiltGraph {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();

        let mut get_index = |graph: &mut DiGraph<String, ()>, node_id: &str| -> NodeIndex {
            if let Some(ix) = index.get(node_id) {
                return *ix;
            }
            let ix = graph.add_node(node_id.to_string());
            index.insert(node_id.to_string(), ix);
            ix
        };

        for (output_id, input_ids) in &self.edges {
            let Some((output_node, _)) = split_socket_id(output_id) else {
                continue;
            };
            if !self.nodes.contains_key(output_node) {
                continue;
            }
            for input_id in input_ids {
                let Some((input_node, _)) = split_socket_id(input_id) else {
                    continue;
                };
                if !self.nodes.contains_key(input_node) {
                    continue;
                }
                let from = get_index(&mut graph, output_node);
                let to = get_index(&mut graph, input_node);
                graph.update_edge(from, to, ());
            }
        }

        BuiltGraph { graph }
    }

    /// The minimum Stage value present in a chain; chains without a Stage
    /// sort last.
    pub fn chain_priority(&self, chain: &[String]) -> i64 {
        let mut min_stage = i64::MAX;
        for node_id in chain {
            if let Some(node) = self.nodes.get(node_id) {
                if node.registry() == STAGE_REGISTRY {
                    let stage = node.stored_property("stage").as_int().unwrap_or(0);
                    min_stage = min_stage.min(stage);
                }
            }
        }
        min_stage
    }

    /// Input sockets fed by the given output socket.
    pub fn consumers_of(&self, output: &SocketRef) -> Vec<SocketRef> {
        self.edges
            .get(&output.full_id())
            .map(|input_ids| {
                input_ids
                    .iter()
                    .filter_map(|id| split_socket_id(id))
                    .map(|(node, socket)| SocketRef::new(node, socket))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── availability ───────────────────────────────────────────────────

    /// Decide whether a node should run: all required inputs present
    /// (groups are OR-alternatives), and at least one output path leads
    /// somewhere alive. Failing nodes deactivate their outputs so the
    /// verdict propagates forward without re-walking.
    pub fn check_is_available(&self, node: &GraphNode, state: &GraphState) -> bool {
        if node.isolated() {
            return false;
        }

        let mut grouped: IndexMap<&str, Vec<&Socket>> = IndexMap::new();
        let mut ungrouped: Vec<&Socket> = Vec::new();
        for socket in node.inputs() {
            if socket.optional {
                continue;
            }
            match &socket.group {
                Some(group) => grouped.entry(group.as_str()).or_default().push(socket),
                None => ungrouped.push(socket),
            }
        }

        let socket_satisfied = |socket: &Socket| -> bool {
            let connected_alive = socket.source.is_some()
                && !socket.source_deactivated(state)
                && !socket.value(state).is_unresolved();
            connected_alive || !node.property(state, &socket.name).is_unresolved()
        };

        for socket in &ungrouped {
            if !socket_satisfied(socket) {
                self.deactivate_outputs(node, state);
                return false;
            }
        }

        for (group, sockets) in &grouped {
            if !sockets.iter().any(|socket| socket_satisfied(socket)) {
                if state.verbosity() >= crate::state::NodeVerbosity::Verbose {
                    warn!(node = %node.title(), group = %group, "input group is not available");
                }
                self.deactivate_outputs(node, state);
                return false;
            }
        }

        // no outputs: terminal node, inputs alone decide
        if node.outputs().is_empty() {
            return true;
        }

        let alive = node.outputs().iter().any(|socket| {
            let mut visited = HashSet::new();
            visited.insert(node.id().to_string());
            self.has_active_path(socket, state, &mut visited)
        });

        if !alive {
            self.deactivate_outputs(node, state);
        }
        alive
    }

    fn deactivate_outputs(&self, node: &GraphNode, state: &GraphState) {
        for socket in node.outputs() {
            socket.set_deactivated(state, true);
        }
    }

    /// Forward reachability from an output socket: does any path lead to
    /// a live endpoint? Cycle-safe via the visited set.
    fn has_active_path(
        &self,
        socket: &Socket,
        state: &GraphState,
        visited: &mut HashSet<String>,
    ) -> bool {
        if socket.deactivated(state) {
            return false;
        }
        let consumers = self.consumers_of(&SocketRef::new(&socket.node_id, &socket.name));
        if consumers.is_empty() {
            // dangling output: leads out of the graph
            return true;
        }
        for input in consumers {
            if visited.contains(&input.node_id) {
                continue;
            }
            visited.insert(input.node_id.clone());
            let Some(downstream) = self.nodes.get(&input.node_id) else {
                continue;
            };
            if downstream.outputs().is_empty() {
                // endpoint downstream keeps the path useful
                return true;
            }
            for out in downstream.outputs() {
                let mut branch_visited = visited.clone();
                if self.has_active_path(out, state, &mut branch_visited) {
                    return true;
                }
            }
        }
        false
    }

    /// Reset all socket values and activation flags in the given state.
    pub fn reset_sockets(&self, state: &GraphState) {
        for node in self.nodes.values() {
            for socket in node.inputs().iter().chain(node.outputs().iter()) {
                state.set_socket_value(&socket.node_id, &socket.name, Value::Unresolved);
                state.set_socket_deactivated(&socket.node_id, &socket.name, false);
            }
        }
        for socket in self
            .computed_inputs
            .iter()
            .chain(self.computed_outputs.iter())
        {
            state.set_socket_value(&socket.node_id, &socket.name, Value::Unresolved);
            state.set_socket_deactivated(&socket.node_id, &socket.name, false);
        }
    }

    // ── serialization ──────────────────────────────────────────────────

    fn leaf_to_doc(node: &Node) -> NodeDoc {
        let mut doc = NodeDoc {
            title: node.title.clone(),
            id: node.id.clone(),
            x: node.x,
            y: node.y,
            width: node.width,
            height: node.height,
            collapsed: node.collapsed,
            inherited: node.inherited,
            registry: Some(node.registry.clone()),
            base_type: node.base_type.clone(),
            ..NodeDoc::default()
        };
        for (name, value) in &node.properties {
            let field = node.field(name);
            let value = if field.ephemeral { &field.default } else { value };
            doc.properties.insert(name.clone(), value.to_json());
        }
        doc
    }

    /// Serialize to a document. With `delta` set, inherited nodes, groups,
    /// comments and edges merged from an `extends` base are filtered out,
    /// leaving only the authored delta.
    pub fn to_doc(&self, delta: bool) -> NodeDoc {
        let mut doc = NodeDoc {
            title: self.title.clone(),
            id: self.id.clone(),
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            collapsed: self.collapsed,
            inherited: self.inherited,
            registry: if self.registry.is_empty() {
                None
            } else {
                Some(self.registry.clone())
            },
            base_type: self.kind.base_type().to_string(),
            extends: self.extends.clone(),
            ..NodeDoc::default()
        };
        for (name, value) in &self.properties {
            doc.properties.insert(name.clone(), value.to_json());
        }

        for (node_id, node) in &self.nodes {
            if delta && node.inherited() {
                continue;
            }
            let node_doc = match node {
                GraphNode::Leaf(leaf) => Self::leaf_to_doc(leaf),
                GraphNode::Graph(graph) => graph.to_doc(delta),
            };
            doc.nodes.insert(node_id.clone(), node_doc);
        }

        for (output_id, input_ids) in &self.edges {
            let kept: Vec<String> = input_ids
                .iter()
                .filter(|input_id| {
                    if !delta {
                        return true;
                    }
                    !self
                        .inherited_edges
                        .contains(&(output_id.clone(), (*input_id).clone()))
                })
                .cloned()
                .collect();
            if !kept.is_empty() {
                doc.edges.insert(output_id.clone(), kept);
            }
        }

        doc.groups = self
            .groups
            .iter()
            .filter(|g| !delta || !g.inherited)
            .cloned()
            .collect();
        doc.comments = self
            .comments
            .iter()
            .filter(|c| !delta || !c.inherited)
            .cloned()
            .collect();
        doc
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}

/// The node-level digraph and its id mapping.
pub struct BuiltGraph {
    pub graph: DiGraph<String, ()>,
}

impl BuiltGraph {
    pub fn is_cyclic(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    pub fn index_of(&self, node_id: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|ix| self.graph[*ix] == node_id)
    }

    /// Weakly-connected components, each in topological order. Component
    /// membership comes from union-find over the edges; the global
    /// topological sort is partitioned so per-chain order is preserved.
    pub fn chains(&self) -> Result<Vec<Vec<String>>, NodeError> {
        let order = toposort(&self.graph, None)
            .map_err(|_| NodeError::Graph("Graph contains cycles".into()))?;

        let mut union: UnionFind<usize> = UnionFind::new(self.graph.node_count());
        for edge in self.graph.edge_references() {
            union.union(edge.source().index(), edge.target().index());
        }

        let mut chains: IndexMap<usize, Vec<String>> = IndexMap::new();
        for ix in order {
            let root = union.find(ix.index());
            chains
                .entry(root)
                .or_default()
                .push(self.graph[ix].clone());
        }
        Ok(chains.into_values().collect())
    }

    /// All ancestors of a node (nodes it transitively depends on).
    pub fn ancestors(&self, node_id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let Some(start) = self.index_of(node_id) else {
            return result;
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        while let Some(ix) = bfs.next(reversed) {
            if ix != start {
                result.insert(self.graph[ix].clone());
            }
        }
        result
    }

    pub fn descendants(&self, node_id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let Some(start) = self.index_of(node_id) else {
            return result;
        };
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(ix) = bfs.next(&self.graph) {
            if ix != start {
                result.insert(self.graph[ix].clone());
            }
        }
        result
    }

    /// Ancestors plus any forked branches hanging off them that do not
    /// lead to the target — used to preserve side effects when executing
    /// a subgraph up to one node.
    pub fn ancestors_with_forks(&self, node_id: &str) -> HashSet<String> {
        let ancestors = self.ancestors(node_id);
        let mut result = ancestors.clone();
        for ancestor in &ancestors {
            for descendant in self.descendants(ancestor) {
                if descendant != node_id && !ancestors.contains(&descendant) {
                    result.insert(descendant);
                }
            }
        }
        result
    }

    /// Restrict to a node subset, keeping edges internal to it.
    pub fn subgraph(&self, keep: &HashSet<String>) -> BuiltGraph {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        for ix in self.graph.node_indices() {
            let id = &self.graph[ix];
            if keep.contains(id) {
                let new_ix = graph.add_node(id.clone());
                index.insert(id.clone(), new_ix);
            }
        }
        for edge in self.graph.edge_references() {
            let from = &self.graph[edge.source()];
            let to = &self.graph[edge.target()];
            if let (Some(a), Some(b)) = (index.get(from), index.get(to)) {
                graph.update_edge(*a, *b, ());
            }
        }
        BuiltGraph { graph }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_support::Passthrough;
    use storygraph_types::socket_id;

    fn passthrough(graph: &mut Graph) -> String {
        graph.add_leaf(Node::create(Arc::new(Passthrough)).unwrap())
    }

    #[test]
    fn connect_sets_source_and_fans_out() {
        let mut graph = Graph::new(GraphKind::Graph);
        let a = passthrough(&mut graph);
        let b = passthrough(&mut graph);
        let c = passthrough(&mut graph);
        graph.connect_ids(&a, "value", &b, "value").unwrap();
        graph.connect_ids(&a, "value", &c, "value").unwrap();

        let edge = graph.edges.get(&socket_id(&a, "value")).unwrap();
        assert_eq!(edge.len(), 2);
        let b_node = graph.node(&b).unwrap();
        assert_eq!(
            b_node.input_socket("value").unwrap().source,
            Some(SocketRef::new(a.as_str(), "value"))
        );
    }

    #[test]
    fn digraph_excludes_unwired_nodes() {
        let mut graph = Graph::new(GraphKind::Graph);
        let a = passthrough(&mut graph);
        let b = passthrough(&mut graph);
        let _lonely = passthrough(&mut graph);
        graph.connect_ids(&a, "value", &b, "value").unwrap();

        let built = graph.build_digraph();
        assert_eq!(built.graph.node_count(), 2);
        assert!(!built.is_cyclic());
    }

    #[test]
    fn cyclic_graph_detected() {
        let mut graph = Graph::new(GraphKind::Graph);
        let a = passthrough(&mut graph);
        let b = passthrough(&mut graph);
        graph.connect_ids(&a, "value", &b, "value").unwrap();
        graph.connect_ids(&b, "value", &a, "value").unwrap();
        assert!(graph.build_digraph().is_cyclic());
    }

    #[test]
    fn availability_fails_without_input_or_default() {
        let state = GraphState::new();
        let mut graph = Graph::new(GraphKind::Graph);
        let a = passthrough(&mut graph);
        let b = passthrough(&mut graph);
        graph.connect_ids(&a, "value", &b, "value").unwrap();

        let node_b = graph.node(&b).unwrap();
        // b's source produced nothing yet
        assert!(!graph.check_is_available(node_b, &state));
        assert!(node_b.output_socket("value").unwrap().deactivated(&state));
    }

    #[test]
    fn availability_propagates_deactivation() {
        let state = GraphState::new();
        let mut graph = Graph::new(GraphKind::Graph);
        let a = passthrough(&mut graph);
        let b = passthrough(&mut graph);
        let c = passthrough(&mut graph);
        graph.connect_ids(&a, "value", &b, "value").unwrap();
        graph.connect_ids(&b, "value", &c, "value").unwrap();

        // a produced a value but its output was deactivated
        state.set_socket_value(&a, "value", Value::Int(1));
        state.set_socket_deactivated(&a, "value", true);

        assert!(!graph.check_is_available(graph.node(&b).unwrap(), &state));
        assert!(!graph.check_is_available(graph.node(&c).unwrap(), &state));
    }

    #[test]
    fn ancestors_with_forks_includes_branches() {
        let mut graph = Graph::new(GraphKind::Graph);
        let a = passthrough(&mut graph);
        let b = passthrough(&mut graph);
        let c = passthrough(&mut graph);
        let fork = passthrough(&mut graph);
        graph.connect_ids(&a, "value", &b, "value").unwrap();
        graph.connect_ids(&b, "value", &c, "value").unwrap();
        graph.connect_ids(&a, "value", &fork, "value").unwrap();

        let built = graph.build_digraph();
        let plain = built.ancestors(&c);
        assert!(plain.contains(&a) && plain.contains(&b));
        assert!(!plain.contains(&fork));

        let with_forks = built.ancestors_with_forks(&c);
        assert!(with_forks.contains(&fork));
    }
}
