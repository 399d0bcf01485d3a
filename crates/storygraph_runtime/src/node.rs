// Node and socket model.
//
// A Node is pure data (id, properties, declared sockets) plus an attached
// behavior trait object resolved through the registry. Sockets never hold
// values themselves; reads and writes go through the active GraphState, so
// one graph definition can be executed by many states concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use uuid::Uuid;

use crate::error::NodeError;
use crate::graph::Graph;
use crate::state::{GraphState, NodeVerbosity};
use crate::value::Value;

/// Address of a socket: owning node id + socket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketRef {
    pub node_id: String,
    pub name: String,
}

impl SocketRef {
    pub fn new(node_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
        }
    }

    pub fn full_id(&self) -> String {
        storygraph_types::socket_id(&self.node_id, &self.name)
    }
}

/// Advisory socket type tag. Checked nowhere; surfaced to editors.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketType {
    One(String),
    Many(Vec<String>),
}

impl Default for SocketType {
    fn default() -> Self {
        SocketType::One("any".to_string())
    }
}

impl From<&str> for SocketType {
    fn from(s: &str) -> Self {
        SocketType::One(s.to_string())
    }
}

/// A typed, named connection point on a node. The value and deactivation
/// flag are looked up through the active state, keyed by the effective
/// (node, name) pair.
#[derive(Debug, Clone)]
pub struct Socket {
    pub id: String,
    pub name: String,
    pub node_id: String,
    pub source: Option<SocketRef>,
    pub optional: bool,
    pub group: Option<String>,
    pub socket_type: SocketType,
}

impl Socket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            node_id: String::new(),
            source: None,
            optional: false,
            group: None,
            socket_type: SocketType::default(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_type(mut self, socket_type: impl Into<SocketType>) -> Self {
        self.socket_type = socket_type.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn full_id(&self) -> String {
        storygraph_types::socket_id(&self.node_id, &self.name)
    }

    /// Effective value: the source socket's state-scoped value when
    /// connected, otherwise this socket's own slot.
    pub fn value(&self, state: &GraphState) -> Value {
        match &self.source {
            Some(source) => state.socket_value(&source.node_id, &source.name),
            None => state.socket_value(&self.node_id, &self.name),
        }
    }

    /// Writes always target this socket's own slot, even when a source is
    /// wired (reads will shadow it).
    pub fn set_value(&self, state: &GraphState, value: Value) {
        state.set_socket_value(&self.node_id, &self.name, value);
    }

    pub fn deactivated(&self, state: &GraphState) -> bool {
        state.socket_deactivated(&self.node_id, &self.name)
    }

    pub fn set_deactivated(&self, state: &GraphState, deactivated: bool) {
        state.set_socket_deactivated(&self.node_id, &self.name, deactivated);
    }

    pub fn source_deactivated(&self, state: &GraphState) -> bool {
        match &self.source {
            Some(source) => state.socket_deactivated(&source.node_id, &source.name),
            None => false,
        }
    }
}

/// Static configuration slot on a node.
#[derive(Debug, Clone)]
pub struct PropertyField {
    pub name: String,
    pub description: String,
    pub field_type: String,
    pub default: Value,
    pub choices: Option<Vec<Value>>,
    pub readonly: bool,
    pub step: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Ephemeral fields are not persisted past their default and live only
    /// in execution state at runtime.
    pub ephemeral: bool,
}

impl PropertyField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            field_type: field_type.into(),
            default: Value::Unresolved,
            choices: None,
            readonly: false,
            step: None,
            min: None,
            max: None,
            ephemeral: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn default_value(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }

    pub fn choices(mut self, choices: Vec<Value>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "type": self.field_type,
            "default": self.default.to_json(),
            "choices": self.choices.as_ref().map(|c| c.iter().map(Value::to_json).collect::<Vec<_>>()),
            "readonly": self.readonly,
            "step": self.step,
            "min": self.min,
            "max": self.max,
            "ephemeral": self.ephemeral,
        })
    }
}

/// Reserved names that properties may not use.
pub const RESERVED_PROPERTY_NAMES: &[&str] = &["id", "title"];

/// A leaf node: declared sockets and properties plus its behavior.
#[derive(Clone)]
pub struct Node {
    pub id: String,
    pub title: String,
    pub registry: String,
    pub base_type: String,
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
    pub collapsed: bool,
    pub inherited: bool,
    pub properties: IndexMap<String, Value>,
    pub fields: IndexMap<String, PropertyField>,
    pub inputs: Vec<Socket>,
    pub outputs: Vec<Socket>,
    behavior: Arc<dyn NodeBehavior>,
}

impl Node {
    /// Construct a node and let its behavior declare sockets and default
    /// properties. Runs exactly once per node.
    pub fn create(behavior: Arc<dyn NodeBehavior>) -> Result<Node, NodeError> {
        let mut node = Node {
            id: Uuid::new_v4().to_string(),
            title: behavior.default_title().to_string(),
            registry: String::new(),
            base_type: "core/Node".to_string(),
            x: 0,
            y: 0,
            width: 200,
            height: 100,
            collapsed: false,
            inherited: false,
            properties: IndexMap::new(),
            fields: IndexMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            behavior: Arc::clone(&behavior),
        };
        behavior.setup(&mut node);
        for name in node.properties.keys() {
            if RESERVED_PROPERTY_NAMES.contains(&name.as_str()) {
                return Err(NodeError::Registry(format!(
                    "property name '{}' is reserved",
                    name
                )));
            }
        }
        Ok(node)
    }

    pub fn behavior(&self) -> &Arc<dyn NodeBehavior> {
        &self.behavior
    }

    pub fn isolated(&self) -> bool {
        self.behavior.isolated()
    }

    // ── setup-time declaration helpers ─────────────────────────────────

    pub fn add_input(&mut self, socket: Socket) -> &mut Socket {
        let mut socket = socket;
        socket.node_id = self.id.clone();
        self.inputs.push(socket);
        self.inputs.last_mut().unwrap()
    }

    pub fn add_output(&mut self, socket: Socket) -> &mut Socket {
        let mut socket = socket;
        socket.node_id = self.id.clone();
        self.outputs.push(socket);
        self.outputs.last_mut().unwrap()
    }

    pub fn declare_field(&mut self, field: PropertyField) {
        self.properties
            .insert(field.name.clone(), field.default.clone());
        self.fields.insert(field.name.clone(), field);
    }

    pub fn set_default_property(&mut self, name: &str, value: impl Into<Value>) {
        self.properties.insert(name.to_string(), value.into());
    }

    /// Field definition for a property, synthesizing a generic one when
    /// the behavior did not declare it.
    pub fn field(&self, name: &str) -> PropertyField {
        if let Some(field) = self.fields.get(name) {
            return field.clone();
        }
        let type_name = self
            .properties
            .get(name)
            .map(|v| v.type_name())
            .unwrap_or("str");
        let type_name = match type_name {
            "unresolved" | "none" => "str",
            other => other,
        };
        PropertyField::new(name, type_name)
    }

    pub fn input_socket(&self, name: &str) -> Option<&Socket> {
        self.inputs.iter().find(|s| s.name == name)
    }

    pub fn output_socket(&self, name: &str) -> Option<&Socket> {
        self.outputs.iter().find(|s| s.name == name)
    }

    /// Author-time property value (no state involved).
    pub fn stored_property(&self, name: &str) -> Value {
        self.properties.get(name).cloned().unwrap_or(Value::Unresolved)
    }

    pub fn set_stored_property(&mut self, name: &str, value: impl Into<Value>) {
        self.properties.insert(name.to_string(), value.into());
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.title, self.id)
    }
}

/// Behavior attached to a leaf node through the registry.
#[async_trait]
pub trait NodeBehavior: Send + Sync {
    fn default_title(&self) -> &str;

    /// Declare sockets and default properties. Called once at node
    /// construction.
    fn setup(&self, node: &mut Node);

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError>;

    /// Isolated nodes never run in the automatic sweep; they are invoked
    /// through side channels (events, commands, explicit calls).
    fn isolated(&self) -> bool {
        false
    }

    /// Error-handler nodes implement `catch`; the scheduler offers
    /// unhandled node errors to them in turn.
    fn handles_errors(&self) -> bool {
        false
    }

    async fn catch(&self, _cx: NodeCx<'_>, _err: &NodeError) -> Result<bool, NodeError> {
        Ok(false)
    }
}

/// Per-run context handed to node behaviors: the node, its containing
/// graph and the active state, plus input/output/property helpers.
#[derive(Clone, Copy)]
pub struct NodeCx<'a> {
    pub node: &'a Node,
    pub graph: &'a Arc<Graph>,
    pub state: &'a GraphState,
}

impl<'a> NodeCx<'a> {
    pub fn new(node: &'a Node, graph: &'a Arc<Graph>, state: &'a GraphState) -> Self {
        Self { node, graph, state }
    }

    pub fn verbosity(&self) -> NodeVerbosity {
        self.state.verbosity()
    }

    /// Value for an input socket, falling back to the property of the
    /// same name when the socket is not connected.
    pub fn input(&self, name: &str) -> Value {
        if let Some(socket) = self.node.input_socket(name) {
            if socket.source.is_some() {
                return socket.value(self.state);
            }
        }
        self.property(name)
    }

    /// All input values keyed by socket name, including property-only
    /// names.
    pub fn input_values(&self) -> IndexMap<String, Value> {
        let mut values = IndexMap::new();
        for socket in &self.node.inputs {
            values.insert(socket.name.clone(), self.input(&socket.name));
        }
        for name in self.node.properties.keys() {
            if !values.contains_key(name) {
                values.insert(name.clone(), self.property(name));
            }
        }
        values
    }

    pub fn input_connected(&self, name: &str) -> bool {
        self.node
            .input_socket(name)
            .map(|s| s.source.is_some())
            .unwrap_or(false)
    }

    /// Property value: state-scoped override first, then the node's
    /// stored value.
    pub fn property(&self, name: &str) -> Value {
        self.state
            .node_property(&self.node.id, name)
            .unwrap_or_else(|| self.node.stored_property(name))
    }

    /// Runtime property writes are state-scoped; they shadow the stored
    /// value for the remainder of this execution.
    pub fn set_property(&self, name: &str, value: impl Into<Value>) {
        self.state
            .set_node_property(&self.node.id, name, value.into());
    }

    pub fn require_input(&self, name: &str) -> Result<Value, NodeError> {
        self.require_input_ext(name, false)
    }

    pub fn require_input_ext(&self, name: &str, none_is_set: bool) -> Result<Value, NodeError> {
        let value = self.input(name);
        if !value.is_set(none_is_set) {
            return Err(NodeError::input(
                &self.node.title,
                name,
                format!("Value is not set: {:?}", value),
            ));
        }
        Ok(value)
    }

    /// Input that is returned as Null when unresolved.
    pub fn normalized_input(&self, name: &str) -> Value {
        let value = self.input(name);
        if value.is_set(false) { value } else { Value::Null }
    }

    /// Required numeric input; strings are parsed.
    pub fn require_number(&self, name: &str) -> Result<f64, NodeError> {
        let value = self.require_input(name)?;
        match &value {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| NodeError::input(&self.node.title, name, "Invalid number")),
            _ => Err(NodeError::input(
                &self.node.title,
                name,
                "Value must be a number",
            )),
        }
    }

    pub fn set_output(&self, name: &str, value: impl Into<Value>) {
        if let Some(socket) = self.node.output_socket(name) {
            socket.set_value(self.state, value.into());
        }
    }

    pub fn set_outputs<I, V>(&self, values: I)
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<Value>,
    {
        for (name, value) in values {
            self.set_output(name, value);
        }
    }

    pub fn deactivate_output(&self, name: &str, deactivated: bool) {
        if let Some(socket) = self.node.output_socket(name) {
            socket.set_deactivated(self.state, deactivated);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal behavior that declares one input and one output and copies
    /// the value through.
    pub struct Passthrough;

    #[async_trait]
    impl NodeBehavior for Passthrough {
        fn default_title(&self) -> &str {
            "Passthrough"
        }

        fn setup(&self, node: &mut Node) {
            node.add_input(Socket::new("value"));
            node.add_output(Socket::new("value"));
        }

        async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
            let value = cx.input("value");
            cx.set_output("value", value);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::Passthrough;
    use super::*;

    #[test]
    fn setup_declares_sockets_once() {
        let node = Node::create(Arc::new(Passthrough)).unwrap();
        assert_eq!(node.inputs.len(), 1);
        assert_eq!(node.outputs.len(), 1);
        assert_eq!(node.inputs[0].node_id, node.id);
    }

    #[test]
    fn socket_reads_chase_source() {
        let state = GraphState::new();
        let mut node = Node::create(Arc::new(Passthrough)).unwrap();
        node.inputs[0].source = Some(SocketRef::new("upstream", "out"));

        state.set_socket_value("upstream", "out", Value::Int(7));
        assert_eq!(node.inputs[0].value(&state), Value::Int(7));

        // writing to a connected input is legal but shadowed by reads
        node.inputs[0].set_value(&state, Value::Int(99));
        assert_eq!(node.inputs[0].value(&state), Value::Int(7));
        assert_eq!(state.socket_value(&node.id, "value"), Value::Int(99));
    }

    #[test]
    fn generic_field_synthesized_from_property_type() {
        let mut node = Node::create(Arc::new(Passthrough)).unwrap();
        node.set_default_property("count", 3i64);
        let field = node.field("count");
        assert_eq!(field.field_type, "int");
    }
}
