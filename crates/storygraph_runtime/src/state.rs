// Per-execution state.
//
// Graph definitions hold no runtime values; everything an execution
// produces lives in a GraphState keyed by node id and socket/property
// name. Nesting shares `shared` and `stack` by handle while `data` is
// per scope, so inner loops and subgraphs see the same shared map as
// their parent without leaking socket values across scopes.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::scene::Scene;
use crate::value::Value;

/// How chatty an execution should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum NodeVerbosity {
    Silent,
    #[default]
    Normal,
    Verbose,
}

/// Point-in-time execution trace snapshot for one node, consumed by the
/// editor UI. Never consulted by execution logic.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub node_id: String,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub deactivated: bool,
    pub error: Option<String>,
    pub input_values: IndexMap<String, String>,
    pub output_values: IndexMap<String, String>,
    pub properties: IndexMap<String, String>,
}

impl NodeState {
    pub fn flattened(&self) -> Value {
        let mut map = IndexMap::new();
        map.insert("node_id".to_string(), Value::String(self.node_id.clone()));
        map.insert(
            "start_time".to_string(),
            self.start_time.map(Value::Float).unwrap_or(Value::Null),
        );
        map.insert(
            "end_time".to_string(),
            self.end_time.map(Value::Float).unwrap_or(Value::Null),
        );
        map.insert("deactivated".to_string(), Value::Bool(self.deactivated));
        map.insert(
            "error".to_string(),
            self.error.clone().map(Value::String).unwrap_or(Value::Null),
        );
        for (key, values) in [
            ("input_values", &self.input_values),
            ("output_values", &self.output_values),
            ("properties", &self.properties),
        ] {
            map.insert(
                key.to_string(),
                Value::Dict(
                    values
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                ),
            );
        }
        Value::Dict(map)
    }
}

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct StateInner {
    data: Mutex<IndexMap<String, Value>>,
    shared: Arc<Mutex<IndexMap<String, Value>>>,
    stack: Arc<Mutex<Vec<NodeState>>>,
    outer: Option<GraphState>,
    graph_id: Mutex<Option<String>>,
    verbosity: Mutex<NodeVerbosity>,
    scene: Mutex<Option<Scene>>,
}

/// Cheap cloneable handle to one execution scope.
#[derive(Clone)]
pub struct GraphState {
    inner: Arc<StateInner>,
}

impl Default for GraphState {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StateInner {
                data: Mutex::new(IndexMap::new()),
                shared: Arc::new(Mutex::new(IndexMap::new())),
                stack: Arc::new(Mutex::new(Vec::new())),
                outer: None,
                graph_id: Mutex::new(None),
                verbosity: Mutex::new(NodeVerbosity::default()),
                scene: Mutex::new(None),
            }),
        }
    }

    /// Create the nested scope for executing `graph_id` beneath `outer`.
    /// `shared` and `stack` are the same maps as the parent's; `data` is
    /// fresh.
    pub fn nested(outer: &GraphState, graph_id: &str) -> Self {
        Self {
            inner: Arc::new(StateInner {
                data: Mutex::new(IndexMap::new()),
                shared: Arc::clone(&outer.inner.shared),
                stack: Arc::clone(&outer.inner.stack),
                outer: Some(outer.clone()),
                graph_id: Mutex::new(Some(graph_id.to_string())),
                verbosity: Mutex::new(outer.verbosity()),
                scene: Mutex::new(outer.scene()),
            }),
        }
    }

    pub fn same_state(&self, other: &GraphState) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn outer(&self) -> Option<&GraphState> {
        self.inner.outer.as_ref()
    }

    pub fn graph_id(&self) -> Option<String> {
        self.inner.graph_id.lock().clone()
    }

    pub fn set_graph_id(&self, id: &str) {
        *self.inner.graph_id.lock() = Some(id.to_string());
    }

    pub fn verbosity(&self) -> NodeVerbosity {
        *self.inner.verbosity.lock()
    }

    pub fn set_verbosity(&self, verbosity: NodeVerbosity) {
        *self.inner.verbosity.lock() = verbosity;
    }

    /// The scene this execution runs under, if any. Falls back through
    /// outer scopes.
    pub fn scene(&self) -> Option<Scene> {
        if let Some(scene) = self.inner.scene.lock().clone() {
            return Some(scene);
        }
        self.inner.outer.as_ref().and_then(|outer| outer.scene())
    }

    pub fn set_scene(&self, scene: Scene) {
        *self.inner.scene.lock() = Some(scene);
    }

    // ── generic data keys ──────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.data.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.inner.data.lock().insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.data.lock().shift_remove(key)
    }

    pub fn data_snapshot(&self) -> IndexMap<String, Value> {
        self.inner.data.lock().clone()
    }

    // ── shared map (spans nested scopes) ───────────────────────────────

    pub fn shared_get(&self, key: &str) -> Option<Value> {
        self.inner.shared.lock().get(key).cloned()
    }

    pub fn shared_set(&self, key: &str, value: Value) {
        self.inner.shared.lock().insert(key.to_string(), value);
    }

    pub fn shared_remove(&self, key: &str) -> Option<Value> {
        self.inner.shared.lock().shift_remove(key)
    }

    pub fn shared_snapshot(&self) -> IndexMap<String, Value> {
        self.inner.shared.lock().clone()
    }

    pub fn creative_mode(&self) -> bool {
        self.shared_get("creative_mode")
            .map(|v| v.as_bool())
            .unwrap_or(false)
    }

    // ── socket value / activation keyspaces ────────────────────────────

    /// Storage key for a socket's value slot. Public so callers can seed
    /// state values (graph inputs, function arguments) ahead of execution.
    pub fn socket_key(node_id: &str, socket_name: &str) -> String {
        format!("{}__socket.{}", node_id, socket_name)
    }

    fn socket_value_key(node_id: &str, socket_name: &str) -> String {
        Self::socket_key(node_id, socket_name)
    }

    fn socket_state_key(node_id: &str, socket_name: &str) -> String {
        format!("{}__socket_deactivated.{}", node_id, socket_name)
    }

    fn property_key(node_id: &str, name: &str) -> String {
        format!("{}.{}", node_id, name)
    }

    pub fn socket_value(&self, node_id: &str, socket_name: &str) -> Value {
        self.get(&Self::socket_value_key(node_id, socket_name))
            .unwrap_or(Value::Unresolved)
    }

    pub fn set_socket_value(&self, node_id: &str, socket_name: &str, value: Value) {
        self.set(&Self::socket_value_key(node_id, socket_name), value);
    }

    pub fn socket_deactivated(&self, node_id: &str, socket_name: &str) -> bool {
        self.get(&Self::socket_state_key(node_id, socket_name))
            .map(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_socket_deactivated(&self, node_id: &str, socket_name: &str, deactivated: bool) {
        self.set(
            &Self::socket_state_key(node_id, socket_name),
            Value::Bool(deactivated),
        );
    }

    /// State-scoped property override; `None` means "fall back to the
    /// node's stored property".
    pub fn node_property(&self, node_id: &str, name: &str) -> Option<Value> {
        self.get(&Self::property_key(node_id, name))
    }

    pub fn set_node_property(&self, node_id: &str, name: &str, value: Value) {
        self.set(&Self::property_key(node_id, name), value);
    }

    // ── execution trace ────────────────────────────────────────────────

    pub fn push_trace(&self, entry: NodeState) {
        self.inner.stack.lock().push(entry);
    }

    pub fn take_trace(&self) -> Vec<NodeState> {
        std::mem::take(&mut *self.inner.stack.lock())
    }

    pub fn trace_len(&self) -> usize {
        self.inner.stack.lock().len()
    }
}

impl std::fmt::Debug for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphState")
            .field("graph_id", &self.graph_id())
            .field("outer", &self.inner.outer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_values_default_unresolved() {
        let state = GraphState::new();
        assert!(state.socket_value("n1", "value").is_unresolved());
        state.set_socket_value("n1", "value", Value::Int(5));
        assert_eq!(state.socket_value("n1", "value"), Value::Int(5));
        assert!(!state.socket_deactivated("n1", "value"));
    }

    #[test]
    fn nested_scopes_share_shared_but_not_data() {
        let outer = GraphState::new();
        outer.shared_set("mode", Value::String("play".into()));
        outer.set_socket_value("n1", "value", Value::Int(1));

        let inner = GraphState::nested(&outer, "g1");
        assert_eq!(inner.shared_get("mode"), Some(Value::String("play".into())));
        assert!(inner.socket_value("n1", "value").is_unresolved());

        inner.shared_set("flag", Value::Bool(true));
        assert_eq!(outer.shared_get("flag"), Some(Value::Bool(true)));
    }

    #[test]
    fn two_states_do_not_leak_socket_values() {
        let a = GraphState::new();
        let b = GraphState::new();
        a.set_socket_value("n1", "value", Value::Int(42));
        assert!(b.socket_value("n1", "value").is_unresolved());
    }
}
