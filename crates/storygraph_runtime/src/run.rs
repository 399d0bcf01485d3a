// Callable function subgraphs and module execution.
//
// A DefineFunction node marks the subgraph feeding it as a callable unit;
// GetFunction wraps it into a FunctionWrapper that seeds FunctionArgument
// nodes from call kwargs, executes the ancestor subgraph (plus forks, to
// preserve side effects) and captures the value a FunctionReturn produced.
// This is how graph-authored logic becomes invocable as a tool call.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::error::{ExceptionWrapper, NodeError};
use crate::event::ScriptEvent;
use crate::exec::{self, ExecOptions};
use crate::graph::{Graph, GraphKind, GraphNode};
use crate::node::{Node, NodeBehavior, NodeCx, PropertyField, Socket};
use crate::registry::Registry;
use crate::signals;
use crate::state::{GraphState, NodeVerbosity};
use crate::value::Value;

pub const ARGUMENT_REGISTRY: &str = "core/functions/Argument";
pub const DEFINE_FUNCTION_REGISTRY: &str = "core/functions/DefineFunction";

const FN_RESULT_KEY: &str = "__fn_result";

fn fn_arg_key(node_id: &str) -> String {
    format!("{}__fn_arg_value", node_id)
}

/// Description of one callable parameter, for exposure to a tool-calling
/// layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub typ: String,
}

/// A callable handle onto a subgraph. Invoking it executes the endpoint's
/// ancestor subgraph (or the whole containing graph when the endpoint is
/// the graph itself), feeding named arguments into FunctionArgument nodes
/// and collecting the FunctionReturn value.
#[derive(Clone)]
pub struct FunctionWrapper {
    endpoint_id: String,
    graph: Arc<Graph>,
    state: GraphState,
}

impl FunctionWrapper {
    pub fn new(endpoint_id: impl Into<String>, graph: Arc<Graph>, state: GraphState) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            graph,
            state,
        }
    }

    /// Wrapper whose endpoint is the containing graph itself.
    pub fn for_graph(graph: Arc<Graph>, state: GraphState) -> Self {
        let endpoint_id = graph.id.clone();
        Self::new(endpoint_id, graph, state)
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    fn endpoint_is_graph(&self) -> bool {
        self.endpoint_id == self.graph.id
    }

    /// FunctionArgument nodes participating in a call: those connected to
    /// the endpoint when it is an inner node, all of them when the
    /// endpoint is the graph itself.
    pub fn argument_nodes(&self) -> Vec<&GraphNode> {
        let is_argument = |node: &&GraphNode| {
            node.as_leaf()
                .map(|leaf| leaf.registry == ARGUMENT_REGISTRY)
                .unwrap_or(false)
        };
        if self.endpoint_is_graph() {
            self.graph.nodes.values().filter(is_argument).collect()
        } else {
            let built = self.graph.build_digraph();
            let connected = built.ancestors_with_forks(&self.endpoint_id);
            self.graph
                .nodes
                .values()
                .filter(|node| connected.contains(node.id()))
                .filter(is_argument)
                .collect()
        }
    }

    /// Structured description of this callable for an LLM tool-calling
    /// layer: name, typed arguments and usage instructions.
    pub fn tool_description(&self, name: &str, instructions: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "instructions": instructions,
            "arguments": self
                .arguments()
                .iter()
                .map(|arg| serde_json::json!({"name": arg.name, "type": arg.typ}))
                .collect::<Vec<_>>(),
        })
    }

    /// Declared parameters, for tool-call exposure.
    pub fn arguments(&self) -> Vec<Argument> {
        self.argument_nodes()
            .iter()
            .map(|node| Argument {
                name: node
                    .stored_property("name")
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                typ: node
                    .stored_property("typ")
                    .as_str()
                    .unwrap_or("str")
                    .to_string(),
            })
            .collect()
    }

    /// Invoke the function. Arguments are matched to FunctionArgument
    /// nodes by name and coerced to each argument's declared type.
    pub fn call(
        &self,
        kwargs: IndexMap<String, Value>,
    ) -> BoxFuture<'_, Result<Value, NodeError>> {
        Box::pin(async move {
            let mut opts = ExecOptions::default();
            for node in self.argument_nodes() {
                let name = node.stored_property("name");
                let Some(name) = name.as_str() else { continue };
                let typ = node.stored_property("typ");
                let typ = typ.as_str().unwrap_or("str");
                let value = match kwargs.get(name) {
                    Some(value) if !value.is_unresolved() => {
                        value.coerce(typ, node.title(), name)?
                    }
                    _ => Value::Unresolved,
                };
                opts = opts.with_state_value(fn_arg_key(node.id()), value);
            }

            let state = if self.endpoint_is_graph() {
                exec::execute(&self.graph, Some(&self.state), opts).await?
            } else {
                exec::execute_to_node(&self.graph, &self.endpoint_id, Some(&self.state), true, opts)
                    .await?
            };

            let result = state.get(FN_RESULT_KEY).unwrap_or(Value::Null);
            if state.verbosity() >= NodeVerbosity::Verbose {
                info!(result = ?result, endpoint = %self.endpoint_id, "function result");
            }
            Ok(result)
        })
    }
}

impl std::fmt::Debug for FunctionWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<function {}>", self.endpoint_id)
    }
}

/// Executing a Function graph in a sweep publishes its wrapper on the
/// graph's `fn` output socket instead of running the body.
pub fn publish_function(graph: &Arc<Graph>, state: &GraphState) {
    let wrapper = FunctionWrapper::for_graph(Arc::clone(graph), state.clone());
    state.set_socket_value(&graph.id, "fn", Value::Function(wrapper));
}

// ── function nodes ─────────────────────────────────────────────────────

/// One named, typed function parameter; its output carries the seeded
/// call argument during function execution.
pub struct FunctionArgument;

#[async_trait]
impl NodeBehavior for FunctionArgument {
    fn default_title(&self) -> &str {
        "Argument"
    }

    fn setup(&self, node: &mut Node) {
        node.declare_field(PropertyField::new("name", "str").description("The name of the argument"));
        node.declare_field(
            PropertyField::new("typ", "str")
                .description("The type of the argument")
                .default_value("str")
                .choices(vec![
                    Value::from("str"),
                    Value::from("int"),
                    Value::from("float"),
                    Value::from("bool"),
                ]),
        );
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let value = cx
            .state
            .get(&fn_arg_key(&cx.node.id))
            .unwrap_or(Value::Unresolved);
        cx.set_output("value", value);
        Ok(())
    }
}

/// Captures the function's return value and short-circuits the rest of
/// the subgraph.
pub struct FunctionReturn;

#[async_trait]
impl NodeBehavior for FunctionReturn {
    fn default_title(&self) -> &str {
        "Return"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("value"));
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let value = cx.input("value");
        if value.is_unresolved() {
            return Ok(());
        }
        cx.set_output("value", value.clone());
        cx.state.set(FN_RESULT_KEY, value);
        if cx.verbosity() >= NodeVerbosity::Verbose {
            info!(node = %cx.node.id, "function return");
        }
        Err(NodeError::stop_graph(format!(
            "Function return: {}",
            cx.node.id
        )))
    }
}

/// Marks the subgraph feeding its `nodes` input as a named function.
/// Never runs in the sweep; GetFunction resolves it.
pub struct DefineFunction;

#[async_trait]
impl NodeBehavior for DefineFunction {
    fn default_title(&self) -> &str {
        "Define Function"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("nodes"));
        node.add_input(Socket::new("name").with_type("str"));
        node.declare_field(PropertyField::new("name", "str").description("The name of the function"));
    }

    fn isolated(&self) -> bool {
        true
    }

    async fn run(&self, _cx: NodeCx<'_>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Build a wrapper for the subgraph feeding a DefineFunction node.
pub fn wrap_define_function(
    define_node: &Node,
    graph: &Arc<Graph>,
    state: &GraphState,
) -> Result<FunctionWrapper, NodeError> {
    let socket = define_node
        .input_socket("nodes")
        .ok_or_else(|| NodeError::Graph("DefineFunction has no nodes input".into()))?;
    let source = socket
        .source
        .as_ref()
        .ok_or_else(|| NodeError::Graph("Nodes input not connected".into()))?;
    Ok(FunctionWrapper::new(
        source.node_id.clone(),
        Arc::clone(graph),
        state.clone(),
    ))
}

/// Locates a DefineFunction by name and outputs its wrapper.
pub struct GetFunction;

#[async_trait]
impl NodeBehavior for GetFunction {
    fn default_title(&self) -> &str {
        "Get Function"
    }

    fn setup(&self, node: &mut Node) {
        node.declare_field(PropertyField::new("name", "str").description("The name of the function"));
        node.add_output(Socket::new("fn").with_type("function"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let name = cx.require_input("name")?;
        let name = name.as_str().unwrap_or_default();

        let define_node = cx
            .graph
            .find_nodes(|node| {
                node.as_leaf()
                    .map(|leaf| {
                        leaf.registry == DEFINE_FUNCTION_REGISTRY
                            && leaf.stored_property("name").as_str() == Some(name)
                    })
                    .unwrap_or(false)
            })
            .next()
            .and_then(GraphNode::as_leaf)
            .ok_or_else(|| NodeError::Graph(format!("Function {} not found", name)))?;

        let wrapper = wrap_define_function(define_node, cx.graph, cx.state)?;
        cx.set_output("fn", Value::Function(wrapper));
        Ok(())
    }
}

/// Calls a function wrapper with an argument dict.
pub struct CallFunction;

#[async_trait]
impl NodeBehavior for CallFunction {
    fn default_title(&self) -> &str {
        "Call Function"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("fn").with_type("function"));
        node.add_input(Socket::new("args").optional());
        node.declare_field(
            PropertyField::new("args", "dict")
                .description("The arguments to pass to the function")
                .default_value(Value::Dict(IndexMap::new())),
        );
        node.add_output(Socket::new("result"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let Value::Function(wrapper) = cx.input("fn") else {
            return Err(NodeError::input(
                &cx.node.title,
                "fn",
                "fn must be a function",
            ));
        };
        let args = match cx.input("args") {
            Value::Dict(map) => map,
            _ => IndexMap::new(),
        };
        let result = wrapper.call(args).await?;
        cx.set_output("result", result);
        Ok(())
    }
}

/// Calls the supplied function once per item in a list, passing the item
/// under the configured argument name.
pub struct CallForEach;

#[async_trait]
impl NodeBehavior for CallForEach {
    fn default_title(&self) -> &str {
        "Call For Each"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state"));
        node.add_input(Socket::new("fn").with_type("function"));
        node.add_input(Socket::new("items").with_type("list"));
        node.declare_field(
            PropertyField::new("argument_name", "str")
                .description("The name of the argument to pass to the function")
                .default_value("item"),
        );
        node.add_output(Socket::new("state"));
        node.add_output(Socket::new("results").with_type("list"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let Value::Function(wrapper) = cx.input("fn") else {
            return Err(NodeError::input(
                &cx.node.title,
                "fn",
                "fn must be a function",
            ));
        };
        let items = match cx.input("items") {
            Value::List(items) => items,
            _ => {
                return Err(NodeError::input(
                    &cx.node.title,
                    "items",
                    "items must be a list",
                ));
            }
        };
        let argument_name = cx.property("argument_name");
        let Some(argument_name) = argument_name.as_str().filter(|s| !s.is_empty()) else {
            return Err(NodeError::input(
                &cx.node.title,
                "argument_name",
                "Argument name is required",
            ));
        };

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let mut kwargs = IndexMap::new();
            kwargs.insert(argument_name.to_string(), item);
            results.push(wrapper.call(kwargs).await?);
        }

        cx.set_output("state", cx.input("state"));
        cx.set_output("results", Value::List(results));
        Ok(())
    }
}

// ── module execution ───────────────────────────────────────────────────

/// Runs a node module from memory as an awaited child task so it can be
/// cancelled (scene reset) without corrupting the parent execution.
pub struct RunModule;

#[async_trait]
impl NodeBehavior for RunModule {
    fn default_title(&self) -> &str {
        "Run Module"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("module"));
        node.add_output(Socket::new("done").with_type("bool"));
        node.add_output(Socket::new("failed").with_type("str"));
        node.add_output(Socket::new("cancelled").with_type("bool"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let module_value = cx.input("module");
        let Value::Module(module) = &module_value else {
            return Err(NodeError::input(
                &cx.node.title,
                "module",
                "Module must be a graph",
            ));
        };

        if cx.verbosity() >= NodeVerbosity::Verbose {
            debug!(module = %module.title, "running module");
        }

        if let Some(outer) = cx.state.outer() {
            if outer.get("_in_run_module") == Some(module_value.clone()) {
                return Err(NodeError::Graph(format!(
                    "Infinite loop detected. Running module from within itself: {}",
                    cx.node.title
                )));
            }
        }
        cx.state.set("_in_run_module", module_value.clone());

        // quarantined state: fresh data, selected shared flags carried over
        let quarantined = GraphState::new();
        quarantined.shared_set(
            "creative_mode",
            Value::Bool(cx.state.creative_mode()),
        );
        quarantined.shared_set(
            "nested_scene_loop",
            Value::Bool(matches!(module.kind, GraphKind::SceneLoop(_))),
        );
        if let Some(scene) = cx.state.scene() {
            quarantined.set_scene(scene);
        }

        let task_module = Arc::clone(module);
        let task_state = quarantined.clone();
        let task = tokio::spawn(async move {
            if task_module.kind.is_loop() {
                exec::execute_loop(&task_module, &task_state, ExecOptions::default()).await
            } else {
                exec::execute(&task_module, Some(&task_state), ExecOptions::default())
                    .await
                    .map(|_| ())
            }
        });

        let task_key = format!("__run_{}", module.id);
        if let Some(scene) = cx.state.scene() {
            scene.register_task(&task_key, task.abort_handle());
        }

        let result = task.await;

        cx.state.remove("_in_run_module");
        if let Some(scene) = cx.state.scene() {
            scene.remove_task(&task_key);
        }

        match result {
            Ok(Ok(())) => {
                cx.set_output("done", true);
                info!(module = %module.title, "module execution complete");
                Ok(())
            }
            Ok(Err(err)) if err.is_passthrough() => {
                cx.set_output("done", true);
                debug!(module = %module.title, "caught scene control signal");
                Err(err)
            }
            Ok(Err(err)) => {
                cx.set_output("failed", err.to_string());
                error!(module = %module.title, error = %err, "error running module");
                Err(NodeError::Module(format!("Error running module: {}", err)))
            }
            Err(join_err) if join_err.is_cancelled() => {
                cx.set_output("cancelled", true);
                info!(module = %module.title, "module execution was cancelled");
                Ok(())
            }
            Err(join_err) => {
                cx.set_output("failed", join_err.to_string());
                Err(NodeError::Module(format!(
                    "Error running module: {}",
                    join_err
                )))
            }
        }
    }
}

/// Cooperative pause: sets a shared flag and polls until an external
/// actor clears it or the scene goes inactive.
pub struct Breakpoint;

pub const BREAKPOINT_FLAG: &str = "__breakpoint";

#[async_trait]
impl NodeBehavior for Breakpoint {
    fn default_title(&self) -> &str {
        "Breakpoint"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state"));
        node.declare_field(
            PropertyField::new("active", "bool")
                .description("Whether the breakpoint is active")
                .default_value(true),
        );
        node.add_output(Socket::new("state"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let incoming = cx.input("state");
        let scene = cx.state.scene();
        let mut active = cx.property("active").as_bool();

        if let Some(scene) = &scene {
            if scene.environment() != "creative" {
                active = false;
                debug!(node = %cx.node.id, "breakpoint disabled outside creative environment");
            }
        }

        if !active {
            cx.set_output("state", incoming);
            return Ok(());
        }

        cx.state
            .shared_set(BREAKPOINT_FLAG, Value::String(cx.node.id.clone()));
        if cx.verbosity() >= NodeVerbosity::Normal {
            info!(node = %cx.node.id, "breakpoint");
        }

        if let Some(signal) = signals::get("nodes_breakpoint") {
            let event = ScriptEvent::new("nodes_breakpoint");
            event.set_field("node_id", Value::String(cx.node.id.clone()));
            signal.send(event).await?;
        }

        loop {
            let held = cx
                .state
                .shared_get(BREAKPOINT_FLAG)
                .map(|v| v.as_bool())
                .unwrap_or(false);
            if !held {
                break;
            }
            if let Some(scene) = &scene {
                if !scene.active() {
                    warn!(node = %cx.node.id, "breakpoint cancelled");
                    cx.set_output("state", incoming);
                    return Err(NodeError::stop_graph("Breakpoint cancelled"));
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }

        if cx.verbosity() >= NodeVerbosity::Normal {
            info!(node = %cx.node.id, "breakpoint released");
        }
        cx.set_output("state", incoming);
        Ok(())
    }
}

// ── error handling nodes ───────────────────────────────────────────────

/// Catches unhandled node errors by invoking a graph-authored function
/// with the wrapped exception; a truthy return claims the error.
pub struct ErrorHandler;

#[async_trait]
impl NodeBehavior for ErrorHandler {
    fn default_title(&self) -> &str {
        "Error Handler"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("fn").with_type("function"));
    }

    fn isolated(&self) -> bool {
        true
    }

    fn handles_errors(&self) -> bool {
        true
    }

    async fn run(&self, _cx: NodeCx<'_>) -> Result<(), NodeError> {
        Ok(())
    }

    async fn catch(&self, cx: NodeCx<'_>, err: &NodeError) -> Result<bool, NodeError> {
        info!(error = %err, "error caught");

        let socket = cx
            .node
            .input_socket("fn")
            .ok_or_else(|| NodeError::Graph("ErrorHandler has no fn input".into()))?;
        let Some(source) = &socket.source else {
            return Ok(false);
        };
        let Some(fn_node) = cx.graph.node(&source.node_id) else {
            return Ok(false);
        };

        // run the supplier node to materialize the wrapper, then read it
        exec::run_node(cx.graph, fn_node, cx.state).await?;
        let value = cx.state.socket_value(&source.node_id, &source.name);
        let Value::Function(wrapper) = value else {
            error!("fn must be a function wrapper");
            return Ok(false);
        };

        let exc = ExceptionWrapper::from_error(err);
        let mut exc_fields = IndexMap::new();
        exc_fields.insert("name".to_string(), Value::String(exc.name));
        exc_fields.insert("message".to_string(), Value::String(exc.message));

        let mut kwargs = IndexMap::new();
        kwargs.insert("exc".to_string(), Value::Dict(exc_fields));

        let caught = wrapper.call(kwargs).await?;
        debug!(result = ?caught, "error handler result");
        Ok(caught.as_bool())
    }
}

/// Unpacks a wrapped exception into its name and message.
pub struct UnpackException;

#[async_trait]
impl NodeBehavior for UnpackException {
    fn default_title(&self) -> &str {
        "Unpack Exception"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("exc").with_type("exception"));
        node.add_output(Socket::new("name"));
        node.add_output(Socket::new("message"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let Value::Dict(fields) = cx.input("exc") else {
            error!("expected wrapped exception");
            return Ok(());
        };
        cx.set_output("name", fields.get("name").cloned().unwrap_or(Value::Null));
        cx.set_output(
            "message",
            fields.get("message").cloned().unwrap_or(Value::Null),
        );
        Ok(())
    }
}

pub fn register(registry: &Registry) -> Result<(), NodeError> {
    registry.register_behavior(ARGUMENT_REGISTRY, Arc::new(FunctionArgument), "core/Node")?;
    registry.register_behavior("core/functions/Return", Arc::new(FunctionReturn), "core/Node")?;
    registry.register_behavior(DEFINE_FUNCTION_REGISTRY, Arc::new(DefineFunction), "core/Node")?;
    registry.register_behavior("core/functions/GetFunction", Arc::new(GetFunction), "core/Node")?;
    registry.register_behavior("core/functions/CallFunction", Arc::new(CallFunction), "core/Node")?;
    registry.register_behavior("core/functions/CallForEach", Arc::new(CallForEach), "core/Node")?;
    registry.register_behavior("core/functions/Breakpoint", Arc::new(Breakpoint), "core/Node")?;
    registry.register_behavior(
        "core/functions/UnpackException",
        Arc::new(UnpackException),
        "core/Node",
    )?;
    registry.register_behavior("core/RunModule", Arc::new(RunModule), "core/Node")?;
    registry.register_behavior("core/ErrorHandler", Arc::new(ErrorHandler), "core/Node")?;
    Ok(())
}
