// Graph execution scheduler.
//
// Execution walks weakly-connected chains of the node digraph, ordered by
// Stage priority, and runs each chain's nodes in topological order inside
// a nested GraphState. Control-flow signals (loop break/continue/exit,
// graph stop) travel through the Result channel and are classified here;
// they are never offered to error handler nodes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::NodeError;
use crate::event::ScriptEvent;
use crate::graph::{
    Graph, GraphKind, GraphNode, LoopConfig, OUTPUT_REGISTRY, StateCallback,
};
use crate::node::NodeCx;
use crate::state::{GraphState, NodeState, NodeVerbosity, now_secs};
use crate::value::Value;

/// Options for a single `execute`/`execute_to_node` call.
#[derive(Default)]
pub struct ExecOptions {
    pub state_values: Vec<(String, Value)>,
    pub callbacks: Vec<StateCallback>,
    /// Run chains whose sink node is isolated (event/command chains).
    pub run_isolated: bool,
    /// Suppress execution-trace emission (used by subgraph evaluation).
    pub suppress_trace: bool,
}

impl ExecOptions {
    pub fn with_state_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state_values.push((key.into(), value));
        self
    }

    /// Seed a named graph input by locating its Input marker node.
    pub fn with_input(mut self, graph: &Graph, input_name: &str, value: Value) -> Self {
        for node in graph.input_nodes() {
            if node.stored_property("input_name").as_str() == Some(input_name) {
                self.state_values
                    .push((GraphState::socket_key(&node.id, "value"), value));
                break;
            }
        }
        self
    }

    pub fn with_callback(mut self, callback: StateCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn run_isolated(mut self, run_isolated: bool) -> Self {
        self.run_isolated = run_isolated;
        self
    }
}

/// Execute the whole graph in dependency order. Returns the nested state
/// the execution ran under, so callers can read routed output values.
pub fn execute<'a>(
    graph: &'a Arc<Graph>,
    outer: Option<&'a GraphState>,
    opts: ExecOptions,
) -> BoxFuture<'a, Result<GraphState, NodeError>> {
    Box::pin(async move {
        let built = graph.build_digraph();
        if built.is_cyclic() {
            return Err(NodeError::Graph("Graph contains cycles".into()));
        }

        let state = make_state(graph, outer);
        graph.reset_sockets(&state);
        for (key, value) in opts.state_values {
            state.set(&key, value);
        }

        trace_sync_all(graph, &state).await;

        let chains = sorted_chains(graph, &built)?;
        let result = execute_inner(
            graph,
            &chains,
            &state,
            !opts.suppress_trace,
            opts.run_isolated,
        )
        .await;

        finish_execution(graph, &state, result).await?;

        for callback in &graph.callbacks {
            callback(&state).await;
        }
        for callback in &opts.callbacks {
            callback(&state).await;
        }
        Ok(state)
    })
}

/// Execute only the ancestors of one node (plus, optionally, forked
/// branches hanging off them) and the node itself. Socket state is NOT
/// reset, so values from the enclosing execution remain visible.
pub fn execute_to_node<'a>(
    graph: &'a Arc<Graph>,
    stop_at_node: &'a str,
    outer: Option<&'a GraphState>,
    execute_forks: bool,
    opts: ExecOptions,
) -> BoxFuture<'a, Result<GraphState, NodeError>> {
    Box::pin(async move {
        if !graph.nodes.contains_key(stop_at_node) {
            return Err(NodeError::Graph(format!(
                "Node {} not found in graph",
                stop_at_node
            )));
        }

        let built = graph.build_digraph();
        let mut keep = if execute_forks {
            built.ancestors_with_forks(stop_at_node)
        } else {
            built.ancestors(stop_at_node)
        };
        keep.insert(stop_at_node.to_string());

        let sub = built.subgraph(&keep);
        if sub.is_cyclic() {
            return Err(NodeError::Graph("Graph contains cycles".into()));
        }

        let state = make_state(graph, outer);
        for (key, value) in opts.state_values {
            state.set(&key, value);
        }

        let chains = sorted_chains(graph, &sub)?;
        let result = execute_inner(graph, &chains, &state, !opts.suppress_trace, true).await;
        finish_execution(graph, &state, result).await?;

        for callback in &opts.callbacks {
            callback(&state).await;
        }
        Ok(state)
    })
}

fn make_state(graph: &Arc<Graph>, outer: Option<&GraphState>) -> GraphState {
    match outer {
        Some(outer) => GraphState::nested(outer, &graph.id),
        None => {
            let state = GraphState::new();
            state.set_graph_id(&graph.id);
            state
        }
    }
}

fn sorted_chains(
    graph: &Graph,
    built: &crate::graph::BuiltGraph,
) -> Result<Vec<Vec<String>>, NodeError> {
    let mut chains = built.chains()?;
    chains.sort_by_key(|chain| graph.chain_priority(chain));
    Ok(chains)
}

/// Top-level result interpretation: a clean stop is swallowed, scene and
/// control signals pass through, anything else runs the graph's
/// registered error callbacks before propagating.
async fn finish_execution(
    graph: &Arc<Graph>,
    state: &GraphState,
    result: Result<(), NodeError>,
) -> Result<(), NodeError> {
    match result {
        Ok(()) => Ok(()),
        Err(NodeError::StopGraphExecution(_)) => Ok(()),
        Err(err) if err.is_passthrough() => Err(err),
        Err(err) => {
            handle_error(graph, state, &err).await;
            Err(err)
        }
    }
}

pub(crate) async fn handle_error(graph: &Graph, state: &GraphState, err: &NodeError) {
    for handler in &graph.error_handlers {
        handler(state, err).await;
    }
}

async fn execute_inner(
    graph: &Arc<Graph>,
    chains: &[Vec<String>],
    state: &GraphState,
    emit_state: bool,
    run_isolated: bool,
) -> Result<(), NodeError> {
    route_graph_inputs(graph, state);
    route_module_properties(graph, state);

    for chain in chains {
        if skip_isolated_chain(graph, chain, run_isolated) {
            continue;
        }
        for node_id in chain {
            if graph.take_interrupt() {
                break;
            }
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            if state.verbosity() >= NodeVerbosity::Verbose {
                debug!(node = %node.title(), "running node (pre check)");
            }
            if !graph.check_is_available(node, state) {
                if emit_state {
                    trace_push(node, state, true, false).await;
                }
                continue;
            }

            let entry = if emit_state {
                trace_push(node, state, false, false).await
            } else {
                None
            };

            match run_node(graph, node, state).await {
                Ok(()) => {
                    trace_pop(node, state, entry, None).await;
                }
                Err(err @ NodeError::StopGraphExecution(_)) => {
                    trace_pop(node, state, entry, None).await;
                    return Err(err);
                }
                Err(err) if err.is_passthrough() => {
                    trace_pop(node, state, entry, None).await;
                    return Err(err);
                }
                Err(NodeError::Module(message)) => {
                    // module failures are traced but do not abort the sweep
                    trace_pop(node, state, entry, Some(message)).await;
                }
                Err(err) => {
                    trace_pop(node, state, entry, Some(err.to_string())).await;
                    attempt_catch(graph, state, err).await?;
                }
            }

            route_output_node(graph, node, state);
        }
    }
    Ok(())
}

fn skip_isolated_chain(graph: &Graph, chain: &[String], run_isolated: bool) -> bool {
    if run_isolated {
        return false;
    }
    chain
        .last()
        .and_then(|id| graph.node(id))
        .map(|node| node.isolated())
        .unwrap_or(false)
}

/// Route the enclosing scope's input values into this graph's Input
/// marker nodes.
fn route_graph_inputs(graph: &Arc<Graph>, state: &GraphState) {
    let Some(outer) = state.outer() else {
        return;
    };
    for node in graph.input_nodes() {
        let Some(input_name) = node.stored_property("input_name").as_str().map(String::from)
        else {
            continue;
        };
        let Some(socket) = graph.input_socket(&input_name) else {
            continue;
        };
        let Some(source) = &socket.source else {
            continue;
        };
        let value = outer.socket_value(&source.node_id, &source.name);
        if state.verbosity() >= NodeVerbosity::Verbose {
            debug!(node = %node.title, value = ?value, "routing graph input");
        }
        state.set_socket_value(&node.id, "value", value);
    }
}

/// Expose graph-level property values through ModuleProperty nodes.
fn route_module_properties(graph: &Arc<Graph>, state: &GraphState) {
    for node in graph.module_property_nodes() {
        let Some(name) = node.stored_property("property_name").as_str().map(String::from)
        else {
            continue;
        };
        let value = state
            .node_property(&graph.id, &name)
            .unwrap_or_else(|| graph.properties.get(&name).cloned().unwrap_or(Value::Unresolved));
        let value = crate::nodes::core::cast_module_property(node, value);
        state.set_socket_value(&node.id, "name", Value::String(name));
        state.set_socket_value(&node.id, "value", value);
    }
}

/// When an Output marker runs, propagate its received value onto the
/// graph's own externally-visible output socket.
fn route_output_node(graph: &Arc<Graph>, node: &GraphNode, state: &GraphState) {
    let Some(leaf) = node.as_leaf() else { return };
    if leaf.registry != OUTPUT_REGISTRY {
        return;
    }
    let Some(output_name) = leaf.stored_property("output_name").as_str().map(String::from) else {
        return;
    };
    let Some(socket) = graph.output_socket(&output_name) else {
        return;
    };
    let Some(value_socket) = leaf.input_socket("value") else {
        return;
    };
    let value = value_socket.value(state);
    socket.set_value(state, value.clone());
    if let Some(outer) = state.outer() {
        outer.set_socket_value(&graph.id, &output_name, value.clone());
    }
    if state.verbosity() >= NodeVerbosity::Verbose {
        debug!(socket = %socket.full_id(), value = ?value, "routing graph output");
    }
}

/// Dispatch a single node: leaf behaviors run directly, nested graphs
/// re-enter the scheduler with the current state as their outer scope.
pub fn run_node<'a>(
    graph: &'a Arc<Graph>,
    node: &'a GraphNode,
    state: &'a GraphState,
) -> BoxFuture<'a, Result<(), NodeError>> {
    Box::pin(async move {
        match node {
            GraphNode::Leaf(leaf) => {
                let behavior = Arc::clone(leaf.behavior());
                behavior.run(NodeCx::new(leaf, graph, state)).await
            }
            GraphNode::Graph(child) => match &child.kind {
                GraphKind::Graph => {
                    execute(child, Some(state), ExecOptions::default()).await?;
                    Ok(())
                }
                GraphKind::Listen(_) => {
                    warn!(node = %child.title, "Listen node run directly");
                    execute(child, Some(state), ExecOptions::default()).await?;
                    Ok(())
                }
                GraphKind::Loop(_) | GraphKind::SceneLoop(_) => {
                    execute_loop(child, state, ExecOptions::default()).await
                }
                GraphKind::Function | GraphKind::Command => {
                    crate::run::publish_function(child, state);
                    Ok(())
                }
            },
        }
    })
}

/// Offer an unhandled node error to the graph's ErrorHandler nodes in
/// turn. The first handler to claim it ends propagation.
async fn attempt_catch(
    graph: &Arc<Graph>,
    state: &GraphState,
    err: NodeError,
) -> Result<(), NodeError> {
    let handlers: Vec<&GraphNode> = graph
        .find_nodes(|node| {
            node.as_leaf()
                .map(|leaf| leaf.behavior().handles_errors())
                .unwrap_or(false)
        })
        .collect();

    if handlers.is_empty() {
        return Err(err);
    }

    for handler in handlers {
        let Some(leaf) = handler.as_leaf() else {
            continue;
        };
        let behavior = Arc::clone(leaf.behavior());
        match behavior.catch(NodeCx::new(leaf, graph, state), &err).await {
            Ok(true) => return Ok(()),
            Ok(false) => continue,
            Err(catch_err) => {
                error!(error = %catch_err, "error in error handler");
            }
        }
    }
    Err(err)
}

// ── loop driver ────────────────────────────────────────────────────────

enum IterationOutcome {
    Continue,
    Break { reraise: Option<NodeError> },
    Exit,
    Raise(NodeError),
}

/// Execute a Loop graph: repeat the chain sweep until broken or exited,
/// with per-iteration socket resets and the loop lifecycle hooks.
pub fn execute_loop<'a>(
    graph: &'a Arc<Graph>,
    outer: &'a GraphState,
    opts: ExecOptions,
) -> BoxFuture<'a, Result<(), NodeError>> {
    Box::pin(async move {
        let built = graph.build_digraph();
        if built.is_cyclic() {
            return Err(NodeError::Graph("Graph contains cycles".into()));
        }

        let state = GraphState::nested(outer, &graph.id);
        graph.reset_sockets(&state);
        for (key, value) in &opts.state_values {
            state.set(key, value.clone());
        }

        let chains = sorted_chains(graph, &built)?;
        let config = loop_config(graph);

        let result = drive_loop(graph, &chains, &state, &config, opts.run_isolated).await;

        // loop callbacks always run, whatever way the loop ended
        for callback in &graph.callbacks {
            callback(&state).await;
        }
        result
    })
}

fn loop_config(graph: &Graph) -> LoopConfig {
    match &graph.kind {
        GraphKind::Loop(config) | GraphKind::SceneLoop(config) => config.clone(),
        _ => LoopConfig::default(),
    }
}

async fn drive_loop(
    graph: &Arc<Graph>,
    chains: &[Vec<String>],
    state: &GraphState,
    config: &LoopConfig,
    run_isolated: bool,
) -> Result<(), NodeError> {
    loop {
        graph.reset_sockets(state);

        let mut break_loop = false;
        let mut reraise: Option<NodeError> = None;

        // LOOP START
        if let Err(err) = on_loop_start(graph, state).await {
            handle_error(graph, state, &err).await;
            match on_loop_error(graph, state, &err).await {
                Ok(()) => {
                    error!(graph = %graph.title, error = %err, "error in loop start");
                }
                Err(NodeError::LoopBreak) => break_loop = true,
                Err(NodeError::LoopContinue) => continue,
                Err(NodeError::LoopExit) => return Ok(()),
                Err(other) => return Err(other),
            }
        }

        // PROCESS NODE CHAINS
        if !break_loop {
            match run_loop_iteration(graph, chains, state, config, run_isolated).await {
                IterationOutcome::Continue => {}
                IterationOutcome::Break { reraise: err } => {
                    break_loop = true;
                    reraise = err;
                }
                IterationOutcome::Exit => return Ok(()),
                IterationOutcome::Raise(err) => return Err(err),
            }
        }

        // LOOP END
        on_loop_end(graph, state).await?;

        if break_loop {
            return match reraise {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
    }
}

async fn run_loop_iteration(
    graph: &Arc<Graph>,
    chains: &[Vec<String>],
    state: &GraphState,
    config: &LoopConfig,
    run_isolated: bool,
) -> IterationOutcome {
    for chain in chains {
        trace_sync_all(graph, state).await;

        if skip_isolated_chain(graph, chain, run_isolated) {
            continue;
        }

        for node_id in chain {
            if graph.take_interrupt() {
                return IterationOutcome::Exit;
            }
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            if !graph.check_is_available(node, state) {
                trace_push(node, state, true, false).await;
                continue;
            }

            let entry = trace_push(node, state, false, false).await;

            match run_node(graph, node, state).await {
                Ok(()) => {
                    trace_pop(node, state, entry, None).await;
                    if let Some(exit_condition) = &config.exit_condition {
                        if exit_condition(state) {
                            return IterationOutcome::Exit;
                        }
                    }
                }
                Err(NodeError::Module(message)) => {
                    trace_pop(node, state, entry, Some(message)).await;
                }
                Err(NodeError::LoopContinue) => {
                    trace_pop(node, state, entry, None).await;
                    // abandon the rest of this iteration, next cycle
                    return IterationOutcome::Continue;
                }
                Err(NodeError::LoopBreak) | Err(NodeError::StopGraphExecution(_)) => {
                    trace_pop(node, state, entry, None).await;
                    return IterationOutcome::Break { reraise: None };
                }
                Err(NodeError::LoopExit) => {
                    trace_pop(node, state, entry, None).await;
                    return IterationOutcome::Exit;
                }
                Err(err) if err.is_scene_signal() || matches!(err, NodeError::StopModule) => {
                    trace_pop(node, state, entry, None).await;
                    return IterationOutcome::Raise(err);
                }
                Err(err) => {
                    trace_pop(node, state, entry, Some(err.to_string())).await;
                    handle_error(graph, state, &err).await;
                    match on_loop_error(graph, state, &err).await {
                        Ok(()) => {
                            error!(graph = %graph.title, error = %err, "error in loop");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            return IterationOutcome::Break { reraise: None };
                        }
                        Err(NodeError::LoopBreak) => {
                            return IterationOutcome::Break { reraise: None };
                        }
                        Err(NodeError::LoopContinue) => return IterationOutcome::Continue,
                        Err(NodeError::LoopExit) => return IterationOutcome::Exit,
                        Err(other)
                            if other.is_scene_signal()
                                || matches!(other, NodeError::StopModule) =>
                        {
                            return IterationOutcome::Raise(other);
                        }
                        Err(other) => {
                            error!(error = %other, "error in loop error handler");
                            // handler failed: break and re-raise the original
                            return IterationOutcome::Break { reraise: Some(err) };
                        }
                    }
                }
            }
        }

        tokio::time::sleep(config.sleep).await;
    }

    IterationOutcome::Continue
}

async fn on_loop_start(graph: &Arc<Graph>, state: &GraphState) -> Result<(), NodeError> {
    match &graph.kind {
        GraphKind::SceneLoop(_) => crate::scene::scene_loop_start(graph, state).await,
        _ => Ok(()),
    }
}

async fn on_loop_end(graph: &Arc<Graph>, state: &GraphState) -> Result<(), NodeError> {
    match &graph.kind {
        GraphKind::SceneLoop(_) => crate::scene::scene_loop_end(graph, state).await,
        _ => Ok(()),
    }
}

async fn on_loop_error(
    graph: &Arc<Graph>,
    state: &GraphState,
    err: &NodeError,
) -> Result<(), NodeError> {
    match &graph.kind {
        GraphKind::SceneLoop(_) => crate::scene::scene_loop_error(graph, state, err).await,
        _ => Ok(()),
    }
}

// ── execution trace ────────────────────────────────────────────────────

static LAST_TRACE_SIGNAL: Mutex<Option<Instant>> = Mutex::new(None);
const TRACE_SIGNAL_INTERVAL: Duration = Duration::from_secs(1);

fn repr(value: &Value) -> String {
    let rendered = format!("{:?}", value);
    if rendered.chars().count() > 255 {
        rendered.chars().take(255).collect()
    } else {
        rendered
    }
}

fn make_entry(node: &GraphNode, state: &GraphState) -> NodeState {
    let input_values: IndexMap<String, String> = node
        .inputs()
        .iter()
        .map(|socket| (socket.name.clone(), repr(&socket.value(state))))
        .collect();
    let output_values: IndexMap<String, String> = node
        .outputs()
        .iter()
        .map(|socket| (socket.name.clone(), repr(&socket.value(state))))
        .collect();
    let properties: IndexMap<String, String> = match node {
        GraphNode::Leaf(leaf) => leaf
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), repr(v)))
            .collect(),
        GraphNode::Graph(graph) => graph
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), repr(v)))
            .collect(),
    };
    NodeState {
        node_id: node.id().to_string(),
        start_time: Some(now_secs()),
        end_time: None,
        deactivated: false,
        error: None,
        input_values,
        output_values,
        properties,
    }
}

pub(crate) async fn trace_push(
    node: &GraphNode,
    state: &GraphState,
    inactive: bool,
    reset: bool,
) -> Option<NodeState> {
    if !state.creative_mode() {
        return None;
    }
    let mut entry = make_entry(node, state);
    if inactive {
        entry.deactivated = true;
    }
    if reset {
        entry.start_time = None;
    }
    state.push_trace(entry.clone());
    signal_node_state(state).await;
    Some(entry)
}

pub(crate) async fn trace_pop(
    node: &GraphNode,
    state: &GraphState,
    prev: Option<NodeState>,
    error: Option<String>,
) {
    if !state.creative_mode() {
        return;
    }
    let mut entry = make_entry(node, state);
    entry.start_time = prev.and_then(|p| p.start_time);
    entry.end_time = Some(now_secs());
    entry.error = error;
    state.push_trace(entry);
    signal_node_state(state).await;
}

async fn trace_sync_all(graph: &Graph, state: &GraphState) {
    if !state.creative_mode() {
        return;
    }
    for node in graph.nodes.values() {
        trace_push(node, state, false, true).await;
    }
}

/// Send the accumulated trace to the observability signal, throttled so a
/// busy graph does not flood the editor.
async fn signal_node_state(state: &GraphState) {
    if !state.creative_mode() {
        return;
    }
    {
        let mut last = LAST_TRACE_SIGNAL.lock();
        if let Some(at) = *last {
            if at.elapsed() < TRACE_SIGNAL_INTERVAL {
                return;
            }
        }
        *last = Some(Instant::now());
    }

    let stack: Vec<Value> = state
        .take_trace()
        .iter()
        .map(NodeState::flattened)
        .collect();
    if let Some(signal) = crate::signals::get("nodes_node_state") {
        let event = ScriptEvent::new("nodes_node_state");
        event.set_field("stack", Value::List(stack));
        if let Err(err) = signal.send(event).await {
            warn!(error = %err, "failed to emit node state");
        }
    }
}
