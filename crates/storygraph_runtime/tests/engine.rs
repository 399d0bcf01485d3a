// End-to-end scheduler behavior: stage ordering, availability gating,
// loop control flow, function subgraphs, error handlers and events.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use storygraph_runtime::event::{ScriptEvent, connect_listeners, execute_from_event};
use storygraph_runtime::graph::LoopConfig;
use storygraph_runtime::run::FunctionWrapper;
use storygraph_runtime::scene::{PlayerInput, Scene, execute_scene_loop, new_scene_loop};
use storygraph_runtime::{
    ExecOptions, Graph, GraphKind, GraphNode, GraphState, Node, NodeBehavior, NodeCx, NodeError,
    NodeSeed, PropertyField, Registry, Socket, Value, execute, execute_loop, signals,
};

// ── helpers ────────────────────────────────────────────────────────────

fn record(state: &GraphState, key: &str, name: &str) {
    let mut entries = match state.shared_get(key) {
        Some(Value::List(entries)) => entries,
        _ => Vec::new(),
    };
    entries.push(Value::from(name));
    state.shared_set(key, Value::List(entries));
}

fn recorded(state: &GraphState, key: &str) -> Vec<String> {
    match state.shared_get(key) {
        Some(Value::List(entries)) => entries.iter().map(Value::to_display).collect(),
        _ => Vec::new(),
    }
}

/// Records its name into the shared run order when executed.
struct Probe {
    name: &'static str,
}

#[async_trait]
impl NodeBehavior for Probe {
    fn default_title(&self) -> &str {
        "Probe"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state"));
        node.add_output(Socket::new("state"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        record(cx.state, "run_order", self.name);
        cx.set_output("state", true);
        Ok(())
    }
}

/// Always fails with a plain error.
struct Fail;

#[async_trait]
impl NodeBehavior for Fail {
    fn default_title(&self) -> &str {
        "Fail"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state"));
        node.add_output(Socket::new("state"));
    }

    async fn run(&self, _cx: NodeCx<'_>) -> Result<(), NodeError> {
        Err(anyhow::anyhow!("boom").into())
    }
}

/// Counts loop iterations in shared state.
struct Count;

#[async_trait]
impl NodeBehavior for Count {
    fn default_title(&self) -> &str {
        "Count"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state"));
        node.add_output(Socket::new("state"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let count = cx
            .state
            .shared_get("iterations")
            .and_then(|v| v.as_int())
            .unwrap_or(0);
        cx.state.shared_set("iterations", Value::Int(count + 1));
        cx.set_output("state", true);
        Ok(())
    }
}

/// Raises loop control signals at configured iteration counts.
struct ControlAt {
    continue_at: Option<i64>,
    break_at: Option<i64>,
    exit_at: Option<i64>,
}

#[async_trait]
impl NodeBehavior for ControlAt {
    fn default_title(&self) -> &str {
        "Control At"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state"));
        node.add_output(Socket::new("state"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let iteration = cx
            .state
            .shared_get("iterations")
            .and_then(|v| v.as_int())
            .unwrap_or(0);
        if self.continue_at == Some(iteration) {
            return Err(NodeError::LoopContinue);
        }
        if self.break_at == Some(iteration) {
            return Err(NodeError::LoopBreak);
        }
        if self.exit_at == Some(iteration) {
            return Err(NodeError::LoopExit);
        }
        cx.set_output("state", true);
        Ok(())
    }
}

fn leaf(registry: &Registry, path: &str) -> Node {
    match registry.create(path, NodeSeed::default()).unwrap() {
        GraphNode::Leaf(node) => node,
        GraphNode::Graph(_) => panic!("expected leaf node for {}", path),
    }
}

fn add_behavior(graph: &mut Graph, behavior: impl NodeBehavior + 'static, path: &str) -> String {
    let mut node = Node::create(Arc::new(behavior)).unwrap();
    node.registry = path.to_string();
    graph.add_leaf(node)
}

fn add_probe(graph: &mut Graph, name: &'static str) -> String {
    add_behavior(graph, Probe { name }, "test/Probe")
}

// ── stage ordering ─────────────────────────────────────────────────────

#[tokio::test]
async fn chains_execute_in_stage_priority_order() {
    let registry = Registry::with_builtins();
    let mut graph = Graph::new(GraphKind::Graph);

    // declaration order is deliberately the reverse of stage order
    let entry = graph.add_leaf(leaf(&registry, "core/Entry"));
    let p3 = add_probe(&mut graph, "unstaged");
    graph.connect_ids(&entry, "state", &p3, "state").unwrap();

    let mut stage1 = leaf(&registry, "core/Stage");
    stage1.set_stored_property("stage", 1i64);
    let stage1 = graph.add_leaf(stage1);
    let p2 = add_probe(&mut graph, "stage1");
    graph.connect_ids(&stage1, "state", &p2, "state").unwrap();

    let mut stage0 = leaf(&registry, "core/Stage");
    stage0.set_stored_property("stage", 0i64);
    let stage0 = graph.add_leaf(stage0);
    let p1 = add_probe(&mut graph, "stage0");
    graph.connect_ids(&stage0, "state", &p1, "state").unwrap();

    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let state = execute(&graph, None, ExecOptions::default()).await.unwrap();
    assert_eq!(recorded(&state, "run_order"), vec!["stage0", "stage1", "unstaged"]);
}

// ── availability ───────────────────────────────────────────────────────

#[tokio::test]
async fn switch_deactivation_gates_downstream_nodes() {
    let registry = Registry::with_builtins();
    let mut graph = Graph::new(GraphKind::Graph);

    let mut zero = leaf(&registry, "data/number/Make");
    zero.set_stored_property("value", 0i64);
    let zero = graph.add_leaf(zero);

    let switch = graph.add_leaf(leaf(&registry, "core/Switch"));
    graph.connect_ids(&zero, "value", &switch, "value").unwrap();

    let yes_probe = add_probe(&mut graph, "yes");
    let after_yes = add_probe(&mut graph, "after_yes");
    let no_probe = add_probe(&mut graph, "no");
    graph.connect_ids(&switch, "yes", &yes_probe, "state").unwrap();
    graph.connect_ids(&yes_probe, "state", &after_yes, "state").unwrap();
    graph.connect_ids(&switch, "no", &no_probe, "state").unwrap();

    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let state = execute(&graph, None, ExecOptions::default()).await.unwrap();
    // zero is falsy: only the no-branch runs, the yes chain is gated off
    assert_eq!(recorded(&state, "run_order"), vec!["no"]);
}

/// Two alternative inputs in one group.
struct Grouped {
    with_default: bool,
}

#[async_trait]
impl NodeBehavior for Grouped {
    fn default_title(&self) -> &str {
        "Grouped"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("x").with_group("g"));
        node.add_input(Socket::new("y").with_group("g"));
        if self.with_default {
            node.declare_field(PropertyField::new("y", "str").default_value("fallback"));
        }
        node.add_output(Socket::new("ok"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        cx.set_output("ok", true);
        Ok(())
    }
}

#[test]
fn group_inputs_are_or_alternatives() {
    let state = GraphState::new();

    let mut graph = Graph::new(GraphKind::Graph);
    let with_default = add_behavior(&mut graph, Grouped { with_default: true }, "test/Grouped");
    let without = add_behavior(&mut graph, Grouped { with_default: false }, "test/Grouped");

    let node = graph.node(&with_default).unwrap();
    assert!(graph.check_is_available(node, &state));

    let node = graph.node(&without).unwrap();
    assert!(!graph.check_is_available(node, &state));
}

// ── end to end dataflow ────────────────────────────────────────────────

fn arithmetic_graph(registry: &Registry) -> Graph {
    let mut graph = Graph::new(GraphKind::Graph);
    graph.registry = "tests/multiplier".to_string();

    let mut input = leaf(registry, "core/Input");
    input.set_stored_property("input_name", "n");
    input.set_stored_property("input_type", "int");
    let input = graph.add_leaf(input);

    let mut arith = leaf(registry, "data/number/BasicArithmetic");
    arith.set_stored_property("operation", "multiply");
    arith.set_stored_property("b", 2i64);
    let arith = graph.add_leaf(arith);

    let mut output = leaf(registry, "core/Output");
    output.set_stored_property("output_name", "result");
    let output = graph.add_leaf(output);

    graph.connect_ids(&input, "value", &arith, "a").unwrap();
    graph.connect_ids(&arith, "result", &output, "value").unwrap();
    graph.reinitialize().unwrap();
    graph
}

#[tokio::test]
async fn input_to_arithmetic_to_output() {
    let registry = Registry::with_builtins();
    let graph = Arc::new(arithmetic_graph(&registry));

    let state = execute(
        &graph,
        None,
        ExecOptions::default().with_input(&graph, "n", Value::Int(5)),
    )
    .await
    .unwrap();

    assert_eq!(state.socket_value(&graph.id, "result"), Value::Int(10));
}

#[tokio::test]
async fn independent_states_do_not_leak_socket_values() {
    let registry = Registry::with_builtins();
    let graph = Arc::new(arithmetic_graph(&registry));

    let first = execute(
        &graph,
        None,
        ExecOptions::default().with_input(&graph, "n", Value::Int(5)),
    )
    .await
    .unwrap();
    let second = execute(
        &graph,
        None,
        ExecOptions::default().with_input(&graph, "n", Value::Int(7)),
    )
    .await
    .unwrap();

    assert_eq!(first.socket_value(&graph.id, "result"), Value::Int(10));
    assert_eq!(second.socket_value(&graph.id, "result"), Value::Int(14));
}

#[tokio::test]
async fn list_append_chain_reports_length() {
    let registry = Registry::with_builtins();
    let mut graph = Graph::new(GraphKind::Graph);

    let make = graph.add_leaf(leaf(&registry, "data/MakeList"));

    let mut append_a = leaf(&registry, "data/ListAppend");
    append_a.set_stored_property("item", "a");
    let append_a = graph.add_leaf(append_a);

    let mut append_b = leaf(&registry, "data/ListAppend");
    append_b.set_stored_property("item", "b");
    let append_b = graph.add_leaf(append_b);

    let length = graph.add_leaf(leaf(&registry, "data/Length"));

    graph.connect_ids(&make, "list", &append_a, "list").unwrap();
    graph.connect_ids(&append_a, "list", &append_b, "list").unwrap();
    graph.connect_ids(&append_b, "list", &length, "object").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let state = execute(&graph, None, ExecOptions::default()).await.unwrap();
    assert_eq!(state.socket_value(&length, "length"), Value::Int(2));
}

// ── loop control flow ──────────────────────────────────────────────────

fn loop_graph(config: LoopConfig) -> Graph {
    Graph::new(GraphKind::Loop(config))
}

#[tokio::test]
async fn loop_break_ends_the_loop() {
    let mut graph = loop_graph(LoopConfig::default());
    let count = add_behavior(&mut graph, Count, "test/Count");
    let control = add_behavior(
        &mut graph,
        ControlAt {
            continue_at: None,
            break_at: Some(3),
            exit_at: None,
        },
        "test/ControlAt",
    );
    let after = add_probe(&mut graph, "after_control");
    graph.connect_ids(&count, "state", &control, "state").unwrap();
    graph.connect_ids(&control, "state", &after, "state").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let outer = GraphState::new();
    execute_loop(&graph, &outer, ExecOptions::default()).await.unwrap();

    assert_eq!(outer.shared_get("iterations"), Some(Value::Int(3)));
    // the break iteration skips the rest of the chain
    let after_runs = recorded(&outer, "run_order")
        .iter()
        .filter(|name| name.as_str() == "after_control")
        .count();
    assert_eq!(after_runs, 2);
}

#[tokio::test]
async fn loop_continue_skips_rest_of_iteration() {
    let mut graph = loop_graph(LoopConfig::default());
    let count = add_behavior(&mut graph, Count, "test/Count");
    let control = add_behavior(
        &mut graph,
        ControlAt {
            continue_at: Some(1),
            break_at: Some(3),
            exit_at: None,
        },
        "test/ControlAt",
    );
    let after = add_probe(&mut graph, "after_control");
    graph.connect_ids(&count, "state", &control, "state").unwrap();
    graph.connect_ids(&control, "state", &after, "state").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let outer = GraphState::new();
    execute_loop(&graph, &outer, ExecOptions::default()).await.unwrap();

    assert_eq!(outer.shared_get("iterations"), Some(Value::Int(3)));
    // iteration 1 continued early, iteration 3 broke: only iteration 2
    // reached the tail of the chain
    let after_runs = recorded(&outer, "run_order")
        .iter()
        .filter(|name| name.as_str() == "after_control")
        .count();
    assert_eq!(after_runs, 1);
}

#[tokio::test]
async fn loop_exit_returns_immediately() {
    let mut graph = loop_graph(LoopConfig::default());
    let count = add_behavior(&mut graph, Count, "test/Count");
    let control = add_behavior(
        &mut graph,
        ControlAt {
            continue_at: None,
            break_at: None,
            exit_at: Some(2),
        },
        "test/ControlAt",
    );
    graph.connect_ids(&count, "state", &control, "state").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let outer = GraphState::new();
    execute_loop(&graph, &outer, ExecOptions::default()).await.unwrap();
    assert_eq!(outer.shared_get("iterations"), Some(Value::Int(2)));
}

#[tokio::test]
async fn loop_exit_condition_checked_after_each_node() {
    let config = LoopConfig {
        sleep: std::time::Duration::from_millis(1),
        exit_condition: Some(Arc::new(|state: &GraphState| {
            state
                .shared_get("iterations")
                .and_then(|v| v.as_int())
                .unwrap_or(0)
                >= 2
        })),
    };
    let mut graph = loop_graph(config);
    let entry = add_behavior(&mut graph, Count, "test/Count");
    let tail = add_probe(&mut graph, "tail");
    graph.connect_ids(&entry, "state", &tail, "state").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let outer = GraphState::new();
    execute_loop(&graph, &outer, ExecOptions::default()).await.unwrap();
    assert_eq!(outer.shared_get("iterations"), Some(Value::Int(2)));
}

// ── function subgraphs ─────────────────────────────────────────────────

#[tokio::test]
async fn function_wrapper_coerces_arguments_and_returns_value() {
    let registry = Registry::with_builtins();
    let mut graph = Graph::new(GraphKind::Function);

    let mut arg = leaf(&registry, "core/functions/Argument");
    arg.set_stored_property("name", "x");
    arg.set_stored_property("typ", "int");
    let arg = graph.add_leaf(arg);

    let ret = graph.add_leaf(leaf(&registry, "core/functions/Return"));
    graph.connect_ids(&arg, "value", &ret, "value").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let wrapper = FunctionWrapper::for_graph(Arc::clone(&graph), GraphState::new());
    assert_eq!(wrapper.arguments().len(), 1);
    assert_eq!(wrapper.arguments()[0].name, "x");

    let mut kwargs = IndexMap::new();
    kwargs.insert("x".to_string(), Value::from("42"));
    let result = wrapper.call(kwargs).await.unwrap();
    assert_eq!(result, Value::Int(42));
}

#[tokio::test]
async fn get_function_and_call_function_in_sweep() {
    let registry = Registry::with_builtins();
    let mut graph = Graph::new(GraphKind::Graph);

    // function body: argument -> return, terminated by DefineFunction
    let mut arg = leaf(&registry, "core/functions/Argument");
    arg.set_stored_property("name", "x");
    arg.set_stored_property("typ", "int");
    let arg = graph.add_leaf(arg);

    let ret = graph.add_leaf(leaf(&registry, "core/functions/Return"));

    let mut define = leaf(&registry, "core/functions/DefineFunction");
    define.set_stored_property("name", "identity");
    let define = graph.add_leaf(define);

    graph.connect_ids(&arg, "value", &ret, "value").unwrap();
    graph.connect_ids(&ret, "value", &define, "nodes").unwrap();

    // caller chain
    let mut getfn = leaf(&registry, "core/functions/GetFunction");
    getfn.set_stored_property("name", "identity");
    let getfn = graph.add_leaf(getfn);

    let mut call = leaf(&registry, "core/functions/CallFunction");
    let mut args = IndexMap::new();
    args.insert("x".to_string(), Value::from("42"));
    call.set_stored_property("args", Value::Dict(args));
    let call = graph.add_leaf(call);

    graph.connect_ids(&getfn, "fn", &call, "fn").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let state = execute(&graph, None, ExecOptions::default()).await.unwrap();
    assert_eq!(state.socket_value(&call, "result"), Value::Int(42));
}

// ── error handlers ─────────────────────────────────────────────────────

#[tokio::test]
async fn error_handler_claims_node_errors() {
    let registry = Registry::with_builtins();
    let mut graph = Graph::new(GraphKind::Graph);

    // failing chain
    let entry = graph.add_leaf(leaf(&registry, "core/Entry"));
    let fail = add_behavior(&mut graph, Fail, "test/Fail");
    graph.connect_ids(&entry, "state", &fail, "state").unwrap();

    // handler function: exc -> probe -> return(truthy)
    let mut exc_arg = leaf(&registry, "core/functions/Argument");
    exc_arg.set_stored_property("name", "exc");
    let exc_arg = graph.add_leaf(exc_arg);
    let handled = add_probe(&mut graph, "handled");
    let ret = graph.add_leaf(leaf(&registry, "core/functions/Return"));
    let mut define = leaf(&registry, "core/functions/DefineFunction");
    define.set_stored_property("name", "handle");
    let define = graph.add_leaf(define);

    graph.connect_ids(&exc_arg, "value", &handled, "state").unwrap();
    graph.connect_ids(&handled, "state", &ret, "value").unwrap();
    graph.connect_ids(&ret, "value", &define, "nodes").unwrap();

    // wire the handler node
    let mut getfn = leaf(&registry, "core/functions/GetFunction");
    getfn.set_stored_property("name", "handle");
    let getfn = graph.add_leaf(getfn);
    let handler = graph.add_leaf(leaf(&registry, "core/ErrorHandler"));
    graph.connect_ids(&getfn, "fn", &handler, "fn").unwrap();

    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let state = execute(&graph, None, ExecOptions::default()).await.unwrap();
    assert!(recorded(&state, "run_order").contains(&"handled".to_string()));
}

#[tokio::test]
async fn uncaught_errors_abort_execution() {
    let registry = Registry::with_builtins();
    let mut graph = Graph::new(GraphKind::Graph);
    let entry = graph.add_leaf(leaf(&registry, "core/Entry"));
    let fail = add_behavior(&mut graph, Fail, "test/Fail");
    graph.connect_ids(&entry, "state", &fail, "state").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let result = execute(&graph, None, ExecOptions::default()).await;
    assert!(result.is_err());
}

// ── events ─────────────────────────────────────────────────────────────

fn listen_graph(event_name: &str, probe_name: &'static str) -> Graph {
    let registry = Registry::with_builtins();
    let mut listen = Graph::new(GraphKind::Listen(Default::default()));
    listen
        .properties
        .insert("event_name".to_string(), Value::from(event_name));
    let entry = listen.add_leaf(leaf(&registry, "core/Entry"));
    let probe = add_probe(&mut listen, probe_name);
    listen.connect_ids(&entry, "state", &probe, "state").unwrap();
    listen.reinitialize().unwrap();
    listen
}

#[tokio::test]
async fn trigger_fires_connected_listener() {
    let registry = Registry::with_builtins();
    signals::register(&["engine_test_event"]);

    let mut graph = Graph::new(GraphKind::Graph);
    graph.add_graph(listen_graph("engine_test_event", "listened"));

    let entry = graph.add_leaf(leaf(&registry, "core/Entry"));
    let mut trigger = leaf(&registry, "event/Trigger");
    trigger.set_stored_property("event_name", "engine_test_event");
    let trigger = graph.add_leaf(trigger);
    graph.connect_ids(&entry, "state", &trigger, "trigger").unwrap();

    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let state = GraphState::new();
    connect_listeners(&graph, &state, false);
    let inner = execute(&graph, Some(&state), ExecOptions::default()).await.unwrap();
    storygraph_runtime::event::disconnect_listeners(&graph, &state);

    assert!(recorded(&inner, "run_order").contains(&"listened".to_string()));
    // the trigger published the event object on its output socket
    assert!(matches!(
        inner.socket_value(&trigger, "event"),
        Value::Event(_)
    ));
}

#[tokio::test]
async fn failed_listener_drops_retrigger_within_cooldown() {
    let registry = Registry::with_builtins();
    signals::register(&["engine_flaky_event"]);

    let mut listen = Graph::new(GraphKind::Listen(Default::default()));
    listen
        .properties
        .insert("event_name".to_string(), Value::from("engine_flaky_event"));
    let entry = listen.add_leaf(leaf(&registry, "core/Entry"));
    let attempt = add_probe(&mut listen, "attempt");
    let fail = add_behavior(&mut listen, Fail, "test/Fail");
    listen.connect_ids(&entry, "state", &attempt, "state").unwrap();
    listen.connect_ids(&attempt, "state", &fail, "state").unwrap();
    listen.reinitialize().unwrap();
    let listen = Arc::new(listen);

    let state = GraphState::new();
    let event = ScriptEvent::new("engine_flaky_event");

    let first = execute_from_event(&listen, &state, event.clone()).await;
    assert!(first.is_err());
    assert_eq!(recorded(&state, "run_order"), vec!["attempt"]);

    // an immediate retrigger is silently dropped
    let second = execute_from_event(&listen, &state, event).await;
    assert!(second.is_ok());
    assert_eq!(recorded(&state, "run_order"), vec!["attempt"]);
}

// ── module execution ───────────────────────────────────────────────────

/// Emits a preloaded module value.
struct EmitModule {
    module: Arc<Graph>,
}

#[async_trait]
impl NodeBehavior for EmitModule {
    fn default_title(&self) -> &str {
        "Emit Module"
    }

    fn setup(&self, node: &mut Node) {
        node.add_output(Socket::new("module"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        cx.set_output("module", Value::Module(Arc::clone(&self.module)));
        Ok(())
    }
}

#[tokio::test]
async fn run_module_reports_cancellation() {
    let registry = Registry::with_builtins();

    // an endless inner loop
    let mut module = Graph::new(GraphKind::Loop(LoopConfig::default()));
    let count = add_behavior(&mut module, Count, "test/Count");
    let tail = add_probe(&mut module, "module_tail");
    module.connect_ids(&count, "state", &tail, "state").unwrap();
    module.reinitialize().unwrap();
    let module = Arc::new(module);

    let mut graph = Graph::new(GraphKind::Graph);
    let supplier = add_behavior(
        &mut graph,
        EmitModule {
            module: Arc::clone(&module),
        },
        "test/EmitModule",
    );
    let runner = graph.add_leaf(leaf(&registry, "core/RunModule"));
    graph
        .connect_ids(&supplier, "module", &runner, "module")
        .unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let scene = Scene::new("cancel-test", Registry::with_builtins());
    let state = GraphState::new();
    state.set_scene(scene.clone());

    let exec_graph = Arc::clone(&graph);
    let exec_state = state.clone();
    let handle = tokio::spawn(async move {
        execute(&exec_graph, Some(&exec_state), ExecOptions::default()).await
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    scene.cancel_tasks();

    let inner = handle.await.unwrap().unwrap();
    assert_eq!(inner.socket_value(&runner, "cancelled"), Value::Bool(true));
}

// ── scene loop ─────────────────────────────────────────────────────────

/// Stores the received input message and counts turns.
struct Turn;

#[async_trait]
impl NodeBehavior for Turn {
    fn default_title(&self) -> &str {
        "Turn"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("input"));
        node.add_output(Socket::new("state"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let message = cx.input("input");
        cx.state.shared_set("last_input", message);
        let turns = cx
            .state
            .shared_get("turns")
            .and_then(|v| v.as_int())
            .unwrap_or(0);
        cx.state.shared_set("turns", Value::Int(turns + 1));
        cx.set_output("state", true);
        Ok(())
    }
}

fn scene_loop_with_exit() -> Graph {
    let mut graph = new_scene_loop();
    graph.kind = GraphKind::SceneLoop(LoopConfig {
        sleep: std::time::Duration::from_millis(1),
        exit_condition: Some(Arc::new(|state: &GraphState| {
            state
                .shared_get("turns")
                .and_then(|v| v.as_int())
                .unwrap_or(0)
                >= 1
        })),
    });
    graph
}

#[tokio::test]
async fn scene_loop_processes_player_input() {
    let registry = Registry::with_builtins();
    let mut graph = scene_loop_with_exit();

    let entry = graph.add_leaf(leaf(&registry, "core/Entry"));
    let wait = graph.add_leaf(leaf(&registry, "input/WaitForInput"));
    let turn = add_behavior(&mut graph, Turn, "test/Turn");
    graph.connect_ids(&entry, "state", &wait, "state").unwrap();
    graph.connect_ids(&wait, "input", &turn, "input").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let scene = Scene::new("input-test", Arc::clone(&registry));
    scene.push_input(PlayerInput::text("hello"));

    let outer = GraphState::new();
    execute_scene_loop(&graph, &scene, &outer).await.unwrap();

    assert_eq!(outer.shared_get("last_input"), Some(Value::from("hello")));
    assert_eq!(outer.shared_get("turns"), Some(Value::Int(1)));
    // the cycle published a game_loop event with the narration flag
    match outer.shared_get("game_loop") {
        Some(Value::Event(event)) => {
            assert_eq!(event.field("had_passive_narration"), Some(Value::Bool(false)));
        }
        other => panic!("expected game_loop event, got {:?}", other),
    }
}

#[tokio::test]
async fn scene_loop_dispatches_commands() {
    let registry = Registry::with_builtins();

    // a command: args -> probe -> return
    let mut command = Graph::new(GraphKind::Command);
    command.properties.insert("name".to_string(), Value::from("note"));
    let mut args = leaf(&registry, "core/functions/Argument");
    args.set_stored_property("name", "args");
    let args = command.add_leaf(args);
    let ran = add_probe(&mut command, "command_ran");
    let ret = command.add_leaf(leaf(&registry, "core/functions/Return"));
    command.connect_ids(&args, "value", &ran, "state").unwrap();
    command.connect_ids(&ran, "state", &ret, "value").unwrap();
    command.reinitialize().unwrap();

    let mut graph = scene_loop_with_exit();
    let entry = graph.add_leaf(leaf(&registry, "core/Entry"));
    let wait = graph.add_leaf(leaf(&registry, "input/WaitForInput"));
    graph.connect_ids(&entry, "state", &wait, "state").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let scene = Scene::new("command-test", Arc::clone(&registry));
    scene.commands().register("note", Arc::new(command));
    scene.push_input(PlayerInput::text("!note:remember the lantern"));

    let outer = GraphState::new();
    execute_scene_loop(&graph, &scene, &outer).await.unwrap();

    assert!(recorded(&outer, "run_order").contains(&"command_ran".to_string()));
    assert_eq!(outer.shared_get("skip_to_player"), Some(Value::Bool(true)));
}

// ── module properties ──────────────────────────────────────────────────

#[tokio::test]
async fn module_property_routes_cast_value() {
    let registry = Registry::with_builtins();
    let mut graph = Graph::new(GraphKind::Graph);
    graph.properties.insert("difficulty".to_string(), Value::from("7"));

    let mut prop = leaf(&registry, "core/ModuleProperty");
    prop.set_stored_property("property_name", "difficulty");
    prop.set_stored_property("property_type", "int");
    let prop = graph.add_leaf(prop);

    let probe = add_probe(&mut graph, "prop_consumer");
    graph.connect_ids(&prop, "value", &probe, "state").unwrap();
    graph.reinitialize().unwrap();
    let graph = Arc::new(graph);

    let state = execute(&graph, None, ExecOptions::default()).await.unwrap();
    assert_eq!(state.socket_value(&prop, "value"), Value::Int(7));
}
