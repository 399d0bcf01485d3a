// Event bus integration: Listen graphs and Trigger nodes.
//
// Listen graphs subscribe to named signals and re-enter graph execution
// when fired, with the event object injected into state data. Triggers
// publish a constructed event and await delivery to all subscribers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::NodeError;
use crate::exec::{self, ExecOptions};
use crate::graph::{Graph, GraphKind, GraphNode};
use crate::node::{Node, NodeBehavior, NodeCx, PropertyField, Socket};
use crate::registry::Registry;
use crate::signals;
use crate::state::{GraphState, NodeVerbosity};
use crate::value::Value;

/// A failed listener suppresses re-triggers for this long, so an event
/// handler that re-triggers its own event cannot storm.
pub const LISTEN_FAILURE_COOLDOWN: Duration = Duration::from_millis(1300);

/// Event object published on the signal bus. Fields are shared and
/// mutable so listeners can coordinate through flags on the event
/// (e.g. `had_passive_narration`).
#[derive(Clone)]
pub struct ScriptEvent {
    event_type: String,
    fields: Arc<Mutex<IndexMap<String, Value>>>,
}

impl ScriptEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            fields: Arc::new(Mutex::new(IndexMap::new())),
        }
    }

    pub fn with_fields(event_type: impl Into<String>, fields: IndexMap<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            fields: Arc::new(Mutex::new(fields)),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.lock().get(name).cloned()
    }

    pub fn set_field(&self, name: &str, value: Value) {
        self.fields.lock().insert(name.to_string(), value);
    }

    pub fn fields_snapshot(&self) -> IndexMap<String, Value> {
        self.fields.lock().clone()
    }

    pub fn same_event(&self, other: &ScriptEvent) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
    }
}

impl std::fmt::Debug for ScriptEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<event {}>", self.event_type)
    }
}

/// Deep-search a graph for Listen nodes, keyed by event name. Nested
/// non-Listen graphs are searched recursively.
pub fn collect_listeners(graph: &Graph) -> Vec<(String, Arc<Graph>)> {
    let mut listeners = Vec::new();
    for node in graph.nodes.values() {
        let GraphNode::Graph(child) = node else {
            continue;
        };
        if matches!(child.kind, GraphKind::Listen(_)) {
            match child.properties.get("event_name").and_then(|v| v.as_str()) {
                Some(event_name) if !event_name.is_empty() => {
                    listeners.push((event_name.to_string(), Arc::clone(child)));
                }
                _ => warn!(node = %child.title, "Listen node has no event name"),
            }
        } else {
            listeners.extend(collect_listeners(child));
        }
    }
    listeners
}

/// Wire every Listen node in the graph to its signal. The connecting
/// state is captured by the subscription: listeners fired outside any
/// in-flight execution run against it.
pub fn connect_listeners(graph: &Graph, state: &GraphState, reconnect: bool) {
    for (event_name, listener) in collect_listeners(graph) {
        let Some(signal) = signals::get(&event_name) else {
            warn!(event_name = %event_name, "Event not found");
            continue;
        };
        if state.verbosity() >= NodeVerbosity::Normal {
            debug!(listener = %listener.title, event_name = %event_name, "connecting listener");
        }
        if reconnect {
            signal.disconnect(&listener.id);
        }
        let state = state.clone();
        let key = listener.id.clone();
        signal.connect(
            &key,
            Arc::new(move |event| {
                let listener = Arc::clone(&listener);
                let state = state.clone();
                Box::pin(async move { execute_from_event(&listener, &state, event).await })
            }),
        );
    }
}

pub fn disconnect_listeners(graph: &Graph, state: &GraphState) {
    for (event_name, listener) in collect_listeners(graph) {
        let Some(signal) = signals::get(&event_name) else {
            warn!(event_name = %event_name, "Event not found");
            continue;
        };
        if state.verbosity() >= NodeVerbosity::Normal {
            debug!(listener = %listener.title, event_name = %event_name, "disconnecting listener");
        }
        signal.disconnect(&listener.id);
    }
}

/// Run a Listen graph in response to a fired signal. A listener that
/// failed within the cooldown window drops the trigger instead of
/// retrying, so failure feedback loops cannot storm.
pub async fn execute_from_event(
    listener: &Arc<Graph>,
    state: &GraphState,
    event: ScriptEvent,
) -> Result<(), NodeError> {
    if let GraphKind::Listen(guard) = &listener.kind {
        let recently_failed = guard
            .last_failure
            .lock()
            .map(|at| at.elapsed() < LISTEN_FAILURE_COOLDOWN)
            .unwrap_or(false);
        if recently_failed {
            warn!(
                listener = %listener.title,
                event = %event.event_type(),
                "listener failed recently, dropping trigger"
            );
            return Ok(());
        }
    }

    let node_view = GraphNode::Graph(Arc::clone(listener));
    let entry = exec::trace_push(&node_view, state, false, false).await;

    let opts = ExecOptions::default()
        .with_state_value("event", Value::Event(event))
        .run_isolated(false);

    match exec::execute(listener, Some(state), opts).await {
        Ok(_) => {
            exec::trace_pop(&node_view, state, entry, None).await;
            Ok(())
        }
        Err(err) => {
            if let GraphKind::Listen(guard) = &listener.kind {
                *guard.last_failure.lock() = Some(std::time::Instant::now());
            }
            exec::trace_pop(&node_view, state, entry, Some(err.to_string())).await;
            Err(err)
        }
    }
}

// ── nodes ──────────────────────────────────────────────────────────────

/// Publishes a named signal with an event payload built from the
/// `payload` input.
pub struct Trigger;

#[async_trait]
impl NodeBehavior for Trigger {
    fn default_title(&self) -> &str {
        "Trigger Event"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("trigger"));
        node.add_input(Socket::new("event_name").with_type("str").optional());
        node.add_input(Socket::new("payload").with_type("dict").optional());
        node.declare_field(
            PropertyField::new("event_name", "str")
                .description("Event to trigger")
                .default_value(""),
        );
        node.add_output(Socket::new("event").with_type("event"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let event_name = cx.input("event_name");
        let Some(event_name) = event_name.as_str().filter(|s| !s.is_empty()) else {
            error!("Event name not set");
            return Ok(());
        };

        let Some(signal) = signals::get(event_name) else {
            error!(event_name = %event_name, "Signal not found");
            return Ok(());
        };

        let fields = match cx.input("payload") {
            Value::Dict(map) => map,
            _ => IndexMap::new(),
        };
        let event = ScriptEvent::with_fields(event_name, fields);

        signal.send(event.clone()).await?;

        if cx.verbosity() >= NodeVerbosity::Verbose {
            debug!(event_name = %event_name, "triggered event");
        }

        cx.set_output("event", Value::Event(event));
        Ok(())
    }
}

/// Returns the current event object when inside a Listen module.
pub struct EventState;

#[async_trait]
impl NodeBehavior for EventState {
    fn default_title(&self) -> &str {
        "Event"
    }

    fn setup(&self, node: &mut Node) {
        node.add_output(Socket::new("event").with_type("event"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let event = cx.state.get("event").unwrap_or(Value::Null);
        cx.set_output("event", event);
        Ok(())
    }
}

/// Unpack an event object's type and fields.
pub struct UnpackEvent;

#[async_trait]
impl NodeBehavior for UnpackEvent {
    fn default_title(&self) -> &str {
        "Unpack Event"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("event").with_type("event"));
        node.add_output(Socket::new("event_type").with_type("str"));
        node.add_output(Socket::new("fields").with_type("dict"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let value = cx.require_input("event")?;
        let Value::Event(event) = value else {
            return Err(NodeError::input(
                &cx.node.title,
                "event",
                "Value must be an event",
            ));
        };
        cx.set_output("event_type", event.event_type());
        cx.set_output("fields", Value::Dict(event.fields_snapshot()));
        Ok(())
    }
}

/// Emit a status message to the UI signal sink.
pub struct EmitStatus;

#[async_trait]
impl NodeBehavior for EmitStatus {
    fn default_title(&self) -> &str {
        "Emit Status"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("message").with_type("str").optional());
        node.add_input(Socket::new("status").with_type("str").optional());
        node.add_input(Socket::new("as_scene_message").with_type("bool").optional());
        node.declare_field(
            PropertyField::new("message", "str")
                .description("The message text to emit")
                .default_value(""),
        );
        node.declare_field(
            PropertyField::new("status", "str")
                .description("The status of the message")
                .default_value("info")
                .choices(vec![
                    Value::from("busy"),
                    Value::from("error"),
                    Value::from("info"),
                    Value::from("success"),
                    Value::from("warning"),
                ]),
        );
        node.declare_field(
            PropertyField::new("as_scene_message", "bool")
                .description("Whether to emit the message as a scene message")
                .default_value(false),
        );
        node.add_output(Socket::new("emitted").with_type("bool"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let message = cx.require_input("message")?;
        let status = cx.require_input("status")?;
        let as_scene_message = cx.input("as_scene_message").as_bool();

        if let Some(signal) = signals::get("status") {
            let event = ScriptEvent::new("status");
            event.set_field("message", message.clone());
            event.set_field("status", status.clone());
            event.set_field("as_scene_message", Value::Bool(as_scene_message));
            signal.send(event).await?;
        }

        debug!(message = %message.to_display(), status = %status.to_display(), "status emitted");
        cx.set_output("emitted", true);
        Ok(())
    }
}

pub fn register(registry: &Registry) -> Result<(), NodeError> {
    registry.register_behavior("event/Trigger", Arc::new(Trigger), "core/EventTrigger")?;
    registry.register_behavior("event/Event", Arc::new(EventState), "core/Node")?;
    registry.register_behavior("event/UnpackEvent", Arc::new(UnpackEvent), "core/Node")?;
    registry.register_behavior("event/EmitStatus", Arc::new(EmitStatus), "core/Node")?;
    Ok(())
}
