// Core marker and plumbing nodes: graph IO sockets, module properties,
// stage priorities and passthroughs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::NodeError;
use crate::graph::{
    INPUT_REGISTRY, MODULE_PROPERTY_REGISTRY, OUTPUT_REGISTRY, STAGE_REGISTRY,
};
use crate::node::{Node, NodeBehavior, NodeCx, PropertyField, Socket};
use crate::registry::Registry;
use crate::value::Value;

/// Socket type tags offered in editor dropdowns.
pub const TYPE_CHOICES: &[&str] = &[
    "actor",
    "agent",
    "any",
    "bool",
    "character",
    "client",
    "dict",
    "event",
    "exception",
    "float",
    "function",
    "int",
    "interaction_state",
    "list",
    "str",
];

fn type_choice_values() -> Vec<Value> {
    TYPE_CHOICES.iter().map(|t| Value::from(*t)).collect()
}

/// Emits the state token that seeds an execution chain.
pub struct Entry;

#[async_trait]
impl NodeBehavior for Entry {
    fn default_title(&self) -> &str {
        "Entry"
    }

    fn setup(&self, node: &mut Node) {
        node.add_output(Socket::new("state"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        cx.set_output("state", true);
        Ok(())
    }
}

/// Marker declaring one external input socket of the containing graph.
pub struct Input;

#[async_trait]
impl NodeBehavior for Input {
    fn default_title(&self) -> &str {
        "Input Socket"
    }

    fn setup(&self, node: &mut Node) {
        node.declare_field(
            PropertyField::new("input_type", "str")
                .description("Input Type")
                .default_value("any")
                .choices(type_choice_values()),
        );
        node.declare_field(
            PropertyField::new("input_name", "str")
                .description("Input Name")
                .default_value("state"),
        );
        node.declare_field(
            PropertyField::new("input_optional", "bool")
                .description("Input Optional")
                .default_value(false),
        );
        node.declare_field(
            PropertyField::new("input_group", "str")
                .description("Input Group")
                .default_value(""),
        );
        node.declare_field(
            PropertyField::new("num", "int")
                .description("Number")
                .default_value(0i64),
        );
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, _cx: NodeCx<'_>) -> Result<(), NodeError> {
        // value is routed in from the enclosing scope before the sweep
        Ok(())
    }
}

/// Marker declaring one external output socket of the containing graph.
pub struct Output;

#[async_trait]
impl NodeBehavior for Output {
    fn default_title(&self) -> &str {
        "Output Socket"
    }

    fn setup(&self, node: &mut Node) {
        node.declare_field(
            PropertyField::new("output_type", "str")
                .description("Output Type")
                .default_value("any")
                .choices(type_choice_values()),
        );
        node.declare_field(
            PropertyField::new("output_name", "str")
                .description("Output Name")
                .default_value("state"),
        );
        node.declare_field(
            PropertyField::new("num", "int")
                .description("Number")
                .default_value(0i64),
        );
        node.add_input(Socket::new("value").optional());
    }

    async fn run(&self, _cx: NodeCx<'_>) -> Result<(), NodeError> {
        // received value is routed onto the graph's output socket by the
        // scheduler
        Ok(())
    }
}

/// Declares a named, typed property of the containing graph and exposes
/// its current value.
pub struct ModuleProperty;

#[async_trait]
impl NodeBehavior for ModuleProperty {
    fn default_title(&self) -> &str {
        "Module Property"
    }

    fn setup(&self, node: &mut Node) {
        node.declare_field(
            PropertyField::new("property_name", "str")
                .description("Property Name")
                .default_value(""),
        );
        node.declare_field(
            PropertyField::new("property_type", "str")
                .description("Property Type")
                .default_value("")
                .choices(vec![
                    Value::from("str"),
                    Value::from("bool"),
                    Value::from("int"),
                    Value::from("float"),
                    Value::from("text"),
                ]),
        );
        node.declare_field(PropertyField::new("default", "any").description("Default Value"));
        node.declare_field(PropertyField::new("choices", "list").description("Choices"));
        node.declare_field(
            PropertyField::new("description", "str")
                .description("Description")
                .default_value(""),
        );
        node.add_output(Socket::new("name"));
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, _cx: NodeCx<'_>) -> Result<(), NodeError> {
        // name/value are routed by the scheduler before the sweep
        Ok(())
    }
}

/// Cast a module property value per the node's declared property type,
/// falling back to the node's default when unresolved.
pub fn cast_module_property(node: &Node, value: Value) -> Value {
    let value = if value.is_unresolved() {
        node.stored_property("default")
    } else {
        value
    };
    let property_type = node.stored_property("property_type");
    let property_type = property_type.as_str().unwrap_or("");
    match property_type {
        "" => value,
        other => value
            .coerce(other, &node.title, "default")
            .unwrap_or_else(|_| Value::String(value.to_display())),
    }
}

/// Passes the input value through unchanged.
pub struct Route;

#[async_trait]
impl NodeBehavior for Route {
    fn default_title(&self) -> &str {
        "Route"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("value"));
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        cx.set_output("value", cx.input("value"));
        Ok(())
    }
}

/// Passthrough that logs the observed value while in creative mode.
pub struct Watch;

#[async_trait]
impl NodeBehavior for Watch {
    fn default_title(&self) -> &str {
        "Watch"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("value"));
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let value = cx.input("value");
        if cx.state.creative_mode() {
            debug!(watch = %cx.node.title, value = ?value, "watch");
        }
        cx.set_output("value", value);
        Ok(())
    }
}

/// Priority marker: the lowest stage value in a chain decides when that
/// chain runs relative to other chains.
pub struct Stage;

#[async_trait]
impl NodeBehavior for Stage {
    fn default_title(&self) -> &str {
        "Stage"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state").optional());
        node.add_input(Socket::new("state_b").optional());
        node.add_input(Socket::new("state_c").optional());
        node.add_input(Socket::new("state_d").optional());
        node.declare_field(
            PropertyField::new("stage", "int")
                .description("Stage")
                .default_value(0i64),
        );
        node.add_output(Socket::new("state"));
        node.add_output(Socket::new("state_b"));
        node.add_output(Socket::new("state_c"));
        node.add_output(Socket::new("state_d"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let mut state_value = cx.input("state");
        // an unconnected primary input still produces a flow token
        if state_value.is_unresolved() && !cx.input_connected("state") {
            state_value = Value::Bool(true);
        }
        cx.set_output("state", state_value);
        cx.set_output("state_b", cx.input("state_b"));
        cx.set_output("state_c", cx.input("state_c"));
        cx.set_output("state_d", cx.input("state_d"));
        Ok(())
    }
}

pub fn register(registry: &Registry) -> Result<(), NodeError> {
    registry.register_behavior("core/Entry", Arc::new(Entry), "core/Node")?;
    registry.register_behavior(INPUT_REGISTRY, Arc::new(Input), "core/Node")?;
    registry.register_behavior(OUTPUT_REGISTRY, Arc::new(Output), "core/Node")?;
    registry.register_behavior(MODULE_PROPERTY_REGISTRY, Arc::new(ModuleProperty), "core/Node")?;
    registry.register_behavior("core/Route", Arc::new(Route), "core/Node")?;
    registry.register_behavior("core/Watch", Arc::new(Watch), "core/Node")?;
    registry.register_behavior(STAGE_REGISTRY, Arc::new(Stage), "core/Node")?;
    Ok(())
}
