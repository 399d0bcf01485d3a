// Utility nodes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::NodeError;
use crate::node::{Node, NodeBehavior, NodeCx, PropertyField, Socket};
use crate::registry::Registry;
use crate::value::Value;

/// Increments a numeric value inside a dict and returns the new value
/// alongside the updated dict.
pub struct Counter;

#[async_trait]
impl NodeBehavior for Counter {
    fn default_title(&self) -> &str {
        "Counter"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state"));
        node.add_input(Socket::new("dict").with_type("dict"));
        node.add_input(Socket::new("key").with_type("str").optional());
        node.add_input(Socket::new("reset").with_type("bool").optional());
        node.declare_field(
            PropertyField::new("increment", "int")
                .description("The amount to increment the value by")
                .default_value(1i64),
        );
        node.declare_field(
            PropertyField::new("key", "str")
                .description("The key to the value to increment")
                .default_value("counter"),
        );
        node.declare_field(
            PropertyField::new("reset", "bool")
                .description("If true, the value will be reset to 0")
                .default_value(false),
        );
        node.add_output(Socket::new("value"));
        node.add_output(Socket::new("dict").with_type("dict"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let Value::Dict(mut map) = cx.input("dict") else {
            return Err(NodeError::input(
                &cx.node.title,
                "dict",
                "Value must be a dict",
            ));
        };
        let key = cx.input("key").to_display();
        let reset = cx.input("reset").as_bool();
        let increment = cx.property("increment").as_int().ok_or_else(|| {
            NodeError::input(&cx.node.title, "increment", "Increment value is required")
        })?;

        let value = if reset {
            0
        } else {
            map.get(&key).and_then(|v| v.as_int()).unwrap_or(0) + increment
        };
        map.insert(key, Value::Int(value));

        cx.set_output("value", value);
        cx.set_output("dict", Value::Dict(map));
        Ok(())
    }
}

pub fn register(registry: &Registry) -> Result<(), NodeError> {
    registry.register_behavior("util/Counter", Arc::new(Counter), "core/Node")?;
    Ok(())
}
