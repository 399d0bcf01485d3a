// Branching and boolean nodes. Switch-style nodes steer execution by
// deactivating the branch that did not fire; downstream availability
// checks pick the deactivation up without any re-walk.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::NodeError;
use crate::node::{Node, NodeBehavior, NodeCx, PropertyField, Socket};
use crate::registry::Registry;
use crate::state::NodeVerbosity;
use crate::value::Value;

/// Routes to `yes` or `no` based on the truthiness of the input value.
pub struct Switch;

#[async_trait]
impl NodeBehavior for Switch {
    fn default_title(&self) -> &str {
        "Switch"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("value"));
        node.declare_field(
            PropertyField::new("pass_through", "bool")
                .description("Pass the value through instead of True")
                .default_value(true),
        );
        node.add_output(Socket::new("yes"));
        node.add_output(Socket::new("no"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let value = cx.input("value");
        let result = value.as_bool();
        let out_value = if cx.property("pass_through").as_bool() {
            value
        } else {
            Value::Bool(true)
        };

        cx.set_output(
            "yes",
            if result {
                out_value.clone()
            } else {
                Value::Unresolved
            },
        );
        cx.set_output("no", if !result { out_value } else { Value::Unresolved });
        cx.deactivate_output("yes", !result);
        cx.deactivate_output("no", result);
        Ok(())
    }
}

/// Reverse switch: routes one of two inputs to a single output based on
/// a check value.
pub struct RSwitch;

#[async_trait]
impl NodeBehavior for RSwitch {
    fn default_title(&self) -> &str {
        "RSwitch"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("check").optional());
        node.add_input(Socket::new("yes").optional());
        node.add_input(Socket::new("no").optional());
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let check = cx.input("check").as_bool();
        let result = if check { cx.input("yes") } else { cx.input("no") };
        cx.set_output("value", result);
        Ok(())
    }
}

/// Boolean inversion.
pub struct Invert;

#[async_trait]
impl NodeBehavior for Invert {
    fn default_title(&self) -> &str {
        "Invert"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("value"));
        node.add_output(Socket::new("value").with_type("bool"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        cx.set_output("value", !cx.input("value").as_bool());
        Ok(())
    }
}

/// Coerce any value to a boolean.
pub struct AsBool;

#[async_trait]
impl NodeBehavior for AsBool {
    fn default_title(&self) -> &str {
        "As Bool"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("value"));
        node.declare_field(
            PropertyField::new("none_is_false", "bool")
                .description("Treat a missing value as False")
                .default_value(true),
        );
        node.add_output(Socket::new("value").with_type("bool"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        cx.set_output("value", cx.input("value").as_bool());
        Ok(())
    }
}

/// First resolved, non-null value of the candidate inputs.
pub struct Coallesce;

#[async_trait]
impl NodeBehavior for Coallesce {
    fn default_title(&self) -> &str {
        "Coallesce"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("a").optional());
        node.add_input(Socket::new("b").optional());
        node.add_input(Socket::new("c").optional());
        node.add_input(Socket::new("d").optional());
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        for name in ["a", "b", "c", "d"] {
            let value = cx.input(name);
            if value.is_set(false) {
                cx.set_output("value", value);
                return Ok(());
            }
        }
        cx.set_output("value", Value::Null);
        Ok(())
    }
}

/// Fall back to a default when the value is missing.
pub struct ApplyDefault;

#[async_trait]
impl NodeBehavior for ApplyDefault {
    fn default_title(&self) -> &str {
        "Apply Default"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("value").optional());
        node.add_input(Socket::new("default").optional());
        node.declare_field(PropertyField::new("default", "any").description("Default value"));
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let value = cx.input("value");
        let result = if value.is_set(false) {
            value
        } else {
            cx.input("default")
        };
        cx.set_output("value", result);
        Ok(())
    }
}

/// Shared OR/AND routing over up to four connected boolean flags.
struct LogicalRouter {
    title: &'static str,
    all_must_hold: bool,
}

#[async_trait]
impl NodeBehavior for LogicalRouter {
    fn default_title(&self) -> &str {
        self.title
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("a").with_type("bool").with_group("flags"));
        node.add_input(Socket::new("b").with_type("bool").with_group("flags"));
        node.add_input(Socket::new("c").with_type("bool").with_group("flags"));
        node.add_input(Socket::new("d").with_type("bool").with_group("flags"));
        node.add_input(Socket::new("value").optional());
        node.add_output(Socket::new("yes"));
        node.add_output(Socket::new("no"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let mut flags = Vec::new();
        for name in ["a", "b", "c", "d"] {
            if cx.input_connected(name) {
                flags.push(cx.input(name).as_bool());
            }
        }

        let result = if flags.is_empty() {
            false
        } else if self.all_must_hold {
            flags.iter().all(|f| *f)
        } else {
            flags.iter().any(|f| *f)
        };

        cx.deactivate_output("yes", !result);
        cx.deactivate_output("no", result);

        let mut value = cx.input("value");
        if value.is_unresolved() {
            value = Value::Bool(true);
        }
        cx.set_output("yes", if result { value.clone() } else { Value::Unresolved });
        cx.set_output("no", if !result { value } else { Value::Unresolved });

        if cx.verbosity() >= NodeVerbosity::Verbose {
            debug!(node = %cx.node.title, flags = ?flags, result = result, "logical router");
        }
        Ok(())
    }
}

pub fn register(registry: &Registry) -> Result<(), NodeError> {
    registry.register_behavior("core/Switch", Arc::new(Switch), "core/Node")?;
    registry.register_behavior("core/RSwitch", Arc::new(RSwitch), "core/Node")?;
    registry.register_behavior("core/Invert", Arc::new(Invert), "core/Node")?;
    registry.register_behavior("core/AsBool", Arc::new(AsBool), "core/Node")?;
    registry.register_behavior("core/Coallesce", Arc::new(Coallesce), "core/Node")?;
    registry.register_behavior("core/ApplyDefault", Arc::new(ApplyDefault), "core/Node")?;
    registry.register_behavior(
        "core/ORRouter",
        Arc::new(LogicalRouter {
            title: "OR Router",
            all_must_hold: false,
        }),
        "core/Node",
    )?;
    registry.register_behavior(
        "core/ANDRouter",
        Arc::new(LogicalRouter {
            title: "AND Router",
            all_must_hold: true,
        }),
        "core/Node",
    )?;
    Ok(())
}
