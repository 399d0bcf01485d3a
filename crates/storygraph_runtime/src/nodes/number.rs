// Arithmetic nodes. Integer inputs keep integer results where the
// operation allows it; division always produces a float.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use crate::error::NodeError;
use crate::node::{Node, NodeBehavior, NodeCx, PropertyField, Socket};
use crate::registry::Registry;
use crate::value::Value;

struct Num {
    value: f64,
    is_int: bool,
}

fn number_input(cx: &NodeCx<'_>, name: &str) -> Result<Num, NodeError> {
    let value = cx.require_input(name)?;
    match value {
        Value::Int(i) => Ok(Num {
            value: i as f64,
            is_int: true,
        }),
        Value::Float(f) => Ok(Num {
            value: f,
            is_int: false,
        }),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(|value| Num {
                value,
                is_int: false,
            })
            .map_err(|_| NodeError::input(&cx.node.title, name, "Invalid number")),
        _ => Err(NodeError::input(
            &cx.node.title,
            name,
            "Value must be a number",
        )),
    }
}

fn number_value(value: f64, as_int: bool) -> Value {
    if as_int && value.fract() == 0.0 {
        Value::Int(value as i64)
    } else {
        Value::Float(value)
    }
}

/// Produces a number from its `value` property.
pub struct MakeNumber;

#[async_trait]
impl NodeBehavior for MakeNumber {
    fn default_title(&self) -> &str {
        "Make Number"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state").optional());
        node.declare_field(
            PropertyField::new("value", "float")
                .description("Value")
                .default_value(0.0),
        );
        node.add_output(Socket::new("value").with_type("int,float"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        cx.set_output("value", cx.property("value"));
        Ok(())
    }
}

/// add / subtract / multiply / divide / power / modulo over two operands.
pub struct BasicArithmetic;

#[async_trait]
impl NodeBehavior for BasicArithmetic {
    fn default_title(&self) -> &str {
        "Basic Arithmetic"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("a").with_type("int,float"));
        node.add_input(Socket::new("b").with_type("int,float"));
        node.declare_field(
            PropertyField::new("operation", "str")
                .description("Arithmetic operation to perform")
                .default_value("add")
                .choices(vec![
                    Value::from("add"),
                    Value::from("subtract"),
                    Value::from("multiply"),
                    Value::from("divide"),
                    Value::from("power"),
                    Value::from("modulo"),
                ]),
        );
        node.declare_field(
            PropertyField::new("a", "float")
                .description("First operand")
                .default_value(0i64),
        );
        node.declare_field(
            PropertyField::new("b", "float")
                .description("Second operand")
                .default_value(0i64),
        );
        node.add_output(Socket::new("result").with_type("int,float"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let a = number_input(&cx, "a")?;
        let b = number_input(&cx, "b")?;
        let operation = cx.property("operation");
        let operation = operation.as_str().unwrap_or("add");
        let both_int = a.is_int && b.is_int;

        let result = match operation {
            "add" => number_value(a.value + b.value, both_int),
            "subtract" => number_value(a.value - b.value, both_int),
            "multiply" => number_value(a.value * b.value, both_int),
            "divide" => {
                if b.value == 0.0 {
                    return Err(NodeError::input(&cx.node.title, "b", "Division by zero"));
                }
                Value::Float(a.value / b.value)
            }
            "power" => number_value(a.value.powf(b.value), both_int),
            "modulo" => {
                if b.value == 0.0 {
                    return Err(NodeError::input(&cx.node.title, "b", "Modulo by zero"));
                }
                number_value(a.value.rem_euclid(b.value), both_int)
            }
            other => {
                return Err(NodeError::input(
                    &cx.node.title,
                    "operation",
                    format!("Unknown operation: {}", other),
                ));
            }
        };
        cx.set_output("result", result);
        Ok(())
    }
}

/// Numeric comparison with a tolerance for floating point equality.
pub struct Compare;

#[async_trait]
impl NodeBehavior for Compare {
    fn default_title(&self) -> &str {
        "Compare"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("a").with_type("int,float"));
        node.add_input(Socket::new("b").with_type("int,float"));
        node.declare_field(
            PropertyField::new("operation", "str")
                .description("Comparison operation to perform")
                .default_value("equals")
                .choices(vec![
                    Value::from("equals"),
                    Value::from("not_equals"),
                    Value::from("greater_than"),
                    Value::from("less_than"),
                    Value::from("greater_equal"),
                    Value::from("less_equal"),
                ]),
        );
        node.declare_field(
            PropertyField::new("tolerance", "float")
                .description("Tolerance for floating point comparison")
                .default_value(0.0001),
        );
        node.declare_field(
            PropertyField::new("a", "float")
                .description("First value to compare")
                .default_value(0i64),
        );
        node.declare_field(
            PropertyField::new("b", "float")
                .description("Second value to compare")
                .default_value(0i64),
        );
        node.add_output(Socket::new("result").with_type("bool"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let a = number_input(&cx, "a")?.value;
        let b = number_input(&cx, "b")?.value;
        let tolerance = cx.property("tolerance").as_float().unwrap_or(0.0001);
        let operation = cx.property("operation");

        let result = match operation.as_str().unwrap_or("equals") {
            "equals" => (a - b).abs() <= tolerance,
            "not_equals" => (a - b).abs() > tolerance,
            "greater_than" => a > b,
            "less_than" => a < b,
            "greater_equal" => a >= b,
            "less_equal" => a <= b,
            other => {
                return Err(NodeError::input(
                    &cx.node.title,
                    "operation",
                    format!("Unknown operation: {}", other),
                ));
            }
        };
        cx.set_output("result", result);
        Ok(())
    }
}

/// Minimum and maximum of two values.
pub struct MinMax;

#[async_trait]
impl NodeBehavior for MinMax {
    fn default_title(&self) -> &str {
        "Min Max"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("a").with_type("int,float"));
        node.add_input(Socket::new("b").with_type("int,float"));
        node.add_output(Socket::new("min").with_type("int,float"));
        node.add_output(Socket::new("max").with_type("int,float"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let a = number_input(&cx, "a")?;
        let b = number_input(&cx, "b")?;
        let both_int = a.is_int && b.is_int;
        cx.set_output("min", number_value(a.value.min(b.value), both_int));
        cx.set_output("max", number_value(a.value.max(b.value), both_int));
        Ok(())
    }
}

/// Sum over a list of numbers.
pub struct Sum;

#[async_trait]
impl NodeBehavior for Sum {
    fn default_title(&self) -> &str {
        "Sum"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("values").with_type("list"));
        node.add_output(Socket::new("sum").with_type("int,float"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let Value::List(values) = cx.input("values") else {
            return Err(NodeError::input(
                &cx.node.title,
                "values",
                "Value must be a list",
            ));
        };
        let mut total = 0.0;
        let mut all_int = true;
        for value in &values {
            match value {
                Value::Int(i) => total += *i as f64,
                Value::Float(f) => {
                    total += f;
                    all_int = false;
                }
                other => {
                    return Err(NodeError::input(
                        &cx.node.title,
                        "values",
                        format!("Cannot sum {}", other.type_name()),
                    ));
                }
            }
        }
        cx.set_output("sum", number_value(total, all_int));
        Ok(())
    }
}

/// Clamp a value into [min, max].
pub struct Clamp;

#[async_trait]
impl NodeBehavior for Clamp {
    fn default_title(&self) -> &str {
        "Clamp"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("value").with_type("int,float"));
        node.declare_field(
            PropertyField::new("min", "float")
                .description("Lower bound")
                .default_value(0.0),
        );
        node.declare_field(
            PropertyField::new("max", "float")
                .description("Upper bound")
                .default_value(1.0),
        );
        node.add_output(Socket::new("value").with_type("int,float"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let value = number_input(&cx, "value")?;
        let min = cx.property("min").as_float().unwrap_or(0.0);
        let max = cx.property("max").as_float().unwrap_or(1.0);
        cx.set_output(
            "value",
            number_value(value.value.clamp(min, max), value.is_int),
        );
        Ok(())
    }
}

/// Random number in [min, max).
pub struct Random;

#[async_trait]
impl NodeBehavior for Random {
    fn default_title(&self) -> &str {
        "Random"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state").optional());
        node.declare_field(
            PropertyField::new("min", "float")
                .description("Lower bound")
                .default_value(0.0),
        );
        node.declare_field(
            PropertyField::new("max", "float")
                .description("Upper bound")
                .default_value(1.0),
        );
        node.add_output(Socket::new("value").with_type("float"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let min = cx.property("min").as_float().unwrap_or(0.0);
        let max = cx.property("max").as_float().unwrap_or(1.0);
        let value = if min < max {
            rand::thread_rng().gen_range(min..max)
        } else {
            min
        };
        cx.set_output("value", value);
        Ok(())
    }
}

pub fn register(registry: &Registry) -> Result<(), NodeError> {
    registry.register_behavior("data/number/Make", Arc::new(MakeNumber), "core/Node")?;
    registry.register_behavior(
        "data/number/BasicArithmetic",
        Arc::new(BasicArithmetic),
        "core/Node",
    )?;
    registry.register_behavior("data/number/Compare", Arc::new(Compare), "core/Node")?;
    registry.register_behavior("data/number/MinMax", Arc::new(MinMax), "core/Node")?;
    registry.register_behavior("data/number/Sum", Arc::new(Sum), "core/Node")?;
    registry.register_behavior("data/number/Clamp", Arc::new(Clamp), "core/Node")?;
    registry.register_behavior("data/number/Random", Arc::new(Random), "core/Node")?;
    Ok(())
}
