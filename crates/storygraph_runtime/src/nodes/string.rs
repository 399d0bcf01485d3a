// String manipulation nodes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::NodeError;
use crate::node::{Node, NodeBehavior, NodeCx, PropertyField, Socket};
use crate::registry::Registry;
use crate::value::Value;

/// Produces a string from its `value` property or input.
pub struct MakeString;

#[async_trait]
impl NodeBehavior for MakeString {
    fn default_title(&self) -> &str {
        "Make String"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state").optional());
        node.add_input(Socket::new("value").with_type("str").optional());
        node.declare_field(
            PropertyField::new("value", "str")
                .description("Value")
                .default_value(""),
        );
        node.add_output(Socket::new("value").with_type("str"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let value = cx.input("value");
        cx.set_output("value", value.to_display());
        Ok(())
    }
}

/// Splits a string on a delimiter.
pub struct Split;

#[async_trait]
impl NodeBehavior for Split {
    fn default_title(&self) -> &str {
        "Split"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("string").with_type("str"));
        node.add_input(Socket::new("delimiter").with_type("str").optional());
        node.declare_field(
            PropertyField::new("delimiter", "str")
                .description("Delimiter")
                .default_value(" "),
        );
        node.add_output(Socket::new("parts").with_type("list"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let string = cx.require_input("string")?.to_display();
        let delimiter = cx.input("delimiter").to_display();
        let parts: Vec<Value> = if delimiter.is_empty() {
            string.chars().map(|c| Value::String(c.to_string())).collect()
        } else {
            string
                .split(&delimiter)
                .map(|part| Value::String(part.to_string()))
                .collect()
        };
        cx.set_output("parts", Value::List(parts));
        Ok(())
    }
}

/// Joins a list of values with a delimiter.
pub struct Join;

#[async_trait]
impl NodeBehavior for Join {
    fn default_title(&self) -> &str {
        "Join"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("parts").with_type("list"));
        node.add_input(Socket::new("delimiter").with_type("str").optional());
        node.declare_field(
            PropertyField::new("delimiter", "str")
                .description("Delimiter")
                .default_value(" "),
        );
        node.add_output(Socket::new("string").with_type("str"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let Value::List(parts) = cx.input("parts") else {
            return Err(NodeError::input(
                &cx.node.title,
                "parts",
                "Value must be a list",
            ));
        };
        let delimiter = cx.input("delimiter").to_display();
        let joined = parts
            .iter()
            .map(Value::to_display)
            .collect::<Vec<_>>()
            .join(&delimiter);
        cx.set_output("string", joined);
        Ok(())
    }
}

/// Replaces occurrences of a substring.
pub struct Replace;

#[async_trait]
impl NodeBehavior for Replace {
    fn default_title(&self) -> &str {
        "Replace"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("string").with_type("str"));
        node.add_input(Socket::new("old").with_type("str"));
        node.add_input(Socket::new("new").with_type("str"));
        node.declare_field(PropertyField::new("old", "str").description("Old").default_value(""));
        node.declare_field(PropertyField::new("new", "str").description("New").default_value(""));
        node.add_output(Socket::new("string").with_type("str"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let string = cx.require_input("string")?.to_display();
        let old = cx.input("old").to_display();
        let new = cx.input("new").to_display();
        let result = if old.is_empty() {
            string
        } else {
            string.replace(&old, &new)
        };
        cx.set_output("string", result);
        Ok(())
    }
}

/// Formats a template by substituting `{key}` placeholders from a
/// variables dict.
pub struct Format;

#[async_trait]
impl NodeBehavior for Format {
    fn default_title(&self) -> &str {
        "Format"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("template").with_type("str"));
        node.add_input(Socket::new("variables").with_type("dict").optional());
        node.declare_field(
            PropertyField::new("template", "str")
                .description("Template")
                .default_value(""),
        );
        node.add_output(Socket::new("string").with_type("str"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let template = cx.require_input("template")?.to_display();
        let mut result = template;
        if let Value::Dict(variables) = cx.input("variables") {
            for (key, value) in &variables {
                result = result.replace(&format!("{{{}}}", key), &value.to_display());
            }
        }
        cx.set_output("string", result);
        Ok(())
    }
}

/// Case transforms: upper, lower, title, capitalize.
pub struct Case;

#[async_trait]
impl NodeBehavior for Case {
    fn default_title(&self) -> &str {
        "Case"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("string").with_type("str"));
        node.declare_field(
            PropertyField::new("case", "str")
                .description("Case")
                .default_value("lower")
                .choices(vec![
                    Value::from("upper"),
                    Value::from("lower"),
                    Value::from("title"),
                    Value::from("capitalize"),
                ]),
        );
        node.add_output(Socket::new("string").with_type("str"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let string = cx.require_input("string")?.to_display();
        let case = cx.property("case");
        let result = match case.as_str().unwrap_or("lower") {
            "upper" => string.to_uppercase(),
            "lower" => string.to_lowercase(),
            "title" => string
                .split(' ')
                .map(capitalize)
                .collect::<Vec<_>>()
                .join(" "),
            "capitalize" => capitalize(&string),
            other => {
                return Err(NodeError::input(
                    &cx.node.title,
                    "case",
                    format!("Unknown case: {}", other),
                ));
            }
        };
        cx.set_output("string", result);
        Ok(())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Trims whitespace (or given characters) from one or both ends.
pub struct Trim;

#[async_trait]
impl NodeBehavior for Trim {
    fn default_title(&self) -> &str {
        "Trim"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("string").with_type("str"));
        node.declare_field(
            PropertyField::new("mode", "str")
                .description("Which ends to trim")
                .default_value("both")
                .choices(vec![
                    Value::from("both"),
                    Value::from("left"),
                    Value::from("right"),
                ]),
        );
        node.declare_field(
            PropertyField::new("characters", "str")
                .description("Characters to trim; empty trims whitespace")
                .default_value(""),
        );
        node.add_output(Socket::new("string").with_type("str"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let string = cx.require_input("string")?.to_display();
        let mode = cx.property("mode");
        let characters = cx.property("characters").to_display();

        let result = if characters.is_empty() {
            match mode.as_str().unwrap_or("both") {
                "left" => string.trim_start().to_string(),
                "right" => string.trim_end().to_string(),
                _ => string.trim().to_string(),
            }
        } else {
            let set: Vec<char> = characters.chars().collect();
            let matcher = |c: char| set.contains(&c);
            match mode.as_str().unwrap_or("both") {
                "left" => string.trim_start_matches(matcher).to_string(),
                "right" => string.trim_end_matches(matcher).to_string(),
                _ => string
                    .trim_start_matches(matcher)
                    .trim_end_matches(matcher)
                    .to_string(),
            }
        };
        cx.set_output("string", result);
        Ok(())
    }
}

/// Extracts a substring by character offsets; negative offsets count
/// from the end.
pub struct Substring;

#[async_trait]
impl NodeBehavior for Substring {
    fn default_title(&self) -> &str {
        "Substring"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("string").with_type("str"));
        node.declare_field(
            PropertyField::new("start", "int")
                .description("Start offset")
                .default_value(0i64),
        );
        node.declare_field(
            PropertyField::new("end", "int")
                .description("End offset; unset means end of string"),
        );
        node.add_output(Socket::new("string").with_type("str"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let string = cx.require_input("string")?.to_display();
        let chars: Vec<char> = string.chars().collect();
        let len = chars.len() as i64;

        let clamp_offset = |offset: i64| -> usize {
            let resolved = if offset < 0 { len + offset } else { offset };
            resolved.clamp(0, len) as usize
        };

        let start = clamp_offset(cx.property("start").as_int().unwrap_or(0));
        let end = match cx.property("end").as_int() {
            Some(end) => clamp_offset(end),
            None => len as usize,
        };
        let result: String = if start < end {
            chars[start..end].iter().collect()
        } else {
            String::new()
        };
        cx.set_output("string", result);
        Ok(())
    }
}

/// String predicates: contains / startswith / endswith / equals.
pub struct StringCheck;

#[async_trait]
impl NodeBehavior for StringCheck {
    fn default_title(&self) -> &str {
        "String Check"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("string").with_type("str"));
        node.add_input(Socket::new("other").with_type("str").optional());
        node.declare_field(
            PropertyField::new("check", "str")
                .description("Check to perform")
                .default_value("contains")
                .choices(vec![
                    Value::from("contains"),
                    Value::from("startswith"),
                    Value::from("endswith"),
                    Value::from("equals"),
                ]),
        );
        node.declare_field(
            PropertyField::new("other", "str")
                .description("Value to check against")
                .default_value(""),
        );
        node.add_output(Socket::new("result").with_type("bool"));
        node.add_output(Socket::new("string").with_type("str"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let string = cx.require_input("string")?.to_display();
        let other = cx.input("other").to_display();
        let check = cx.property("check");
        let result = match check.as_str().unwrap_or("contains") {
            "contains" => string.contains(&other),
            "startswith" => string.starts_with(&other),
            "endswith" => string.ends_with(&other),
            "equals" => string == other,
            _ => false,
        };
        cx.set_output("result", result);
        cx.set_output("string", string);
        Ok(())
    }
}

pub fn register(registry: &Registry) -> Result<(), NodeError> {
    registry.register_behavior("data/string/Make", Arc::new(MakeString), "core/Node")?;
    registry.register_behavior("data/string/Split", Arc::new(Split), "core/Node")?;
    registry.register_behavior("data/string/Join", Arc::new(Join), "core/Node")?;
    registry.register_behavior("data/string/Replace", Arc::new(Replace), "core/Node")?;
    registry.register_behavior("data/string/Format", Arc::new(Format), "core/Node")?;
    registry.register_behavior("data/string/Case", Arc::new(Case), "core/Node")?;
    registry.register_behavior("data/string/Trim", Arc::new(Trim), "core/Node")?;
    registry.register_behavior("data/string/Substring", Arc::new(Substring), "core/Node")?;
    registry.register_behavior("data/string/StringCheck", Arc::new(StringCheck), "core/Node")?;
    Ok(())
}
