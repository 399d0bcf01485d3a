// Container manipulation nodes: lists, dicts and generic attribute
// access. Containers are value-semantic; nodes that modify one emit the
// updated container on an output socket.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;

use crate::error::NodeError;
use crate::node::{Node, NodeBehavior, NodeCx, PropertyField, Socket};
use crate::registry::Registry;
use crate::state::NodeVerbosity;
use crate::value::Value;

/// Creates a new list, optionally seeded from the `items` property.
pub struct MakeList;

#[async_trait]
impl NodeBehavior for MakeList {
    fn default_title(&self) -> &str {
        "Make List"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state").optional());
        node.declare_field(
            PropertyField::new("items", "list")
                .description("Initial items in the list")
                .default_value(Value::List(Vec::new())),
        );
        node.add_output(Socket::new("list").with_type("list"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let items = match cx.property("items") {
            Value::List(items) => items,
            _ => Vec::new(),
        };
        cx.set_output("list", Value::List(items));
        Ok(())
    }
}

/// Appends an item; a missing list input starts a fresh list.
pub struct ListAppend;

#[async_trait]
impl NodeBehavior for ListAppend {
    fn default_title(&self) -> &str {
        "List Append"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("list").with_type("list").optional());
        node.add_input(Socket::new("item"));
        node.add_output(Socket::new("list").with_type("list"));
        node.add_output(Socket::new("item"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let mut list = match cx.input("list") {
            Value::List(items) => items,
            _ => Vec::new(),
        };
        let item = cx.input("item");
        if cx.verbosity() >= NodeVerbosity::Verbose {
            debug!(list_length = list.len(), item = ?item, "appending item to list");
        }
        list.push(item.clone());
        cx.set_output("list", Value::List(list));
        cx.set_output("item", item);
        Ok(())
    }
}

/// Removes the first occurrence of an item.
pub struct ListRemove;

#[async_trait]
impl NodeBehavior for ListRemove {
    fn default_title(&self) -> &str {
        "List Remove"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("list").with_type("list"));
        node.add_input(Socket::new("item"));
        node.add_output(Socket::new("list").with_type("list"));
        node.add_output(Socket::new("item"));
        node.add_output(Socket::new("removed").with_type("bool"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let Value::List(mut list) = cx.input("list") else {
            return Err(NodeError::input(
                &cx.node.title,
                "list",
                "List must be provided",
            ));
        };
        let item = cx.input("item");
        let removed = match list.iter().position(|v| *v == item) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        };
        cx.set_output("list", Value::List(list));
        cx.set_output("item", item);
        cx.set_output("removed", removed);
        Ok(())
    }
}

/// Length of a list, dict or string.
pub struct Length;

#[async_trait]
impl NodeBehavior for Length {
    fn default_title(&self) -> &str {
        "Length"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("object"));
        node.add_output(Socket::new("length").with_type("int"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let length = match cx.input("object") {
            Value::List(items) => items.len(),
            Value::Dict(map) => map.len(),
            Value::String(s) => s.chars().count(),
            other => {
                return Err(NodeError::input(
                    &cx.node.title,
                    "object",
                    format!("Cannot take length of {}", other.type_name()),
                ));
            }
        };
        cx.set_output("length", length as i64);
        Ok(())
    }
}

/// Creates a new dict.
pub struct MakeDict;

#[async_trait]
impl NodeBehavior for MakeDict {
    fn default_title(&self) -> &str {
        "Make Dict"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("state").optional());
        node.declare_field(
            PropertyField::new("entries", "dict")
                .description("Initial dictionary entries")
                .default_value(Value::Dict(IndexMap::new())),
        );
        node.add_output(Socket::new("dict").with_type("dict"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let entries = match cx.property("entries") {
            Value::Dict(map) => map,
            _ => IndexMap::new(),
        };
        cx.set_output("dict", Value::Dict(entries));
        Ok(())
    }
}

/// Reads a key from a dict, with an optional default.
pub struct DictGet;

#[async_trait]
impl NodeBehavior for DictGet {
    fn default_title(&self) -> &str {
        "Dict Get"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("dict").with_type("dict"));
        node.add_input(Socket::new("key").with_type("str"));
        node.add_input(Socket::new("default").optional());
        node.declare_field(PropertyField::new("key", "str").description("Key"));
        node.add_output(Socket::new("value"));
        node.add_output(Socket::new("dict").with_type("dict"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let dict_value = cx.input("dict");
        let Value::Dict(map) = &dict_value else {
            return Err(NodeError::input(
                &cx.node.title,
                "dict",
                "Value must be a dict",
            ));
        };
        let key = cx.require_input("key")?;
        let key = key.to_display();
        let value = map
            .get(&key)
            .cloned()
            .unwrap_or_else(|| cx.normalized_input("default"));
        cx.set_output("value", value);
        cx.set_output("dict", dict_value);
        Ok(())
    }
}

/// Writes a key into a dict and emits the updated dict.
pub struct DictSet;

#[async_trait]
impl NodeBehavior for DictSet {
    fn default_title(&self) -> &str {
        "Dict Set"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("dict").with_type("dict"));
        node.add_input(Socket::new("key").with_type("str"));
        node.add_input(Socket::new("value"));
        node.declare_field(PropertyField::new("key", "str").description("Key"));
        node.add_output(Socket::new("dict").with_type("dict"));
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let Value::Dict(mut map) = cx.input("dict") else {
            return Err(NodeError::input(
                &cx.node.title,
                "dict",
                "Value must be a dict",
            ));
        };
        let key = cx.require_input("key")?;
        let value = cx.input("value");
        map.insert(key.to_display(), value.clone());
        cx.set_output("dict", Value::Dict(map));
        cx.set_output("value", value);
        Ok(())
    }
}

/// Removes a key from a dict, emitting the removed value.
pub struct DictPop;

#[async_trait]
impl NodeBehavior for DictPop {
    fn default_title(&self) -> &str {
        "Dict Pop"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("dict").with_type("dict"));
        node.add_input(Socket::new("key").with_type("str"));
        node.declare_field(PropertyField::new("key", "str").description("Key"));
        node.add_output(Socket::new("dict").with_type("dict"));
        node.add_output(Socket::new("value"));
        node.add_output(Socket::new("popped").with_type("bool"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let Value::Dict(mut map) = cx.input("dict") else {
            return Err(NodeError::input(
                &cx.node.title,
                "dict",
                "Value must be a dict",
            ));
        };
        let key = cx.require_input("key")?;
        let value = map.shift_remove(&key.to_display());
        cx.set_output("popped", value.is_some());
        cx.set_output("value", value.unwrap_or(Value::Null));
        cx.set_output("dict", Value::Dict(map));
        Ok(())
    }
}

/// Membership check for lists, dicts (keys) and strings (substring).
pub struct Contains;

#[async_trait]
impl NodeBehavior for Contains {
    fn default_title(&self) -> &str {
        "Contains"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("object"));
        node.add_input(Socket::new("value"));
        node.declare_field(PropertyField::new("value", "any").description("Value"));
        node.add_output(Socket::new("contains").with_type("bool"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let object = cx.input("object");
        let value = cx.input("value");
        let contains = match &object {
            Value::Dict(map) => map.contains_key(&value.to_display()),
            Value::List(items) => items.contains(&value),
            Value::String(s) => s.contains(&value.to_display()),
            _ => false,
        };
        if cx.verbosity() >= NodeVerbosity::Normal {
            debug!(value = ?value, contains = contains, "contains check");
        }
        cx.set_output("contains", contains);
        Ok(())
    }
}

/// Generic attribute read: dict key or list index.
pub struct Get;

#[async_trait]
impl NodeBehavior for Get {
    fn default_title(&self) -> &str {
        "Get"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("object"));
        node.add_input(Socket::new("attribute").with_type("str"));
        node.declare_field(PropertyField::new("attribute", "str").description("Attribute"));
        node.add_output(Socket::new("value"));
        node.add_output(Socket::new("attribute").with_type("str"));
        node.add_output(Socket::new("object"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let object = cx.input("object");
        let attribute = cx.require_input("attribute")?;
        let value = match &object {
            Value::Dict(map) => map
                .get(&attribute.to_display())
                .cloned()
                .unwrap_or(Value::Null),
            Value::List(items) => {
                let index = attribute.coerce("int", &cx.node.title, "attribute")?;
                let index = index.as_int().unwrap_or(0);
                let index = if index < 0 {
                    items.len() as i64 + index
                } else {
                    index
                };
                items
                    .get(index.max(0) as usize)
                    .cloned()
                    .unwrap_or(Value::Unresolved)
            }
            _ => Value::Null,
        };
        cx.set_output("value", value);
        cx.set_output("attribute", attribute);
        cx.set_output("object", object);
        Ok(())
    }
}

/// Generic attribute write: dict key or list index.
pub struct Set;

#[async_trait]
impl NodeBehavior for Set {
    fn default_title(&self) -> &str {
        "Set"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("object"));
        node.add_input(Socket::new("attribute").with_type("str"));
        node.add_input(Socket::new("value"));
        node.declare_field(PropertyField::new("attribute", "str").description("Attribute"));
        node.add_output(Socket::new("object"));
        node.add_output(Socket::new("attribute").with_type("str"));
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let object = cx.input("object");
        let attribute = cx.require_input("attribute")?;
        let value = cx.input("value");
        let object = match object {
            Value::Dict(mut map) => {
                map.insert(attribute.to_display(), value.clone());
                Value::Dict(map)
            }
            Value::List(mut items) => {
                let index = attribute.coerce("int", &cx.node.title, "attribute")?;
                let index = index.as_int().unwrap_or(0);
                if index < 0 || index as usize >= items.len() {
                    return Err(NodeError::input(
                        &cx.node.title,
                        "attribute",
                        "List index out of range",
                    ));
                }
                items[index as usize] = value.clone();
                Value::List(items)
            }
            other => {
                return Err(NodeError::input(
                    &cx.node.title,
                    "object",
                    format!("Cannot set attribute on {}", other.type_name()),
                ));
            }
        };
        cx.set_output("object", object);
        cx.set_output("attribute", attribute);
        cx.set_output("value", value);
        Ok(())
    }
}

/// Parses a JSON string into a value.
pub struct Json;

#[async_trait]
impl NodeBehavior for Json {
    fn default_title(&self) -> &str {
        "JSON"
    }

    fn setup(&self, node: &mut Node) {
        node.add_input(Socket::new("json").with_type("str"));
        node.add_output(Socket::new("data").with_type("dict,list"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let raw = cx.require_input("json")?;
        let parsed: serde_json::Value = serde_json::from_str(&raw.to_display())
            .map_err(|e| NodeError::input(&cx.node.title, "json", format!("Invalid JSON: {}", e)))?;
        cx.set_output("data", Value::from_json(&parsed));
        Ok(())
    }
}

pub fn register(registry: &Registry) -> Result<(), NodeError> {
    registry.register_behavior("data/MakeList", Arc::new(MakeList), "core/Node")?;
    registry.register_behavior("data/ListAppend", Arc::new(ListAppend), "core/Node")?;
    registry.register_behavior("data/ListRemove", Arc::new(ListRemove), "core/Node")?;
    registry.register_behavior("data/Length", Arc::new(Length), "core/Node")?;
    registry.register_behavior("data/MakeDict", Arc::new(MakeDict), "core/Node")?;
    registry.register_behavior("data/DictGet", Arc::new(DictGet), "core/Node")?;
    registry.register_behavior("data/DictSet", Arc::new(DictSet), "core/Node")?;
    registry.register_behavior("data/DictPop", Arc::new(DictPop), "core/Node")?;
    registry.register_behavior("data/Contains", Arc::new(Contains), "core/Node")?;
    registry.register_behavior("data/Get", Arc::new(Get), "core/Node")?;
    registry.register_behavior("data/Set", Arc::new(Set), "core/Node")?;
    registry.register_behavior("data/JSON", Arc::new(Json), "core/Node")?;
    Ok(())
}
