// State scope manipulation nodes.
//
// Variables live in one of several scopes: the local execution scope,
// the parent scope, the shared map spanning nested executions, the
// per-cycle scene-loop dict, or the scene's persistent game state.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::NodeError;
use crate::node::{Node, NodeBehavior, NodeCx, PropertyField, Socket};
use crate::registry::Registry;
use crate::value::Value;

const SCENE_LOOP_KEY: &str = "scene_loop";

#[derive(Clone, Copy, PartialEq)]
enum Scope {
    Local,
    Parent,
    Shared,
    SceneLoop,
    Game,
}

fn scope_from(cx: &NodeCx<'_>) -> Result<Scope, NodeError> {
    let scope = cx.property("scope");
    match scope.as_str().unwrap_or("local") {
        "local" => Ok(Scope::Local),
        "parent" => Ok(Scope::Parent),
        "shared" => Ok(Scope::Shared),
        "scene loop" => Ok(Scope::SceneLoop),
        "game" => Ok(Scope::Game),
        other => Err(NodeError::input(
            &cx.node.title,
            "scope",
            format!("Unknown scope: {}", other),
        )),
    }
}

fn scope_choices() -> Vec<Value> {
    vec![
        Value::from("local"),
        Value::from("parent"),
        Value::from("shared"),
        Value::from("scene loop"),
        Value::from("game"),
    ]
}

fn declare_common(node: &mut Node) {
    node.add_input(Socket::new("name").with_type("str").optional());
    node.declare_field(
        PropertyField::new("name", "str").description("The name of the variable to manipulate"),
    );
    node.declare_field(
        PropertyField::new("scope", "str")
            .description("Which scope to manipulate")
            .default_value("local")
            .choices(scope_choices()),
    );
}

fn scope_get(cx: &NodeCx<'_>, scope: Scope, name: &str) -> Option<Value> {
    match scope {
        Scope::Local => cx.state.get(name),
        Scope::Parent => cx.state.outer().and_then(|outer| outer.get(name)),
        Scope::Shared => cx.state.shared_get(name),
        Scope::SceneLoop => match cx.state.shared_get(SCENE_LOOP_KEY) {
            Some(Value::Dict(map)) => map.get(name).cloned(),
            _ => {
                warn!("not inside a scene loop, reading empty scope");
                None
            }
        },
        Scope::Game => cx.state.scene().and_then(|scene| scene.game_state_get(name)),
    }
}

fn scope_set(cx: &NodeCx<'_>, scope: Scope, name: &str, value: Value) {
    match scope {
        Scope::Local => cx.state.set(name, value),
        Scope::Parent => {
            if let Some(outer) = cx.state.outer() {
                outer.set(name, value);
            }
        }
        Scope::Shared => cx.state.shared_set(name, value),
        Scope::SceneLoop => {
            let mut map = match cx.state.shared_get(SCENE_LOOP_KEY) {
                Some(Value::Dict(map)) => map,
                _ => {
                    warn!("not inside a scene loop, writing empty scope");
                    Default::default()
                }
            };
            map.insert(name.to_string(), value);
            cx.state.shared_set(SCENE_LOOP_KEY, Value::Dict(map));
        }
        Scope::Game => {
            if let Some(scene) = cx.state.scene() {
                scene.game_state_set(name, value);
            }
        }
    }
}

fn scope_unset(cx: &NodeCx<'_>, scope: Scope, name: &str) -> Option<Value> {
    match scope {
        Scope::Local => cx.state.remove(name),
        Scope::Parent => cx.state.outer().and_then(|outer| outer.remove(name)),
        Scope::Shared => cx.state.shared_remove(name),
        Scope::SceneLoop => {
            let mut map = match cx.state.shared_get(SCENE_LOOP_KEY) {
                Some(Value::Dict(map)) => map,
                _ => return None,
            };
            let removed = map.shift_remove(name);
            cx.state.shared_set(SCENE_LOOP_KEY, Value::Dict(map));
            removed
        }
        Scope::Game => cx.state.scene().and_then(|scene| scene.game_state_remove(name)),
    }
}

/// Set a variable in a scope.
pub struct SetState;

#[async_trait]
impl NodeBehavior for SetState {
    fn default_title(&self) -> &str {
        "Set State"
    }

    fn setup(&self, node: &mut Node) {
        declare_common(node);
        node.add_input(Socket::new("value"));
        node.add_output(Socket::new("name").with_type("str"));
        node.add_output(Socket::new("value"));
        node.add_output(Socket::new("scope").with_type("str"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let name = cx.require_input("name")?.to_display();
        let value = cx.input("value");
        let scope = scope_from(&cx)?;
        scope_set(&cx, scope, &name, value.clone());
        cx.set_output("name", name);
        cx.set_output("value", value);
        cx.set_output("scope", cx.property("scope"));
        Ok(())
    }
}

/// Read a variable from a scope, with an optional default.
pub struct GetState;

#[async_trait]
impl NodeBehavior for GetState {
    fn default_title(&self) -> &str {
        "Get State"
    }

    fn setup(&self, node: &mut Node) {
        declare_common(node);
        node.add_input(Socket::new("default").optional());
        node.add_output(Socket::new("name").with_type("str"));
        node.add_output(Socket::new("value"));
        node.add_output(Socket::new("scope").with_type("str"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let name = cx.require_input("name")?.to_display();
        let scope = scope_from(&cx)?;
        let value = scope_get(&cx, scope, &name)
            .unwrap_or_else(|| cx.normalized_input("default"));
        cx.set_output("name", name);
        cx.set_output("value", value);
        cx.set_output("scope", cx.property("scope"));
        Ok(())
    }
}

/// Remove a variable from a scope.
pub struct UnsetState;

#[async_trait]
impl NodeBehavior for UnsetState {
    fn default_title(&self) -> &str {
        "Unset State"
    }

    fn setup(&self, node: &mut Node) {
        declare_common(node);
        node.add_output(Socket::new("name").with_type("str"));
        node.add_output(Socket::new("removed").with_type("bool"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let name = cx.require_input("name")?.to_display();
        let scope = scope_from(&cx)?;
        let removed = scope_unset(&cx, scope, &name).is_some();
        cx.set_output("name", name);
        cx.set_output("removed", removed);
        Ok(())
    }
}

/// Whether a variable exists in a scope.
pub struct HasState;

#[async_trait]
impl NodeBehavior for HasState {
    fn default_title(&self) -> &str {
        "Has State"
    }

    fn setup(&self, node: &mut Node) {
        declare_common(node);
        node.add_output(Socket::new("exists").with_type("bool"));
        node.add_output(Socket::new("value"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let name = cx.require_input("name")?.to_display();
        let scope = scope_from(&cx)?;
        let value = scope_get(&cx, scope, &name);
        cx.set_output("exists", value.is_some());
        cx.set_output("value", value.unwrap_or(Value::Unresolved));
        Ok(())
    }
}

/// Increment a numeric variable in a scope, creating it at zero.
pub struct CounterState;

#[async_trait]
impl NodeBehavior for CounterState {
    fn default_title(&self) -> &str {
        "Counter State"
    }

    fn setup(&self, node: &mut Node) {
        declare_common(node);
        node.add_input(Socket::new("state").optional());
        node.add_input(Socket::new("reset").with_type("bool").optional());
        node.declare_field(
            PropertyField::new("increment", "int")
                .description("The amount to increment the value by")
                .default_value(1i64),
        );
        node.add_output(Socket::new("value").with_type("int"));
    }

    async fn run(&self, cx: NodeCx<'_>) -> Result<(), NodeError> {
        let name = cx.require_input("name")?.to_display();
        let scope = scope_from(&cx)?;
        let increment = cx.property("increment").as_int().unwrap_or(1);

        let value = if cx.input("reset").as_bool() {
            0
        } else {
            let current = scope_get(&cx, scope, &name)
                .and_then(|v| v.as_int())
                .unwrap_or(0);
            current + increment
        };
        scope_set(&cx, scope, &name, Value::Int(value));
        cx.set_output("value", value);
        Ok(())
    }
}

pub fn register(registry: &Registry) -> Result<(), NodeError> {
    registry.register_behavior("state/SetState", Arc::new(SetState), "core/Node")?;
    registry.register_behavior("state/GetState", Arc::new(GetState), "core/Node")?;
    registry.register_behavior("state/UnsetState", Arc::new(UnsetState), "core/Node")?;
    registry.register_behavior("state/HasState", Arc::new(HasState), "core/Node")?;
    registry.register_behavior("state/CounterState", Arc::new(CounterState), "core/Node")?;
    Ok(())
}
