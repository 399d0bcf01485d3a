// Slash commands.
//
// A command is a Function-kind graph registered under a `command/` path.
// The scene loop registers every such type as a slash command on its
// first cycle; player input starting with `!` dispatches to one, with
// colon-separated arguments passed as a single `args` list.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::graph::{Graph, GraphNode};
use crate::registry::{NodeSeed, Registry};
use crate::run::FunctionWrapper;
use crate::scene::Scene;
use crate::state::GraphState;
use crate::value::Value;

pub const COMMAND_BASE_TYPE: &str = "command/Command";

/// Parse a `!name:arg1:arg2` message into its command name and args.
pub fn parse_command(text: &str) -> Option<(&str, Vec<&str>)> {
    let rest = text.strip_prefix('!')?;
    if rest.is_empty() {
        return None;
    }
    let mut parts = rest.split(':');
    let name = parts.next()?;
    Some((name, parts.collect()))
}

/// Named command graphs available to the player.
pub struct CommandSet {
    commands: Mutex<IndexMap<String, Arc<Graph>>>,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandSet {
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(IndexMap::new()),
        }
    }

    pub fn register(&self, name: &str, graph: Arc<Graph>) {
        debug!(command = %name, "registering command");
        self.commands.lock().insert(name.to_string(), graph);
    }

    pub fn names(&self) -> Vec<String> {
        self.commands.lock().keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Graph>> {
        self.commands.lock().get(name).cloned()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
    }

    /// Dispatch a player message. Returns false when the message is not
    /// a command or names an unknown one.
    pub async fn execute(&self, text: &str, state: &GraphState) -> Result<bool, NodeError> {
        let Some((name, args)) = parse_command(text) else {
            return Ok(false);
        };
        let Some(command) = self.get(name) else {
            warn!(command = %name, "unknown command");
            return Ok(false);
        };

        let wrapper = FunctionWrapper::for_graph(command, state.clone());
        let mut kwargs = IndexMap::new();
        kwargs.insert(
            "args".to_string(),
            Value::List(args.into_iter().map(Value::from).collect()),
        );
        wrapper.call(kwargs).await?;
        Ok(true)
    }
}

/// Register every `command/Command` node type in the registry as a
/// slash command on the scene.
pub fn register_commands_from_registry(
    scene: &Scene,
    registry: &Registry,
) -> Result<(), NodeError> {
    for path in registry.paths_by_base_type(COMMAND_BASE_TYPE) {
        let node = registry.create(&path, NodeSeed::default())?;
        let GraphNode::Graph(graph) = node else {
            warn!(path = %path, "command type is not a graph");
            continue;
        };
        let name = match graph.properties.get("name").and_then(|v| v.as_str()) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => path.rsplit('/').next().unwrap_or(&path).to_string(),
        };
        scene.commands().register(&name, graph);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_splits_args() {
        assert_eq!(parse_command("!roll:d20:2"), Some(("roll", vec!["d20", "2"])));
        assert_eq!(parse_command("!save"), Some(("save", vec![])));
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("!"), None);
    }
}
