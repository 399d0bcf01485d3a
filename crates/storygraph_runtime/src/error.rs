// Engine errors and control-flow signals.
//
// Control flow (loop break/continue/exit, graph stop) travels through the
// same Result channel as real errors; the scheduler classifies variants
// instead of catching exception types. Scene-level signals always pass
// through every execution layer unmodified.

use serde::{Deserialize, Serialize};

/// Error and control-signal type returned from node and graph execution.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    // Control-flow signals. Never logged as errors, never offered to
    // ErrorHandler nodes.
    #[error("loop continue")]
    LoopContinue,
    #[error("loop break")]
    LoopBreak,
    #[error("loop exit")]
    LoopExit,
    #[error("stop module")]
    StopModule,
    #[error("stop graph execution: {0}")]
    StopGraphExecution(String),
    #[error("stage exit")]
    StageExit,

    // Scene-level signals. Raised by external collaborators, interpreted
    // only by the scene-loop driver.
    #[error("exit scene")]
    ExitScene,
    #[error("reset scene")]
    ResetScene,
    #[error("restart scene loop")]
    RestartSceneLoop,
    #[error("acted as character {0}")]
    ActedAsCharacter(String),
    #[error("generation cancelled")]
    GenerationCancelled,

    // Recoverable and fatal errors.
    #[error("module error: {0}")]
    Module(String),
    #[error("error in node {node} input {input}: {message}")]
    InputValue {
        node: String,
        input: String,
        message: String,
    },
    #[error("registry error: {0}")]
    Registry(String),
    #[error("graph error: {0}")]
    Graph(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NodeError {
    pub fn input(node: impl Into<String>, input: impl Into<String>, message: impl Into<String>) -> Self {
        NodeError::InputValue {
            node: node.into(),
            input: input.into(),
            message: message.into(),
        }
    }

    pub fn stop_graph(reason: impl Into<String>) -> Self {
        NodeError::StopGraphExecution(reason.into())
    }

    /// Scheduling signals that alter control flow without signaling
    /// failure.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            NodeError::LoopContinue
                | NodeError::LoopBreak
                | NodeError::LoopExit
                | NodeError::StopModule
                | NodeError::StopGraphExecution(_)
                | NodeError::StageExit
        )
    }

    /// Scene-level signals that must propagate through every layer.
    pub fn is_scene_signal(&self) -> bool {
        matches!(
            self,
            NodeError::ExitScene
                | NodeError::ResetScene
                | NodeError::RestartSceneLoop
                | NodeError::ActedAsCharacter(_)
                | NodeError::GenerationCancelled
        )
    }

    /// Anything the scheduler re-raises without treating as a node error.
    pub fn is_passthrough(&self) -> bool {
        self.is_control() || self.is_scene_signal()
    }

    /// Short class-style name, exposed to error handler functions.
    pub fn name(&self) -> &'static str {
        match self {
            NodeError::LoopContinue => "LoopContinue",
            NodeError::LoopBreak => "LoopBreak",
            NodeError::LoopExit => "LoopExit",
            NodeError::StopModule => "StopModule",
            NodeError::StopGraphExecution(_) => "StopGraphExecution",
            NodeError::StageExit => "StageExit",
            NodeError::ExitScene => "ExitScene",
            NodeError::ResetScene => "ResetScene",
            NodeError::RestartSceneLoop => "RestartSceneLoop",
            NodeError::ActedAsCharacter(_) => "ActedAsCharacter",
            NodeError::GenerationCancelled => "GenerationCancelled",
            NodeError::Module(_) => "ModuleError",
            NodeError::InputValue { .. } => "InputValueError",
            NodeError::Registry(_) => "RegistryError",
            NodeError::Graph(_) => "GraphError",
            NodeError::Other(_) => "Error",
        }
    }
}

/// Structured error payload handed to graph-authored error handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionWrapper {
    pub name: String,
    pub message: String,
}

impl ExceptionWrapper {
    pub fn from_error(err: &NodeError) -> Self {
        Self {
            name: err.name().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(NodeError::LoopBreak.is_control());
        assert!(NodeError::LoopBreak.is_passthrough());
        assert!(NodeError::ActedAsCharacter("elara".into()).is_scene_signal());
        assert!(!NodeError::Module("boom".into()).is_passthrough());
        assert!(!NodeError::input("n", "x", "missing").is_control());
    }

    #[test]
    fn wrapper_carries_name_and_message() {
        let err = NodeError::input("n1", "value", "Value is not set");
        let wrapped = ExceptionWrapper::from_error(&err);
        assert_eq!(wrapped.name, "InputValueError");
        assert!(wrapped.message.contains("value"));
    }
}
