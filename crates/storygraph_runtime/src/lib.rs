// Storygraph runtime
//
// A typed dataflow/graph interpreter for author-scripted game logic:
// nodes with sockets and properties, nested graphs and loops, event
// listeners, callable function subgraphs, and a scene-loop driver. Graph
// definitions are data (see `storygraph_types`); behavior is attached
// through the node registry at hydration time, so the same graph can be
// executed concurrently by independent `GraphState`s.

pub mod command;
pub mod error;
pub mod event;
pub mod exec;
pub mod graph;
pub mod layout;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod run;
pub mod scene;
pub mod signals;
pub mod state;
pub mod value;

pub use error::{ExceptionWrapper, NodeError};
pub use event::ScriptEvent;
pub use exec::{ExecOptions, execute, execute_loop, execute_to_node};
pub use graph::{Graph, GraphKind, GraphNode};
pub use node::{Node, NodeBehavior, NodeCx, PropertyField, Socket, SocketRef};
pub use registry::{NodeSeed, Registry};
pub use run::FunctionWrapper;
pub use scene::Scene;
pub use state::{GraphState, NodeState, NodeVerbosity};
pub use value::Value;
