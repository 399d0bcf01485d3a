// Storygraph wire formats
//
// Pure serde data model for node-graph documents as they exist on disk and
// on the editor websocket channel. No runtime behavior lives here; the
// runtime crate hydrates these documents through its node registry.

mod doc;
mod flat;

pub use doc::{CommentDoc, DynamicInputDoc, GroupDoc, NodeDoc, socket_id, split_socket_id};
pub use flat::{ConnectionDoc, FlatGraphDoc, FlatNodeDoc};
