/// Workflow Management Layer
///
/// Workflow definitions, their SQLite persistence, the petgraph view used by the
/// executor and the lock-free hot-reload registry.

// Event and graph model
pub mod types;

// Petgraph view of a workflow
pub mod graph;

// SQLite persistence for workflow definitions
pub mod storage;

// Hot-reload registry using ArcSwap
pub mod registry;

pub use types::{Edge, Node, NodeKind, Workflow, WorkflowEvent};
