/// dagloop: workflow automation engine
///
/// Walks DAG workflows event by event, runs user condition and transformer scripts in a
/// Lua sandbox and turns loop-configured HTTP actions into persisted, resumable polling
/// loops driven by a background scheduler.

// Core configuration and setup
pub mod config;

// Workflow definitions, storage, graph view and hot-reload registry
pub mod workflow;

// SQLite persistence for executions, loops and approvals
pub mod store;

// Runtime execution engine, node handlers and loop scheduler
pub mod runtime;

// HTTP API layer - webhook triggers and control endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use runtime::{ExecutionEngine, LoopScheduler};
pub use server::start_server;
pub use workflow::{Edge, Node, NodeKind, Workflow, WorkflowEvent};
