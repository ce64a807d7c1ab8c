/// Runtime Execution Layer
///
/// The DAG walker, the node handlers it dispatches to, the Lua sandbox, the HTTP
/// action executor and the background polling-loop scheduler.

// Error taxonomy shared by every runtime component
pub mod error;

// Lua condition/transformer sandbox
pub mod sandbox;

// Outbound HTTP with retry and outcome classification
pub mod http;

// Email, LLM and log-sink actions plus event templating
pub mod actions;

// Folding of converging branch inputs
pub mod merge;

// Individual node execution handlers
pub mod executor;

// DAG walk and public execution facade
pub mod engine;

// Background scheduler for persisted polling loops
pub mod scheduler;

// Re-export main types
pub use engine::ExecutionEngine;
pub use executor::NodeExecutor;
pub use scheduler::LoopScheduler;
