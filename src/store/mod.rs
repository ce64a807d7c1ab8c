/// Persistence for runtime state
///
/// Execution records, approval records and polling-loop state, each in its own
/// SQLite table behind a small repository type.

pub mod approvals;
pub mod database;
pub mod executions;
pub mod loops;

pub use approvals::ApprovalStore;
pub use executions::ExecutionStore;
pub use loops::LoopStore;
