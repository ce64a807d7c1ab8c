/// Error types for script evaluation, HTTP actions, DAG execution and polling loops.
///
/// Every variant maps to a stable `class()` string that is written to the step log
/// and the loop iteration history.

use thiserror::Error;

/// Errors from the Lua script sandbox.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScriptError {
    #[error("script does not define a `{entry_point}` function")]
    MissingEntryPoint { entry_point: &'static str },
    #[error("script exceeded its {timeout_ms}ms budget")]
    Timeout { timeout_ms: u64 },
    #[error("event could not cross the sandbox boundary: {message}")]
    Serialization { message: String },
    #[error("script error: {message}")]
    RuntimeFault { message: String },
}

impl ScriptError {
    pub fn class(&self) -> &'static str {
        match self {
            ScriptError::MissingEntryPoint { .. } => "script_missing_entry_point",
            ScriptError::Timeout { .. } => "script_timeout",
            ScriptError::Serialization { .. } => "script_serialization",
            ScriptError::RuntimeFault { .. } => "script_runtime_fault",
        }
    }
}

/// Errors from outbound HTTP calls.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HttpError {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },
    #[error("server responded with status {code}")]
    StatusError { code: u16, body: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl HttpError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. } | HttpError::ConnectionFailed { .. } => true,
            HttpError::StatusError { code, .. } => *code >= 500,
            HttpError::InvalidRequest { .. } => false,
        }
    }

    /// Status code to record, 0 when no response arrived
    pub fn status_code(&self) -> u16 {
        match self {
            HttpError::StatusError { code, .. } => *code,
            _ => 0,
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            HttpError::Timeout { .. } => "http_timeout",
            HttpError::ConnectionFailed { .. } => "http_connection_failed",
            HttpError::StatusError { .. } => "http_status",
            HttpError::InvalidRequest { .. } => "http_invalid_request",
        }
    }
}

/// Errors that end a DAG execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("cycle detected at node '{node_id}'")]
    CycleDetected { node_id: String },
    #[error("node '{node_id}' has outgoing edges with no branch selector")]
    MultiplePathsUnresolved { node_id: String },
    #[error("trigger does not accept method {method}")]
    MethodNotAllowed { method: String },
    #[error("node '{node_id}' failed: {message}")]
    NodeFailed {
        node_id: String,
        class: &'static str,
        message: String,
    },
    #[error("execution cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("approval task not found: {0}")]
    ApprovalNotFound(String),
    #[error("approval task {0} is no longer pending")]
    ApprovalAlreadyDecided(String),
    #[error("execution store error: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl ExecutionError {
    pub fn node_failed(node_id: &str, class: &'static str, message: impl ToString) -> Self {
        ExecutionError::NodeFailed {
            node_id: node_id.to_string(),
            class,
            message: message.to_string(),
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            ExecutionError::WorkflowNotFound(_) => "workflow_not_found",
            ExecutionError::NodeNotFound(_) => "node_not_found",
            ExecutionError::CycleDetected { .. } => "cycle_detected",
            ExecutionError::MultiplePathsUnresolved { .. } => "multiple_paths_unresolved",
            ExecutionError::MethodNotAllowed { .. } => "method_not_allowed",
            ExecutionError::NodeFailed { class, .. } => *class,
            ExecutionError::Cancelled { .. } => "cancelled",
            ExecutionError::ExecutionNotFound(_) => "execution_not_found",
            ExecutionError::ApprovalNotFound(_) => "approval_not_found",
            ExecutionError::ApprovalAlreadyDecided(_) => "approval_already_decided",
            ExecutionError::Persistence(_) => "persistence",
        }
    }
}

/// Errors from the polling-loop scheduler and its control operations.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("loop not found: {0}")]
    NotFound(String),
    #[error("cannot {action} a loop that is {from}")]
    InvalidTransition { from: String, action: &'static str },
    #[error("invalid loop configuration: {0}")]
    InvalidConfig(String),
    #[error("loop persistence failure: {0}")]
    PersistenceFailure(String),
}

impl LoopError {
    pub fn class(&self) -> &'static str {
        match self {
            LoopError::NotFound(_) => "loop_not_found",
            LoopError::InvalidTransition { .. } => "invalid_transition",
            LoopError::InvalidConfig(_) => "invalid_loop_config",
            LoopError::PersistenceFailure(_) => "loop_persistence",
        }
    }
}

impl From<sqlx::Error> for LoopError {
    fn from(e: sqlx::Error) -> Self {
        LoopError::PersistenceFailure(e.to_string())
    }
}

impl From<serde_json::Error> for LoopError {
    fn from(e: serde_json::Error) -> Self {
        LoopError::PersistenceFailure(e.to_string())
    }
}
