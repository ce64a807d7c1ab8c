/// Core workflow type definitions
///
/// Defines the event envelope passed between nodes and the graph model (workflows,
/// nodes, edges) together with the per-node action configuration. These types are
/// deserialized from workflow JSON and persisted as JSON in SQLite.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Output handle for a human approval gate's immediate notification
pub const HANDLE_NOTIFY: &str = "notify";
/// Output handle taken when an approval is granted
pub const HANDLE_APPROVED: &str = "approved";
/// Output handle taken when an approval is denied or times out denied
pub const HANDLE_DENIED: &str = "denied";
/// Output handle taken when a polling loop completes successfully
pub const HANDLE_SUCCESS: &str = "success";
/// Output handle taken when a polling loop fails
pub const HANDLE_FAILURE: &str = "failure";

/// Envelope passed from node to node
///
/// Each hop produces a new event; nodes never mutate their input in place.
/// `condition_results` accumulates the boolean outcome of every condition node
/// evaluated on the path, keyed by node name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Payload, addressed as `$.data` by templates and JSONPath
    #[serde(default)]
    pub data: Value,
    /// Free-form string annotations carried along the path
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Inbound request headers, lowercased
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Condition node name to the branch it took
    #[serde(default)]
    pub condition_results: HashMap<String, bool>,
}

impl WorkflowEvent {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Build the initial event for an inbound trigger request
    pub fn from_request(
        workflow_id: &str,
        execution_id: &str,
        payload: Value,
        headers: HashMap<String, String>,
        method: HttpMethod,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("workflow_id".to_string(), workflow_id.to_string());
        metadata.insert("execution_id".to_string(), execution_id.to_string());
        metadata.insert("trigger_method".to_string(), method.as_str().to_string());
        metadata.insert("started_at".to_string(), chrono::Utc::now().to_rfc3339());

        Self {
            data: payload,
            metadata,
            headers,
            condition_results: HashMap::new(),
        }
    }

    /// Copy of this event carrying new data
    pub fn with_data(&self, data: Value) -> Self {
        Self {
            data,
            metadata: self.metadata.clone(),
            headers: self.headers.clone(),
            condition_results: self.condition_results.clone(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// JSON view used when resolving `{{ $.path }}` templates
    pub fn template_context(&self) -> Value {
        json!({
            "data": self.data,
            "metadata": self.metadata,
            "headers": self.headers,
            "condition_results": self.condition_results,
        })
    }
}

/// A complete workflow definition
///
/// Loaded from JSON, stored in SQLite and compiled into a petgraph view at execution
/// time. `start_node_id` names the single trigger node events enter through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-order-status")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Optional free text shown in listings
    #[serde(default)]
    pub description: Option<String>,
    /// Entry point for inbound events
    pub start_node_id: String,
    /// Nodes in definition order
    pub nodes: Vec<Node>,
    /// Edges in definition order; fan-out follows this order
    pub edges: Vec<Edge>,
}

impl Workflow {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == node_id)
    }
}

/// A single node in the workflow graph
///
/// The `type` tag and the variant's fields sit at the same JSON level as `id` and
/// `name`, e.g. `{"id": "n2", "name": "is_done", "type": "condition", "script": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the workflow
    pub id: String,
    /// Unique display name, used as the key in `condition_results`
    pub name: String,
    /// Node type and its configuration
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Convergence policy when more than one edge feeds this node
    #[serde(default)]
    pub input_merge_strategy: Option<InputMergeStrategy>,
}

impl Node {
    /// Merge strategy in force for this node (trigger and condition nodes always wait for all)
    pub fn merge_strategy(&self) -> InputMergeStrategy {
        match self.kind {
            NodeKind::Trigger { .. } | NodeKind::Condition { .. } => InputMergeStrategy::WaitForAll,
            _ => self.input_merge_strategy.clone().unwrap_or_default(),
        }
    }
}

/// Closed set of node behaviors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point; an empty method list accepts any method
    Trigger {
        #[serde(default)]
        methods: Vec<HttpMethod>,
    },
    /// Lua script defining `condition(event)`
    Condition { script: String },
    /// Lua script defining `transformer(event)`
    Transformer { script: String },
    /// Outbound HTTP call, optionally repeated as a polling loop
    HttpRequest(HttpRequestAction),
    /// Email delivered through the configured relay
    Email(EmailAction),
    /// Pause the branch for a fixed duration
    Delay {
        duration: u64,
        #[serde(default)]
        unit: DelayUnit,
    },
    /// Human approval gate with notify/approved/denied outputs
    HumanApproval(ApprovalGate),
    /// Anthropic messages API completion
    Llm(LlmAction),
    /// OpenObserve JSON log ingestion
    LogSink(LogSinkAction),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Trigger { .. } => "trigger",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Transformer { .. } => "transformer",
            NodeKind::HttpRequest(_) => "http_request",
            NodeKind::Email(_) => "email",
            NodeKind::Delay { .. } => "delay",
            NodeKind::HumanApproval(_) => "human_approval",
            NodeKind::Llm(_) => "llm",
            NodeKind::LogSink(_) => "log_sink",
        }
    }
}

/// Connection between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Optional identifier
    #[serde(default)]
    pub id: String,
    /// Source node id
    pub from_node_id: String,
    /// Target node id
    pub to_node_id: String,
    /// Branch this edge represents when the source is a condition node
    #[serde(default)]
    pub condition_result: Option<bool>,
    /// Output handle of a multi-output source node
    #[serde(default)]
    pub source_handle_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    #[serde(rename = "GET", alias = "get")]
    Get,
    #[serde(rename = "POST", alias = "post")]
    Post,
    #[serde(rename = "PUT", alias = "put")]
    Put,
    #[serde(rename = "PATCH", alias = "patch")]
    Patch,
    #[serde(rename = "DELETE", alias = "delete")]
    Delete,
    #[serde(rename = "HEAD", alias = "head")]
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }

    /// Whether the event data travels as a JSON body rather than query parameters
    pub fn has_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            other => Err(format!("unsupported HTTP method: {other}")),
        }
    }
}

/// What an action node does when its call fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Log the failure and pass the original event on
    Continue,
    /// Fail the execution
    #[default]
    Stop,
    /// Retry per `RetryConfig`, then fail the execution
    Retry,
}

/// Exponential retry policy for `FailureAction::Retry`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Wait before the second attempt
    pub initial_delay_ms: u64,
    /// Upper bound on any single wait
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

/// Configuration of an `http_request` node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestAction {
    /// Target URL; may contain `{{ $.path }}` placeholders
    pub url: String,
    /// Defaults to GET, which sends `data` as query parameters
    #[serde(default)]
    pub method: HttpMethod,
    /// Per-attempt timeout
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// What to do when every attempt fails
    #[serde(default)]
    pub failure_action: FailureAction,
    /// Used only with `FailureAction::Retry`
    #[serde(default)]
    pub retry_config: RetryConfig,
    /// Extra request headers, sent as given
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Turns the node into a persisted polling loop
    #[serde(default)]
    pub loop_config: Option<LoopConfig>,
}

/// Configuration of an `email` node; `subject` and `body` are templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAction {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub failure_action: FailureAction,
    #[serde(default)]
    pub retry_config: RetryConfig,
}

fn default_max_tokens() -> u32 {
    1024
}

/// Configuration of an `llm` node; `prompt` and `system_prompt` are templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAction {
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub failure_action: FailureAction,
    #[serde(default)]
    pub retry_config: RetryConfig,
}

fn default_stream() -> String {
    "default".to_string()
}

/// Configuration of a `log_sink` node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSinkAction {
    /// OpenObserve base URL including the organization, e.g. `http://o2:5080/api/default`
    pub url: String,
    /// Full `Authorization` header value
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub failure_action: FailureAction,
    #[serde(default)]
    pub retry_config: RetryConfig,
}

/// Configuration of a `human_approval` node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Decision deadline; waits indefinitely when absent
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub timeout_action: ApprovalTimeoutAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTimeoutAction {
    Approve,
    #[default]
    Deny,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    pub fn to_duration(self, amount: u64) -> Duration {
        let factor = match self {
            DelayUnit::Seconds => 1,
            DelayUnit::Minutes => 60,
            DelayUnit::Hours => 3_600,
            DelayUnit::Days => 86_400,
        };
        Duration::from_secs(amount.saturating_mul(factor))
    }
}

fn default_interval_seconds() -> u64 {
    60
}

/// Polling-loop definition attached to an `http_request` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Unbounded when absent
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Base wait between iterations
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Defaults to a fixed wait of `interval_seconds`
    #[serde(default)]
    pub backoff_strategy: Option<BackoffStrategy>,
    /// Checked against every response; absent means run until `max_iterations`
    #[serde(default)]
    pub termination_condition: Option<TerminationCondition>,
}

impl LoopConfig {
    pub fn backoff(&self) -> BackoffStrategy {
        self.backoff_strategy
            .clone()
            .unwrap_or(BackoffStrategy::Fixed(self.interval_seconds))
    }
}

/// Wait between loop iterations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed(u64),
    Exponential { base: u64, multiplier: f64, max: u64 },
}

impl BackoffStrategy {
    /// Seconds to wait after `iteration` iterations have completed (1-based)
    pub fn interval_after(&self, iteration: u32) -> u64 {
        match self {
            BackoffStrategy::Fixed(seconds) => *seconds,
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let exponent = iteration.saturating_sub(1) as i32;
                let raw = *base as f64 * multiplier.powi(exponent);
                if !raw.is_finite() {
                    return *max;
                }
                raw.min(*max as f64).floor() as u64
            }
        }
    }
}

/// Script evaluated after every loop iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationCondition {
    /// Lua source defining `condition(event)`
    pub script: String,
    #[serde(default)]
    pub action: TerminationAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationAction {
    #[default]
    Success,
    Failure,
    Stop,
}

/// Convergence policy for nodes with several incoming edges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMergeStrategy {
    /// Wait until every live predecessor has delivered
    #[default]
    WaitForAll,
    /// Proceed with the first arrival and ignore the rest
    FirstWins,
    /// Proceed when all arrive or the timeout (seconds) elapses after the first arrival
    TimeoutBased(u64),
}
