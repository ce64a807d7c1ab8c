/// Node execution handlers
///
/// One handler per node kind, dispatched from a single match. Handlers never touch
/// the walk state: they turn an input event into a [`NodeOutput`] and the engine
/// decides which edges that output travels on.

use crate::runtime::actions::{render_template, ActionRunner};
use crate::runtime::error::{ExecutionError, HttpError};
use crate::runtime::http::{HttpExecutor, HttpRequest};
use crate::runtime::sandbox::ScriptSandbox;
use crate::runtime::scheduler::LoopScheduler;
use crate::store::loops::LoopState;
use crate::workflow::types::{
    ApprovalGate, FailureAction, HttpRequestAction, Node, NodeKind, WorkflowEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Identity of the execution a node runs in
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub cancel: CancellationToken,
}

/// What a node produced
#[derive(Debug)]
pub enum NodeOutput {
    /// Deliver on every outgoing edge
    Forward(WorkflowEvent),
    /// Action failed under `FailureAction::Continue`; the input travels on
    Skipped {
        event: WorkflowEvent,
        class: &'static str,
        message: String,
    },
    /// Condition result, already recorded in the event
    Branch { result: bool, event: WorkflowEvent },
    /// Transformer returned nothing
    Dropped,
    /// Polling loop registered; the branch parks until it finishes
    LoopScheduled(LoopState),
    /// Approval gate reached; the engine raises the task
    AwaitApproval(ApprovalGate),
}

/// Dispatches nodes to the sandbox, the HTTP executor, app actions or the loop scheduler
pub struct NodeExecutor {
    sandbox: ScriptSandbox,
    http: HttpExecutor,
    actions: ActionRunner,
    scheduler: Arc<LoopScheduler>,
}

impl NodeExecutor {
    pub fn new(
        sandbox: ScriptSandbox,
        http: HttpExecutor,
        actions: ActionRunner,
        scheduler: Arc<LoopScheduler>,
    ) -> Self {
        Self {
            sandbox,
            http,
            actions,
            scheduler,
        }
    }

    /// Execute a single node against its input event
    pub async fn execute_node(
        &self,
        node: &Node,
        input: &WorkflowEvent,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, ExecutionError> {
        tracing::info!("🚀 Starting node execution: {} (type: {})", node.id, node.kind.type_name());
        let start_time = std::time::Instant::now();

        let result = self.dispatch(node, input, ctx).await;

        let duration = start_time.elapsed();
        match &result {
            Ok(_) => tracing::info!("✅ Node execution completed: {} in {:?}", node.id, duration),
            Err(e) => tracing::error!("❌ Node execution failed: {} in {:?} - Error: {}", node.id, duration, e),
        }

        result
    }

    async fn dispatch(
        &self,
        node: &Node,
        input: &WorkflowEvent,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, ExecutionError> {
        match &node.kind {
            NodeKind::Trigger { .. } => Ok(NodeOutput::Forward(
                input.clone().with_metadata("trigger_node_id", &node.id),
            )),
            NodeKind::Condition { script } => {
                let result = self
                    .sandbox
                    .evaluate_condition(script, input)
                    .await
                    .map_err(|e| ExecutionError::node_failed(&node.id, e.class(), e))?;
                let mut event = input.clone();
                event.condition_results.insert(node.name.clone(), result);
                tracing::debug!("🔀 Condition '{}' evaluated to {}", node.name, result);
                Ok(NodeOutput::Branch { result, event })
            }
            NodeKind::Transformer { script } => {
                match self
                    .sandbox
                    .evaluate_transformer(script, input)
                    .await
                    .map_err(|e| ExecutionError::node_failed(&node.id, e.class(), e))?
                {
                    Some(event) => Ok(NodeOutput::Forward(event)),
                    None => {
                        tracing::debug!("🗑️ Transformer '{}' dropped the event", node.name);
                        Ok(NodeOutput::Dropped)
                    }
                }
            }
            NodeKind::HttpRequest(action) if action.loop_config.is_some() => {
                let state = self
                    .scheduler
                    .schedule_loop(&ctx.execution_id, &ctx.workflow_id, &node.id, action, input.clone())
                    .await
                    .map_err(|e| ExecutionError::node_failed(&node.id, e.class(), e))?;
                Ok(NodeOutput::LoopScheduled(state))
            }
            NodeKind::HttpRequest(action) => self.execute_http_request(node, action, input).await,
            NodeKind::Email(action) => match self.actions.send_email(action, input).await {
                Ok(_) => Ok(NodeOutput::Forward(input.clone())),
                Err(e) => on_failure(node, action.failure_action, input, e),
            },
            NodeKind::Llm(action) => match self.actions.complete(action, input).await {
                Ok(output) => Ok(NodeOutput::Forward(input.with_data(output))),
                Err(e) => on_failure(node, action.failure_action, input, e),
            },
            NodeKind::LogSink(action) => match self.actions.ship_logs(action, input).await {
                Ok(_) => Ok(NodeOutput::Forward(input.clone())),
                Err(e) => on_failure(node, action.failure_action, input, e),
            },
            NodeKind::Delay { duration, unit } => {
                let wait = unit.to_duration(*duration);
                tracing::debug!("⏳ Delay node '{}' waiting {:?}", node.name, wait);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => Ok(NodeOutput::Forward(input.clone())),
                    _ = ctx.cancel.cancelled() => Err(ExecutionError::Cancelled {
                        reason: format!("cancelled during delay node '{}'", node.id),
                    }),
                }
            }
            NodeKind::HumanApproval(gate) => Ok(NodeOutput::AwaitApproval(gate.clone())),
        }
    }

    async fn execute_http_request(
        &self,
        node: &Node,
        action: &HttpRequestAction,
        input: &WorkflowEvent,
    ) -> Result<NodeOutput, ExecutionError> {
        let request = HttpRequest {
            url: render_template(&action.url, input),
            method: action.method,
            headers: action.headers.clone(),
            body: input.data.clone(),
        };

        match self
            .http
            .execute(
                &request,
                Duration::from_secs(action.timeout_seconds),
                &action.retry_config,
                action.failure_action,
            )
            .await
        {
            Ok(result) => Ok(NodeOutput::Forward(
                input
                    .with_data(result.body)
                    .with_metadata("http_status", result.status)
                    .with_metadata("http_latency_ms", result.latency_ms)
                    .with_metadata("http_attempts", result.attempts),
            )),
            Err(e) => on_failure(node, action.failure_action, input, e),
        }
    }
}

/// Apply an action node's failure policy
fn on_failure(
    node: &Node,
    failure_action: FailureAction,
    input: &WorkflowEvent,
    error: HttpError,
) -> Result<NodeOutput, ExecutionError> {
    match failure_action {
        FailureAction::Continue => {
            tracing::warn!("⚠️ Node '{}' failed but continuing: {}", node.name, error);
            Ok(NodeOutput::Skipped {
                event: input.clone(),
                class: error.class(),
                message: error.to_string(),
            })
        }
        FailureAction::Stop | FailureAction::Retry => {
            Err(ExecutionError::node_failed(&node.id, error.class(), error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmailConfig, HttpConfig, LlmConfig, SandboxConfig, SchedulerConfig};
    use crate::store::database::test_pool;
    use crate::store::loops::LoopStore;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn executor() -> NodeExecutor {
        let http = HttpExecutor::new(&HttpConfig::default()).unwrap();
        let sandbox = ScriptSandbox::new(&SandboxConfig::default());
        let scheduler = Arc::new(LoopScheduler::new(
            LoopStore::new(test_pool().await),
            http.clone(),
            sandbox.clone(),
            SchedulerConfig::default(),
        ));
        let actions = ActionRunner::new(
            http.clone(),
            EmailConfig {
                relay_url: None,
                api_key: None,
                default_from: "robot@dagloop.test".to_string(),
            },
            LlmConfig::default(),
        );
        NodeExecutor::new(sandbox, http, actions, scheduler)
    }

    fn ctx() -> NodeContext {
        NodeContext {
            execution_id: "exec-1".to_string(),
            workflow_id: "wf".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    fn node(value: serde_json::Value) -> Node {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn condition_records_result_by_node_name() {
        let condition = node(json!({
            "id": "c1", "name": "is_big", "type": "condition",
            "script": "function condition(event) return event.data.amount > 100 end"
        }));
        let output = executor()
            .await
            .execute_node(&condition, &WorkflowEvent::new(json!({"amount": 250})), &ctx())
            .await
            .unwrap();

        let NodeOutput::Branch { result, event } = output else {
            panic!("expected a branch");
        };
        assert!(result);
        assert_eq!(event.condition_results["is_big"], true);
    }

    #[tokio::test]
    async fn script_errors_fail_the_node() {
        let transformer = node(json!({
            "id": "t1", "name": "shape", "type": "transformer",
            "script": "function transformer(event) return event.data.missing.field end"
        }));
        let err = executor()
            .await
            .execute_node(&transformer, &WorkflowEvent::new(json!({})), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.class(), "script_runtime_fault");
    }

    #[tokio::test]
    async fn http_success_replaces_data_and_records_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 5})))
            .mount(&server)
            .await;

        let request = node(json!({
            "id": "h1", "name": "create", "type": "http_request",
            "url": format!("{}/orders", server.uri()), "method": "POST"
        }));
        let NodeOutput::Forward(event) = executor()
            .await
            .execute_node(&request, &WorkflowEvent::new(json!({"sku": "a"})), &ctx())
            .await
            .unwrap()
        else {
            panic!("expected forward");
        };
        assert_eq!(event.data, json!({"id": 5}));
        assert_eq!(event.metadata["http_status"], "201");
        assert_eq!(event.metadata["http_attempts"], "1");
    }

    #[tokio::test]
    async fn continue_passes_original_event_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let request = node(json!({
            "id": "h1", "name": "flaky", "type": "http_request",
            "url": server.uri(), "failure_action": "continue"
        }));
        let input = WorkflowEvent::new(json!({"keep": true}));
        let output = executor().await.execute_node(&request, &input, &ctx()).await.unwrap();

        let NodeOutput::Skipped { event, class, .. } = output else {
            panic!("expected skipped");
        };
        assert_eq!(event, input);
        assert_eq!(class, "http_status");
    }

    #[tokio::test]
    async fn invalid_loop_config_fails_the_node() {
        let request = node(json!({
            "id": "h1", "name": "poll", "type": "http_request",
            "url": "http://status.test", "loop_config": { "interval_seconds": 0 }
        }));
        let err = executor()
            .await
            .execute_node(&request, &WorkflowEvent::default(), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.class(), "invalid_loop_config");
    }

    #[tokio::test]
    async fn delay_aborts_on_cancellation() {
        let delay = node(json!({ "id": "d1", "name": "wait", "type": "delay", "duration": 1, "unit": "hours" }));
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = executor()
            .await
            .execute_node(&delay, &WorkflowEvent::default(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled { .. }));
    }
}
