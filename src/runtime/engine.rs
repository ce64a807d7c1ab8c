/// DAG execution engine
///
/// Walks a workflow graph for one inbound event. Node tasks run on a `JoinSet` and
/// report back to a single coordinator that owns the edge state, so convergence,
/// dead-path elimination and cycle detection are decided in one place. The engine is
/// also the public facade for execution, loop and approval operations.

use crate::runtime::actions::render_template;
use crate::runtime::error::{ExecutionError, LoopError};
use crate::runtime::executor::{NodeContext, NodeExecutor, NodeOutput};
use crate::runtime::merge::merge_inputs;
use crate::runtime::scheduler::LoopScheduler;
use crate::store::approvals::{ApprovalStatus, ApprovalTask};
use crate::store::executions::{ExecutionRecord, ExecutionStatus, ExecutionStep, NewStep, StepStatus};
use crate::store::loops::{LoopControl, LoopState, LoopStatus, LoopStatusReport};
use crate::store::{ApprovalStore, ExecutionStore};
use crate::workflow::registry::{CompiledWorkflow, WorkflowRegistry};
use crate::workflow::types::{
    ApprovalGate, ApprovalTimeoutAction, HttpMethod, InputMergeStrategy, Node, NodeKind, WorkflowEvent,
    HANDLE_APPROVED, HANDLE_DENIED, HANDLE_FAILURE, HANDLE_NOTIFY, HANDLE_SUCCESS,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::{Entry, VacantEntry};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Decision channel of an approval gate that is still waiting
struct PendingApproval {
    execution_id: String,
    decision: oneshot::Sender<bool>,
}

/// Handles of an execution whose walk is live
struct LiveWalk {
    cancel: CancellationToken,
    /// Retried loops rejoining the walk: (node_id, loop_id)
    rejoin: mpsc::UnboundedSender<(String, String)>,
}

/// Execution engine facade
///
/// Cloning is cheap; every walk task holds its own clone.
#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<WorkflowRegistry>,
    executor: Arc<NodeExecutor>,
    scheduler: Arc<LoopScheduler>,
    executions: ExecutionStore,
    approvals: ApprovalStore,
    /// Every execution with a live walk; removed only once no rejoin is pending
    running: Arc<DashMap<String, LiveWalk>>,
    /// Key: approval task id
    pending_approvals: Arc<DashMap<String, PendingApproval>>,
}

/// Where a walk starts
enum Origin {
    /// Fresh event entering through the start node
    Trigger(WorkflowEvent),
    /// Continuation from loop nodes whose loops are still live: (node_id, loop_id)
    Loops(Vec<(String, String)>),
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        executor: Arc<NodeExecutor>,
        scheduler: Arc<LoopScheduler>,
        executions: ExecutionStore,
        approvals: ApprovalStore,
    ) -> Self {
        Self {
            registry,
            executor,
            scheduler,
            executions,
            approvals,
            running: Arc::new(DashMap::new()),
            pending_approvals: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Accept an inbound event and start its walk; returns the execution id immediately
    pub async fn submit_event(
        &self,
        workflow_id: &str,
        payload: Value,
        headers: HashMap<String, String>,
        method: HttpMethod,
    ) -> Result<String, ExecutionError> {
        let compiled = self
            .registry
            .get_workflow(workflow_id)
            .ok_or_else(|| ExecutionError::WorkflowNotFound(workflow_id.to_string()))?;

        let start_node_id = &compiled.workflow.start_node_id;
        let start = compiled
            .workflow
            .node(start_node_id)
            .ok_or_else(|| ExecutionError::NodeNotFound(start_node_id.clone()))?;
        if let NodeKind::Trigger { methods } = &start.kind {
            if !methods.is_empty() && !methods.contains(&method) {
                return Err(ExecutionError::MethodNotAllowed {
                    method: method.to_string(),
                });
            }
        }

        let execution_id = Uuid::new_v4().to_string();
        let event = WorkflowEvent::from_request(workflow_id, &execution_id, payload, headers, method);
        self.executions.create(&execution_id, workflow_id, &event).await?;

        tracing::info!("📨 Accepted {} event for workflow '{}' as execution {}", method, workflow_id, execution_id);
        self.spawn_walk(compiled, execution_id.clone(), Origin::Trigger(event));
        Ok(execution_id)
    }

    pub async fn get_execution_status(&self, execution_id: &str) -> Result<ExecutionRecord, ExecutionError> {
        self.executions
            .get(execution_id)
            .await?
            .ok_or_else(|| ExecutionError::ExecutionNotFound(execution_id.to_string()))
    }

    pub async fn list_execution_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>, ExecutionError> {
        self.get_execution_status(execution_id).await?;
        Ok(self.executions.list_steps(execution_id).await?)
    }

    /// Request cancellation; the walk settles the final status
    ///
    /// An execution without a live walk is marked cancelled directly. Terminal
    /// executions are left as they are.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<ExecutionRecord, ExecutionError> {
        let record = self.get_execution_status(execution_id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }

        if let Some(live) = self.running.get(execution_id) {
            tracing::info!("🛑 Cancelling execution {}", execution_id);
            live.cancel.cancel();
            return Ok(record);
        }

        self.stop_loops_of(execution_id).await;
        self.executions
            .finish(
                execution_id,
                ExecutionStatus::Cancelled,
                None,
                Some(("cancelled", "cancelled by request".to_string())),
            )
            .await?;
        self.get_execution_status(execution_id).await
    }

    pub async fn get_loop_status(&self, loop_id: &str) -> Result<LoopStatusReport, LoopError> {
        self.scheduler.status(loop_id).await
    }

    pub async fn list_active_loops(&self, execution_id: Option<&str>) -> Result<Vec<LoopStatusReport>, LoopError> {
        self.scheduler.list_active(execution_id).await
    }

    pub async fn pause_loop(&self, loop_id: &str) -> Result<LoopState, LoopError> {
        self.scheduler.control(loop_id, LoopControl::Pause).await
    }

    pub async fn resume_loop(&self, loop_id: &str) -> Result<LoopState, LoopError> {
        self.scheduler.control(loop_id, LoopControl::Resume).await
    }

    pub async fn stop_loop(&self, loop_id: &str) -> Result<LoopState, LoopError> {
        self.scheduler.control(loop_id, LoopControl::Stop).await
    }

    /// Restart a failed or stopped loop and resume its execution from the loop node
    ///
    /// A live walk takes the loop back in; otherwise a continuation walk starts.
    pub async fn retry_loop(&self, loop_id: &str) -> Result<LoopState, LoopError> {
        let state = self.scheduler.control(loop_id, LoopControl::Retry).await?;

        match self.registry.get_workflow(&state.workflow_id) {
            Some(compiled) => {
                let resumed = (state.node_id.clone(), state.id.clone());
                match self.running.entry(state.execution_id.clone()) {
                    Entry::Occupied(live) => {
                        tracing::info!("🔁 Loop {} rejoins the live walk of execution {}", state.id, state.execution_id);
                        // The receiver outlives the entry
                        let _ = live.get().rejoin.send(resumed);
                    }
                    Entry::Vacant(slot) => {
                        let (cancel, rejoin) = register_walk(slot);
                        self.launch(compiled, state.execution_id.clone(), cancel, rejoin, Origin::Loops(vec![resumed]));
                    }
                }
            }
            None => tracing::warn!(
                "⚠️ Workflow '{}' is gone; retried loop {} has no execution to resume",
                state.workflow_id,
                state.id
            ),
        }
        Ok(state)
    }

    /// Record a human decision for a pending approval task
    pub async fn decide_approval(
        &self,
        task_id: &str,
        approved: bool,
        comment: Option<String>,
    ) -> Result<ApprovalTask, ExecutionError> {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };

        let Some(task) = self.approvals.settle(task_id, status, comment).await? else {
            return match self.approvals.get(task_id).await? {
                Some(_) => Err(ExecutionError::ApprovalAlreadyDecided(task_id.to_string())),
                None => Err(ExecutionError::ApprovalNotFound(task_id.to_string())),
            };
        };

        tracing::info!("🙋 Approval {} {}", task_id, status.as_str());
        match self.pending_approvals.remove(task_id) {
            Some((_, pending)) => {
                // The walk may have ended in the meantime
                let _ = pending.decision.send(approved);
            }
            None => tracing::warn!("⚠️ No live walk is waiting on approval {}", task_id),
        }
        Ok(task)
    }

    /// Reconcile persisted state after a restart
    ///
    /// Pending approvals are abandoned, loops are re-armed, executions parked on a live
    /// loop get a continuation walk and every other unfinished execution is failed.
    /// Returns the number of continuations started.
    pub async fn recover_on_startup(&self) -> anyhow::Result<usize> {
        let abandoned = self.approvals.abandon_pending().await?;
        if abandoned > 0 {
            tracing::warn!("⚠️ Abandoned {} pending approval task(s) from before restart", abandoned);
        }
        self.scheduler.recover().await?;

        let mut resumed = 0;
        for status in [ExecutionStatus::Running, ExecutionStatus::Pending] {
            for record in self.executions.list_by_status(status).await? {
                let loops: Vec<(String, String)> = self
                    .scheduler
                    .store()
                    .list_active(Some(&record.id))
                    .await?
                    .into_iter()
                    .map(|state| (state.node_id, state.id))
                    .collect();

                let compiled = self.registry.get_workflow(&record.workflow_id);
                match compiled {
                    Some(compiled) if status == ExecutionStatus::Running && !loops.is_empty() => {
                        tracing::info!(
                            "♻️ Resuming execution {} from {} live loop(s)",
                            record.id,
                            loops.len()
                        );
                        self.spawn_walk(compiled, record.id.clone(), Origin::Loops(loops));
                        resumed += 1;
                    }
                    _ => {
                        tracing::warn!("⚠️ Execution {} was interrupted by restart", record.id);
                        self.stop_loops_of(&record.id).await;
                        self.executions
                            .finish(
                                &record.id,
                                ExecutionStatus::Failed,
                                None,
                                Some(("interrupted", "interrupted by restart".to_string())),
                            )
                            .await?;
                    }
                }
            }
        }
        Ok(resumed)
    }

    /// Start a walk unless the execution already has one; returns whether it started
    fn spawn_walk(&self, compiled: CompiledWorkflow, execution_id: String, origin: Origin) -> bool {
        match self.running.entry(execution_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let (cancel, rejoin) = register_walk(slot);
                self.launch(compiled, execution_id, cancel, rejoin, origin);
                true
            }
        }
    }

    fn launch(
        &self,
        compiled: CompiledWorkflow,
        execution_id: String,
        cancel: CancellationToken,
        rejoin: mpsc::UnboundedReceiver<(String, String)>,
        origin: Origin,
    ) {
        let ctx = NodeContext {
            execution_id,
            workflow_id: compiled.workflow.id.clone(),
            cancel,
        };
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(compiled, ctx, origin, rejoin).await });
    }

    /// Run walks for an execution until no retried loop is left to pick up
    async fn drive(
        self,
        compiled: CompiledWorkflow,
        mut ctx: NodeContext,
        mut origin: Origin,
        mut rejoin: mpsc::UnboundedReceiver<(String, String)>,
    ) {
        let execution_id = ctx.execution_id.clone();
        loop {
            self.walk_once(compiled.clone(), ctx.clone(), origin, &mut rejoin).await;

            // Retries sent after the walk stopped listening get a walk of their own
            let pending = loop {
                let pending: Vec<(String, String)> = std::iter::from_fn(|| rejoin.try_recv().ok()).collect();
                if !pending.is_empty() {
                    break pending;
                }
                if self
                    .running
                    .remove_if(&execution_id, |_, _| rejoin.is_empty())
                    .is_some()
                {
                    return;
                }
            };

            tracing::info!("🔁 Continuing execution {} from {} retried loop(s)", execution_id, pending.len());
            let cancel = CancellationToken::new();
            if let Some(mut live) = self.running.get_mut(&execution_id) {
                live.cancel = cancel.clone();
            }
            ctx.cancel = cancel;
            origin = Origin::Loops(pending);
        }
    }

    async fn walk_once(
        &self,
        compiled: CompiledWorkflow,
        ctx: NodeContext,
        origin: Origin,
        rejoin: &mut mpsc::UnboundedReceiver<(String, String)>,
    ) {
        let execution_id = ctx.execution_id.clone();
        let started = std::time::Instant::now();

        let outcome = match self.executions.mark_running(&execution_id).await {
            Ok(()) => Walk::new(self.clone(), compiled, ctx).run(origin, rejoin).await,
            Err(e) => Err(e.into()),
        };

        let finished = match &outcome {
            Ok(output) => {
                tracing::info!("🏁 Execution {} completed in {:?}", execution_id, started.elapsed());
                self.executions
                    .finish(&execution_id, ExecutionStatus::Completed, output.as_ref(), None)
                    .await
            }
            Err(e) => {
                let status = match e {
                    ExecutionError::Cancelled { .. } => ExecutionStatus::Cancelled,
                    _ => ExecutionStatus::Failed,
                };
                tracing::error!("❌ Execution {} ended {}: {}", execution_id, status.as_str(), e);
                self.stop_loops_of(&execution_id).await;
                self.executions
                    .finish(&execution_id, status, None, Some((e.class(), e.to_string())))
                    .await
            }
        };
        if let Err(e) = finished {
            tracing::error!("❌ Failed to record outcome of execution {}: {}", execution_id, e);
        }

        self.pending_approvals
            .retain(|_, pending| pending.execution_id != execution_id);
    }

    async fn stop_loops_of(&self, execution_id: &str) {
        match self.scheduler.stop_execution_loops(execution_id).await {
            Ok(0) => {}
            Ok(stopped) => tracing::info!("⏹️ Stopped {} loop(s) of execution {}", stopped, execution_id),
            Err(e) => tracing::error!("❌ Failed to stop loops of execution {}: {}", execution_id, e),
        }
    }

    /// Run one node and turn its output into a routing decision
    async fn run_node(self, node: Node, input: WorkflowEvent, path: Vec<String>, ctx: NodeContext) -> TaskReport {
        let result = self.node_step(&node, &input, &ctx).await;
        TaskReport::Finished {
            node_id: node.id,
            path,
            result,
        }
    }

    async fn node_step(&self, node: &Node, input: &WorkflowEvent, ctx: &NodeContext) -> Result<Step, ExecutionError> {
        self.executions.set_current_node(&ctx.execution_id, &node.id).await?;
        let log = StepLog {
            execution_id: &ctx.execution_id,
            node,
            input,
            started_at: Utc::now(),
        };

        let output = match self.executor.execute_node(node, input, ctx).await {
            Ok(output) => output,
            Err(e) => {
                self.executions
                    .append_step(log.entry(StepStatus::Failed, None, Some((e.class(), e.to_string()))))
                    .await?;
                return Err(e);
            }
        };

        match output {
            NodeOutput::Forward(event) => {
                self.executions.append_step(log.entry(StepStatus::Completed, Some(&event), None)).await?;
                Ok(Step::done(Route::All(event)))
            }
            NodeOutput::Skipped { event, class, message } => {
                self.executions
                    .append_step(log.entry(StepStatus::Skipped, Some(&event), Some((class, message))))
                    .await?;
                Ok(Step::done(Route::All(event)))
            }
            NodeOutput::Branch { result, event } => {
                self.executions.append_step(log.entry(StepStatus::Completed, Some(&event), None)).await?;
                Ok(Step::done(Route::Branch(result, event)))
            }
            NodeOutput::Dropped => {
                self.executions.append_step(log.entry(StepStatus::Dropped, None, None)).await?;
                Ok(Step::done(Route::Drop))
            }
            NodeOutput::LoopScheduled(state) => {
                self.executions.append_step(log.entry(StepStatus::Waiting, None, None)).await?;
                self.await_loop(node, &state.id, &ctx.execution_id).await
            }
            NodeOutput::AwaitApproval(gate) => {
                let (task, decision) = self.open_approval(node, &gate, input, &ctx.execution_id).await?;
                self.executions.append_step(log.entry(StepStatus::Waiting, None, None)).await?;
                let event = input.clone().with_metadata("approval_task_id", &task.id);
                Ok(Step {
                    route: Route::Handle(HandleRoute::NOTIFY, event),
                    follow_up: Some(ApprovalWait {
                        task_id: task.id,
                        gate,
                        decision,
                    }),
                })
            }
        }
    }

    /// Park a branch until its loop ends, then pick the outgoing handle
    async fn await_loop(&self, node: &Node, loop_id: &str, execution_id: &str) -> Result<Step, ExecutionError> {
        tracing::info!("⏸️ Node '{}' parked on loop {}", node.id, loop_id);
        let state = self
            .scheduler
            .wait_for_completion(loop_id)
            .await
            .map_err(|e| ExecutionError::node_failed(&node.id, e.class(), e))?;

        self.executions.set_current_node(execution_id, &node.id).await?;
        let log = StepLog {
            execution_id,
            node,
            input: &state.initial_event,
            started_at: state.loop_started_at,
        };
        let reason = state.termination_reason.map(|r| r.as_str()).unwrap_or("unknown");

        match state.status {
            LoopStatus::Completed => {
                let event = state
                    .last_event
                    .clone()
                    .unwrap_or_else(|| state.initial_event.clone());
                self.executions
                    .append_step(log.entry(StepStatus::Completed, Some(&event), None))
                    .await?;
                Ok(Step::done(Route::Handle(HandleRoute::SUCCESS, event)))
            }
            LoopStatus::Failed => {
                let event = state
                    .initial_event
                    .clone()
                    .with_metadata("loop_status", state.status)
                    .with_metadata("termination_reason", reason)
                    .with_metadata("loop_iterations", state.current_iteration);
                let error = format!("loop {} failed: {}", state.id, reason);
                self.executions
                    .append_step(log.entry(StepStatus::Failed, Some(&event), Some(("loop_failed", error))))
                    .await?;
                Ok(Step::done(Route::Handle(HandleRoute::FAILURE, event)))
            }
            _ => Err(ExecutionError::Cancelled {
                reason: format!("loop {} on node '{}' stopped ({})", state.id, node.id, reason),
            }),
        }
    }

    async fn continue_loop(self, node: Node, loop_id: String, execution_id: String) -> TaskReport {
        let result = self.await_loop(&node, &loop_id, &execution_id).await;
        TaskReport::Finished {
            path: vec![node.id.clone()],
            node_id: node.id,
            result,
        }
    }

    /// Persist an approval task; the decision channel is registered first so no decision is lost
    async fn open_approval(
        &self,
        node: &Node,
        gate: &ApprovalGate,
        input: &WorkflowEvent,
        execution_id: &str,
    ) -> Result<(ApprovalTask, oneshot::Receiver<bool>), ExecutionError> {
        let now = Utc::now();
        let task = ApprovalTask {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            node_id: node.id.clone(),
            title: render_template(&gate.title, input),
            description: gate.description.as_deref().map(|d| render_template(d, input)),
            status: ApprovalStatus::Pending,
            comment: None,
            event: input.clone(),
            created_at: now,
            decided_at: None,
            expires_at: gate
                .timeout_seconds
                .map(|seconds| now + chrono::Duration::seconds(seconds as i64)),
        };

        let (sender, receiver) = oneshot::channel();
        self.pending_approvals.insert(
            task.id.clone(),
            PendingApproval {
                execution_id: execution_id.to_string(),
                decision: sender,
            },
        );
        if let Err(e) = self.approvals.insert(&task).await {
            self.pending_approvals.remove(&task.id);
            return Err(e.into());
        }

        tracing::info!("🙋 Approval task {} raised by node '{}': {}", task.id, node.id, task.title);
        Ok((task, receiver))
    }

    /// Wait for a decision or the gate's deadline, then route on approved or denied
    async fn await_decision(
        self,
        node: Node,
        wait: ApprovalWait,
        input: WorkflowEvent,
        path: Vec<String>,
        execution_id: String,
    ) -> TaskReport {
        let result = self.decision_step(&node, wait, &input, &execution_id).await;
        TaskReport::Finished {
            node_id: node.id,
            path,
            result,
        }
    }

    async fn decision_step(
        &self,
        node: &Node,
        wait: ApprovalWait,
        input: &WorkflowEvent,
        execution_id: &str,
    ) -> Result<Step, ExecutionError> {
        let started_at = Utc::now();
        let ApprovalWait { task_id, gate, decision } = wait;

        let received = match gate.timeout_seconds {
            Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), decision).await.ok(),
            None => Some(decision.await),
        };
        let (approved, decided_by) = match received {
            Some(Ok(approved)) => (approved, "human"),
            Some(Err(_)) => {
                return Err(ExecutionError::Cancelled {
                    reason: format!("approval {task_id} abandoned"),
                })
            }
            None => (self.expire_approval(&task_id, &gate).await?, "timeout"),
        };

        let event = input
            .clone()
            .with_metadata("approval_task_id", &task_id)
            .with_metadata("approval_decision", if approved { HANDLE_APPROVED } else { HANDLE_DENIED })
            .with_metadata("approval_decided_by", decided_by);
        self.executions.set_current_node(execution_id, &node.id).await?;
        let log = StepLog {
            execution_id,
            node,
            input,
            started_at,
        };
        self.executions
            .append_step(log.entry(StepStatus::Completed, Some(&event), None))
            .await?;

        let route = if approved {
            HandleRoute::APPROVED
        } else {
            HandleRoute::DENIED
        };
        Ok(Step::done(Route::Handle(route, event)))
    }

    /// Settle an expired task with the gate's timeout action
    ///
    /// When a human decision wins the race the stored decision is used instead.
    async fn expire_approval(&self, task_id: &str, gate: &ApprovalGate) -> Result<bool, ExecutionError> {
        self.pending_approvals.remove(task_id);
        let fallback = gate.timeout_action == ApprovalTimeoutAction::Approve;
        let comment = format!("timed out, defaulted to {}", if fallback { "approve" } else { "deny" });

        if self
            .approvals
            .settle(task_id, ApprovalStatus::TimedOut, Some(comment))
            .await?
            .is_some()
        {
            tracing::info!("⌛ Approval {} timed out", task_id);
            return Ok(fallback);
        }

        let stored = self
            .approvals
            .get(task_id)
            .await?
            .ok_or_else(|| ExecutionError::ApprovalNotFound(task_id.to_string()))?;
        Ok(stored.status == ApprovalStatus::Approved)
    }
}

/// Fixed part of a step-log entry
#[derive(Clone, Copy)]
struct StepLog<'a> {
    execution_id: &'a str,
    node: &'a Node,
    input: &'a WorkflowEvent,
    started_at: DateTime<Utc>,
}

/// Insert the live-walk handles for a new walk
fn register_walk(
    slot: VacantEntry<'_, String, LiveWalk>,
) -> (CancellationToken, mpsc::UnboundedReceiver<(String, String)>) {
    let cancel = CancellationToken::new();
    let (rejoin, receiver) = mpsc::unbounded_channel();
    slot.insert(LiveWalk {
        cancel: cancel.clone(),
        rejoin,
    });
    (cancel, receiver)
}

impl<'a> StepLog<'a> {
    fn entry(
        self,
        status: StepStatus,
        output: Option<&'a WorkflowEvent>,
        error: Option<(&'a str, String)>,
    ) -> NewStep<'a> {
        NewStep {
            execution_id: self.execution_id,
            node: self.node,
            status,
            input: self.input,
            output,
            error,
            started_at: self.started_at,
        }
    }
}

/// Outgoing edge selection for multi-output nodes
#[derive(Debug, Clone, Copy)]
struct HandleRoute {
    handle: &'static str,
    /// Whether edges without a handle are delivered
    unlabeled: bool,
    /// Handles whose edges stay unsettled for a later report
    keep_open: &'static [&'static str],
}

impl HandleRoute {
    const NOTIFY: Self = Self {
        handle: HANDLE_NOTIFY,
        unlabeled: true,
        keep_open: &[HANDLE_APPROVED, HANDLE_DENIED],
    };
    const APPROVED: Self = Self {
        handle: HANDLE_APPROVED,
        unlabeled: false,
        keep_open: &[],
    };
    const DENIED: Self = Self {
        handle: HANDLE_DENIED,
        unlabeled: false,
        keep_open: &[],
    };
    const SUCCESS: Self = Self {
        handle: HANDLE_SUCCESS,
        unlabeled: true,
        keep_open: &[],
    };
    const FAILURE: Self = Self {
        handle: HANDLE_FAILURE,
        unlabeled: true,
        keep_open: &[],
    };
}

enum Route {
    All(WorkflowEvent),
    Branch(bool, WorkflowEvent),
    Handle(HandleRoute, WorkflowEvent),
    Drop,
}

struct ApprovalWait {
    task_id: String,
    gate: ApprovalGate,
    decision: oneshot::Receiver<bool>,
}

struct Step {
    route: Route,
    follow_up: Option<ApprovalWait>,
}

impl Step {
    fn done(route: Route) -> Self {
        Self { route, follow_up: None }
    }
}

enum TaskReport {
    Finished {
        node_id: String,
        path: Vec<String>,
        result: Result<Step, ExecutionError>,
    },
    /// A timeout-based merge window closed
    MergeDeadline { node_id: String },
}

#[derive(Clone)]
struct Arrival {
    event: WorkflowEvent,
    path: Vec<String>,
}

enum EdgeState {
    Unsettled,
    Delivered(Arrival),
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Waiting,
    Fired,
    Dead,
}

enum EdgeAction {
    Deliver,
    Kill,
    Keep,
}

/// State of one walk over a workflow graph
struct Walk {
    engine: ExecutionEngine,
    compiled: CompiledWorkflow,
    ctx: NodeContext,
    /// Indexed like `Workflow::edges`
    edges: Vec<EdgeState>,
    progress: HashMap<String, Progress>,
    merge_timers: HashMap<String, AbortHandle>,
    /// Nodes whose incoming edges changed since they were last evaluated
    dirty: VecDeque<String>,
    tasks: JoinSet<TaskReport>,
    output: Option<WorkflowEvent>,
}

impl Walk {
    fn new(engine: ExecutionEngine, compiled: CompiledWorkflow, ctx: NodeContext) -> Self {
        let edges = compiled.workflow.edges.iter().map(|_| EdgeState::Unsettled).collect();
        let progress = compiled
            .workflow
            .nodes
            .iter()
            .map(|node| (node.id.clone(), Progress::Waiting))
            .collect();
        Self {
            engine,
            compiled,
            ctx,
            edges,
            progress,
            merge_timers: HashMap::new(),
            dirty: VecDeque::new(),
            tasks: JoinSet::new(),
            output: None,
        }
    }

    /// Drive the walk to quiescence; returns the terminal output event
    async fn run(
        mut self,
        origin: Origin,
        rejoin: &mut mpsc::UnboundedReceiver<(String, String)>,
    ) -> Result<Option<WorkflowEvent>, ExecutionError> {
        match origin {
            Origin::Trigger(event) => {
                let start = self.compiled.workflow.start_node_id.clone();
                let node = self.node(&start)?;
                self.presettle(&[start.clone()]);
                self.progress.insert(start.clone(), Progress::Fired);
                let path = vec![start];
                let task = self.engine.clone().run_node(node, event, path, self.ctx.clone());
                self.tasks.spawn(task);
            }
            Origin::Loops(loops) => {
                let origins: Vec<String> = loops.iter().map(|(node_id, _)| node_id.clone()).collect();
                self.presettle(&origins);
                for (node_id, loop_id) in loops {
                    let node = self.node(&node_id)?;
                    self.progress.insert(node_id, Progress::Fired);
                    let task = self
                        .engine
                        .clone()
                        .continue_loop(node, loop_id, self.ctx.execution_id.clone());
                    self.tasks.spawn(task);
                }
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    return Err(ExecutionError::Cancelled {
                        reason: "cancelled by request".to_string(),
                    });
                }
                Some((node_id, loop_id)) = rejoin.recv() => self.rejoin_loop(node_id, loop_id)?,
                next = self.tasks.join_next() => match next {
                    None => break,
                    Some(Ok(report)) => self.apply(report)?,
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => return Err(ExecutionError::node_failed("walk", "task_panicked", e)),
                },
            }
        }

        self.check_stalled()?;
        Ok(self.output)
    }

    fn node(&self, node_id: &str) -> Result<Node, ExecutionError> {
        self.compiled
            .workflow
            .node(node_id)
            .cloned()
            .ok_or_else(|| ExecutionError::NodeNotFound(node_id.to_string()))
    }

    /// Take a retried loop back into this walk
    fn rejoin_loop(&mut self, node_id: String, loop_id: String) -> Result<(), ExecutionError> {
        let node = self.node(&node_id)?;
        tracing::info!("🔁 Loop {} rejoins the walk at node '{}'", loop_id, node_id);
        self.reopen_below(&node_id);
        self.progress.insert(node_id, Progress::Fired);
        let task = self
            .engine
            .clone()
            .continue_loop(node, loop_id, self.ctx.execution_id.clone());
        self.tasks.spawn(task);
        Ok(())
    }

    /// Unsettle a node's outgoing edges and revive the dead region they lead into
    ///
    /// Nodes that already fired keep their result; a second arrival is ignored.
    fn reopen_below(&mut self, node_id: &str) {
        let mut frontier: Vec<usize> = self.compiled.graph.outgoing(node_id);
        while let Some(index) = frontier.pop() {
            self.edges[index] = EdgeState::Unsettled;
            let target = self.compiled.workflow.edges[index].to_node_id.clone();
            if self.progress.get(&target) == Some(&Progress::Dead) {
                self.progress.insert(target.clone(), Progress::Waiting);
                frontier.extend(
                    self.compiled
                        .graph
                        .outgoing(&target)
                        .into_iter()
                        .filter(|&i| matches!(self.edges[i], EdgeState::Dead)),
                );
            }
        }
    }

    /// Kill edges whose source cannot be reached from any origin
    fn presettle(&mut self, origins: &[String]) {
        let mut reachable = HashSet::new();
        for origin in origins {
            reachable.extend(self.compiled.graph.reachable_from(origin));
        }
        for (index, edge) in self.compiled.workflow.edges.iter().enumerate() {
            if !reachable.contains(&edge.from_node_id) {
                self.edges[index] = EdgeState::Dead;
            }
        }
    }

    fn apply(&mut self, report: TaskReport) -> Result<(), ExecutionError> {
        match report {
            TaskReport::Finished { node_id, path, result } => {
                let step = result?;
                self.route(&node_id, &path, step)?;
            }
            TaskReport::MergeDeadline { node_id } => {
                if self.progress.get(&node_id) == Some(&Progress::Waiting) {
                    tracing::debug!("⏰ Merge window of node '{}' closed", node_id);
                    let arrivals = self.take_delivered(&node_id);
                    self.fire(&node_id, arrivals)?;
                }
            }
        }
        self.settle_dirty()
    }

    fn route(&mut self, node_id: &str, path: &[String], step: Step) -> Result<(), ExecutionError> {
        let Step { route, follow_up } = step;
        let outgoing = self.compiled.graph.outgoing(node_id);

        let mut decisions = Vec::with_capacity(outgoing.len());
        for &index in &outgoing {
            if !matches!(self.edges[index], EdgeState::Unsettled) {
                continue;
            }
            let edge = &self.compiled.workflow.edges[index];
            let action = match &route {
                Route::All(_) => EdgeAction::Deliver,
                Route::Drop => EdgeAction::Kill,
                Route::Branch(result, _) => match edge.condition_result {
                    Some(expected) if expected == *result => EdgeAction::Deliver,
                    Some(_) => EdgeAction::Kill,
                    None => {
                        return Err(ExecutionError::MultiplePathsUnresolved {
                            node_id: node_id.to_string(),
                        })
                    }
                },
                Route::Handle(selector, _) => match edge.source_handle_id.as_deref() {
                    None if selector.unlabeled => EdgeAction::Deliver,
                    None => EdgeAction::Kill,
                    Some(handle) if handle == selector.handle => EdgeAction::Deliver,
                    Some(handle) if selector.keep_open.contains(&handle) => EdgeAction::Keep,
                    Some(_) => EdgeAction::Kill,
                },
            };
            decisions.push((index, action));
        }

        let event = match route {
            Route::All(event) | Route::Branch(_, event) | Route::Handle(_, event) => Some(event),
            Route::Drop => None,
        };

        let mut delivered = 0;
        for (index, action) in decisions {
            match (action, &event) {
                (EdgeAction::Deliver, Some(event)) => {
                    self.deliver(index, event.clone(), path)?;
                    delivered += 1;
                }
                (EdgeAction::Keep, _) => {}
                _ => self.kill(index),
            }
        }

        match follow_up {
            Some(wait) => {
                let node = self.node(node_id)?;
                let input = event.clone().unwrap_or_default();
                let task = self.engine.clone().await_decision(
                    node,
                    wait,
                    input,
                    path.to_vec(),
                    self.ctx.execution_id.clone(),
                );
                self.tasks.spawn(task);
            }
            None if delivered == 0 => {
                if let Some(event) = event {
                    self.output = Some(event);
                }
            }
            None => {}
        }
        Ok(())
    }

    fn deliver(&mut self, index: usize, event: WorkflowEvent, path: &[String]) -> Result<(), ExecutionError> {
        let target = self.compiled.workflow.edges[index].to_node_id.clone();
        if path.contains(&target) {
            return Err(ExecutionError::CycleDetected { node_id: target });
        }

        self.edges[index] = EdgeState::Delivered(Arrival {
            event,
            path: path.to_vec(),
        });
        self.dirty.push_back(target);
        Ok(())
    }

    fn kill(&mut self, index: usize) {
        self.edges[index] = EdgeState::Dead;
        self.dirty.push_back(self.compiled.workflow.edges[index].to_node_id.clone());
    }

    /// Re-evaluate every node whose inputs changed, propagating dead paths
    fn settle_dirty(&mut self) -> Result<(), ExecutionError> {
        while let Some(node_id) = self.dirty.pop_front() {
            match self.progress.get(&node_id) {
                Some(Progress::Waiting) => {}
                Some(Progress::Fired) => {
                    tracing::debug!("↪️ Ignoring late arrival at node '{}'", node_id);
                    continue;
                }
                _ => continue,
            }

            let incoming = self.compiled.graph.incoming(&node_id);
            let settled = incoming
                .iter()
                .filter(|&&i| !matches!(self.edges[i], EdgeState::Unsettled))
                .count();
            let delivered = incoming
                .iter()
                .filter(|&&i| matches!(self.edges[i], EdgeState::Delivered(_)))
                .count();
            let all_settled = settled == incoming.len();

            if all_settled && delivered == 0 {
                self.mark_dead(&node_id);
                continue;
            }

            let node = self.node(&node_id)?;
            match node.merge_strategy() {
                InputMergeStrategy::FirstWins if delivered > 0 => {
                    let arrivals = self.take_delivered(&node_id);
                    self.fire(&node_id, arrivals.into_iter().take(1).collect())?;
                }
                InputMergeStrategy::TimeoutBased(seconds) if delivered > 0 && !all_settled => {
                    if !self.merge_timers.contains_key(&node_id) {
                        let task_node = node_id.clone();
                        let timer = self.tasks.spawn(async move {
                            tokio::time::sleep(Duration::from_secs(seconds)).await;
                            TaskReport::MergeDeadline { node_id: task_node }
                        });
                        self.merge_timers.insert(node_id.clone(), timer);
                    }
                }
                _ if all_settled => {
                    let arrivals = self.take_delivered(&node_id);
                    self.fire(&node_id, arrivals)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn mark_dead(&mut self, node_id: &str) {
        tracing::debug!("🪦 Node '{}' is on a dead path", node_id);
        self.progress.insert(node_id.to_string(), Progress::Dead);
        for index in self.compiled.graph.outgoing(node_id) {
            if matches!(self.edges[index], EdgeState::Unsettled) {
                self.kill(index);
            }
        }
    }

    /// Delivered arrivals in incoming-edge order
    fn take_delivered(&self, node_id: &str) -> Vec<Arrival> {
        self.compiled
            .graph
            .incoming(node_id)
            .into_iter()
            .filter_map(|i| match &self.edges[i] {
                EdgeState::Delivered(arrival) => Some(arrival.clone()),
                _ => None,
            })
            .collect()
    }

    fn fire(&mut self, node_id: &str, arrivals: Vec<Arrival>) -> Result<(), ExecutionError> {
        let node = self.node(node_id)?;
        if let Some(timer) = self.merge_timers.remove(node_id) {
            timer.abort();
        }

        let mut path: Vec<String> = Vec::new();
        for arrival in &arrivals {
            for step in &arrival.path {
                if !path.contains(step) {
                    path.push(step.clone());
                }
            }
        }
        path.push(node_id.to_string());

        let events: Vec<WorkflowEvent> = arrivals.into_iter().map(|arrival| arrival.event).collect();
        let input = merge_inputs(&node.merge_strategy(), events);

        self.progress.insert(node_id.to_string(), Progress::Fired);
        let task = self.engine.clone().run_node(node, input, path, self.ctx.clone());
        self.tasks.spawn(task);
        Ok(())
    }

    /// A quiescent walk with a node still waiting on unsettled edges has a cycle
    fn check_stalled(&self) -> Result<(), ExecutionError> {
        for node in &self.compiled.workflow.nodes {
            if self.progress.get(&node.id) != Some(&Progress::Waiting) {
                continue;
            }
            let stalled = self
                .compiled
                .graph
                .incoming(&node.id)
                .into_iter()
                .any(|i| matches!(self.edges[i], EdgeState::Unsettled));
            if stalled {
                return Err(ExecutionError::CycleDetected {
                    node_id: node.id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmailConfig, HttpConfig, LlmConfig, SandboxConfig, SchedulerConfig};
    use crate::runtime::actions::ActionRunner;
    use crate::runtime::http::HttpExecutor;
    use crate::runtime::sandbox::ScriptSandbox;
    use crate::store::database::test_pool;
    use crate::store::LoopStore;
    use crate::workflow::storage::WorkflowStorage;
    use crate::workflow::types::Workflow;
    use serde_json::json;

    async fn engine() -> ExecutionEngine {
        let pool = test_pool().await;
        let http = HttpExecutor::new(&HttpConfig::default()).unwrap();
        let sandbox = ScriptSandbox::new(&SandboxConfig::default());
        let scheduler = Arc::new(LoopScheduler::new(
            LoopStore::new(pool.clone()),
            http.clone(),
            sandbox.clone(),
            SchedulerConfig {
                completion_poll_ms: 50,
                ..SchedulerConfig::default()
            },
        ));
        let actions = ActionRunner::new(http.clone(), EmailConfig::default(), LlmConfig::default());
        let executor = Arc::new(NodeExecutor::new(sandbox, http, actions, scheduler.clone()));
        ExecutionEngine::new(
            Arc::new(WorkflowRegistry::new(WorkflowStorage::new(pool.clone()))),
            executor,
            scheduler,
            ExecutionStore::new(pool.clone()),
            ApprovalStore::new(pool),
        )
    }

    async fn publish(engine: &ExecutionEngine, definition: Value) {
        let workflow: Workflow = serde_json::from_value(definition).unwrap();
        engine.registry().publish(workflow).await.unwrap();
    }

    async fn submit(engine: &ExecutionEngine, payload: Value) -> String {
        engine
            .submit_event("wf", payload, HashMap::new(), HttpMethod::Post)
            .await
            .unwrap()
    }

    async fn wait_terminal(engine: &ExecutionEngine, execution_id: &str) -> ExecutionRecord {
        for _ in 0..500 {
            let record = engine.get_execution_status(execution_id).await.unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {execution_id} did not finish");
    }

    async fn steps_of(engine: &ExecutionEngine, execution_id: &str, node_id: &str) -> Vec<ExecutionStep> {
        engine
            .list_execution_steps(execution_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|step| step.node_id == node_id)
            .collect()
    }

    fn transformer(id: &str, body: &str) -> Value {
        json!({
            "id": id, "name": id, "type": "transformer",
            "script": format!("function transformer(event) {body} end")
        })
    }

    fn tag(id: &str) -> Value {
        transformer(id, &format!("event.data = {{ tag = '{id}' }} return event"))
    }

    #[tokio::test]
    async fn linear_flow_runs_each_node_once_in_order() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                tag("a"),
                tag("b"),
                tag("c")
            ],
            "edges": [
                { "from_node_id": "t", "to_node_id": "a" },
                { "from_node_id": "a", "to_node_id": "b" },
                { "from_node_id": "b", "to_node_id": "c" }
            ]
        }))
        .await;

        let id = submit(&engine, json!({ "n": 1 })).await;
        let record = wait_terminal(&engine, &id).await;
        assert_eq!(record.status, ExecutionStatus::Completed);

        let order: Vec<String> = engine
            .list_execution_steps(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|step| step.node_id)
            .collect();
        assert_eq!(order, ["t", "a", "b", "c"]);
        assert_eq!(record.output.unwrap().data, json!({ "tag": "c" }));
    }

    #[tokio::test]
    async fn condition_selects_one_branch() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger", "methods": ["POST"] },
                { "id": "big", "name": "is_big", "type": "condition",
                  "script": "function condition(event) return event.data.amount > 100 end" },
                tag("yes"),
                tag("no")
            ],
            "edges": [
                { "from_node_id": "t", "to_node_id": "big" },
                { "from_node_id": "big", "to_node_id": "yes", "condition_result": true },
                { "from_node_id": "big", "to_node_id": "no", "condition_result": false }
            ]
        }))
        .await;

        let id = submit(&engine, json!({"amount": 250})).await;
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, ExecutionStatus::Completed);
        let output = record.output.unwrap();
        assert_eq!(output.data, json!({"tag": "yes"}));
        assert_eq!(output.condition_results["is_big"], true);
        assert_eq!(output.metadata["trigger_node_id"], "t");
        assert!(steps_of(&engine, &id, "no").await.is_empty());
    }

    #[tokio::test]
    async fn rejected_method_never_creates_execution() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [{ "id": "t", "name": "t", "type": "trigger", "methods": ["POST"] }],
            "edges": []
        }))
        .await;

        let err = engine
            .submit_event("wf", json!({}), HashMap::new(), HttpMethod::Get)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MethodNotAllowed { .. }));

        let err = engine
            .submit_event("missing", json!({}), HashMap::new(), HttpMethod::Post)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn dropped_branch_completes_without_output() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                transformer("filter", "return nil"),
                tag("after")
            ],
            "edges": [
                { "from_node_id": "t", "to_node_id": "filter" },
                { "from_node_id": "filter", "to_node_id": "after" }
            ]
        }))
        .await;

        let id = submit(&engine, json!({})).await;
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.output.is_none());
        let filter = steps_of(&engine, &id, "filter").await;
        assert_eq!(filter[0].status, StepStatus::Dropped);
        assert!(steps_of(&engine, &id, "after").await.is_empty());
    }

    #[tokio::test]
    async fn join_after_untaken_branch_runs_once_with_live_input() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                { "id": "c", "name": "c", "type": "condition",
                  "script": "function condition(event) return false end" },
                tag("a"),
                tag("b"),
                transformer("j", "return event")
            ],
            "edges": [
                { "from_node_id": "t", "to_node_id": "c" },
                { "from_node_id": "c", "to_node_id": "a", "condition_result": true },
                { "from_node_id": "c", "to_node_id": "b", "condition_result": false },
                { "from_node_id": "a", "to_node_id": "j" },
                { "from_node_id": "b", "to_node_id": "j" }
            ]
        }))
        .await;

        let id = submit(&engine, json!({})).await;
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.output.unwrap().data, json!({"tag": "b"}));
        assert_eq!(steps_of(&engine, &id, "j").await.len(), 1);
    }

    #[tokio::test]
    async fn diamond_merges_in_edge_order() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                tag("a"),
                tag("b"),
                transformer("j", "return event")
            ],
            "edges": [
                { "from_node_id": "t", "to_node_id": "a" },
                { "from_node_id": "t", "to_node_id": "b" },
                { "from_node_id": "b", "to_node_id": "j" },
                { "from_node_id": "a", "to_node_id": "j" }
            ]
        }))
        .await;

        let id = submit(&engine, json!({})).await;
        let record = wait_terminal(&engine, &id).await;

        let output = record.output.unwrap();
        assert_eq!(output.data, json!([{"tag": "b"}, {"tag": "a"}]));
        assert_eq!(output.metadata["merge_strategy"], "wait_for_all");
        assert_eq!(output.metadata["input_count"], "2");
    }

    #[tokio::test]
    async fn first_wins_fires_once() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                tag("a"),
                tag("b"),
                { "id": "j", "name": "j", "type": "delay", "duration": 0,
                  "input_merge_strategy": "first_wins" }
            ],
            "edges": [
                { "from_node_id": "t", "to_node_id": "a" },
                { "from_node_id": "t", "to_node_id": "b" },
                { "from_node_id": "a", "to_node_id": "j" },
                { "from_node_id": "b", "to_node_id": "j" }
            ]
        }))
        .await;

        let id = submit(&engine, json!({})).await;
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, ExecutionStatus::Completed);
        let joins = steps_of(&engine, &id, "j").await;
        assert_eq!(joins.len(), 1);
        assert!(joins[0].input.data.is_object());
    }

    #[tokio::test]
    async fn timeout_merge_proceeds_without_slow_branch() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                tag("fast"),
                { "id": "slow", "name": "slow", "type": "delay", "duration": 2 },
                { "id": "j", "name": "j", "type": "delay", "duration": 0,
                  "input_merge_strategy": { "timeout_based": 0 } }
            ],
            "edges": [
                { "from_node_id": "t", "to_node_id": "fast" },
                { "from_node_id": "t", "to_node_id": "slow" },
                { "from_node_id": "fast", "to_node_id": "j" },
                { "from_node_id": "slow", "to_node_id": "j" }
            ]
        }))
        .await;

        let id = submit(&engine, json!({})).await;
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, ExecutionStatus::Completed);
        let joins = steps_of(&engine, &id, "j").await;
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].input.data, json!({"tag": "fast"}));
    }

    #[tokio::test]
    async fn waiting_cycle_is_detected() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                tag("a"),
                tag("b")
            ],
            "edges": [
                { "from_node_id": "t", "to_node_id": "a" },
                { "from_node_id": "a", "to_node_id": "b" },
                { "from_node_id": "b", "to_node_id": "a" }
            ]
        }))
        .await;

        let id = submit(&engine, json!({})).await;
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error_class.as_deref(), Some("cycle_detected"));
    }

    #[tokio::test]
    async fn back_edge_into_fired_node_is_detected() {
        let engine = engine().await;
        let mut b = tag("b");
        b["input_merge_strategy"] = json!("first_wins");
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [{ "id": "t", "name": "t", "type": "trigger" }, tag("a"), b],
            "edges": [
                { "from_node_id": "t", "to_node_id": "b" },
                { "from_node_id": "b", "to_node_id": "a" },
                { "from_node_id": "a", "to_node_id": "b" }
            ]
        }))
        .await;

        let id = submit(&engine, json!({})).await;
        let record = wait_terminal(&engine, &id).await;
        assert_eq!(record.error_class.as_deref(), Some("cycle_detected"));
    }

    #[tokio::test]
    async fn unlabeled_condition_edge_is_unresolved() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                { "id": "c", "name": "c", "type": "condition",
                  "script": "function condition(event) return true end" },
                tag("a")
            ],
            "edges": [
                { "from_node_id": "t", "to_node_id": "c" },
                { "from_node_id": "c", "to_node_id": "a" }
            ]
        }))
        .await;

        let id = submit(&engine, json!({})).await;
        let record = wait_terminal(&engine, &id).await;
        assert_eq!(record.error_class.as_deref(), Some("multiple_paths_unresolved"));
    }

    #[tokio::test]
    async fn script_failure_fails_execution_with_step_error() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                transformer("broken", "return event.data.missing.field")
            ],
            "edges": [{ "from_node_id": "t", "to_node_id": "broken" }]
        }))
        .await;

        let id = submit(&engine, json!({})).await;
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.current_node_id.as_deref(), Some("broken"));
        let steps = steps_of(&engine, &id, "broken").await;
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error_class.as_deref(), Some("script_runtime_fault"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_delay() {
        let engine = engine().await;
        publish(&engine, json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                { "id": "wait", "name": "wait", "type": "delay", "duration": 1, "unit": "hours" }
            ],
            "edges": [{ "from_node_id": "t", "to_node_id": "wait" }]
        }))
        .await;

        let id = submit(&engine, json!({})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.cancel_execution(&id).await.unwrap();
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert_eq!(record.error_class.as_deref(), Some("cancelled"));
    }

    fn approval_workflow(gate: Value) -> Value {
        let mut node = json!({ "id": "gate", "name": "gate", "type": "human_approval" });
        for (key, value) in gate.as_object().unwrap() {
            node[key] = value.clone();
        }
        json!({
            "id": "wf", "name": "wf", "start_node_id": "t",
            "nodes": [
                { "id": "t", "name": "t", "type": "trigger" },
                node,
                tag("notified"),
                tag("ship"),
                tag("reject")
            ],
            "edges": [
                { "from_node_id": "t", "to_node_id": "gate" },
                { "from_node_id": "gate", "to_node_id": "notified" },
                { "from_node_id": "gate", "to_node_id": "ship", "source_handle_id": "approved" },
                { "from_node_id": "gate", "to_node_id": "reject", "source_handle_id": "denied" }
            ]
        })
    }

    #[tokio::test]
    async fn approval_routes_notify_then_decision() {
        let engine = engine().await;
        publish(&engine, approval_workflow(json!({ "title": "Ship order {{ $.data.id }}?" }))).await;

        let id = submit(&engine, json!({"id": 9})).await;
        let task = loop {
            let tasks = engine.approvals.list_by_execution(&id).await.unwrap();
            if let Some(task) = tasks.into_iter().next() {
                break task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(task.title, "Ship order 9?");

        let decided = engine
            .decide_approval(&task.id, true, Some("looks fine".to_string()))
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(steps_of(&engine, &id, "notified").await.len(), 1);
        assert_eq!(steps_of(&engine, &id, "ship").await.len(), 1);
        assert!(steps_of(&engine, &id, "reject").await.is_empty());

        let again = engine.decide_approval(&task.id, false, None).await.unwrap_err();
        assert!(matches!(again, ExecutionError::ApprovalAlreadyDecided(_)));
        let unknown = engine.decide_approval("nope", true, None).await.unwrap_err();
        assert!(matches!(unknown, ExecutionError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn approval_timeout_applies_default_action() {
        let engine = engine().await;
        publish(&engine, approval_workflow(json!({ "title": "t", "timeout_seconds": 0 }))).await;

        let id = submit(&engine, json!({})).await;
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(steps_of(&engine, &id, "reject").await.len(), 1);
        assert!(steps_of(&engine, &id, "ship").await.is_empty());
        let tasks = engine.approvals.list_by_execution(&id).await.unwrap();
        assert_eq!(tasks[0].status, ApprovalStatus::TimedOut);
    }
}
