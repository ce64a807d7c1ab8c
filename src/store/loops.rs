/// Persisted polling-loop state
///
/// One row per loop instance. The scheduler claims a due row by clearing its
/// `next_execution_at` and stamping a claim token; the iteration outcome is only
/// recorded while that token is still current, so a stop or retry issued mid-flight
/// discards the late result. All read-modify-write paths run in a transaction.

use crate::runtime::error::LoopError;
use crate::store::database::{from_millis, to_millis};
use crate::store::executions::decode_error;
use crate::workflow::types::{HttpMethod, HttpRequestAction, LoopConfig, WorkflowEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, types::Json, Row};
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Running => "running",
            LoopStatus::Paused => "paused",
            LoopStatus::Completed => "completed",
            LoopStatus::Failed => "failed",
            LoopStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopStatus::Completed | LoopStatus::Failed | LoopStatus::Stopped)
    }
}

impl FromStr for LoopStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(LoopStatus::Running),
            "paused" => Ok(LoopStatus::Paused),
            "completed" => Ok(LoopStatus::Completed),
            "failed" => Ok(LoopStatus::Failed),
            "stopped" => Ok(LoopStatus::Stopped),
            other => Err(format!("unknown loop status: {other}")),
        }
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a loop reached a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Termination condition met with action `success`
    Success,
    /// Termination condition met with action `failure`
    Failure,
    /// Termination condition met with action `stop`
    Stop,
    MaxIterations,
    /// Stopped through the control interface
    Manual,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Success => "Success",
            TerminationReason::Failure => "Failure",
            TerminationReason::Stop => "Stop",
            TerminationReason::MaxIterations => "MaxIterations",
            TerminationReason::Manual => "Manual",
        }
    }

    /// Terminal status this reason leads to
    pub fn status(&self) -> LoopStatus {
        match self {
            TerminationReason::Success => LoopStatus::Completed,
            TerminationReason::Failure | TerminationReason::MaxIterations => LoopStatus::Failed,
            TerminationReason::Stop | TerminationReason::Manual => LoopStatus::Stopped,
        }
    }
}

impl FromStr for TerminationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Success" => Ok(TerminationReason::Success),
            "Failure" => Ok(TerminationReason::Failure),
            "Stop" => Ok(TerminationReason::Stop),
            "MaxIterations" => Ok(TerminationReason::MaxIterations),
            "Manual" => Ok(TerminationReason::Manual),
            other => Err(format!("unknown termination reason: {other}")),
        }
    }
}

/// Explicit control operations on a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Pause,
    Resume,
    Stop,
    Retry,
}

impl LoopControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopControl::Pause => "pause",
            LoopControl::Resume => "resume",
            LoopControl::Stop => "stop",
            LoopControl::Retry => "retry",
        }
    }
}

/// Validate a control operation against the current status
///
/// `Ok(None)` means the loop is already where the operation would take it.
pub fn plan_transition(from: LoopStatus, control: LoopControl) -> Result<Option<LoopStatus>, LoopError> {
    use LoopStatus::*;

    let target = match (control, from) {
        (LoopControl::Pause, Running) => Some(Paused),
        (LoopControl::Pause, Paused) => None,
        (LoopControl::Resume, Paused) => Some(Running),
        (LoopControl::Resume, Running) => None,
        (LoopControl::Stop, Running | Paused) => Some(Stopped),
        (LoopControl::Stop, Stopped) => None,
        (LoopControl::Retry, Failed | Stopped) => Some(Running),
        _ => {
            return Err(LoopError::InvalidTransition {
                from: from.to_string(),
                action: control.as_str(),
            })
        }
    };
    Ok(target)
}

/// One entry of a loop's capped iteration history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub success: bool,
    /// 0 when no response arrived
    pub http_status: u16,
    pub latency_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_class: Option<String>,
    pub response_snippet: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopState {
    pub id: String,
    pub execution_id: String,
    pub workflow_id: String,
    pub node_id: String,
    /// `{execution_id}_{node_id}`
    pub execution_step_id: String,
    pub status: LoopStatus,
    pub termination_reason: Option<TerminationReason>,
    pub current_iteration: u32,
    pub max_iterations: Option<u32>,
    pub successful_iterations: u32,
    pub consecutive_failures: u32,
    /// None while an iteration is in flight or the loop is not running
    pub next_execution_at: Option<DateTime<Utc>>,
    pub loop_started_at: DateTime<Utc>,
    pub last_response_status: Option<u16>,
    pub last_response_body: Option<String>,
    pub last_error: Option<String>,
    pub iteration_history: Vec<IterationRecord>,
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub timeout_seconds: u64,
    pub loop_config: LoopConfig,
    pub initial_event: WorkflowEvent,
    /// Enriched event of the most recent iteration
    pub last_event: Option<WorkflowEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoopState {
    /// Fresh running loop due immediately
    pub fn new(
        execution_id: &str,
        workflow_id: &str,
        node_id: &str,
        action: &HttpRequestAction,
        loop_config: LoopConfig,
        initial_event: WorkflowEvent,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            node_id: node_id.to_string(),
            execution_step_id: format!("{execution_id}_{node_id}"),
            status: LoopStatus::Running,
            termination_reason: None,
            current_iteration: 0,
            max_iterations: loop_config.max_iterations,
            successful_iterations: 0,
            consecutive_failures: 0,
            next_execution_at: Some(now),
            loop_started_at: now,
            last_response_status: None,
            last_response_body: None,
            last_error: None,
            iteration_history: Vec::new(),
            url: action.url.clone(),
            method: action.method,
            headers: action.headers.clone(),
            timeout_seconds: action.timeout_seconds,
            loop_config,
            initial_event,
            last_event: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// successful_iterations / current_iteration, 0 before the first iteration
    pub fn success_rate(&self) -> f64 {
        if self.current_iteration == 0 {
            0.0
        } else {
            self.successful_iterations as f64 / self.current_iteration as f64
        }
    }
}

/// Loop state as exposed to the status layer
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatusReport {
    #[serde(flatten)]
    pub state: LoopState,
    pub success_rate: f64,
}

impl From<LoopState> for LoopStatusReport {
    fn from(state: LoopState) -> Self {
        let success_rate = state.success_rate();
        Self { state, success_rate }
    }
}

/// Result of one iteration, ready to persist
#[derive(Debug, Clone)]
pub struct IterationUpdate {
    pub current_iteration: u32,
    pub successful_iterations: u32,
    pub consecutive_failures: u32,
    pub last_response_status: u16,
    pub last_response_body: Option<String>,
    pub last_error: Option<String>,
    pub last_event: WorkflowEvent,
    pub record: IterationRecord,
    /// Set when this iteration ends the loop
    pub terminal: Option<TerminationReason>,
    pub next_execution_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum RecordOutcome {
    Recorded(LoopState),
    /// The claim was superseded (stopped, retried or already terminal)
    Discarded,
}

#[derive(Debug, Clone)]
pub struct LoopStore {
    pool: SqlitePool,
}

impl LoopStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, state: &LoopState) -> Result<(), LoopError> {
        sqlx::query(
            r#"
            INSERT INTO loop_states (
                id, execution_id, workflow_id, node_id, execution_step_id, status,
                termination_reason, current_iteration, max_iterations, successful_iterations,
                consecutive_failures, next_execution_at, loop_started_at, iteration_history,
                url, method, headers, timeout_seconds, loop_config, initial_event,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.id)
        .bind(&state.execution_id)
        .bind(&state.workflow_id)
        .bind(&state.node_id)
        .bind(&state.execution_step_id)
        .bind(state.status.as_str())
        .bind(state.termination_reason.map(|reason| reason.as_str()))
        .bind(state.current_iteration)
        .bind(state.max_iterations)
        .bind(state.successful_iterations)
        .bind(state.consecutive_failures)
        .bind(state.next_execution_at.map(to_millis))
        .bind(to_millis(state.loop_started_at))
        .bind(Json(&state.iteration_history))
        .bind(&state.url)
        .bind(state.method.as_str())
        .bind(Json(&state.headers))
        .bind(state.timeout_seconds as i64)
        .bind(Json(&state.loop_config))
        .bind(Json(&state.initial_event))
        .bind(to_millis(state.created_at))
        .bind(to_millis(state.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, loop_id: &str) -> Result<Option<LoopState>, LoopError> {
        let row = sqlx::query("SELECT * FROM loop_states WHERE id = ?")
            .bind(loop_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| loop_from_row(&row)).transpose()?)
    }

    pub async fn require(&self, loop_id: &str) -> Result<LoopState, LoopError> {
        self.get(loop_id)
            .await?
            .ok_or_else(|| LoopError::NotFound(loop_id.to_string()))
    }

    /// Running and paused loops, optionally limited to one execution
    pub async fn list_active(&self, execution_id: Option<&str>) -> Result<Vec<LoopState>, LoopError> {
        let rows = match execution_id {
            Some(execution_id) => {
                sqlx::query(
                    r#"
                    SELECT * FROM loop_states
                    WHERE status IN ('running', 'paused') AND execution_id = ?
                    ORDER BY created_at
                    "#,
                )
                .bind(execution_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM loop_states WHERE status IN ('running', 'paused') ORDER BY created_at",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(loop_from_row).collect::<Result<_, _>>()?)
    }

    /// Ids of running loops due at `now`, oldest first
    pub async fn due_ids(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, LoopError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM loop_states
            WHERE status = 'running' AND next_execution_at IS NOT NULL AND next_execution_at <= ?
            ORDER BY next_execution_at
            LIMIT ?
            "#,
        )
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| row.try_get::<String, _>("id"))
            .collect::<Result<_, _>>()?)
    }

    /// Atomically take a due loop for one iteration
    ///
    /// Returns the claim token, or `None` when the loop is no longer running and due.
    pub async fn claim(&self, loop_id: &str, now: DateTime<Utc>) -> Result<Option<String>, LoopError> {
        let token = uuid::Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            UPDATE loop_states
            SET next_execution_at = NULL, claim_token = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
              AND next_execution_at IS NOT NULL AND next_execution_at <= ?
            "#,
        )
        .bind(&token)
        .bind(to_millis(Utc::now()))
        .bind(loop_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then_some(token))
    }

    /// Give a claim back without running the iteration
    pub async fn release(&self, loop_id: &str, token: &str, at: DateTime<Utc>) -> Result<(), LoopError> {
        sqlx::query(
            r#"
            UPDATE loop_states
            SET next_execution_at = CASE WHEN status = 'running' THEN ? ELSE NULL END,
                claim_token = NULL
            WHERE id = ? AND claim_token = ?
            "#,
        )
        .bind(to_millis(at))
        .bind(loop_id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist an iteration outcome under the claim `token`
    pub async fn record_iteration(
        &self,
        loop_id: &str,
        token: &str,
        update: IterationUpdate,
        history_cap: usize,
    ) -> Result<RecordOutcome, LoopError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status, claim_token, iteration_history FROM loop_states WHERE id = ?")
            .bind(loop_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| LoopError::NotFound(loop_id.to_string()))?;

        let status: LoopStatus = row
            .try_get::<String, _>("status")?
            .parse()
            .map_err(LoopError::PersistenceFailure)?;
        let current_token: Option<String> = row.try_get("claim_token")?;
        if current_token.as_deref() != Some(token) || status.is_terminal() {
            tracing::debug!("🗑️ Discarding superseded iteration result for loop {}", loop_id);
            return Ok(RecordOutcome::Discarded);
        }

        let mut history = row
            .try_get::<Json<Vec<IterationRecord>>, _>("iteration_history")?
            .0;
        history.push(update.record);
        if history.len() > history_cap {
            let excess = history.len() - history_cap;
            history.drain(..excess);
        }

        let (next_status, next_execution_at) = match update.terminal {
            Some(reason) => (reason.status(), None),
            None if status == LoopStatus::Paused => (LoopStatus::Paused, None),
            None => (LoopStatus::Running, Some(to_millis(update.next_execution_at))),
        };

        sqlx::query(
            r#"
            UPDATE loop_states
            SET status = ?, termination_reason = ?, current_iteration = ?,
                successful_iterations = ?, consecutive_failures = ?, next_execution_at = ?,
                claim_token = NULL, last_response_status = ?, last_response_body = ?,
                last_error = ?, last_event = ?, iteration_history = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(next_status.as_str())
        .bind(update.terminal.map(|reason| reason.as_str()))
        .bind(update.current_iteration)
        .bind(update.successful_iterations)
        .bind(update.consecutive_failures)
        .bind(next_execution_at)
        .bind(update.last_response_status)
        .bind(update.last_response_body)
        .bind(update.last_error)
        .bind(Json(&update.last_event))
        .bind(Json(&history))
        .bind(to_millis(Utc::now()))
        .bind(loop_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RecordOutcome::Recorded(self.require(loop_id).await?))
    }

    /// Apply a validated control operation
    ///
    /// Returns the resulting state and whether anything changed.
    pub async fn transition(
        &self,
        loop_id: &str,
        control: LoopControl,
    ) -> Result<(LoopState, bool), LoopError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM loop_states WHERE id = ?")
            .bind(loop_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| LoopError::NotFound(loop_id.to_string()))?;
        let from: LoopStatus = row
            .try_get::<String, _>("status")?
            .parse()
            .map_err(LoopError::PersistenceFailure)?;

        let Some(target) = plan_transition(from, control)? else {
            tx.commit().await?;
            return Ok((self.require(loop_id).await?, false));
        };

        let now = to_millis(Utc::now());
        let statement = match control {
            LoopControl::Pause => {
                "UPDATE loop_states SET status = ?, next_execution_at = NULL, updated_at = ? WHERE id = ?"
            }
            LoopControl::Resume => {
                r#"
                UPDATE loop_states
                SET status = ?,
                    next_execution_at = CASE WHEN claim_token IS NULL THEN ?2 ELSE NULL END,
                    updated_at = ?2
                WHERE id = ?3
                "#
            }
            LoopControl::Stop => {
                r#"
                UPDATE loop_states
                SET status = ?, termination_reason = 'Manual', next_execution_at = NULL,
                    claim_token = NULL, updated_at = ?
                WHERE id = ?
                "#
            }
            LoopControl::Retry => {
                r#"
                UPDATE loop_states
                SET status = ?, termination_reason = NULL, current_iteration = 0,
                    successful_iterations = 0, consecutive_failures = 0, last_error = NULL,
                    next_execution_at = ?2, loop_started_at = ?2, claim_token = NULL, updated_at = ?2
                WHERE id = ?3
                "#
            }
        };

        sqlx::query(statement)
            .bind(target.as_str())
            .bind(now)
            .bind(loop_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("🎛️ Loop {} {} → {}", loop_id, from, target);
        Ok((self.require(loop_id).await?, true))
    }

    /// Re-arm loops whose in-flight iteration was lost to a restart
    ///
    /// Past-due loops keep their stored fire time and run once on the next scan.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<u64, LoopError> {
        let rearmed = sqlx::query(
            r#"
            UPDATE loop_states
            SET next_execution_at = ?, claim_token = NULL
            WHERE status = 'running' AND next_execution_at IS NULL
            "#,
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?
        .rows_affected();

        sqlx::query("UPDATE loop_states SET claim_token = NULL WHERE status IN ('running', 'paused')")
            .execute(&self.pool)
            .await?;

        Ok(rearmed)
    }

    /// Delete terminal loops last touched before `older_than`
    pub async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, LoopError> {
        let result = sqlx::query(
            r#"
            DELETE FROM loop_states
            WHERE status IN ('completed', 'failed', 'stopped') AND updated_at < ?
            "#,
        )
        .bind(to_millis(older_than))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn loop_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LoopState, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let reason: Option<String> = row.try_get("termination_reason")?;
    let method: String = row.try_get("method")?;
    let timeout_seconds: i64 = row.try_get("timeout_seconds")?;

    Ok(LoopState {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        workflow_id: row.try_get("workflow_id")?,
        node_id: row.try_get("node_id")?,
        execution_step_id: row.try_get("execution_step_id")?,
        status: status.parse().map_err(decode_error)?,
        termination_reason: reason.map(|r| r.parse()).transpose().map_err(decode_error)?,
        current_iteration: row.try_get("current_iteration")?,
        max_iterations: row.try_get("max_iterations")?,
        successful_iterations: row.try_get("successful_iterations")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        next_execution_at: row.try_get::<Option<i64>, _>("next_execution_at")?.map(from_millis),
        loop_started_at: from_millis(row.try_get("loop_started_at")?),
        last_response_status: row.try_get("last_response_status")?,
        last_response_body: row.try_get("last_response_body")?,
        last_error: row.try_get("last_error")?,
        iteration_history: row
            .try_get::<Json<Vec<IterationRecord>>, _>("iteration_history")?
            .0,
        url: row.try_get("url")?,
        method: method.parse().map_err(decode_error)?,
        headers: row.try_get::<Json<HashMap<String, String>>, _>("headers")?.0,
        timeout_seconds: timeout_seconds.max(0) as u64,
        loop_config: row.try_get::<Json<LoopConfig>, _>("loop_config")?.0,
        initial_event: row.try_get::<Json<WorkflowEvent>, _>("initial_event")?.0,
        last_event: row
            .try_get::<Option<Json<WorkflowEvent>>, _>("last_event")?
            .map(|json| json.0),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}
