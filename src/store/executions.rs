/// Execution records and the append-only step log
///
/// One row per DAG execution tracks its lifecycle and current node. Every node run
/// appends a step row with input and output snapshots; step rows are never updated.

use crate::store::database::{from_millis, to_millis};
use crate::workflow::types::{Node, WorkflowEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, types::Json, Row};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Outcome of one node run as written to the step log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// Transformer returned nothing; the branch ends here
    Dropped,
    /// Node handed off to a loop or an approval and is parked
    Waiting,
    /// Action failed under `FailureAction::Continue`
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Dropped => "dropped",
            StepStatus::Waiting => "waiting",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "dropped" => Ok(StepStatus::Dropped),
            "waiting" => Ok(StepStatus::Waiting),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub current_node_id: Option<String>,
    pub input: WorkflowEvent,
    pub output: Option<WorkflowEvent>,
    pub error: Option<String>,
    pub error_class: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStep {
    pub id: i64,
    pub execution_id: String,
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub status: StepStatus,
    pub input: WorkflowEvent,
    pub output: Option<WorkflowEvent>,
    pub error: Option<String>,
    pub error_class: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Step about to be appended
#[derive(Debug)]
pub struct NewStep<'a> {
    pub execution_id: &'a str,
    pub node: &'a Node,
    pub status: StepStatus,
    pub input: &'a WorkflowEvent,
    pub output: Option<&'a WorkflowEvent>,
    /// `(error_class, message)`
    pub error: Option<(&'a str, String)>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExecutionStore {
    pool: SqlitePool,
}

impl ExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        execution_id: &str,
        workflow_id: &str,
        input: &WorkflowEvent,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, status, input, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution_id)
        .bind(workflow_id)
        .bind(ExecutionStatus::Pending.as_str())
        .bind(Json(input))
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move to `running`, clearing any earlier terminal outcome (used again by continuations)
    pub async fn mark_running(&self, execution_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, started_at = COALESCE(started_at, ?), completed_at = NULL,
                error = NULL, error_class = NULL
            WHERE id = ?
            "#,
        )
        .bind(ExecutionStatus::Running.as_str())
        .bind(to_millis(Utc::now()))
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_current_node(&self, execution_id: &str, node_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE executions SET current_node_id = ? WHERE id = ?")
            .bind(node_id)
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a terminal outcome
    pub async fn finish(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        output: Option<&WorkflowEvent>,
        error: Option<(&str, String)>,
    ) -> Result<(), sqlx::Error> {
        let (error_class, error_message) = match error {
            Some((class, message)) => (Some(class), Some(message)),
            None => (None, None),
        };

        sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, output = ?, error = ?, error_class = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(output.map(Json))
        .bind(error_message)
        .bind(error_class)
        .bind(to_millis(Utc::now()))
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| execution_from_row(&row)).transpose()
    }

    pub async fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<ExecutionRecord>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM executions WHERE status = ? ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(execution_from_row).collect()
    }

    pub async fn append_step(&self, step: NewStep<'_>) -> Result<i64, sqlx::Error> {
        let (error_class, error_message) = match step.error {
            Some((class, message)) => (Some(class), Some(message)),
            None => (None, None),
        };
        let completed_at = match step.status {
            StepStatus::Waiting => None,
            _ => Some(to_millis(Utc::now())),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO execution_steps
                (execution_id, node_id, node_name, node_type, status, input, output,
                 error, error_class, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(step.execution_id)
        .bind(&step.node.id)
        .bind(&step.node.name)
        .bind(step.node.kind.type_name())
        .bind(step.status.as_str())
        .bind(Json(step.input))
        .bind(step.output.map(Json))
        .bind(error_message)
        .bind(error_class)
        .bind(to_millis(step.started_at))
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Steps in the order they were appended
    pub async fn list_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM execution_steps WHERE execution_id = ? ORDER BY id")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ExecutionStep, sqlx::Error> {
                let status: String = row.try_get("status")?;
                Ok(ExecutionStep {
                    id: row.try_get("id")?,
                    execution_id: row.try_get("execution_id")?,
                    node_id: row.try_get("node_id")?,
                    node_name: row.try_get("node_name")?,
                    node_type: row.try_get("node_type")?,
                    status: status.parse().map_err(decode_error)?,
                    input: row.try_get::<Json<WorkflowEvent>, _>("input")?.0,
                    output: row
                        .try_get::<Option<Json<WorkflowEvent>>, _>("output")?
                        .map(|json| json.0),
                    error: row.try_get("error")?,
                    error_class: row.try_get("error_class")?,
                    started_at: from_millis(row.try_get("started_at")?),
                    completed_at: row.try_get::<Option<i64>, _>("completed_at")?.map(from_millis),
                })
            })
            .collect()
    }
}

fn execution_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        status: status.parse().map_err(decode_error)?,
        current_node_id: row.try_get("current_node_id")?,
        input: row.try_get::<Json<WorkflowEvent>, _>("input")?.0,
        output: row
            .try_get::<Option<Json<WorkflowEvent>>, _>("output")?
            .map(|json| json.0),
        error: row.try_get("error")?,
        error_class: row.try_get("error_class")?,
        created_at: from_millis(row.try_get("created_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_millis),
        completed_at: row.try_get::<Option<i64>, _>("completed_at")?.map(from_millis),
    })
}

pub(crate) fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}
