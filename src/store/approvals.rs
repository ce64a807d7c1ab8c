/// Human approval tasks raised by `human_approval` nodes

use crate::store::database::{from_millis, to_millis};
use crate::store::executions::decode_error;
use crate::workflow::types::WorkflowEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, types::Json, Row};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    TimedOut,
    /// Abandoned because the process restarted while waiting
    Failed,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::TimedOut => "timed_out",
            ApprovalStatus::Failed => "failed",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            "timed_out" => Ok(ApprovalStatus::TimedOut),
            "failed" => Ok(ApprovalStatus::Failed),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalTask {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: ApprovalStatus,
    pub comment: Option<String>,
    pub event: WorkflowEvent,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ApprovalStore {
    pool: SqlitePool,
}

impl ApprovalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, task: &ApprovalTask) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO approval_tasks
                (id, execution_id, node_id, title, description, status, comment, event,
                 created_at, decided_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.execution_id)
        .bind(&task.node_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(&task.comment)
        .bind(Json(&task.event))
        .bind(to_millis(task.created_at))
        .bind(task.decided_at.map(to_millis))
        .bind(task.expires_at.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<ApprovalTask>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM approval_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| task_from_row(&row)).transpose()
    }

    pub async fn list_by_execution(&self, execution_id: &str) -> Result<Vec<ApprovalTask>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM approval_tasks WHERE execution_id = ? ORDER BY created_at")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Settle a pending task; `None` if it was already settled or does not exist
    pub async fn settle(
        &self,
        task_id: &str,
        status: ApprovalStatus,
        comment: Option<String>,
    ) -> Result<Option<ApprovalTask>, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE approval_tasks
            SET status = ?, comment = ?, decided_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(comment)
        .bind(to_millis(Utc::now()))
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(task_id).await
    }

    /// Fail every task still pending, returning how many were abandoned
    pub async fn abandon_pending(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE approval_tasks
            SET status = 'failed', comment = 'interrupted by restart', decided_at = ?
            WHERE status = 'pending'
            "#,
        )
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalTask, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(ApprovalTask {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        node_id: row.try_get("node_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: status.parse().map_err(decode_error)?,
        comment: row.try_get("comment")?,
        event: row.try_get::<Json<WorkflowEvent>, _>("event")?.0,
        created_at: from_millis(row.try_get("created_at")?),
        decided_at: row.try_get::<Option<i64>, _>("decided_at")?.map(from_millis),
        expires_at: row.try_get::<Option<i64>, _>("expires_at")?.map(from_millis),
    })
}
