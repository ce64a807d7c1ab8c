/// SQLite pool and schema for the engine database
///
/// A single `engine.db` holds workflow definitions, executions with their step log,
/// polling-loop state and approval tasks. Timestamps are stored as unix milliseconds.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::time::Duration;

/// Open (creating if needed) the database at `path` and initialize its schema
pub async fn connect(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let path = path.as_ref();
    tracing::info!("🗄️ Opening engine database: {}", path.display());

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePool::connect_with(options).await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes; safe to call repeatedly
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            definition JSON NOT NULL,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            status TEXT NOT NULL,
            current_node_id TEXT,
            input JSON NOT NULL,
            output JSON,
            error TEXT,
            error_class TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)",
        r#"
        CREATE TABLE IF NOT EXISTS execution_steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            node_name TEXT NOT NULL,
            node_type TEXT NOT NULL,
            status TEXT NOT NULL,
            input JSON NOT NULL,
            output JSON,
            error TEXT,
            error_class TEXT,
            started_at INTEGER NOT NULL,
            completed_at INTEGER
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_execution_steps_execution ON execution_steps(execution_id, id)",
        r#"
        CREATE TABLE IF NOT EXISTS loop_states (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            execution_step_id TEXT NOT NULL,
            status TEXT NOT NULL,
            termination_reason TEXT,
            current_iteration INTEGER NOT NULL DEFAULT 0,
            max_iterations INTEGER,
            successful_iterations INTEGER NOT NULL DEFAULT 0,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            next_execution_at INTEGER,
            claim_token TEXT,
            loop_started_at INTEGER NOT NULL,
            last_response_status INTEGER,
            last_response_body TEXT,
            last_error TEXT,
            iteration_history JSON NOT NULL DEFAULT '[]',
            url TEXT NOT NULL,
            method TEXT NOT NULL,
            headers JSON NOT NULL,
            timeout_seconds INTEGER NOT NULL,
            loop_config JSON NOT NULL,
            initial_event JSON NOT NULL,
            last_event JSON,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_loop_states_due ON loop_states(status, next_execution_at)",
        "CREATE INDEX IF NOT EXISTS idx_loop_states_execution ON loop_states(execution_id)",
        r#"
        CREATE TABLE IF NOT EXISTS approval_tasks (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL,
            comment TEXT,
            event JSON NOT NULL,
            created_at INTEGER NOT NULL,
            decided_at INTEGER,
            expires_at INTEGER
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_approval_tasks_execution ON approval_tasks(execution_id)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Fresh database in a leaked temp directory
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    std::mem::forget(dir);
    connect(&path).await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let pool = test_pool().await;
        init_schema(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(name,)| name.as_str()).collect();
        assert_eq!(
            names,
            vec!["approval_tasks", "execution_steps", "executions", "loop_states", "workflows"]
        );
    }
}
