/// SQLite persistence layer for workflow definitions
///
/// Workflows are stored as JSON documents keyed by id. Definitions arrive from the
/// ingestion layer, either saved directly or imported from a directory of JSON files.

use crate::workflow::types::Workflow;
use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use std::path::Path;

/// SQLite-based workflow storage
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    /// Pool shared with the runtime stores
    pool: SqlitePool,
}

impl WorkflowStorage {
    /// Wrap an already-migrated pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new workflow or replace an existing one
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve a workflow by ID
    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                let workflow: Workflow = serde_json::from_str(&definition_json)?;
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }

    /// Load all workflows for registry initialization
    pub async fn load_all_workflows(&self) -> Result<HashMap<String, Workflow>> {
        let rows = sqlx::query("SELECT id, definition FROM workflows")
            .fetch_all(&self.pool)
            .await?;

        let mut workflows = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            match serde_json::from_str::<Workflow>(&definition_json) {
                Ok(workflow) => {
                    workflows.insert(id, workflow);
                }
                Err(e) => tracing::warn!("⚠️ Skipping unreadable workflow '{}': {}", id, e),
            }
        }

        Ok(workflows)
    }

    /// Import every `*.json` workflow definition found in `dir`
    ///
    /// Returns the number of workflows saved. A malformed file aborts the import so a
    /// broken deployment is noticed at startup rather than at the first webhook call.
    pub async fn import_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("reading workflow directory {}", dir.display()))?;

        let mut imported = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let workflow: Workflow = serde_json::from_str(&raw)
                .with_context(|| format!("parsing workflow {}", path.display()))?;

            tracing::info!("📥 Importing workflow '{}' from {}", workflow.id, path.display());
            self.save_workflow(&workflow).await?;
            imported += 1;
        }

        Ok(imported)
    }
}
