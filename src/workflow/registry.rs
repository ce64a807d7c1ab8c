/// Hot-reload workflow registry using ArcSwap
///
/// Provides lock-free, atomic updates to the in-memory workflow registry. Each update
/// swaps the entire map pointer, so executions already running keep the version they
/// started with while new submissions see the new one.

use crate::workflow::{
    graph::WorkflowGraph,
    storage::WorkflowStorage,
    types::{NodeKind, Workflow},
};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Lock-free registry of compiled workflows
#[derive(Debug)]
pub struct WorkflowRegistry {
    /// Key: workflow_id, Value: compiled workflow
    workflows: ArcSwap<HashMap<String, CompiledWorkflow>>,
    storage: WorkflowStorage,
}

/// Validated workflow plus its graph view
///
/// Cloning is cheap: both halves are reference counted.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow: Arc<Workflow>,
    pub graph: Arc<WorkflowGraph>,
}

impl WorkflowRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Initialize registry by loading all workflows from storage
    ///
    /// Workflows that fail validation are skipped with a warning so one bad definition
    /// does not keep the engine from starting.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored_workflows = self.storage.load_all_workflows().await?;
        let mut compiled = HashMap::new();

        for (id, workflow) in stored_workflows {
            match compile_workflow(workflow) {
                Ok(workflow) => {
                    compiled.insert(id, workflow);
                }
                Err(e) => tracing::warn!("⚠️ Workflow '{}' rejected: {}", id, e),
            }
        }

        self.workflows.store(Arc::new(compiled));
        tracing::info!(
            "Initialized workflow registry with {} workflows",
            self.workflows.load().len()
        );
        Ok(())
    }

    /// Validate, persist and publish a workflow definition
    pub async fn publish(&self, workflow: Workflow) -> Result<()> {
        let compiled = compile_workflow(workflow)?;
        self.storage.save_workflow(&compiled.workflow).await?;

        let current = self.workflows.load();
        let mut next = (**current).clone();
        let id = compiled.workflow.id.clone();
        next.insert(id.clone(), compiled);
        self.workflows.store(Arc::new(next));

        tracing::info!("Hot-reloaded workflow: {}", id);
        Ok(())
    }

    /// Get a workflow by ID (lock-free read)
    pub fn get_workflow(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        self.workflows.load().get(workflow_id).cloned()
    }
}

/// Validate a workflow and build its graph view
///
/// Checks that ids and names are unique, that the start node exists and is a trigger,
/// and that every edge endpoint resolves.
pub fn compile_workflow(workflow: Workflow) -> Result<CompiledWorkflow> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for node in &workflow.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(anyhow::anyhow!("Duplicate node id: {}", node.id));
        }
        if !names.insert(node.name.as_str()) {
            return Err(anyhow::anyhow!("Duplicate node name: {}", node.name));
        }
    }

    let start = workflow
        .node(&workflow.start_node_id)
        .ok_or_else(|| anyhow::anyhow!("Start node not found: {}", workflow.start_node_id))?;
    if !matches!(start.kind, NodeKind::Trigger { .. }) {
        return Err(anyhow::anyhow!(
            "Start node '{}' must be a trigger, found {}",
            start.id,
            start.kind.type_name()
        ));
    }

    let graph = WorkflowGraph::build(&workflow)?;

    Ok(CompiledWorkflow {
        workflow: Arc::new(workflow),
        graph: Arc::new(graph),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::test_pool;
    use serde_json::json;

    fn workflow(start_type: &str) -> Workflow {
        serde_json::from_value(json!({
            "id": "wf", "name": "wf", "start_node_id": "s",
            "nodes": [
                { "id": "s", "name": "s", "type": start_type, "script": "", "duration": 0 },
                { "id": "d", "name": "d", "type": "delay", "duration": 0 }
            ],
            "edges": [{ "from_node_id": "s", "to_node_id": "d" }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn publish_makes_workflow_visible() {
        let registry = WorkflowRegistry::new(WorkflowStorage::new(test_pool().await));
        assert!(registry.get_workflow("wf").is_none());
        registry.publish(workflow("trigger")).await.unwrap();

        let compiled = registry.get_workflow("wf").unwrap();
        assert_eq!(compiled.graph.outgoing("s"), vec![0]);
    }

    #[tokio::test]
    async fn init_from_storage_skips_invalid_definitions() {
        let storage = WorkflowStorage::new(test_pool().await);
        storage.save_workflow(&workflow("condition")).await.unwrap();
        let registry = WorkflowRegistry::new(storage);
        registry.init_from_storage().await.unwrap();
        assert!(registry.get_workflow("wf").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut wf = workflow("trigger");
        wf.nodes[1].name = "s".to_string();
        assert!(compile_workflow(wf).is_err());
    }
}
