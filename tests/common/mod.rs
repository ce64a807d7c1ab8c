//! Shared harness for integration tests: a file-backed engine with a fast scheduler

#![allow(dead_code)]

use dagloop::config::Config;
use dagloop::runtime::{ExecutionEngine, LoopScheduler};
use dagloop::server::build_engine;
use dagloop::store::database;
use dagloop::store::executions::{ExecutionRecord, ExecutionStatus};
use dagloop::store::loops::LoopStatusReport;
use dagloop::workflow::types::{HttpMethod, Workflow};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Harness {
    pub engine: ExecutionEngine,
    pub scheduler: Arc<LoopScheduler>,
    pub shutdown: CancellationToken,
}

pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.database.data_dir = data_dir.display().to_string();
    config.database.workflows_dir = None;
    config.scheduler.tick_interval_ms = 20;
    config.scheduler.completion_poll_ms = 50;
    config
}

/// Open `{data_dir}/engine.db`, reconcile leftovers and start the scheduler
pub async fn start(data_dir: &Path) -> Harness {
    let config = test_config(data_dir);
    let pool = database::connect(data_dir.join("engine.db")).await.unwrap();
    let (engine, scheduler) = build_engine(&config, pool).await.unwrap();
    engine.recover_on_startup().await.unwrap();

    let shutdown = CancellationToken::new();
    scheduler.start(shutdown.clone());
    Harness {
        engine,
        scheduler,
        shutdown,
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn publish(engine: &ExecutionEngine, definition: Value) {
    let workflow: Workflow = serde_json::from_value(definition).unwrap();
    engine.registry().publish(workflow).await.unwrap();
}

pub async fn submit(engine: &ExecutionEngine, workflow_id: &str, payload: Value) -> String {
    engine
        .submit_event(workflow_id, payload, HashMap::new(), HttpMethod::Post)
        .await
        .unwrap()
}

/// Trigger → polling `http_request` → `ok` on success / `alert` on failure
pub fn polling_workflow(url: &str, max_iterations: Option<u32>, interval_seconds: u64) -> Value {
    json!({
        "id": "wf-poll",
        "name": "Order status poller",
        "start_node_id": "t",
        "nodes": [
            { "id": "t", "name": "start", "type": "trigger", "methods": ["POST"] },
            { "id": "poll", "name": "poll_status", "type": "http_request",
              "url": url, "method": "GET", "timeout_seconds": 5,
              "loop_config": {
                  "max_iterations": max_iterations,
                  "interval_seconds": interval_seconds,
                  "termination_condition": {
                      "script": "function condition(event) return event.data.status == \"done\" end"
                  }
              } },
            { "id": "ok", "name": "ready", "type": "transformer",
              "script": "function transformer(event) return { outcome = 'ready', status = event.data.status } end" },
            { "id": "alert", "name": "gave_up", "type": "transformer",
              "script": "function transformer(event) return { outcome = 'gave_up' } end" }
        ],
        "edges": [
            { "from_node_id": "t", "to_node_id": "poll" },
            { "from_node_id": "poll", "to_node_id": "ok", "source_handle_id": "success" },
            { "from_node_id": "poll", "to_node_id": "alert", "source_handle_id": "failure" }
        ]
    })
}

pub async fn wait_status(engine: &ExecutionEngine, execution_id: &str, status: ExecutionStatus) -> ExecutionRecord {
    for _ in 0..1_500 {
        let record = engine.get_execution_status(execution_id).await.unwrap();
        if record.status == status {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = engine.get_execution_status(execution_id).await.unwrap();
    panic!("execution {execution_id} never reached {status:?}, last seen {record:?}");
}

/// Wait for the execution's loop to appear and complete `iterations` iterations
pub async fn wait_loop_iterations(engine: &ExecutionEngine, execution_id: &str, iterations: u32) -> LoopStatusReport {
    for _ in 0..1_500 {
        let active = engine.list_active_loops(Some(execution_id)).await.unwrap();
        if let Some(report) = active.into_iter().next() {
            if report.state.current_iteration >= iterations {
                return report;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("loop of execution {execution_id} never reached iteration {iterations}");
}

pub async fn first_active_loop(engine: &ExecutionEngine, execution_id: &str) -> String {
    wait_loop_iterations(engine, execution_id, 0).await.state.id
}
