//! Restart recovery: a second engine on the same database picks up where the first stopped
//!
//! Each engine lives on its own runtime; shutting the first runtime down abandons its
//! tasks mid-flight the way a process crash would.

mod common;

use common::{polling_workflow, publish, start, submit, wait_loop_iterations, wait_status};
use dagloop::store::executions::ExecutionStatus;
use dagloop::store::loops::{LoopStatus, TerminationReason};
use serde_json::json;
use tokio::runtime::Runtime;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[test]
fn parked_execution_resumes_and_loop_fires_once_per_interval() {
    let dir = tempfile::tempdir().unwrap();
    let mock_runtime = Runtime::new().unwrap();
    let server = mock_runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "pending" })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "done" })))
            .with_priority(2)
            .mount(&server)
            .await;
        server
    });
    let url = format!("{}/jobs/7", server.uri());

    let first = Runtime::new().unwrap();
    let (execution_id, loop_id) = first.block_on(async {
        let harness = start(dir.path()).await;
        publish(&harness.engine, polling_workflow(&url, Some(5), 2)).await;
        let execution_id = submit(&harness.engine, "wf-poll", json!({})).await;
        let report = wait_loop_iterations(&harness.engine, &execution_id, 1).await;
        // Leave the scheduler and walk running so the shutdown interrupts them
        std::mem::forget(harness);
        (execution_id, report.state.id)
    });
    first.shutdown_background();

    let second = Runtime::new().unwrap();
    second.block_on(async {
        let harness = start(dir.path()).await;
        let engine = &harness.engine;

        let record = wait_status(engine, &execution_id, ExecutionStatus::Completed).await;
        assert_eq!(record.output.unwrap().data["outcome"], json!("ready"));

        let report = engine.get_loop_status(&loop_id).await.unwrap();
        assert_eq!(report.state.status, LoopStatus::Completed);
        assert_eq!(report.state.termination_reason, Some(TerminationReason::Success));
        assert_eq!(report.state.current_iteration, 2);
        assert_eq!(report.state.iteration_history.len(), 2);
    });

    let requests = mock_runtime.block_on(server.received_requests()).unwrap();
    assert_eq!(requests.len(), 2);
}

#[test]
fn unparked_execution_is_failed_as_interrupted() {
    let dir = tempfile::tempdir().unwrap();

    let first = Runtime::new().unwrap();
    let execution_id = first.block_on(async {
        let harness = start(dir.path()).await;
        publish(
            &harness.engine,
            json!({
                "id": "wf-slow",
                "name": "slow",
                "start_node_id": "t",
                "nodes": [
                    { "id": "t", "name": "start", "type": "trigger" },
                    { "id": "wait", "name": "wait", "type": "delay", "duration": 1, "unit": "hours" }
                ],
                "edges": [{ "from_node_id": "t", "to_node_id": "wait" }]
            }),
        )
        .await;
        let execution_id = submit(&harness.engine, "wf-slow", json!({})).await;
        wait_status(&harness.engine, &execution_id, ExecutionStatus::Running).await;
        std::mem::forget(harness);
        execution_id
    });
    first.shutdown_background();

    let second = Runtime::new().unwrap();
    second.block_on(async {
        let harness = start(dir.path()).await;
        let record = harness.engine.get_execution_status(&execution_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error_class.as_deref(), Some("interrupted"));
        assert_eq!(record.error.as_deref(), Some("interrupted by restart"));
    });
}
