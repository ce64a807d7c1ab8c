//! HTTP surface: webhook triggers, status, loop control and approval decisions

mod common;

use common::test_config;
use dagloop::server::create_app;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct TestServer {
    base: String,
    client: Client,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TestServer {
    async fn start(data_dir: &Path) -> Self {
        let workflows_dir = data_dir.join("workflows");
        std::fs::create_dir_all(&workflows_dir).unwrap();
        std::fs::write(workflows_dir.join("orders.json"), orders_workflow().to_string()).unwrap();
        std::fs::write(workflows_dir.join("refunds.json"), refund_workflow().to_string()).unwrap();
        std::fs::write(workflows_dir.join("README.md"), "not a workflow").unwrap();

        let mut config = test_config(data_dir);
        config.database.workflows_dir = Some(workflows_dir.display().to_string());

        let shutdown = CancellationToken::new();
        let app = create_app(config, shutdown.clone()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            client: Client::new(),
            shutdown,
        }
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = self.client.request(method, format!("{}{}", self.base, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.unwrap();
        let status = response.status();
        let text = response.text().await.unwrap();
        let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        (status, value)
    }

    async fn wait_execution(&self, execution_id: &str, status: &str) -> Value {
        for _ in 0..500 {
            let (_, record) = self
                .send(Method::GET, &format!("/api/executions/{execution_id}"), None)
                .await;
            if record["status"] == status {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {execution_id} never reached {status}");
    }
}

fn tag(id: &str) -> Value {
    json!({
        "id": id, "name": id, "type": "transformer",
        "script": format!("function transformer(event) return {{ tag = '{id}' }} end")
    })
}

fn orders_workflow() -> Value {
    json!({
        "id": "wf-orders",
        "name": "Order router",
        "start_node_id": "t",
        "nodes": [
            { "id": "t", "name": "start", "type": "trigger", "methods": ["POST", "GET"] },
            { "id": "big", "name": "is_big", "type": "condition",
              "script": "function condition(event) return tonumber(event.data.amount) > 100 end" },
            tag("large"),
            tag("small")
        ],
        "edges": [
            { "from_node_id": "t", "to_node_id": "big" },
            { "from_node_id": "big", "to_node_id": "large", "condition_result": true },
            { "from_node_id": "big", "to_node_id": "small", "condition_result": false }
        ]
    })
}

fn refund_workflow() -> Value {
    json!({
        "id": "wf-refunds",
        "name": "Refund approval",
        "start_node_id": "t",
        "nodes": [
            { "id": "t", "name": "start", "type": "trigger", "methods": ["POST"] },
            { "id": "gate", "name": "manager_sign_off", "type": "human_approval",
              "title": "Refund {{ $.data.amount }}" },
            { "id": "notified", "name": "notified", "type": "transformer",
              "script": "function transformer(event) return event end" },
            tag("granted"),
            tag("refused")
        ],
        "edges": [
            { "from_node_id": "t", "to_node_id": "gate" },
            { "from_node_id": "gate", "to_node_id": "notified", "source_handle_id": "notify" },
            { "from_node_id": "gate", "to_node_id": "granted", "source_handle_id": "approved" },
            { "from_node_id": "gate", "to_node_id": "refused", "source_handle_id": "denied" }
        ]
    })
}

#[tokio::test]
async fn webhook_runs_imported_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let (status, body) = server
        .send(Method::POST, "/webhook/wf-orders", Some(json!({ "amount": 250 })))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let execution_id = body["execution_id"].as_str().unwrap().to_string();

    let record = server.wait_execution(&execution_id, "completed").await;
    assert_eq!(record["output"]["data"], json!({ "tag": "large" }));
    assert_eq!(record["input"]["metadata"]["trigger_method"], "POST");

    let (status, steps) = server
        .send(Method::GET, &format!("/api/executions/{execution_id}/steps"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let visited: Vec<&str> = steps
        .as_array()
        .unwrap()
        .iter()
        .map(|step| step["node_id"].as_str().unwrap())
        .collect();
    assert!(visited.contains(&"large"));
    assert!(!visited.contains(&"small"));
}

#[tokio::test]
async fn bodyless_webhook_uses_query_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let (status, body) = server.send(Method::GET, "/webhook/wf-orders?amount=7", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let execution_id = body["execution_id"].as_str().unwrap().to_string();

    let record = server.wait_execution(&execution_id, "completed").await;
    assert_eq!(record["input"]["data"], json!({ "amount": "7" }));
    assert_eq!(record["output"]["data"], json!({ "tag": "small" }));
}

#[tokio::test]
async fn webhook_rejections_map_to_status_codes() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let (status, body) = server.send(Method::DELETE, "/webhook/wf-orders", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["class"], "method_not_allowed");

    let (status, _) = server.send(Method::OPTIONS, "/webhook/wf-orders", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, body) = server.send(Method::POST, "/webhook/wf-missing", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["class"], "workflow_not_found");

    let response = server
        .client
        .post(format!("{}/webhook/wf-orders", server.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_resources_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let (status, body) = server.send(Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!("ok"));

    let (status, body) = server.send(Method::GET, "/api/executions/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["class"], "execution_not_found");

    let (status, body) = server.send(Method::GET, "/api/loops/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["class"], "loop_not_found");

    let (status, _) = server.send(Method::POST, "/api/loops/nope/pause", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = server.send(Method::POST, "/api/loops/nope/rewind", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["class"], "bad_request");

    let (status, body) = server.send(Method::GET, "/api/loops", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = server
        .send(Method::POST, "/api/approvals/nope", Some(json!({ "approved": true })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["class"], "approval_not_found");
}

#[tokio::test]
async fn approval_decision_resumes_execution_once() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let (_, body) = server
        .send(Method::POST, "/webhook/wf-refunds", Some(json!({ "amount": 40 })))
        .await;
    let execution_id = body["execution_id"].as_str().unwrap().to_string();

    let mut task_id = None;
    for _ in 0..500 {
        let (_, steps) = server
            .send(Method::GET, &format!("/api/executions/{execution_id}/steps"), None)
            .await;
        task_id = steps
            .as_array()
            .unwrap()
            .iter()
            .find(|step| step["node_id"] == "notified")
            .and_then(|step| step["input"]["metadata"]["approval_task_id"].as_str())
            .map(str::to_string);
        if task_id.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let task_id = task_id.expect("notify branch ran");

    let (_, record) = server
        .send(Method::GET, &format!("/api/executions/{execution_id}"), None)
        .await;
    assert_eq!(record["status"], "running");

    let decision = json!({ "approved": true, "comment": "fine" });
    let (status, task) = server
        .send(Method::POST, &format!("/api/approvals/{task_id}"), Some(decision.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "approved");
    assert_eq!(task["title"], "Refund 40");

    let (status, body) = server
        .send(Method::POST, &format!("/api/approvals/{task_id}"), Some(decision))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["class"], "approval_already_decided");

    let record = server.wait_execution(&execution_id, "completed").await;
    assert_eq!(record["output"]["data"], json!({ "tag": "granted" }));
}
