//! End-to-end checks of the execution-result callback: a stub control plane
//! captures everything the runtime posts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use axum::{Json, Router, extract::Path, extract::State, routing::post};
use serde_json::{Value, json};

use quiver_core::HandlerOutput;

use super::test_utils::*;

type Captured = Arc<Mutex<Vec<(String, Value)>>>;

async fn capture_result(
    State(captured): State<Captured>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    captured
        .lock()
        .expect("capture lock poisoned")
        .push((name, body));
    Json(json!({"success": true}))
}

/// Serve the stub backend on an ephemeral port, returning its base URL.
async fn spawn_stub_backend() -> (String, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route(
            "/api/v1/functions/{name}/execution-result",
            post(capture_result),
        )
        .with_state(captured.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub backend");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{addr}"), captured)
}

async fn wait_for_reports(captured: &Captured, count: usize) -> Vec<(String, Value)> {
    for _ in 0..100 {
        {
            let reports = captured.lock().expect("capture lock poisoned");
            if reports.len() >= count {
                return reports.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("backend never received {count} execution report(s)");
}

#[tokio::test]
async fn test_http_invocation_reports_success() {
    let (backend_url, captured) = spawn_stub_backend().await;
    let ctx = test_context_with(&backend_url, Duration::from_secs(5)).await;
    install(
        &ctx.state,
        "hello",
        vec![http_trigger(&["GET"])],
        false,
        Arc::new(StaticHandler(HandlerOutput::value(json!({"ok": true})))),
    );

    let response = send_get(&ctx.app, "/hello").await;
    assert_eq!(response.status(), StatusCode::OK);

    let reports = wait_for_reports(&captured, 1).await;
    let (name, report) = &reports[0];
    assert_eq!(name, "hello");
    assert_eq!(report["function_name"], "hello");
    assert_eq!(report["success"], true);
    assert_eq!(report["result"], json!({"ok": true}));
    assert!(!report["execution_id"].as_str().unwrap().is_empty());
    assert!(!report["delivery_id"].as_str().unwrap().is_empty());
    assert!(report["logs"].is_array());
    assert!(report["execution_time_ms"].is_u64());
    assert!(report["timestamp"].is_string());
}

#[tokio::test]
async fn test_failed_invocation_reports_failure_with_logs() {
    let (backend_url, captured) = spawn_stub_backend().await;
    let ctx = test_context_with(&backend_url, Duration::from_millis(50)).await;
    install(
        &ctx.state,
        "slow",
        vec![http_trigger(&["GET"])],
        false,
        Arc::new(SleepyHandler(Duration::from_secs(10))),
    );

    let response = send_get(&ctx.app, "/slow").await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    let reports = wait_for_reports(&captured, 1).await;
    let (_, report) = &reports[0];
    assert_eq!(report["success"], false);
    assert_eq!(report["result"]["error"], "Function execution timed out");
    let logs: Vec<String> = report["logs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l.as_str().unwrap().to_string())
        .collect();
    assert!(logs.iter().any(|l| l.starts_with("[ERROR]")));
}

#[tokio::test]
async fn test_webhook_reports_supplied_ids() {
    let (backend_url, captured) = spawn_stub_backend().await;
    let ctx = test_context_with(&backend_url, Duration::from_secs(5)).await;
    install(
        &ctx.state,
        "hook",
        Vec::new(),
        false,
        Arc::new(StaticHandler(HandlerOutput::value(json!({"done": true})))),
    );

    let response = send_json(
        &ctx.app,
        "POST",
        "/webhook/hook",
        json!({
            "payload": {"n": 1},
            "execution_id": "exec-42",
            "delivery_id": "del-42",
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let reports = wait_for_reports(&captured, 1).await;
    let (_, report) = &reports[0];
    assert_eq!(report["execution_id"], "exec-42");
    assert_eq!(report["delivery_id"], "del-42");
    assert_eq!(report["success"], true);
}
