//! Shared fixtures for server tests: an in-process runtime with closure-style
//! handlers, so the HTTP surface is exercised without a script runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::Response as AxumResponse;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use quiver_core::error::{QuiverError, Result as CoreResult};
use quiver_core::function::{FunctionRecord, FunctionStatus};
use quiver_core::{
    Config, FunctionContext, FunctionRequest, Handler, HandlerOutput, Runtime, Trigger,
};

use crate::{AppState, create_app};

pub struct TestContext {
    pub state: AppState,
    pub app: Router,
    dir: TempDir,
}

impl TestContext {
    /// Invocation log written by the stub runtime, one line per invoke.
    pub fn stub_invocation_log(&self) -> std::path::PathBuf {
        self.dir.path().join("invocations.log")
    }
}

pub async fn test_context() -> TestContext {
    test_context_with("http://127.0.0.1:1", Duration::from_secs(5)).await
}

pub async fn test_context_with(backend_url: &str, timeout: Duration) -> TestContext {
    let dir = tempfile::tempdir().expect("tempdir");
    // `false` exits 1 without output, so deployed files are skipped
    // deterministically instead of depending on an installed runtime.
    build_context(dir, "false".into(), backend_url, timeout).await
}

/// Context whose handler runtime is a stub script, so deployed files load
/// and execute for real instead of being skipped.
pub async fn test_context_with_stub_runtime() -> TestContext {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = write_stub_runtime(dir.path()).display().to_string();
    build_context(dir, runtime, "http://127.0.0.1:1", Duration::from_secs(5)).await
}

async fn build_context(
    dir: TempDir,
    handler_runtime: String,
    backend_url: &str,
    timeout: Duration,
) -> TestContext {
    let config = Config {
        server_host: "127.0.0.1".into(),
        server_port: 0,
        backend_url: backend_url.into(),
        api_key: "test-key".into(),
        postgres: None,
        function_timeout: timeout,
        functions_dir: dir.path().join("functions"),
        handler_runtime,
        cache_dir: dir.path().join("cache"),
        cors_allowed_origin: "http://localhost:3000".into(),
    };
    let runtime = Runtime::new(config).await.expect("runtime");
    let state = AppState { runtime };
    let app = create_app(state.clone());
    TestContext { state, app, dir }
}

/// Stub script runtime speaking the shim's envelope protocol: every file
/// describes as a run-once function, and every invoke succeeds with
/// `{"success": true}` after appending a line to `invocations.log`.
fn write_stub_runtime(dir: &std::path::Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("stub-runtime.sh");
    let script = r#"#!/bin/sh
mode="$4"
if [ "$mode" = "describe" ]; then
  echo '{"ok":true,"metadata":{"description":"","triggers":[{"type":"once"}],"runOnce":true,"hasDefault":true}}'
else
  echo run >> "$(dirname "$0")/invocations.log"
  echo '{"ok":true,"output":{"kind":"value","value":{"success":true}}}'
fi
"#;
    std::fs::write(&path, script).expect("write stub runtime");
    let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod stub runtime");
    path
}

/// Poll a condition until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 2s");
}

/// Handler returning a fixed output.
pub struct StaticHandler(pub HandlerOutput);

#[async_trait]
impl Handler for StaticHandler {
    async fn call(
        &self,
        _request: &FunctionRequest,
        _context: &FunctionContext,
    ) -> CoreResult<HandlerOutput> {
        Ok(self.0.clone())
    }
}

/// Handler that always fails.
pub struct FailingHandler;

#[async_trait]
impl Handler for FailingHandler {
    async fn call(
        &self,
        _request: &FunctionRequest,
        _context: &FunctionContext,
    ) -> CoreResult<HandlerOutput> {
        Err(QuiverError::Handler("kaboom".into()))
    }
}

/// Handler that sleeps past any reasonable test timeout.
pub struct SleepyHandler(pub Duration);

#[async_trait]
impl Handler for SleepyHandler {
    async fn call(
        &self,
        _request: &FunctionRequest,
        _context: &FunctionContext,
    ) -> CoreResult<HandlerOutput> {
        tokio::time::sleep(self.0).await;
        Ok(HandlerOutput::value(Value::Null))
    }
}

/// Handler that records every request and its env map.
pub struct CapturingHandler {
    pub seen: Arc<Mutex<Vec<(FunctionRequest, HashMap<String, String>)>>>,
    pub output: HandlerOutput,
}

impl CapturingHandler {
    pub fn new(output: HandlerOutput) -> (Arc<Mutex<Vec<(FunctionRequest, HashMap<String, String>)>>>, Arc<Self>)
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(Self {
            seen: seen.clone(),
            output,
        });
        (seen, handler)
    }
}

#[async_trait]
impl Handler for CapturingHandler {
    async fn call(
        &self,
        request: &FunctionRequest,
        context: &FunctionContext,
    ) -> CoreResult<HandlerOutput> {
        self.seen
            .lock()
            .expect("seen lock poisoned")
            .push((request.clone(), context.env.clone()));
        Ok(self.output.clone())
    }
}

/// Register a function backed by an in-process handler.
pub fn install(
    state: &AppState,
    name: &str,
    triggers: Vec<Trigger>,
    run_once: bool,
    handler: Arc<dyn Handler>,
) {
    state.runtime.registry.insert(Arc::new(FunctionRecord {
        name: name.to_string(),
        description: String::new(),
        triggers,
        handler,
        source_path: format!("{name}.ts").into(),
        env_vars: HashMap::new(),
        run_once,
        status: std::sync::RwLock::new(FunctionStatus::default()),
    }));
    state.runtime.rebind_events();
}

pub fn http_trigger(methods: &[&str]) -> Trigger {
    Trigger::Http {
        methods: methods.iter().map(|m| m.to_string()).collect(),
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> AxumResponse {
    app.clone().oneshot(request).await.expect("request failed")
}

pub async fn send_get(app: &Router, uri: &str) -> AxumResponse {
    send(
        app,
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request"),
    )
    .await
}

pub async fn send_delete(app: &Router, uri: &str) -> AxumResponse {
    send(
        app,
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .expect("request"),
    )
    .await
}

pub async fn send_json(app: &Router, method: &str, uri: &str, body: Value) -> AxumResponse {
    send(
        app,
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
    )
    .await
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8_lossy(&bytes).into_owned()
}
