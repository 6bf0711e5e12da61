//! Handler abstraction and the process-backed handler host.
//!
//! Handler files are TypeScript/JavaScript modules on disk. The runtime does
//! not embed a script engine; instead every invocation spawns the configured
//! script runtime (`deno` by default) on a small shim module which imports the
//! handler file, rebuilds the request/context surface, and speaks a JSON
//! envelope protocol over stdin/stdout. Handler log output travels over
//! stderr, one prefixed line at a time, into the per-execution buffer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::backend::BackendClient;
use crate::error::{QuiverError, Result};
use crate::function::FunctionMetadata;

/// Ordered header multimap carried by synthesized requests.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The request surface a handler sees, whichever trigger produced it.
#[derive(Debug, Clone)]
pub struct FunctionRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl FunctionRequest {
    /// Build the synthetic POST request used by non-HTTP trigger paths.
    pub fn synthetic(path: impl Into<String>, trigger_type: &str) -> Self {
        let mut headers = Headers::new();
        headers.insert("X-Trigger-Type", trigger_type);
        Self {
            method: "POST".to_string(),
            path: path.into(),
            headers,
            body: None,
        }
    }

    pub fn with_json_body(mut self, body: &Value) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub fn text(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.body.as_deref().map(str::as_bytes)
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(self.body.as_deref()?).ok()
    }
}

/// Identifiers correlating one invocation with the Backend's records.
#[derive(Debug, Clone)]
pub struct ExecutionIds {
    pub execution_id: String,
    pub delivery_id: Option<String>,
}

impl ExecutionIds {
    /// Mint a fresh pair, one UUID each.
    pub fn fresh() -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            delivery_id: Some(Uuid::new_v4().to_string()),
        }
    }

    /// Use identifiers handed to us by the Backend (webhook deliveries).
    pub fn supplied(execution_id: String, delivery_id: String) -> Self {
        Self {
            execution_id,
            delivery_id: Some(delivery_id),
        }
    }
}

/// Per-execution log buffer. Lines carry `[LOG]`/`[WARN]`/`[ERROR]` prefixes
/// and are forwarded to tracing as they arrive.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<String>>>);

const LOG_PREFIXES: [&str; 3] = ["[LOG]", "[WARN]", "[ERROR]"];

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, message: impl AsRef<str>) {
        self.push(format!("[LOG] {}", message.as_ref()));
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.push(format!("[WARN] {}", message.as_ref()));
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.push(format!("[ERROR] {}", message.as_ref()));
    }

    /// Take a line from a handler's log stream, preserving a prefix the
    /// handler already applied.
    pub fn absorb(&self, line: String) {
        if LOG_PREFIXES.iter().any(|p| line.starts_with(p)) {
            self.push(line);
        } else {
            self.push(format!("[LOG] {line}"));
        }
    }

    fn push(&self, line: String) {
        debug!("{}", line);
        self.0.lock().expect("log buffer lock poisoned").push(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().expect("log buffer lock poisoned").clone()
    }
}

/// Everything a handler receives besides the request itself.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub env: HashMap<String, String>,
    pub ids: ExecutionIds,
    pub logs: LogBuffer,
    pub backend: BackendClient,
}

/// Normalized handler return value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HandlerOutput {
    /// A response-like object, forwarded verbatim on HTTP trigger paths.
    Response {
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Value,
    },
    /// Any other value; JSON-encoded for HTTP triggers, passed through as the
    /// result payload otherwise.
    Value {
        #[serde(default)]
        value: Value,
    },
}

impl HandlerOutput {
    pub fn value(value: Value) -> Self {
        HandlerOutput::Value { value }
    }

    /// The value reported to the Backend as `result`.
    pub fn result_value(&self) -> &Value {
        match self {
            HandlerOutput::Response { body, .. } => body,
            HandlerOutput::Value { value } => value,
        }
    }
}

/// The invocable side of a function record.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: &FunctionRequest, context: &FunctionContext)
    -> Result<HandlerOutput>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    method: &'a str,
    path: &'a str,
    headers: Vec<(&'a str, &'a str)>,
    body: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireContext<'a> {
    env: &'a HashMap<String, String>,
    execution_id: &'a str,
    delivery_id: Option<&'a str>,
    backend_url: &'a str,
    api_key: &'a str,
}

#[derive(Serialize)]
struct InvokeEnvelope<'a> {
    request: WireRequest<'a>,
    context: WireContext<'a>,
}

#[derive(Deserialize)]
struct ResultEnvelope {
    ok: bool,
    #[serde(default)]
    output: Option<HandlerOutput>,
    #[serde(default)]
    metadata: Option<FunctionMetadata>,
    #[serde(default)]
    error: Option<String>,
}

/// Spawns the script runtime on the shim for each call.
#[derive(Debug, Clone)]
pub struct ProcessHandler {
    runtime: String,
    shim_path: PathBuf,
    source_path: PathBuf,
}

impl ProcessHandler {
    pub fn new(runtime: String, shim_path: PathBuf, source_path: PathBuf) -> Self {
        Self {
            runtime,
            shim_path,
            source_path,
        }
    }

    fn command(runtime: &str, shim: &Path, mode: &str, file: &Path) -> Command {
        let mut cmd = Command::new(runtime);
        cmd.arg("run")
            .arg("--allow-all")
            .arg(shim)
            .arg(mode)
            .arg(file)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Ask the shim for the handler file's exported metadata.
    pub async fn describe(
        runtime: &str,
        shim: &Path,
        file: &Path,
    ) -> Result<FunctionMetadata> {
        let output = Self::command(runtime, shim, "describe", file)
            .output()
            .await
            .map_err(|e| {
                QuiverError::Load(format!("failed to spawn handler runtime '{runtime}': {e}"))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let envelope: ResultEnvelope = serde_json::from_str(stdout.trim()).map_err(|_| {
            QuiverError::Load(format!(
                "describe produced no metadata for {} (exit {:?}): {}",
                file.display(),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
        })?;

        if !envelope.ok {
            return Err(QuiverError::Load(
                envelope.error.unwrap_or_else(|| "unknown describe error".into()),
            ));
        }
        envelope
            .metadata
            .ok_or_else(|| QuiverError::Load("describe envelope missing metadata".into()))
    }
}

#[async_trait]
impl Handler for ProcessHandler {
    async fn call(
        &self,
        request: &FunctionRequest,
        context: &FunctionContext,
    ) -> Result<HandlerOutput> {
        let envelope = serde_json::to_string(&InvokeEnvelope {
            request: WireRequest {
                method: &request.method,
                path: &request.path,
                headers: request.headers.iter().collect(),
                body: request.body.as_deref(),
            },
            context: WireContext {
                env: &context.env,
                execution_id: &context.ids.execution_id,
                delivery_id: context.ids.delivery_id.as_deref(),
                backend_url: context.backend.base_url(),
                api_key: context.backend.api_key(),
            },
        })?;

        let mut child = Self::command(&self.runtime, &self.shim_path, "invoke", &self.source_path)
            .spawn()
            .map_err(|e| {
                QuiverError::Handler(format!(
                    "failed to spawn handler runtime '{}': {e}",
                    self.runtime
                ))
            })?;

        // A handler that exits without reading stdin closes the pipe early;
        // the result envelope (or its absence) decides the outcome.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(envelope.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        // Stream handler log output into the execution buffer as it arrives.
        let stderr_task = child.stderr.take().map(|stderr| {
            let logs = context.logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.absorb(line);
                }
            })
        });

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout).await?;
        }
        let status = child.wait().await?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let envelope: ResultEnvelope = serde_json::from_str(stdout.trim()).map_err(|_| {
            QuiverError::Handler(format!(
                "handler produced no result envelope (exit {:?})",
                status.code()
            ))
        })?;

        if envelope.ok {
            Ok(envelope
                .output
                .unwrap_or(HandlerOutput::Value { value: Value::Null }))
        } else {
            Err(QuiverError::Handler(
                envelope.error.unwrap_or_else(|| "unknown handler error".into()),
            ))
        }
    }
}

/// Shim module executed by the script runtime. Materialized once per process
/// under the cache directory.
const HANDLER_SHIM: &str = r#"// Executes a user handler file on behalf of the Quiver runtime.
// Usage: <runtime> run --allow-all quiver-shim.mjs <describe|invoke> <handler-file>

const [mode, target] = Deno.args;
const encoder = new TextEncoder();

function emit(value) {
  Deno.stdout.writeSync(encoder.encode(JSON.stringify(value)));
}

let mod;
try {
  mod = await import(new URL(`file://${target}`).href);
} catch (err) {
  emit({ ok: false, error: `failed to import handler: ${err}` });
  Deno.exit(1);
}

if (mode === "describe") {
  emit({
    ok: true,
    metadata: {
      description: typeof mod.description === "string" ? mod.description : "",
      triggers: Array.isArray(mod.triggers) ? mod.triggers : [],
      runOnce: mod.runOnce === true,
      hasDefault: typeof mod.default === "function",
    },
  });
  Deno.exit(0);
}

const chunks = [];
for await (const chunk of Deno.stdin.readable) chunks.push(chunk);
const total = chunks.reduce((n, c) => n + c.length, 0);
const buffer = new Uint8Array(total);
let offset = 0;
for (const chunk of chunks) {
  buffer.set(chunk, offset);
  offset += chunk.length;
}
const { request, context } = JSON.parse(new TextDecoder().decode(buffer));

const format = (v) => (typeof v === "string" ? v : JSON.stringify(v));
const writeLog = (level) => (...args) => {
  Deno.stderr.writeSync(encoder.encode(`[${level}] ${args.map(format).join(" ")}\n`));
};
console.log = writeLog("LOG");
console.info = writeLog("LOG");
console.warn = writeLog("WARN");
console.error = writeLog("ERROR");

const headers = new Headers();
for (const [key, value] of request.headers ?? []) headers.append(key, value);
const body = request.body ?? null;
const req = {
  method: request.method,
  url: `http://localhost${request.path}`,
  headers,
  text: async () => body ?? "",
  json: async () => JSON.parse(body ?? "null"),
};

const callBackend = async (path, options = {}) => {
  const merged = new Headers(options.headers ?? {});
  if (!merged.has("x-api-key")) merged.set("x-api-key", context.apiKey);
  if (!merged.has("Content-Type")) merged.set("Content-Type", "application/json");
  if (context.executionId && !merged.has("x-execution-id")) {
    merged.set("x-execution-id", context.executionId);
  }
  if (context.deliveryId && !merged.has("x-delivery-id")) {
    merged.set("x-delivery-id", context.deliveryId);
  }
  return await fetch(`${context.backendUrl}${path}`, { ...options, headers: merged });
};

const ctx = { env: context.env ?? {}, callBackend };

try {
  const value = await mod.default(req, ctx);
  let output;
  if (value instanceof Response) {
    const text = await value.text();
    let parsed;
    try {
      parsed = JSON.parse(text);
    } catch {
      parsed = text;
    }
    output = {
      kind: "response",
      status: value.status,
      headers: Object.fromEntries(value.headers.entries()),
      body: parsed,
    };
  } else {
    output = { kind: "value", value: value === undefined ? null : value };
  }
  emit({ ok: true, output });
} catch (err) {
  emit({ ok: false, error: String(err && err.stack ? err.stack : err) });
}
"#;

/// Write the shim module into the cache directory, returning its path.
pub fn materialize_shim(cache_dir: &Path) -> Result<PathBuf> {
    let path = cache_dir.join("quiver-shim.mjs");
    std::fs::create_dir_all(cache_dir)?;
    std::fs::write(&path, HANDLER_SHIM)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_headers_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.insert("X-Trigger-Type", "http");
        assert_eq!(headers.get("x-trigger-type"), Some("http"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn test_log_buffer_prefixes_and_absorbs() {
        let logs = LogBuffer::new();
        logs.log("hello");
        logs.warn("careful");
        logs.error("boom");
        logs.absorb("[WARN] from handler".to_string());
        logs.absorb("bare line".to_string());

        assert_eq!(
            logs.snapshot(),
            vec![
                "[LOG] hello",
                "[WARN] careful",
                "[ERROR] boom",
                "[WARN] from handler",
                "[LOG] bare line",
            ]
        );
    }

    #[test]
    fn test_result_envelope_response_roundtrip() {
        let envelope: ResultEnvelope = serde_json::from_value(json!({
            "ok": true,
            "output": {"kind": "response", "status": 201, "body": {"id": 7}},
        }))
        .unwrap();
        assert!(envelope.ok);
        match envelope.output.unwrap() {
            HandlerOutput::Response { status, body, .. } => {
                assert_eq!(status, 201);
                assert_eq!(body, json!({"id": 7}));
            }
            other => panic!("expected response output, got {other:?}"),
        }
    }

    #[test]
    fn test_result_value_for_both_shapes() {
        let response = HandlerOutput::Response {
            status: 200,
            headers: HashMap::new(),
            body: json!({"ok": true}),
        };
        assert_eq!(response.result_value(), &json!({"ok": true}));

        let value = HandlerOutput::value(json!([1, 2, 3]));
        assert_eq!(value.result_value(), &json!([1, 2, 3]));
    }

    #[test]
    fn test_synthetic_request_carries_trigger_header() {
        let request = FunctionRequest::synthetic("/seed", "once").with_json_body(&json!({"a": 1}));
        assert_eq!(request.method, "POST");
        assert_eq!(request.headers.get("X-Trigger-Type"), Some("once"));
        assert_eq!(request.json(), Some(json!({"a": 1})));
    }
}
