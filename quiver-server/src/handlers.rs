//! Endpoint bodies for the runtime's HTTP surface.

use std::collections::HashMap;

use axum::{
    Json,
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use quiver_core::harness::TIMEOUT_MESSAGE;
use quiver_core::loader::env_sidecar_path;
use quiver_core::{ExecutionIds, FunctionRequest, HandlerOutput};

use crate::AppState;
use crate::error::{AppError, AppResult};

// Request body limit for function invocations (2 MiB).
const BODY_LIMIT: usize = 2 * 1024 * 1024;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let runtime = &state.runtime;
    let (database, channels) = match &runtime.bridge {
        Some(bridge) => (bridge.is_connected(), bridge.channels()),
        None => (false, Vec::new()),
    };
    Json(json!({
        "status": "ok",
        "functions": runtime.registry.len(),
        "database": database,
        "channels": channels,
    }))
}

/// GET /functions
pub async fn list_functions(State(state): State<AppState>) -> Json<Value> {
    let functions: Vec<_> = state
        .runtime
        .registry
        .snapshot()
        .iter()
        .map(|record| record.info())
        .collect();
    Json(json!({ "functions": functions }))
}

/// GET /function-status/{name}
pub async fn function_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    let record = state
        .runtime
        .registry
        .get(&name)
        .ok_or_else(|| AppError::not_found(format!("Function '{name}' not found")))?;
    Ok(Json(json!({
        "name": record.name,
        "status": record.status_snapshot(),
    })))
}

/// ANY /reload
pub async fn reload(State(state): State<AppState>) -> Json<Value> {
    let count = state.runtime.scan_and_reload().await;
    Json(json!({ "success": true, "functions": count }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub function_name: Option<String>,
    pub code: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

/// POST /deploy
pub async fn deploy(
    State(state): State<AppState>,
    Json(request): Json<DeployRequest>,
) -> AppResult<Json<Value>> {
    let (Some(name), Some(code)) = (request.function_name, request.code) else {
        return Err(AppError::bad_request("functionName and code are required"));
    };
    if !is_safe_function_name(&name) {
        return Err(AppError::bad_request(format!(
            "Invalid function name '{name}'"
        )));
    }

    let source_path = state.runtime.config.functions_dir.join(format!("{name}.ts"));
    tokio::fs::write(&source_path, code)
        .await
        .map_err(|e| AppError::internal(format!("Failed to write handler file: {e}")))?;

    if let Some(env) = request.env {
        let contents = serde_json::to_string_pretty(&env)
            .map_err(|e| AppError::internal(format!("Failed to encode env file: {e}")))?;
        tokio::fs::write(env_sidecar_path(&source_path), contents)
            .await
            .map_err(|e| AppError::internal(format!("Failed to write env file: {e}")))?;
    }

    info!("Deployed function '{}'", name);
    let count = state.runtime.scan_and_reload().await;
    Ok(Json(json!({
        "success": true,
        "function": name,
        "functions": count,
    })))
}

/// DELETE /deploy/{name}
pub async fn undeploy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    if !is_safe_function_name(&name) {
        return Err(AppError::bad_request(format!(
            "Invalid function name '{name}'"
        )));
    }

    let source_path = state.runtime.config.functions_dir.join(format!("{name}.ts"));
    remove_ignoring_missing(&source_path).await?;
    remove_ignoring_missing(&env_sidecar_path(&source_path)).await?;

    info!("Undeployed function '{}'", name);
    let count = state.runtime.scan_and_reload().await;
    Ok(Json(json!({
        "success": true,
        "function": name,
        "functions": count,
    })))
}

async fn remove_ignoring_missing(path: &std::path::Path) -> AppResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AppError::internal(format!(
            "Failed to remove {}: {e}",
            path.display()
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct EmitEventRequest {
    pub event: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// POST /emit-event
pub async fn emit_event(
    State(state): State<AppState>,
    Json(request): Json<EmitEventRequest>,
) -> AppResult<Json<Value>> {
    let Some(event) = request.event else {
        return Err(AppError::bad_request("event is required"));
    };
    let data = request.data.unwrap_or(Value::Null);

    let (has_listeners, listeners) = state.runtime.emit_event(&event, data).await;
    Ok(Json(json!({
        "success": true,
        "event": event,
        "hasListeners": has_listeners,
        "listeners": listeners,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DbNotifyRequest {
    pub channel: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// POST /db-notify
pub async fn db_notify(
    State(state): State<AppState>,
    Json(request): Json<DbNotifyRequest>,
) -> AppResult<Json<Value>> {
    let Some(channel) = request.channel else {
        return Err(AppError::bad_request("channel is required"));
    };
    let Some(bridge) = &state.runtime.bridge else {
        return Err(AppError::service_unavailable(
            "Database bridge is not configured",
        ));
    };

    let payload = request
        .payload
        .map(|value| value.to_string())
        .unwrap_or_default();
    bridge
        .notify(&channel, &payload)
        .await
        .map_err(|e| AppError::internal(format!("NOTIFY failed: {e}")))?;

    Ok(Json(json!({ "success": true, "channel": channel })))
}

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub env_vars: Option<HashMap<String, String>>,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub delivery_id: Option<String>,
}

/// POST /webhook/{name} — acknowledge immediately, execute in the background.
pub async fn webhook(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<WebhookRequest>,
) -> AppResult<impl IntoResponse> {
    let record = state
        .runtime
        .registry
        .get(&name)
        .ok_or_else(|| AppError::not_found(format!("Function '{name}' not found")))?;

    let execution_id = request
        .execution_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let delivery_id = request
        .delivery_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let ids = ExecutionIds::supplied(execution_id.clone(), delivery_id.clone());

    let payload = request.payload.unwrap_or(Value::Null);
    let runtime = state.runtime.clone();
    tokio::spawn(async move {
        let fn_request =
            FunctionRequest::synthetic(format!("/webhook/{}", record.name), "webhook")
                .with_json_body(&payload);
        runtime
            .execute(&record, fn_request, ids, request.env_vars)
            .await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "execution_id": execution_id,
            "delivery_id": delivery_id,
        })),
    ))
}

/// ANY /{name} — invoke a function as an HTTP trigger.
pub async fn invoke(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> AppResult<Response> {
    invoke_function(state, name, request).await
}

/// ANY /{name}/{*rest} — function lookup uses the first path segment.
pub async fn invoke_subpath(
    State(state): State<AppState>,
    Path((name, _rest)): Path<(String, String)>,
    request: Request,
) -> AppResult<Response> {
    invoke_function(state, name, request).await
}

async fn invoke_function(
    state: AppState,
    name: String,
    request: Request,
) -> AppResult<Response> {
    let record = state
        .runtime
        .registry
        .get(&name)
        .ok_or_else(|| AppError::not_found(format!("Function '{name}' not found")))?;

    if !record.has_http_trigger() {
        return Err(AppError::bad_request(format!(
            "Function '{name}' does not have an HTTP trigger"
        )));
    }

    let method = request.method().as_str().to_uppercase();
    if !record.http_methods().contains(&method) {
        return Err(AppError::method_not_allowed(format!(
            "Method '{method}' not allowed for function '{name}'"
        )));
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, BODY_LIMIT)
        .await
        .map_err(|e| AppError::bad_request(format!("Failed to read request body: {e}")))?;

    let ids = ExecutionIds::fresh();
    let mut fn_request = FunctionRequest {
        method,
        path: parts.uri.path().to_string(),
        headers: quiver_core::handler::Headers::new(),
        body: if bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&bytes).into_owned())
        },
    };
    for (key, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            fn_request.headers.insert(key.as_str(), value);
        }
    }
    // Only the HTTP path stamps the ids into the request headers.
    fn_request
        .headers
        .insert("x-execution-id", ids.execution_id.clone());
    if let Some(delivery_id) = &ids.delivery_id {
        fn_request.headers.insert("x-delivery-id", delivery_id.clone());
    }

    let outcome = state.runtime.execute(&record, fn_request, ids, None).await;

    if outcome.timed_out {
        return Err(AppError::gateway_timeout(TIMEOUT_MESSAGE));
    }
    if !outcome.success {
        return Err(AppError::internal("Function execution failed")
            .with_message(outcome.error.unwrap_or_default()));
    }

    match outcome.output {
        Some(HandlerOutput::Response {
            status,
            headers,
            body,
        }) => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body_bytes = match &body {
                Value::String(text) => text.clone().into_bytes(),
                value => serde_json::to_vec(value).unwrap_or_default(),
            };
            let mut response = Response::builder()
                .status(status)
                .body(Body::from(body_bytes))
                .map_err(|e| AppError::internal(format!("Invalid handler response: {e}")))?;

            let mut has_content_type = false;
            for (key, value) in &headers {
                let Ok(header_name) = key.parse::<HeaderName>() else {
                    continue;
                };
                let Ok(header_value) = HeaderValue::from_str(value) else {
                    continue;
                };
                if header_name == header::CONTENT_TYPE {
                    has_content_type = true;
                }
                response.headers_mut().insert(header_name, header_value);
            }
            if !has_content_type {
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
            Ok(response)
        }
        Some(HandlerOutput::Value { value }) => Ok(Json(value).into_response()),
        None => Ok(Json(Value::Null).into_response()),
    }
}

/// Deployed names become file stems; keep them path-safe.
fn is_safe_function_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
