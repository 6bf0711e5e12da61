//! Execution harness: runs one handler invocation under the configured
//! timeout, captures logs, updates function status, and reports the result to
//! the Backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{debug, error};

use crate::backend::{BackendClient, ExecutionReport};
use crate::function::FunctionRecord;
use crate::handler::{ExecutionIds, FunctionContext, FunctionRequest, HandlerOutput, LogBuffer};
use crate::registry::Registry;

pub const TIMEOUT_MESSAGE: &str = "Function execution timed out";

/// Outcome of a single invocation, consumed by whichever trigger path asked
/// for it.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: Option<HandlerOutput>,
    pub error: Option<String>,
    pub timed_out: bool,
    pub logs: Vec<String>,
    pub duration_ms: u64,
    pub ids: ExecutionIds,
}

#[derive(Debug, Clone)]
pub struct Harness {
    registry: Arc<Registry>,
    backend: BackendClient,
    timeout: Duration,
}

impl Harness {
    pub fn new(registry: Arc<Registry>, backend: BackendClient, timeout: Duration) -> Self {
        Self {
            registry,
            backend,
            timeout,
        }
    }

    /// Invoke `record` with the given request. `env_override` replaces the
    /// function's default env map for this call only (webhook deliveries).
    pub async fn execute(
        &self,
        record: &Arc<FunctionRecord>,
        request: FunctionRequest,
        ids: ExecutionIds,
        env_override: Option<HashMap<String, String>>,
    ) -> ExecutionOutcome {
        let started_at = Utc::now();
        let started = tokio::time::Instant::now();
        let logs = LogBuffer::new();
        let context = FunctionContext {
            env: env_override.unwrap_or_else(|| record.env_vars.clone()),
            ids: ids.clone(),
            logs: logs.clone(),
            backend: self.backend.bind(&ids),
        };

        debug!(
            "Executing function '{}' ({} {})",
            record.name, request.method, request.path
        );

        let raced = timeout(self.timeout, record.handler.call(&request, &context)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (success, output, error_text, timed_out) = match raced {
            Ok(Ok(output)) => (true, Some(output), None, false),
            Ok(Err(e)) => {
                let message = e.to_string();
                logs.error(&message);
                (false, None, Some(message), false)
            }
            Err(_) => {
                logs.error(TIMEOUT_MESSAGE);
                (false, None, Some(TIMEOUT_MESSAGE.to_string()), true)
            }
        };

        let result_value = output
            .as_ref()
            .map(|o| o.result_value().clone())
            .unwrap_or(Value::Null);

        self.registry.update_status(&record.name, |status| {
            status.last_run_at = Some(started_at);
            status.run_count += 1;
            if success {
                status.last_result = Some(result_value.clone());
                status.last_error = None;
            } else {
                status.last_error = error_text.clone();
            }
        });

        // A run-once function completes only when it returns a mapping with
        // `success == true`; any other shape leaves it eligible to run again.
        if success && record.run_once && result_value.get("success") == Some(&Value::Bool(true)) {
            self.registry.update_status(&record.name, |status| {
                status.has_completed = true;
            });
            self.registry.mark_completed(&record.name);
        }

        if let Some(message) = &error_text {
            error!("Function '{}' failed: {}", record.name, message);
        }

        let outcome = ExecutionOutcome {
            success,
            output,
            error: error_text,
            timed_out,
            logs: logs.snapshot(),
            duration_ms,
            ids,
        };

        let report = ExecutionReport {
            execution_id: outcome.ids.execution_id.clone(),
            delivery_id: outcome.ids.delivery_id.clone(),
            function_name: record.name.clone(),
            success: outcome.success,
            result: if outcome.success {
                result_value
            } else {
                json!({"error": outcome.error.clone()})
            },
            logs: outcome.logs.clone(),
            execution_time_ms: outcome.duration_ms,
            timestamp: started_at,
        };
        self.backend.report_execution_result(&report).await;

        outcome
    }
}
