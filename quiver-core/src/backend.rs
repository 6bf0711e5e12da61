//! Thin client for the control plane ("the Backend").

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::handler::ExecutionIds;

/// HTTP client bound to `BACKEND_URL` and `API_KEY`. A clone can additionally
/// carry the execution/delivery ids of one invocation, which are then
/// forwarded on every call.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    execution_id: Option<String>,
    delivery_id: Option<String>,
}

/// Execution record posted after every invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    pub function_name: String,
    pub success: bool,
    pub result: Value,
    pub logs: Vec<String>,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl BackendClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            execution_id: None,
            delivery_id: None,
        }
    }

    /// Clone of this client that forwards the given invocation ids.
    pub fn bind(&self, ids: &ExecutionIds) -> Self {
        let mut bound = self.clone();
        bound.execution_id = Some(ids.execution_id.clone());
        bound.delivery_id = ids.delivery_id.clone();
        bound
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn default_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.api_key) {
            headers.insert("x-api-key", value);
        }
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        if let Some(id) = self.execution_id.as_deref()
            && let Ok(value) = HeaderValue::from_str(id)
        {
            headers.insert("x-execution-id", value);
        }
        if let Some(id) = self.delivery_id.as_deref()
            && let Ok(value) = HeaderValue::from_str(id)
        {
            headers.insert("x-delivery-id", value);
        }
        headers
    }

    /// Issue a call against the Backend. The helper handlers receive as
    /// `callBackend` resolves to this.
    pub async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method, self.url(path))
            .headers(self.default_headers());
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Post one execution record. Best-effort: failures are logged and
    /// dropped, never retried.
    pub async fn report_execution_result(&self, report: &ExecutionReport) {
        let path = format!(
            "/api/v1/functions/{}/execution-result",
            report.function_name
        );
        let result = self
            .http
            .post(self.url(&path))
            .headers(self.default_headers())
            .json(report)
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    "Backend rejected execution result for '{}': {}",
                    report.function_name,
                    response.status()
                );
            }
            Err(e) => {
                warn!(
                    "Failed to report execution result for '{}': {}",
                    report.function_name, e
                );
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join_handles_slashes() {
        let client = BackendClient::new("http://backend:8000/", "secret");
        assert_eq!(client.base_url(), "http://backend:8000");
        assert_eq!(client.url("/api/v1/ping"), "http://backend:8000/api/v1/ping");
        assert_eq!(client.url("api/v1/ping"), "http://backend:8000/api/v1/ping");
    }

    #[test]
    fn test_bound_client_forwards_ids() {
        let client = BackendClient::new("http://backend:8000", "secret");
        let ids = ExecutionIds::supplied("exec-1".into(), "del-1".into());
        let bound = client.bind(&ids);
        let headers = bound.default_headers();
        assert_eq!(headers.get("x-api-key").unwrap(), "secret");
        assert_eq!(headers.get("x-execution-id").unwrap(), "exec-1");
        assert_eq!(headers.get("x-delivery-id").unwrap(), "del-1");

        let unbound_headers = client.default_headers();
        assert!(unbound_headers.get("x-execution-id").is_none());
    }

    #[test]
    fn test_report_serialization_skips_missing_delivery_id() {
        let report = ExecutionReport {
            execution_id: "exec".into(),
            delivery_id: None,
            function_name: "hello".into(),
            success: true,
            result: serde_json::json!({"ok": true}),
            logs: vec!["[LOG] hi".into()],
            execution_time_ms: 12,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&report).unwrap();
        assert!(value.get("delivery_id").is_none());
        assert_eq!(value["function_name"], "hello");
    }
}
