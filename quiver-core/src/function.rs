//! Function records, trigger descriptors, and per-function status.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::handler::Handler;

fn default_http_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "PATCH"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

/// Declarative description of when a function becomes eligible to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    Http {
        #[serde(default = "default_http_methods", alias = "method")]
        methods: Vec<String>,
    },
    Schedule {
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Database {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operations: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    Event {
        event: String,
    },
    Once {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    Webhook {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
}

impl Trigger {
    /// Notification channel for a database trigger, defaulting to
    /// `<table>_changes`.
    pub fn database_channel(&self) -> Option<String> {
        match self {
            Trigger::Database { table, channel, .. } => Some(
                channel
                    .clone()
                    .unwrap_or_else(|| format!("{table}_changes")),
            ),
            _ => None,
        }
    }
}

/// Metadata a handler file exports, as reported by describe mode.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub triggers: Vec<Value>,
    #[serde(default)]
    pub run_once: bool,
    #[serde(default)]
    pub has_default: bool,
}

impl FunctionMetadata {
    /// Parse the raw trigger list, skipping entries the runtime does not
    /// understand.
    pub fn parsed_triggers(&self, function: &str) -> Vec<Trigger> {
        self.triggers
            .iter()
            .filter_map(|raw| match serde_json::from_value(raw.clone()) {
                Ok(trigger) => Some(trigger),
                Err(e) => {
                    warn!("Skipping unrecognized trigger on '{}': {}", function, e);
                    None
                }
            })
            .collect()
    }
}

/// Mutable execution bookkeeping for a registered function.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FunctionStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub has_completed: bool,
    pub last_result: Option<Value>,
    pub last_error: Option<String>,
}

/// One registered handler and everything needed to invoke it.
pub struct FunctionRecord {
    pub name: String,
    pub description: String,
    pub triggers: Vec<Trigger>,
    pub handler: Arc<dyn Handler>,
    pub source_path: PathBuf,
    pub env_vars: HashMap<String, String>,
    pub run_once: bool,
    pub status: std::sync::RwLock<FunctionStatus>,
}

impl std::fmt::Debug for FunctionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRecord")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("source_path", &self.source_path)
            .field("run_once", &self.run_once)
            .finish()
    }
}

impl FunctionRecord {
    /// All HTTP methods this function accepts, uppercased; empty when the
    /// function declares no HTTP trigger.
    pub fn http_methods(&self) -> Vec<String> {
        let mut methods = Vec::new();
        for trigger in &self.triggers {
            if let Trigger::Http { methods: declared } = trigger {
                for m in declared {
                    let m = m.to_uppercase();
                    if !methods.contains(&m) {
                        methods.push(m);
                    }
                }
            }
        }
        methods
    }

    pub fn has_http_trigger(&self) -> bool {
        self.triggers
            .iter()
            .any(|t| matches!(t, Trigger::Http { .. }))
    }

    pub fn status_snapshot(&self) -> FunctionStatus {
        self.status.read().expect("status lock poisoned").clone()
    }

    /// Serializable view for the `/functions` listing.
    pub fn info(&self) -> FunctionInfo {
        FunctionInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            triggers: self.triggers.clone(),
            run_once: self.run_once,
            source_path: self.source_path.display().to_string(),
            status: self.status_snapshot(),
        }
    }
}

/// Registry listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    pub description: String,
    pub triggers: Vec<Trigger>,
    pub run_once: bool,
    pub source_path: String,
    pub status: FunctionStatus,
}
