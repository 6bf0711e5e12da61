//! Function loader: turns handler files on disk into registry records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{QuiverError, Result};
use crate::function::{FunctionRecord, FunctionStatus};
use crate::handler::ProcessHandler;
use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct Loader {
    functions_dir: PathBuf,
    handler_runtime: String,
    shim_path: PathBuf,
}

impl Loader {
    pub fn new(config: &Config, shim_path: PathBuf) -> Self {
        Self {
            functions_dir: config.functions_dir.clone(),
            handler_runtime: config.handler_runtime.clone(),
            shim_path,
        }
    }

    pub fn functions_dir(&self) -> &Path {
        &self.functions_dir
    }

    /// Load every handler file in the working directory. Files that fail to
    /// load are skipped; the rest of the scan continues.
    pub async fn load_all(&self, registry: &Registry) -> Vec<FunctionRecord> {
        let mut entries = match tokio::fs::read_dir(&self.functions_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Cannot read functions directory {}: {}",
                    self.functions_dir.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut paths = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if is_handler_file(&path) {
                paths.push(path);
            }
        }
        // Directory order is filesystem-dependent; keep loads deterministic.
        paths.sort();

        let mut records = Vec::new();
        for path in paths {
            match self.load_one(&path, registry).await {
                Ok(record) => {
                    info!(
                        "Loaded function '{}' ({} trigger(s))",
                        record.name,
                        record.triggers.len()
                    );
                    records.push(record);
                }
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                }
            }
        }
        records
    }

    /// Load a single handler file: metadata via describe mode, env sidecar,
    /// status seeded from the completed-run-once set.
    pub async fn load_one(&self, path: &Path, registry: &Registry) -> Result<FunctionRecord> {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| QuiverError::Load(format!("unusable file name: {}", path.display())))?
            .to_string();

        let source_path = path
            .canonicalize()
            .map_err(|e| QuiverError::Load(format!("cannot resolve {}: {e}", path.display())))?;

        let metadata =
            ProcessHandler::describe(&self.handler_runtime, &self.shim_path, &source_path).await?;
        if !metadata.has_default {
            return Err(QuiverError::Load(format!(
                "{} does not export a default handler",
                path.display()
            )));
        }

        let has_completed = registry.is_completed(&name);
        Ok(FunctionRecord {
            description: metadata.description.clone(),
            triggers: metadata.parsed_triggers(&name),
            handler: Arc::new(ProcessHandler::new(
                self.handler_runtime.clone(),
                self.shim_path.clone(),
                source_path.clone(),
            )),
            source_path,
            env_vars: read_env_sidecar(path),
            run_once: metadata.run_once,
            status: std::sync::RwLock::new(FunctionStatus {
                has_completed,
                ..FunctionStatus::default()
            }),
            name,
        })
    }
}

/// Whether a directory entry is a handler source file. Hidden files, temp
/// files, and non-TypeScript entries are ignored.
pub fn is_handler_file(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if file_name.starts_with('.') || file_name.ends_with(".tmp") {
        return false;
    }
    path.extension().and_then(|e| e.to_str()) == Some("ts")
}

/// Path of a handler's optional env sidecar (`<name>.env.json`).
pub fn env_sidecar_path(handler_path: &Path) -> PathBuf {
    let stem = handler_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    handler_path.with_file_name(format!("{stem}.env.json"))
}

/// Read a handler's env map. Absence is not an error; invalid JSON leaves the
/// env empty.
pub fn read_env_sidecar(handler_path: &Path) -> HashMap<String, String> {
    let sidecar = env_sidecar_path(handler_path);
    let Ok(contents) = std::fs::read_to_string(&sidecar) else {
        return HashMap::new();
    };
    match serde_json::from_str(&contents) {
        Ok(env) => env,
        Err(e) => {
            warn!("Ignoring invalid env file {}: {}", sidecar.display(), e);
            HashMap::new()
        }
    }
}
