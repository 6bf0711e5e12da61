//! Filesystem watcher for the functions directory.
//!
//! File change bursts (editor saves, deploys writing source plus env sidecar)
//! are debounced for one second and collapse into a single reload request.

use std::path::Path;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::error::{QuiverError, Result};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

/// Start watching the functions directory. Relevant changes send one unit on
/// `reload_tx`. The returned debouncer must be kept alive for the watch to
/// stay active.
pub fn watch_functions_dir(
    dir: &Path,
    reload_tx: mpsc::UnboundedSender<()>,
) -> Result<Debouncer<RecommendedWatcher, RecommendedCache>> {
    let mut debouncer = new_debouncer(
        DEBOUNCE_WINDOW,
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                let relevant = events
                    .iter()
                    .any(|event| event.paths.iter().any(|path| is_relevant_path(path)));
                if relevant {
                    let _ = reload_tx.send(());
                }
            }
            Err(errors) => {
                for e in errors {
                    error!("File watch error: {:?}", e);
                }
            }
        },
    )
    .map_err(|e| QuiverError::Config(format!("failed to create file watcher: {e}")))?;

    debouncer
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| {
            QuiverError::Config(format!("failed to watch {}: {e}", dir.display()))
        })?;

    info!("Watching {} for handler changes", dir.display());
    Ok(debouncer)
}

/// Only handler sources and env sidecars trigger a rescan.
fn is_relevant_path(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if file_name.starts_with('.') {
        return false;
    }
    file_name.ends_with(".ts") || file_name.ends_with(".env.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relevant_paths() {
        assert!(is_relevant_path(Path::new("/fns/hello.ts")));
        assert!(is_relevant_path(Path::new("/fns/hello.env.json")));
        assert!(!is_relevant_path(Path::new("/fns/.hello.ts.swp")));
        assert!(!is_relevant_path(Path::new("/fns/readme.md")));
    }
}
