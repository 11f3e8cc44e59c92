//! Config hot-reload watcher.
//!
//! Watches the orchestrator TOML file for modifications and invokes a
//! callback with the freshly parsed and validated [`OrchestratorConfig`]
//! after a debounce window.

use crate::config::OrchestratorConfig;
use conductor_core::{ConductorError, ConductorResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;

/// Watches a config file on disk and calls back on every (debounced) change.
///
/// Dropping the watcher releases the file-system watch, which in turn ends
/// the background thread.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// `on_reload` runs on a background thread each time the file is modified
    /// and successfully parsed. Parse or validation errors are logged and do
    /// not invoke the callback, so the running configuration stays in force.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> ConductorResult<Self>
    where
        F: Fn(OrchestratorConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        let _ = tx.send(());
                    }
                }
            })
            .map_err(|e| ConductorError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| ConductorError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // Editors write in bursts; settle, then reload once.
                std::thread::sleep(debounce);
                while rx.try_recv().is_ok() {}

                match OrchestratorConfig::load(&path) {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "Configuration reloaded");
                        on_reload(config);
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }

            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}
