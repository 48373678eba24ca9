use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::Watcher as _;
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use tokio::sync::mpsc;

/// Keeps the configuration file watch alive. Independent of the WatchSet,
/// so rebuilding the mirrored roots never touches it.
pub struct ConfigWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

/// Watch `config_path` and send a unit signal whenever it changes.
///
/// The parent directory is watched rather than the file, because editors
/// commonly save by writing a new file and renaming it over the old one.
pub fn watch_config_file(
    config_path: &Path,
    debounce: Duration,
) -> Result<(mpsc::UnboundedReceiver<()>, ConfigWatcher)> {
    let config_path = std::path::absolute(config_path)
        .with_context(|| format!("Cannot resolve {}", config_path.display()))?;
    let file_name: OsString = config_path
        .file_name()
        .with_context(|| format!("Config path has no file name: {}", config_path.display()))?
        .to_os_string();
    let dir = config_path
        .parent()
        .with_context(|| format!("Config path has no parent: {}", config_path.display()))?
        .to_path_buf();

    let (tx, rx) = mpsc::unbounded_channel();
    let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                if events
                    .iter()
                    .any(|e| e.path.file_name() == Some(file_name.as_os_str()))
                {
                    let _ = tx.send(());
                }
            }
            Err(e) => tracing::error!(error = %e, "config watcher error"),
        }
    })
    .context("Failed to create config file watcher")?;

    debouncer
        .watcher()
        .watch(&dir, notify::RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    tracing::debug!(path = %config_path.display(), "watching config file");

    Ok((
        rx,
        ConfigWatcher {
            _debouncer: debouncer,
        },
    ))
}
