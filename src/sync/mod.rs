pub mod aggregator;
pub mod config_watcher;
pub mod mirror;
pub mod watch_set;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::config::{self, EntryError, MirrorRoot, SyncConfiguration};
use crate::util::path as sync_path;

use aggregator::{ChangeAggregator, ChangeKind, ChangeReport};
use watch_set::WatchSet;
use watcher::{EventSink, FsEvent, NotifyBackend, WatchBackend, WatchMessage};

const CONFIG_DEBOUNCE: Duration = Duration::from_millis(200);

/// The result of one successful mirror action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorOutcome {
    pub kind: ChangeKind,
    pub target: PathBuf,
}

/// Translate one event to its target path and perform the side effect.
///
/// Returns `None` when there was nothing to do (source vanished before the
/// copy, target already absent on delete).
pub async fn dispatch(root: &MirrorRoot, event: &FsEvent) -> Result<Option<MirrorOutcome>> {
    let target = sync_path::resolve_target_path(&root.source, &root.target, &event.path)?;

    let done = match event.kind {
        ChangeKind::Added | ChangeKind::Changed => mirror::replicate(&event.path, &target).await?,
        ChangeKind::Removed if event.path == root.source => {
            tracing::warn!(
                root = %root.source.display(),
                "source root was removed; keeping its mirror"
            );
            false
        }
        ChangeKind::Removed => mirror::remove(&root.target, &target).await?,
    };

    tracing::debug!(
        kind = ?event.kind,
        source = %event.path.display(),
        target = %target.display(),
        done,
        "mirror action"
    );
    Ok(done.then_some(MirrorOutcome {
        kind: event.kind,
        target,
    }))
}

/// Owns the current configuration and watch set and drives everything.
pub struct SyncService<B> {
    config_path: PathBuf,
    config: Arc<SyncConfiguration>,
    watch_set: WatchSet<B>,
    aggregator: ChangeAggregator,
}

impl SyncService<NotifyBackend> {
    /// Startup: the config file must exist and load cleanly.
    pub fn load(config_path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<WatchMessage>)> {
        if !config_path.is_file() {
            anyhow::bail!(
                "Config file not found: {}\n\
                 See config/treemirror.example.toml for an example.",
                config_path.display()
            );
        }
        let loaded = config::load_config(config_path)?;
        report_skipped(&loaded.skipped);
        Ok(Self::new(config_path, loaded.config, NotifyBackend))
    }
}

impl<B: WatchBackend> SyncService<B> {
    pub fn new(
        config_path: &Path,
        config: SyncConfiguration,
        backend: B,
    ) -> (Self, mpsc::UnboundedReceiver<WatchMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            config_path: config_path.to_path_buf(),
            aggregator: ChangeAggregator::new(config.report_window),
            config: Arc::new(config),
            watch_set: WatchSet::new(backend, tx),
        };
        (service, rx)
    }

    #[cfg(test)]
    pub fn config(&self) -> &SyncConfiguration {
        &self.config
    }

    #[cfg(test)]
    pub fn watch_set(&self) -> &WatchSet<B> {
        &self.watch_set
    }

    #[cfg(test)]
    pub fn aggregator(&self) -> &ChangeAggregator {
        &self.aggregator
    }

    /// Open a watch for every root; existing files surface as Added events.
    pub async fn initial_sync(&mut self) {
        tracing::info!(roots = self.config.roots.len(), "building watch set");
        self.watch_set.rebuild(&self.config).await;
        tracing::info!(
            watching = self.watch_set.len(),
            "watch set built, initial scans queued"
        );
    }

    /// Re-read the config file. An invalid file leaves everything as is.
    pub async fn reload(&mut self) {
        tracing::info!(path = %self.config_path.display(), "config file changed, reloading");

        let loaded = match config::load_config(&self.config_path) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(
                    error = %format!("{e:#}"),
                    "config reload failed; keeping previous configuration"
                );
                return;
            }
        };
        report_skipped(&loaded.skipped);

        self.aggregator.set_window(loaded.config.report_window);
        self.config = Arc::new(loaded.config);
        self.watch_set.rebuild(&self.config).await;
        tracing::info!(watching = self.watch_set.len(), "config reloaded");
    }

    pub async fn handle_message(&mut self, msg: WatchMessage) {
        match msg {
            WatchMessage::Event {
                generation,
                root,
                event,
            } => {
                if generation != self.watch_set.generation() {
                    tracing::trace!(path = %event.path.display(), "dropping stale event");
                    return;
                }
                let config = Arc::clone(&self.config);
                let Some(root) = config.root_for(&root) else {
                    return;
                };

                match dispatch(root, &event).await {
                    Ok(Some(outcome)) => {
                        self.aggregator
                            .record(outcome.kind, outcome.target, Instant::now());
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!(
                        path = %event.path.display(),
                        error = %format!("{e:#}"),
                        "mirror action failed"
                    ),
                }
            }
            WatchMessage::RootAppeared { generation, root } => {
                if generation != self.watch_set.generation() {
                    return;
                }
                let config = Arc::clone(&self.config);
                if let Some(root) = config.root_for(&root) {
                    tracing::info!(root = %root.source.display(), "source root appeared");
                    self.watch_set.reopen(root, &config).await;
                }
            }
        }
    }

    /// Emit the pending report if its quiet period has passed.
    pub fn flush_due(&mut self, now: Instant) -> Option<ChangeReport> {
        let report = self.aggregator.flush_due(now)?;
        log_report(&report);
        Some(report)
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(mut self, mut watch_rx: mpsc::UnboundedReceiver<WatchMessage>) -> Result<()> {
        self.initial_sync().await;

        let (mut reload_rx, _config_watcher) =
            config_watcher::watch_config_file(&self.config_path, CONFIG_DEBOUNCE)?;

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;

        loop {
            let flush_at = self.aggregator.deadline();
            let flush_sleep = tokio::time::sleep_until(
                flush_at
                    .map(tokio::time::Instant::from_std)
                    .unwrap_or_else(tokio::time::Instant::now),
            );

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }

                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }

                Some(msg) = watch_rx.recv() => {
                    self.handle_message(msg).await;
                }

                Some(()) = reload_rx.recv() => {
                    self.reload().await;
                }

                _ = flush_sleep, if flush_at.is_some() => {
                    self.flush_due(Instant::now());
                }
            }
        }

        self.watch_set.close_all().await;
        if let Some(report) = self.aggregator.flush() {
            log_report(&report);
        }
        tracing::info!("treemirror stopped");
        Ok(())
    }
}

/// One-shot pass over every root without watching.
pub async fn sync_once(config: &SyncConfiguration) -> Option<ChangeReport> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    for root in &config.roots {
        if !root.source.is_dir() {
            tracing::warn!(root = %root.source.display(), "source root does not exist, skipping");
            continue;
        }
        let sink = EventSink::new(0, root.clone(), config.ignore.clone(), tx.clone());
        let dir = root.source.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || sink.scan(&dir)).await {
            tracing::error!(root = %root.source.display(), error = %e, "scan failed");
        }
    }
    drop(tx);

    let mut aggregator = ChangeAggregator::new(config.report_window);
    while let Some(msg) = rx.recv().await {
        let WatchMessage::Event { root, event, .. } = msg else {
            continue;
        };
        let Some(root) = config.root_for(&root) else {
            continue;
        };
        match dispatch(root, &event).await {
            Ok(Some(outcome)) => aggregator.record(outcome.kind, outcome.target, Instant::now()),
            Ok(None) => {}
            Err(e) => tracing::error!(
                path = %event.path.display(),
                error = %format!("{e:#}"),
                "mirror action failed"
            ),
        }
    }
    aggregator.flush()
}

pub fn report_skipped(skipped: &[EntryError]) {
    for e in skipped {
        tracing::error!(error = %e, "skipping mapping entry");
    }
}

fn log_report(report: &ChangeReport) {
    tracing::info!(
        added = report.added,
        changed = report.changed,
        deleted = report.deleted,
        "changes synced"
    );
    for path in &report.paths {
        tracing::trace!(path = %path.display(), "synced");
    }
}
