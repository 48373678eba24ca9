use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tokio::sync::mpsc;

use super::watcher::{EventSink, WatchBackend, WatchHandle, WatchMessage};
use crate::config::{MirrorRoot, SyncConfiguration};

/// The active watch handles, at most one per source root.
pub struct WatchSet<B> {
    backend: B,
    tx: mpsc::UnboundedSender<WatchMessage>,
    handles: BTreeMap<PathBuf, Box<dyn WatchHandle>>,
    /// Roots that did not exist when opened and are waiting to be created.
    waiting: BTreeSet<PathBuf>,
    generation: u64,
}

impl<B: WatchBackend> WatchSet<B> {
    pub fn new(backend: B, tx: mpsc::UnboundedSender<WatchMessage>) -> Self {
        Self {
            backend,
            tx,
            handles: BTreeMap::new(),
            waiting: BTreeSet::new(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[cfg(test)]
    pub fn roots(&self) -> impl Iterator<Item = &std::path::Path> {
        self.handles.keys().map(PathBuf::as_path)
    }

    #[cfg(test)]
    pub fn is_waiting(&self, root: &std::path::Path) -> bool {
        self.waiting.contains(root)
    }

    /// Close every handle and wait until none of them can emit again.
    pub async fn close_all(&mut self) {
        let old: Vec<_> = std::mem::take(&mut self.handles).into_values().collect();
        self.waiting.clear();
        if old.is_empty() {
            return;
        }

        let count = old.len();
        let closed = tokio::task::spawn_blocking(move || {
            for handle in old {
                handle.close();
            }
        })
        .await;
        match closed {
            Ok(()) => tracing::debug!(count, "closed watch handles"),
            Err(e) => tracing::error!(error = %e, "failed to close watch handles"),
        }
    }

    /// Replace all watches with ones for `config`. Old handles are fully
    /// closed before the first new one opens.
    pub async fn rebuild(&mut self, config: &SyncConfiguration) {
        self.close_all().await;
        self.generation += 1;

        for root in &config.roots {
            self.open(root, config);
        }
        tracing::debug!(
            generation = self.generation,
            active = self.handles.len(),
            "watch set rebuilt"
        );
    }

    /// Retry the watch of a root that was missing when it was opened.
    pub async fn reopen(&mut self, root: &MirrorRoot, config: &SyncConfiguration) {
        if !self.waiting.remove(&root.source) {
            return;
        }
        if let Some(old) = self.handles.remove(&root.source)
            && let Err(e) = tokio::task::spawn_blocking(move || old.close()).await
        {
            tracing::error!(error = %e, "failed to close watch handle");
        }
        self.open(root, config);
    }

    fn open(&mut self, root: &MirrorRoot, config: &SyncConfiguration) {
        let missing = !root.source.is_dir();
        let sink = EventSink::new(
            self.generation,
            root.clone(),
            config.ignore.clone(),
            self.tx.clone(),
        );

        match self.backend.open(sink, config.watch_debounce) {
            Ok(handle) => {
                if missing {
                    self.waiting.insert(root.source.clone());
                }
                self.handles.insert(root.source.clone(), handle);
            }
            Err(e) => {
                tracing::error!(
                    root = %root.source.display(),
                    error = %format!("{e:#}"),
                    "failed to watch root; it stays unmirrored until the next reload"
                );
            }
        }
    }
}
