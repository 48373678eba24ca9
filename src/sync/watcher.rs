use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::Watcher as _;
use notify_debouncer_mini::{DebounceEventResult, DebouncedEventKind, Debouncer, new_debouncer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::aggregator::ChangeKind;
use crate::config::MirrorRoot;
use crate::util::ignore::IgnoreSpec;
use crate::util::path as sync_path;

/// A classified change under a source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: ChangeKind,
    /// Absolute path under the source root.
    pub path: PathBuf,
}

/// What watch handles send to the orchestrator.
///
/// `generation` identifies the WatchSet build that opened the handle;
/// messages from an older build are stale and must be dropped.
#[derive(Debug, Clone)]
pub enum WatchMessage {
    Event {
        generation: u64,
        root: PathBuf,
        event: FsEvent,
    },
    /// A missing source root may have been created.
    RootAppeared { generation: u64, root: PathBuf },
}

/// The sending side a watch handle is wired to: one per source root.
///
/// Clones share one cancellation token. Once it is cancelled nothing is
/// sent any more and running scans stop at the next entry.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    root: MirrorRoot,
    ignore: IgnoreSpec,
    tx: mpsc::UnboundedSender<WatchMessage>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(
        generation: u64,
        root: MirrorRoot,
        ignore: IgnoreSpec,
        tx: mpsc::UnboundedSender<WatchMessage>,
    ) -> Self {
        Self {
            generation,
            root,
            ignore,
            tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn root(&self) -> &MirrorRoot {
        &self.root
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn emit(&self, kind: ChangeKind, path: PathBuf) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.tx.send(WatchMessage::Event {
            generation: self.generation,
            root: self.root.source.clone(),
            event: FsEvent { kind, path },
        });
    }

    pub fn root_appeared(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.tx.send(WatchMessage::RootAppeared {
            generation: self.generation,
            root: self.root.source.clone(),
        });
    }

    fn is_ignored(&self, path: &Path) -> bool {
        match sync_path::relative_path(&self.root.source, path) {
            Ok(rel) => self.ignore.is_ignored(&rel),
            Err(_) => true,
        }
    }

    /// Added if the mirrored copy does not exist yet, otherwise Changed.
    fn classify(&self, path: &Path) -> ChangeKind {
        match sync_path::resolve_target_path(&self.root.source, &self.root.target, path) {
            Ok(target) if target.exists() => ChangeKind::Changed,
            _ => ChangeKind::Added,
        }
    }

    fn is_mirrored_dir(&self, dir: &Path) -> bool {
        sync_path::resolve_target_path(&self.root.source, &self.root.target, dir)
            .is_ok_and(|t| t.is_dir())
    }

    /// Turn one debounced batch of "something happened at `path`"
    /// notifications into events.
    ///
    /// Removals are emitted before any directory is scanned, so a swapped
    /// directory has its stale mirror entries removed before the new
    /// contents are copied in.
    pub fn observe(&self, paths: &[PathBuf]) {
        let mut removed = Vec::new();
        let mut dirs = Vec::new();

        for path in paths {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.is_ignored(path) {
                continue;
            }

            match std::fs::symlink_metadata(path) {
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.emit(ChangeKind::Removed, path.clone());
                    removed.push(path.as_path());
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot stat, skipping");
                }
                Ok(meta) if meta.is_symlink() => {
                    tracing::debug!(path = %path.display(), "skipping symlink");
                }
                Ok(meta) if meta.is_dir() => dirs.push(path.as_path()),
                Ok(_) => self.emit(self.classify(path), path.clone()),
            }
        }

        // A mirrored directory normally only changed its listing and its
        // files report themselves. Vanished entries below it in the same
        // batch mean it may have been replaced wholesale, which inotify
        // reports as the directory alone.
        for dir in dirs {
            let replaced = removed.iter().any(|r| r.starts_with(dir));
            if replaced || !self.is_mirrored_dir(dir) {
                self.scan(dir);
            }
        }
    }

    /// Walk `dir` and emit Added/Changed for every regular, non-ignored file.
    pub fn scan(&self, dir: &Path) {
        let walker = WalkDir::new(dir)
            .into_iter()
            .filter_entry(|entry| !self.is_ignored(entry.path()));

        for entry in walker {
            if self.cancel.is_cancelled() {
                tracing::debug!(dir = %dir.display(), "scan cancelled");
                return;
            }
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    self.emit(self.classify(entry.path()), entry.into_path());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "scan error, skipping entry"),
            }
        }
    }
}

/// Something that can open a watch on one source root.
pub trait WatchBackend {
    fn open(&self, sink: EventSink, debounce: Duration) -> Result<Box<dyn WatchHandle>>;
}

/// An open watch. Dropping it also stops it, but `close` waits until no
/// further events can be emitted.
pub trait WatchHandle: Send {
    fn close(self: Box<Self>);
}

/// Recursive inotify/FSEvents watch via notify, one debouncer per root.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyBackend;

struct NotifyHandle {
    debouncer: Debouncer<notify::RecommendedWatcher>,
    cancel: CancellationToken,
    /// Disconnects once the debouncer thread has dropped the event handler.
    handler_gone: std_mpsc::Receiver<()>,
    scan: Option<JoinHandle<()>>,
}

impl WatchHandle for NotifyHandle {
    fn close(self: Box<Self>) {
        let Self {
            debouncer,
            cancel,
            handler_gone,
            scan,
        } = *self;

        cancel.cancel();
        // Dropping the debouncer asks its thread to shut down but does not
        // wait for it; the handler owns the only sender of `handler_gone`.
        drop(debouncer);
        let _ = handler_gone.recv();

        if let Some(scan) = scan
            && scan.join().is_err()
        {
            tracing::error!("initial scan thread panicked");
        }
    }
}

impl WatchBackend for NotifyBackend {
    fn open(&self, sink: EventSink, debounce: Duration) -> Result<Box<dyn WatchHandle>> {
        let source = sink.root().source.clone();

        if !source.is_dir() {
            return watch_for_creation(sink, debounce);
        }

        let (alive, handler_gone) = std_mpsc::channel::<()>();
        let handler_sink = sink.clone();
        let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
            let _alive = &alive;
            match result {
                Ok(events) => {
                    let paths: Vec<PathBuf> = events
                        .into_iter()
                        .filter(|e| {
                            matches!(
                                e.kind,
                                DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                            )
                        })
                        .map(|e| e.path)
                        .collect();
                    handler_sink.observe(&paths);
                }
                Err(e) => {
                    tracing::error!(
                        root = %handler_sink.root().source.display(),
                        error = %e,
                        "watcher error"
                    );
                }
            }
        })
        .context("Failed to create file watcher")?;

        debouncer
            .watcher()
            .watch(&source, notify::RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", source.display()))?;
        tracing::info!(root = %source.display(), "watching for changes");

        // Initial sync: surface every existing file as an event
        let cancel = sink.cancel_token();
        let scan = std::thread::Builder::new()
            .name("treemirror-scan".into())
            .spawn(move || sink.scan(&source))
            .context("Failed to start initial scan")?;

        Ok(Box::new(NotifyHandle {
            debouncer,
            cancel,
            handler_gone,
            scan: Some(scan),
        }))
    }
}

/// Watch the nearest existing ancestor of a missing root and report any
/// activity there so the orchestrator can retry the real watch.
fn watch_for_creation(sink: EventSink, debounce: Duration) -> Result<Box<dyn WatchHandle>> {
    let source = sink.root().source.clone();
    let anchor = source
        .ancestors()
        .skip(1)
        .find(|p| p.is_dir())
        .with_context(|| format!("No existing ancestor for {}", source.display()))?
        .to_path_buf();

    let (alive, handler_gone) = std_mpsc::channel::<()>();
    let cancel = sink.cancel_token();
    let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
        let _alive = &alive;
        if result.is_ok_and(|events| !events.is_empty()) {
            sink.root_appeared();
        }
    })
    .context("Failed to create file watcher")?;

    debouncer
        .watcher()
        .watch(&anchor, notify::RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", anchor.display()))?;
    tracing::warn!(
        root = %source.display(),
        waiting_in = %anchor.display(),
        "source root does not exist yet, waiting for it"
    );

    Ok(Box::new(NotifyHandle {
        debouncer,
        cancel,
        handler_gone,
        scan: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sink_for(
        tmp: &TempDir,
        ignored: &[String],
    ) -> (EventSink, mpsc::UnboundedReceiver<WatchMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let root = MirrorRoot {
            source: tmp.path().join("src"),
            target: tmp.path().join("dst"),
        };
        std::fs::create_dir_all(&root.source).unwrap();
        let ignore = IgnoreSpec::compile(ignored).unwrap();
        (EventSink::new(7, root, ignore, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WatchMessage>) -> Vec<FsEvent> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let WatchMessage::Event {
                generation, event, ..
            } = msg
            {
                assert_eq!(generation, 7);
                out.push(event);
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    #[test]
    fn scan_emits_files_and_skips_ignored() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut rx) = sink_for(&tmp, &["node_modules".into()]);
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::create_dir_all(src.join("node_modules/pkg")).unwrap();
        std::fs::create_dir_all(src.join(".git")).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        std::fs::write(src.join("sub/b.txt"), "b").unwrap();
        std::fs::write(src.join("node_modules/pkg/x.js"), "x").unwrap();
        std::fs::write(src.join(".git/HEAD"), "h").unwrap();

        sink.scan(&src);
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                FsEvent {
                    kind: ChangeKind::Added,
                    path: src.join("a.txt")
                },
                FsEvent {
                    kind: ChangeKind::Added,
                    path: src.join("sub/b.txt")
                },
            ]
        );
    }

    #[test]
    fn observe_classifies_by_target_state() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut rx) = sink_for(&tmp, &[]);
        let src = tmp.path().join("src");
        std::fs::write(src.join("new.txt"), "n").unwrap();
        std::fs::write(src.join("old.txt"), "o").unwrap();
        std::fs::create_dir_all(tmp.path().join("dst")).unwrap();
        std::fs::write(tmp.path().join("dst/old.txt"), "stale").unwrap();

        sink.observe(&[src.join("new.txt"), src.join("old.txt"), src.join("gone.txt")]);

        let kinds: Vec<_> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Removed, ChangeKind::Added, ChangeKind::Changed]
        );
    }

    #[test]
    fn observe_new_directory_scans_it() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut rx) = sink_for(&tmp, &[]);
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("fresh/inner")).unwrap();
        std::fs::write(src.join("fresh/inner/f.txt"), "f").unwrap();

        sink.observe(&[src.join("fresh")]);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, src.join("fresh/inner/f.txt"));
    }

    #[test]
    fn observe_mirrored_directory_is_quiet() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut rx) = sink_for(&tmp, &[]);
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("d")).unwrap();
        std::fs::write(src.join("d/f.txt"), "f").unwrap();
        std::fs::create_dir_all(tmp.path().join("dst/d")).unwrap();

        sink.observe(&[src.join("d")]);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn observe_replaced_directory_rescans_it() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut rx) = sink_for(&tmp, &[]);
        let src = tmp.path().join("src");
        // `d` was swapped for a directory holding different files
        std::fs::create_dir_all(src.join("d")).unwrap();
        std::fs::write(src.join("d/new.txt"), "n").unwrap();
        std::fs::create_dir_all(tmp.path().join("dst/d")).unwrap();
        std::fs::write(tmp.path().join("dst/d/old.txt"), "o").unwrap();

        sink.observe(&[src.join("d"), src.join("d/old.txt")]);

        let mut kinds = Vec::new();
        while let Ok(WatchMessage::Event { event, .. }) = rx.try_recv() {
            kinds.push(event);
        }
        assert_eq!(
            kinds,
            vec![
                FsEvent {
                    kind: ChangeKind::Removed,
                    path: src.join("d/old.txt")
                },
                FsEvent {
                    kind: ChangeKind::Added,
                    path: src.join("d/new.txt")
                },
            ]
        );
    }

    #[test]
    fn cancelled_sink_stops_emitting() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut rx) = sink_for(&tmp, &[]);
        let src = tmp.path().join("src");
        std::fs::write(src.join("a.txt"), "a").unwrap();

        sink.cancel_token().cancel();
        sink.scan(&src);
        sink.observe(&[src.join("a.txt")]);
        sink.root_appeared();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn observe_ignored_path_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut rx) = sink_for(&tmp, &["node_modules".into()]);
        let src = tmp.path().join("src");
        sink.observe(&[
            src.join("node_modules/x.txt"),
            src.join(".hidden"),
            tmp.path().join("elsewhere/file"),
        ]);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn notify_backend_initial_scan() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut rx) = sink_for(&tmp, &[]);
        let src = tmp.path().join("src");
        std::fs::write(src.join("a.txt"), "hi").unwrap();

        let handle = NotifyBackend
            .open(sink, Duration::from_millis(50))
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            WatchMessage::Event { event, .. } => {
                assert_eq!(event.kind, ChangeKind::Added);
                assert_eq!(event.path, src.join("a.txt"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        tokio::task::spawn_blocking(move || handle.close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn notify_backend_is_silent_after_close() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut rx) = sink_for(&tmp, &[]);
        let src = tmp.path().join("src");
        for d in 0..100 {
            let dir = src.join(format!("d{d:03}"));
            std::fs::create_dir_all(&dir).unwrap();
            for f in 0..50 {
                std::fs::write(dir.join(format!("f{f:02}.txt")), "x").unwrap();
            }
        }

        let handle = NotifyBackend
            .open(sink, Duration::from_millis(20))
            .unwrap();
        // Close while the initial scan is still walking the tree
        tokio::task::spawn_blocking(move || handle.close())
            .await
            .unwrap();

        // Whatever was queued before close returned may stay queued
        while rx.try_recv().is_ok() {}

        std::fs::write(src.join("late.txt"), "late").unwrap();
        std::fs::write(src.join("d000/f00.txt"), "changed").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err(), "closed handle emitted an event");
    }

    #[tokio::test]
    async fn notify_backend_waits_for_missing_root() {
        let tmp = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = MirrorRoot {
            source: tmp.path().join("later"),
            target: tmp.path().join("dst"),
        };
        let sink = EventSink::new(1, root, IgnoreSpec::default(), tx);

        let handle = NotifyBackend
            .open(sink, Duration::from_millis(50))
            .unwrap();
        std::fs::create_dir_all(tmp.path().join("later")).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, WatchMessage::RootAppeared { generation: 1, .. }));

        tokio::task::spawn_blocking(move || handle.close())
            .await
            .unwrap();
    }
}
