use std::path::PathBuf;
use std::time::{Duration, Instant};

/// What happened to a mirrored path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

/// One flushed batch of mirrored changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeReport {
    pub added: usize,
    pub changed: usize,
    pub deleted: usize,
    pub paths: Vec<PathBuf>,
}

impl ChangeReport {
    pub fn total(&self) -> usize {
        self.added + self.changed + self.deleted
    }

    fn record(&mut self, kind: ChangeKind, target: PathBuf) {
        match kind {
            ChangeKind::Added => self.added += 1,
            ChangeKind::Changed => self.changed += 1,
            ChangeKind::Removed => self.deleted += 1,
        }
        self.paths.push(target);
    }
}

/// Coalesces mirror outcomes into one report per quiet period.
///
/// Trailing-edge debounce: every `record` pushes the deadline to
/// `now + window`. The caller owns the clock and polls `flush_due`.
#[derive(Debug)]
pub struct ChangeAggregator {
    window: Duration,
    batch: ChangeReport,
    deadline: Option<Instant>,
}

impl ChangeAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            batch: ChangeReport::default(),
            deadline: None,
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn record(&mut self, kind: ChangeKind, target: PathBuf, now: Instant) {
        self.batch.record(kind, target);
        self.deadline = Some(now + self.window);
    }

    /// When the pending batch should be flushed, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[cfg(test)]
    pub fn pending(&self) -> &ChangeReport {
        &self.batch
    }

    /// Take the batch if the quiet period has elapsed at `now`.
    pub fn flush_due(&mut self, now: Instant) -> Option<ChangeReport> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Take the batch regardless of the deadline (shutdown).
    pub fn flush(&mut self) -> Option<ChangeReport> {
        self.deadline = None;
        let report = std::mem::take(&mut self.batch);
        (report.total() > 0).then_some(report)
    }
}
