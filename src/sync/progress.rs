//! Sync progress counters and the periodic reporter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::info;

/// Default time between two progress reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Counters shared by the scanner, the workers and the reporter.
///
/// They are informational only; nothing reads them to make decisions.
#[derive(Debug, Default)]
pub struct Progress {
    to_scan: AtomicU64,
    scanned: AtomicU64,
    fetched: AtomicU64,
    label_updates: AtomicU64,
}

/// Point-in-time copy of [`Progress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub to_scan: u64,
    pub scanned: u64,
    pub fetched: u64,
    pub label_updates: u64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_to_scan(&self, total: u64) {
        self.to_scan.store(total, Ordering::Relaxed);
    }

    pub fn add_scanned(&self, n: u64) {
        self.scanned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_fetched(&self, n: u64) {
        self.fetched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_label_updates(&self, n: u64) {
        self.label_updates.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            to_scan: self.to_scan.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            label_updates: self.label_updates.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} scanned, {} fetched, {} label-updated",
            self.scanned, self.to_scan, self.fetched, self.label_updates
        )
    }
}

/// Background thread that hands a snapshot to a callback at a fixed interval.
pub struct Reporter {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Reporter {
    /// Start reporting. `on_tick` runs on the reporter thread.
    pub fn spawn<F>(progress: Arc<Progress>, interval: Duration, on_tick: F) -> Self
    where
        F: Fn(&ProgressSnapshot) + Send + 'static,
    {
        let (stop, stopped) = bounded::<()>(1);
        let handle = std::thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => on_tick(&progress.snapshot()),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Self { stop, handle }
    }

    /// Report through `tracing` at info level.
    pub fn spawn_logging(progress: Arc<Progress>, interval: Duration) -> Self {
        Self::spawn(progress, interval, |snapshot| info!("{snapshot}"))
    }

    /// Stop the reporter and wait for its thread.
    pub fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}
