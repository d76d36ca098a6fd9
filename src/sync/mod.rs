//! Concurrent mailbox sync.
//!
//! One scanner thread feeds a bounded queue; `concurrency` worker threads,
//! each with its own server connection, drain it into the archive. A full
//! queue blocks the scanner and an empty one blocks the workers.
//!
//! The first failure anywhere aborts the whole run and is returned.

pub mod progress;
pub mod scanner;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::bounded;
use tracing::info;

use crate::archive::ArchiveStore;
use crate::error::{ArchiveError, Result};
use crate::remote::MailSource;

pub use progress::{Progress, ProgressSnapshot, Reporter};
pub use scanner::{ScanSummary, WindowSizer};

/// Default number of fetch workers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default capacity of the work queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub concurrency: usize,
    pub queue_capacity: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// What a completed run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub scan: ScanSummary,
    pub fetched: u64,
}

/// Sync the mailbox behind `scan_source` into `store`.
///
/// `connect` opens one connection per worker; it receives the worker number
/// (starting at 1).
pub fn run_sync<S, W, F>(
    scan_source: &mut S,
    connect: F,
    store: &ArchiveStore,
    progress: &Progress,
    options: &SyncOptions,
) -> Result<SyncSummary>
where
    S: MailSource,
    W: MailSource,
    F: Fn(usize) -> Result<W> + Sync,
{
    let workers = options.concurrency.max(1);
    let (tx, rx) = bounded(options.queue_capacity.max(1));
    let abort = AtomicBool::new(false);

    info!(
        workers,
        messages = scan_source.mailbox_message_count(),
        "Starting sync"
    );

    let (scan_result, worker_results) = std::thread::scope(|scope| {
        let abort = &abort;
        let connect = &connect;

        let scan_handle = scope.spawn(move || {
            let result = scanner::scan(scan_source, store, progress, abort, tx);
            if result.is_err() {
                abort.store(true, Ordering::Relaxed);
            }
            result
        });

        let worker_handles: Vec<_> = (1..=workers)
            .map(|id| {
                let rx = rx.clone();
                scope.spawn(move || {
                    let result = connect(id).and_then(|mut source| {
                        worker::fetch_and_store(id, &mut source, store, progress, abort, rx)
                    });
                    if result.is_err() {
                        abort.store(true, Ordering::Relaxed);
                    }
                    result
                })
            })
            .collect();
        drop(rx);

        let worker_results: Vec<Result<u64>> = worker_handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(ArchiveError::WorkerPanicked)))
            .collect();
        let scan_result = scan_handle
            .join()
            .unwrap_or_else(|_| Err(ArchiveError::WorkerPanicked));
        (scan_result, worker_results)
    });

    let mut fetched = 0;
    for result in worker_results {
        fetched += result?;
    }
    let scan = scan_result?;

    info!(
        scanned = scan.scanned,
        fetched,
        label_updates = scan.label_updates,
        "Sync finished"
    );
    Ok(SyncSummary { scan, fetched })
}
