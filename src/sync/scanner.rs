//! Adaptive scan of the remote mailbox.
//!
//! Sequence numbers `1..=N` are searched in contiguous windows. A window in
//! which everything is already archived doubles the next window; a window
//! that turned up work halves it. Long archived stretches are skipped
//! quickly while the fetch bursts behind a gap stay small.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use tracing::{debug, trace};

use crate::archive::ArchiveStore;
use crate::error::Result;
use crate::remote::{MailSource, RemoteMessage};
use crate::sync::progress::Progress;

/// Smallest (and initial) window size.
pub const MIN_WINDOW: u32 = 100;

/// Largest window size.
pub const MAX_WINDOW: u32 = 3200;

/// Adaptive window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSizer {
    size: u32,
}

impl Default for WindowSizer {
    fn default() -> Self {
        Self { size: MIN_WINDOW }
    }
}

impl WindowSizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Adjust the size after a window that queued `fetch_items` messages.
    pub fn advance(&mut self, fetch_items: usize) {
        if fetch_items == 0 {
            self.size = (self.size * 2).min(MAX_WINDOW);
        } else if self.size > MIN_WINDOW {
            self.size = (self.size / 2).max(MIN_WINDOW);
        }
    }
}

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub windows: u64,
    pub scanned: u64,
    pub queued: u64,
    pub label_updates: u64,
}

/// Walk the whole mailbox, queueing missing messages and refreshing labels.
///
/// The queue is closed when this returns. The scan stops early when `abort`
/// is raised or when no consumer is left.
pub fn scan<S>(
    source: &mut S,
    store: &ArchiveStore,
    progress: &Progress,
    abort: &AtomicBool,
    queue: Sender<RemoteMessage>,
) -> Result<ScanSummary>
where
    S: MailSource + ?Sized,
{
    let total = source.mailbox_message_count();
    progress.set_to_scan(u64::from(total));

    let mut summary = ScanSummary::default();
    let mut sizer = WindowSizer::new();
    let mut begin: u32 = 1;

    while begin <= total {
        if abort.load(Ordering::Relaxed) {
            debug!(begin, "Scan aborted");
            break;
        }

        let end = begin.saturating_add(sizer.size() - 1).min(total);
        let messages = source.search_range(begin, end)?;
        summary.windows += 1;
        summary.scanned += messages.len() as u64;
        progress.add_scanned(messages.len() as u64);

        let mut queued = 0usize;
        for message in messages {
            if !store.have(message.uid) {
                if queue.send(message).is_err() {
                    debug!("All fetch workers have stopped; ending scan");
                    return Ok(summary);
                }
                queued += 1;
            } else if store.labels(message.uid) != message.labels {
                store.set_labels(message.uid, message.labels)?;
                summary.label_updates += 1;
                progress.add_label_updates(1);
            }
        }
        summary.queued += queued as u64;

        sizer.advance(queued);
        trace!(begin, end, queued, next_window = sizer.size(), "Scanned window");

        match end.checked_add(1) {
            Some(next) => begin = next,
            None => break,
        }
    }

    debug!(
        windows = summary.windows,
        scanned = summary.scanned,
        queued = summary.queued,
        "Scan finished"
    );
    Ok(summary)
}
