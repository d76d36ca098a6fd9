//! Fetch worker: drains the work queue into the archive.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Receiver;
use tracing::{debug, trace};

use crate::archive::ArchiveStore;
use crate::error::Result;
use crate::remote::{MailSource, RemoteMessage};
use crate::sync::progress::Progress;

/// Fetch and store queued messages until the queue is closed and empty.
///
/// Returns the number of messages stored. The first error ends the worker;
/// the caller is responsible for raising `abort` so the others stop too.
pub fn fetch_and_store<S>(
    worker_id: usize,
    source: &mut S,
    store: &ArchiveStore,
    progress: &Progress,
    abort: &AtomicBool,
    queue: Receiver<RemoteMessage>,
) -> Result<u64>
where
    S: MailSource + ?Sized,
{
    let mut fetched = 0u64;
    for message in queue.iter() {
        if abort.load(Ordering::Relaxed) {
            debug!(worker = worker_id, "Worker stopping after abort");
            break;
        }

        let body = source.fetch_by_uid(message.uid)?;
        trace!(worker = worker_id, uid = message.uid, bytes = body.len(), "Fetched");
        store.write_message(message.uid, body, message.labels)?;

        fetched += 1;
        progress.add_fetched(1);
    }

    debug!(worker = worker_id, fetched, "Worker finished");
    Ok(fetched)
}
