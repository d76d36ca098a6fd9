//! Append-only message archive.
//!
//! The log is a sequence of frames (see [`crate::archive::codec`]). The
//! in-memory maps are derived from it: on open they are seeded from the
//! checkpoint index, if it can be trusted, and then brought up to date by
//! replaying every frame written after the checkpoint.
//!
//! All operations take the same lock, so a store can be shared between the
//! scanner and any number of fetch workers.
//!
//! A store opened with [`ArchiveStore::open_read_only`] never writes to the
//! log or the index. An incomplete trailing frame is left in place and the
//! sequential reader stops in front of it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::archive::checkpoint::{self, Index, IndexRecord};
use crate::archive::codec;
use crate::archive::record::{Record, RecordKind};
use crate::error::{ArchiveError, Result};

/// Offset value marking a deleted message.
pub const TOMBSTONE: i64 = -1;

/// Records appended between two automatic checkpoints.
pub const DEFAULT_CHECKPOINT_THRESHOLD: usize = 1000;

/// Tuning knobs for an [`ArchiveStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Write a checkpoint once this many records are newer than the last one.
    pub checkpoint_threshold: usize,
    /// `fdatasync` the log after every appended frame.
    pub sync_writes: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            sync_writes: true,
        }
    }
}

/// Durable archive of one mailbox.
pub struct ArchiveStore {
    path: PathBuf,
    idx_path: PathBuf,
    options: StoreOptions,
    read_only: bool,
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    state: State,
    /// Records on disk that the last checkpoint does not cover.
    dirty: usize,
    /// Position of the sequential reader.
    read_pos: u64,
    /// Start of an incomplete trailing frame left in place by a read-only open.
    torn_tail: Option<u64>,
    /// Start of a partial frame a failed append could not remove.
    poisoned: Option<u64>,
}

#[derive(Default)]
struct State {
    labels: HashMap<u32, Vec<String>>,
    offsets: HashMap<u32, i64>,
}

impl ArchiveStore {
    /// Open or create the archive at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Open or create the archive at `path`, recovering its in-memory state.
    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Self::open_mode(path.as_ref(), options, false)
    }

    /// Open an existing archive without write access.
    ///
    /// Recovery runs as usual but nothing is written back: no truncation of
    /// a torn tail and no checkpoint. Every mutating call returns
    /// [`ArchiveError::ReadOnly`].
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_mode(path.as_ref(), StoreOptions::default(), true)
    }

    fn open_mode(path: &Path, options: StoreOptions, read_only: bool) -> Result<Self> {
        let path = path.to_path_buf();
        let idx_path = checkpoint::index_path_for(&path);

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(&path)
            .map_err(|e| ArchiveError::io(&path, e))?;
        let log_len = file
            .metadata()
            .map_err(|e| ArchiveError::io(&path, e))?
            .len();

        let mut inner = Inner {
            file,
            state: State::default(),
            dirty: 0,
            read_pos: 0,
            torn_tail: None,
            poisoned: None,
        };

        let start = match checkpoint::load_index(&idx_path) {
            Ok(Some(index)) if (0..=log_len as i64).contains(&index.file_offset) => {
                inner.state.seed(index.records);
                index.file_offset as u64
            }
            Ok(Some(index)) => {
                warn!(
                    path = %idx_path.display(),
                    file_offset = index.file_offset,
                    log_len,
                    "Index points past the end of the log (reindexing)"
                );
                0
            }
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "Reading index failed (reindexing)");
                0
            }
        };

        inner.replay(start, &path, read_only)?;
        if inner.dirty > 0 && !read_only {
            debug!(
                replayed = inner.dirty,
                from = start,
                "Replayed records after checkpoint"
            );
            inner.write_checkpoint(&path, &idx_path)?;
        }

        info!(
            path = %path.display(),
            messages = inner.state.live_count(),
            read_only,
            "Opened archive"
        );

        Ok(Self {
            path,
            idx_path,
            options,
            read_only,
            inner: Mutex::new(inner),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the checkpoint index.
    pub fn index_path(&self) -> &Path {
        &self.idx_path
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(ArchiveError::ReadOnly(self.path.clone()));
        }
        Ok(())
    }

    /// Append a full copy of a message and make it the live version.
    pub fn write_message(
        &self,
        message_id: u32,
        body: Vec<u8>,
        labels: Vec<String>,
    ) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        let record = Record::full(message_id, body, labels);
        let offset = inner.append(&record, &self.path, &self.options)?;

        inner.state.offsets.insert(message_id, offset as i64);
        inner.state.labels.insert(message_id, record.labels);
        inner.maybe_checkpoint(&self.path, &self.idx_path, &self.options)
    }

    /// Record new labels for a message without storing its body again.
    ///
    /// Fails with [`ArchiveError::NotArchived`] unless the message is live.
    pub fn set_labels(&self, message_id: u32, labels: Vec<String>) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        if !inner.state.is_live(message_id) {
            return Err(ArchiveError::NotArchived(message_id));
        }
        let record = Record::label_update(message_id, labels);
        inner.append(&record, &self.path, &self.options)?;

        inner.state.labels.insert(message_id, record.labels);
        inner.maybe_checkpoint(&self.path, &self.idx_path, &self.options)
    }

    /// Mark a message as deleted. Earlier copies stay in the log.
    pub fn delete_message(&self, message_id: u32) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        inner.append(&Record::tombstone(message_id), &self.path, &self.options)?;

        inner.state.offsets.insert(message_id, TOMBSTONE);
        inner.state.labels.remove(&message_id);
        inner.maybe_checkpoint(&self.path, &self.idx_path, &self.options)
    }

    /// Whether a live copy of the message is archived.
    pub fn have(&self, message_id: u32) -> bool {
        self.inner.lock().state.is_live(message_id)
    }

    /// Current labels of a message (empty if unknown or deleted).
    pub fn labels(&self, message_id: u32) -> Vec<String> {
        self.inner
            .lock()
            .state
            .labels
            .get(&message_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Log offset of the live copy of a message.
    pub fn offset(&self, message_id: u32) -> Option<u64> {
        self.inner
            .lock()
            .state
            .offsets
            .get(&message_id)
            .and_then(|&offset| u64::try_from(offset).ok())
    }

    /// Number of live messages.
    pub fn size(&self) -> usize {
        self.inner.lock().state.live_count()
    }

    /// Current size of the log in bytes.
    pub fn log_len(&self) -> Result<u64> {
        let inner = self.inner.lock();
        inner
            .file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| ArchiveError::io(&self.path, e))
    }

    /// Read the next record from the sequential cursor.
    ///
    /// Returns the record with its log offset, or `Ok(None)` at the end of
    /// the log.
    pub fn read_record(&self) -> Result<Option<(u64, Record)>> {
        let mut inner = self.inner.lock();
        let pos = inner.read_pos;
        if inner.torn_tail.is_some_and(|tail| pos >= tail) {
            return Ok(None);
        }

        let mut file = &inner.file;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| ArchiveError::io(&self.path, e))?;
        match codec::read_frame(&mut file, pos).map_err(|e| e.with_path(&self.path))? {
            Some((record, len)) => {
                inner.read_pos = pos + len;
                Ok(Some((pos, record)))
            }
            None => Ok(None),
        }
    }

    /// Move the sequential cursor back to the start of the log.
    pub fn rewind(&self) {
        self.inner.lock().read_pos = 0;
    }

    /// The live state as it would be written to a checkpoint.
    pub fn snapshot(&self) -> Result<Index> {
        self.inner.lock().capture(&self.path)
    }

    /// Write a checkpoint now, regardless of the dirty count.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_writable()?;
        self.inner.lock().write_checkpoint(&self.path, &self.idx_path)
    }

    /// Wait for in-flight writes, flush the log and checkpoint pending records.
    ///
    /// A no-op on a read-only store.
    pub fn write_close(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner
            .file
            .sync_all()
            .map_err(|e| ArchiveError::io(&self.path, e))?;
        if inner.dirty > 0 {
            inner.write_checkpoint(&self.path, &self.idx_path)?;
        }
        Ok(())
    }
}

impl Inner {
    /// Apply every frame from `start` to the end of the log.
    ///
    /// A frame cut short at the end of the log is dropped: truncated away,
    /// or only skipped when `read_only`. A length prefix that runs past the
    /// end while a complete payload follows it is damage, not a torn write,
    /// and fails with [`ArchiveError::MalformedFrame`].
    fn replay(&mut self, start: u64, path: &Path, read_only: bool) -> Result<()> {
        let mut reader = BufReader::new(&self.file);
        reader
            .seek(SeekFrom::Start(start))
            .map_err(|e| ArchiveError::io(path, e))?;

        let mut pos = start;
        loop {
            match codec::read_frame(&mut reader, pos) {
                Ok(Some((record, len))) => {
                    self.state.apply(record, pos);
                    self.dirty += 1;
                    pos += len;
                }
                Ok(None) => break,
                Err(ArchiveError::TruncatedFrame { offset }) => {
                    let torn =
                        is_torn_tail(&self.file, offset).map_err(|e| ArchiveError::io(path, e))?;
                    if !torn {
                        return Err(ArchiveError::MalformedFrame {
                            offset,
                            reason: "length prefix runs past the end of the log \
                                     but a complete payload follows it"
                                .to_string(),
                        });
                    }
                    if read_only {
                        warn!(
                            path = %path.display(),
                            offset,
                            "Ignoring incomplete trailing frame"
                        );
                        self.torn_tail = Some(offset);
                    } else {
                        warn!(
                            path = %path.display(),
                            offset,
                            "Discarding incomplete trailing frame"
                        );
                        self.file
                            .set_len(offset)
                            .map_err(|e| ArchiveError::io(path, e))?;
                    }
                    break;
                }
                Err(e) => return Err(e.with_path(path)),
            }
        }
        Ok(())
    }

    /// Append one frame at the end of the log and return its offset.
    fn append(&mut self, record: &Record, path: &Path, options: &StoreOptions) -> Result<u64> {
        if let Some(offset) = self.poisoned {
            return Err(ArchiveError::TornWrite {
                path: path.to_path_buf(),
                offset,
            });
        }
        let frame = codec::encode(record)?;
        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| ArchiveError::io(path, e))?;

        if let Err(e) = self.file.write_all(&frame) {
            // Leave no torn frame behind for the next append to bury.
            if let Err(cleanup) = self.file.set_len(offset) {
                warn!(
                    path = %path.display(),
                    offset,
                    error = %cleanup,
                    "Could not remove partial frame; refusing further appends"
                );
                self.poisoned = Some(offset);
            }
            return Err(ArchiveError::io(path, e));
        }
        if options.sync_writes {
            self.file
                .sync_data()
                .map_err(|e| ArchiveError::io(path, e))?;
        }

        self.dirty += 1;
        Ok(offset)
    }

    fn maybe_checkpoint(
        &mut self,
        path: &Path,
        idx_path: &Path,
        options: &StoreOptions,
    ) -> Result<()> {
        if self.dirty >= options.checkpoint_threshold {
            self.write_checkpoint(path, idx_path)?;
        }
        Ok(())
    }

    fn capture(&self, path: &Path) -> Result<Index> {
        let log_len = self
            .file
            .metadata()
            .map_err(|e| ArchiveError::io(path, e))?
            .len();

        let mut records: Vec<IndexRecord> = self
            .state
            .offsets
            .iter()
            .filter(|(_, &offset)| offset >= 0)
            .map(|(&message_id, &file_offset)| IndexRecord {
                message_id,
                file_offset,
                labels: self
                    .state
                    .labels
                    .get(&message_id)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        records.sort_by_key(|r| r.message_id);

        Ok(Index {
            file_offset: log_len as i64,
            records,
        })
    }

    fn write_checkpoint(&mut self, path: &Path, idx_path: &Path) -> Result<()> {
        let index = self.capture(path)?;
        checkpoint::write_index(idx_path, &index)?;
        self.dirty = 0;
        Ok(())
    }
}

/// Whether the frame at `offset`, whose length prefix claims more bytes than
/// the log holds, is an interrupted final write.
fn is_torn_tail(file: &File, offset: u64) -> std::io::Result<bool> {
    let log_len = file.metadata()?.len();
    let payload_start = offset + codec::LENGTH_PREFIX_LEN as u64;
    if log_len <= payload_start {
        return Ok(true);
    }
    let mut reader = file;
    reader.seek(SeekFrom::Start(payload_start))?;
    Ok(!codec::holds_complete_payload(BufReader::new(reader)))
}

impl State {
    fn seed(&mut self, records: Vec<IndexRecord>) {
        for rec in records {
            self.offsets.insert(rec.message_id, rec.file_offset);
            self.labels.insert(rec.message_id, rec.labels);
        }
    }

    /// Replay one record found at log offset `pos`.
    fn apply(&mut self, record: Record, pos: u64) {
        let id = record.message_id;
        match record.kind() {
            RecordKind::Full => {
                self.offsets.insert(id, pos as i64);
                self.labels.insert(id, record.labels);
            }
            RecordKind::LabelUpdate => {
                if self.is_live(id) {
                    self.labels.insert(id, record.labels);
                }
            }
            RecordKind::Tombstone => {
                self.offsets.insert(id, TOMBSTONE);
                self.labels.remove(&id);
            }
        }
    }

    fn is_live(&self, message_id: u32) -> bool {
        self.offsets.get(&message_id).is_some_and(|&offset| offset >= 0)
    }

    fn live_count(&self) -> usize {
        self.offsets.values().filter(|&&offset| offset >= 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_write_and_lookup() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(dir.path().join("a.imapvault")).unwrap();

        store
            .write_message(10, b"hello".to_vec(), labels(&["Inbox"]))
            .unwrap();

        assert!(store.have(10));
        assert!(!store.have(11));
        assert_eq!(store.labels(10), labels(&["Inbox"]));
        assert!(store.labels(11).is_empty());
        assert_eq!(store.offset(10), Some(0));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_first_record_at_offset_zero_is_live() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.imapvault");
        {
            let store = ArchiveStore::open(&path).unwrap();
            store.write_message(1, b"x".to_vec(), vec![]).unwrap();
        }
        let store = ArchiveStore::open(&path).unwrap();
        assert_eq!(store.offset(1), Some(0));
        assert!(store.have(1));
    }

    #[test]
    fn test_set_labels_keeps_offset() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(dir.path().join("a.imapvault")).unwrap();

        store.write_message(1, b"one".to_vec(), vec![]).unwrap();
        store.write_message(2, b"two".to_vec(), vec![]).unwrap();
        let before = store.offset(2);

        store.set_labels(2, labels(&["Starred"])).unwrap();
        assert_eq!(store.offset(2), before);
        assert_eq!(store.labels(2), labels(&["Starred"]));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(dir.path().join("a.imapvault")).unwrap();

        store.write_message(1, b"one".to_vec(), labels(&["A"])).unwrap();
        store.delete_message(1).unwrap();

        assert!(!store.have(1));
        assert!(store.labels(1).is_empty());
        assert_eq!(store.offset(1), None);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_read_record_sequence() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(dir.path().join("a.imapvault")).unwrap();

        store.write_message(1, b"one".to_vec(), vec![]).unwrap();
        store.set_labels(1, labels(&["X"])).unwrap();
        store.delete_message(1).unwrap();

        let kinds: Vec<RecordKind> = std::iter::from_fn(|| store.read_record().unwrap())
            .map(|(_, r)| r.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![RecordKind::Full, RecordKind::LabelUpdate, RecordKind::Tombstone]
        );

        assert!(store.read_record().unwrap().is_none());
        store.rewind();
        let (offset, first) = store.read_record().unwrap().unwrap();
        assert_eq!(offset, 0);
        assert_eq!(first.message_data, b"one");
    }

    #[test]
    fn test_appends_do_not_move_read_cursor() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(dir.path().join("a.imapvault")).unwrap();

        store.write_message(1, b"one".to_vec(), vec![]).unwrap();
        let (_, first) = store.read_record().unwrap().unwrap();
        store.write_message(2, b"two".to_vec(), vec![]).unwrap();
        let (_, second) = store.read_record().unwrap().unwrap();

        assert_eq!(first.message_id, 1);
        assert_eq!(second.message_id, 2);
    }

    #[test]
    fn test_threshold_triggers_checkpoint() {
        let dir = TempDir::new().unwrap();
        let options = StoreOptions {
            checkpoint_threshold: 3,
            sync_writes: false,
        };
        let store = ArchiveStore::open_with(dir.path().join("a.imapvault"), options).unwrap();

        store.write_message(1, b"1".to_vec(), vec![]).unwrap();
        store.write_message(2, b"2".to_vec(), vec![]).unwrap();
        assert!(!store.index_path().exists());

        store.write_message(3, b"3".to_vec(), vec![]).unwrap();
        let index = checkpoint::load_index(store.index_path()).unwrap().unwrap();
        assert_eq!(index.records.len(), 3);
        assert_eq!(index.file_offset as u64, store.log_len().unwrap());
    }

    #[test]
    fn test_snapshot_excludes_deleted() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(dir.path().join("a.imapvault")).unwrap();

        store.write_message(3, b"3".to_vec(), vec![]).unwrap();
        store.write_message(1, b"1".to_vec(), vec![]).unwrap();
        store.write_message(2, b"2".to_vec(), vec![]).unwrap();
        store.delete_message(2).unwrap();

        let ids: Vec<u32> = store
            .snapshot()
            .unwrap()
            .records
            .iter()
            .map(|r| r.message_id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_write_close_checkpoints_dirty_records() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(dir.path().join("a.imapvault")).unwrap();
        store.write_message(1, b"1".to_vec(), vec![]).unwrap();

        store.write_close().unwrap();
        let index = checkpoint::load_index(store.index_path()).unwrap().unwrap();
        assert_eq!(index, store.snapshot().unwrap());
    }

    #[test]
    fn test_set_labels_requires_live_message() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(dir.path().join("a.imapvault")).unwrap();
        store.write_message(1, b"one".to_vec(), vec![]).unwrap();
        store.delete_message(1).unwrap();
        let len = store.log_len().unwrap();

        assert!(matches!(
            store.set_labels(1, labels(&["X"])),
            Err(ArchiveError::NotArchived(1))
        ));
        assert!(matches!(
            store.set_labels(2, labels(&["X"])),
            Err(ArchiveError::NotArchived(2))
        ));
        assert_eq!(store.log_len().unwrap(), len);
        assert!(store.labels(1).is_empty());
    }

    #[test]
    fn test_label_update_for_dead_message_is_ignored() {
        let mut state = State::default();
        state.apply(Record::label_update(4, labels(&["X"])), 0);
        assert!(state.labels.is_empty());

        state.apply(Record::full(4, b"b".to_vec(), vec![]), 10);
        state.apply(Record::tombstone(4), 20);
        state.apply(Record::label_update(4, labels(&["X"])), 30);
        assert!(state.labels.is_empty());
        assert!(!state.is_live(4));
    }

    #[test]
    fn test_unremovable_partial_frame_blocks_appends() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(dir.path().join("a.imapvault")).unwrap();
        store.write_message(1, b"one".to_vec(), vec![]).unwrap();
        let len = store.log_len().unwrap();

        store.inner.lock().poisoned = Some(len);
        let err = store.write_message(2, b"two".to_vec(), vec![]).unwrap_err();

        assert!(matches!(err, ArchiveError::TornWrite { offset, .. } if offset == len));
        assert_eq!(store.log_len().unwrap(), len);
        assert!(!store.have(2));
        assert!(store.have(1));
    }

    #[test]
    fn test_read_only_store_refuses_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.imapvault");
        {
            let store = ArchiveStore::open(&path).unwrap();
            store.write_message(1, b"one".to_vec(), vec![]).unwrap();
        }
        std::fs::remove_file(checkpoint::index_path_for(&path)).ok();

        let store = ArchiveStore::open_read_only(&path).unwrap();
        assert!(store.have(1));
        assert!(matches!(
            store.write_message(2, b"two".to_vec(), vec![]),
            Err(ArchiveError::ReadOnly(_))
        ));
        assert!(matches!(store.delete_message(1), Err(ArchiveError::ReadOnly(_))));
        assert!(matches!(store.checkpoint(), Err(ArchiveError::ReadOnly(_))));
        store.write_close().unwrap();
        assert!(!store.index_path().exists());
    }

    #[test]
    fn test_read_only_open_of_missing_archive_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.imapvault");
        assert!(matches!(
            ArchiveStore::open_read_only(&path),
            Err(ArchiveError::Io { .. })
        ));
        assert!(!path.exists());
    }
}
