//! Checkpoint index file format.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ sha256: [u8; 32]                     │
//! │  digest of the uncompressed entries  │
//! ├──────────────────────────────────────┤
//! │ gzip(bincode-serialized Index)       │
//! └──────────────────────────────────────┘
//! ```
//!
//! The index is replaced with a write-to-temp + rename, so readers only ever
//! see a complete old checkpoint or a complete new one.

use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archive::codec::{gunzip, gzip};
use crate::archive::record::digest;
use crate::error::{ArchiveError, Result};

/// Length of the digest header.
pub const DIGEST_LEN: usize = 32;

/// Snapshot of the live archive state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Log position up to which this snapshot is authoritative.
    pub file_offset: i64,
    /// One entry per live message, sorted by id.
    pub records: Vec<IndexRecord>,
}

/// Location and labels of one live message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub message_id: u32,
    pub file_offset: i64,
    pub labels: Vec<String>,
}

/// Index path for an archive: `mail.imapvault` → `mail.imapvault.idx`.
pub fn index_path_for(log_path: &Path) -> PathBuf {
    with_suffix(log_path, ".idx")
}

fn temp_path_for(idx_path: &Path) -> PathBuf {
    with_suffix(idx_path, ".tmp")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Atomically replace the index at `idx_path` with `index`.
pub fn write_index(idx_path: &Path, index: &Index) -> Result<()> {
    let bytes = bincode::serialize(index)?;
    let hash = digest(&bytes);
    let compressed = gzip(&bytes)?;

    let tmp_path = temp_path_for(idx_path);
    let mut file = File::create(&tmp_path).map_err(|e| ArchiveError::io(&tmp_path, e))?;
    file.write_all(&hash)
        .map_err(|e| ArchiveError::io(&tmp_path, e))?;
    file.write_all(&compressed)
        .map_err(|e| ArchiveError::io(&tmp_path, e))?;
    file.sync_all().map_err(|e| ArchiveError::io(&tmp_path, e))?;
    drop(file);

    std::fs::rename(&tmp_path, idx_path).map_err(|e| ArchiveError::io(idx_path, e))?;
    debug!(
        path = %idx_path.display(),
        records = index.records.len(),
        file_offset = index.file_offset,
        "Checkpoint written"
    );
    Ok(())
}

/// Load and validate the index at `idx_path`.
///
/// Returns `Ok(None)` if there is no index, and [`ArchiveError::InvalidIndex`]
/// if it exists but cannot be trusted.
pub fn load_index(idx_path: &Path) -> Result<Option<Index>> {
    let data = match std::fs::read(idx_path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ArchiveError::io(idx_path, e)),
    };

    let invalid = |reason: String| ArchiveError::InvalidIndex {
        path: idx_path.to_path_buf(),
        reason,
    };

    if data.len() < DIGEST_LEN {
        return Err(invalid("file too small".into()));
    }
    let (stored_hash, compressed) = data.split_at(DIGEST_LEN);

    let bytes = gunzip(compressed).map_err(|e| invalid(format!("decompression failed: {e}")))?;
    if digest(&bytes).as_slice() != stored_hash {
        return Err(invalid("digest mismatch".into()));
    }

    let index: Index = bincode::deserialize(&bytes)
        .map_err(|e| invalid(format!("deserialization failed: {e}")))?;
    Ok(Some(index))
}
