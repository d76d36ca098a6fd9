//! Centralized error types for imapvault.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the imapvault library.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The log ends in the middle of a frame (a torn write).
    #[error("Truncated frame at offset {offset}")]
    TruncatedFrame { offset: u64 },

    /// A complete frame whose payload cannot be decoded.
    #[error("Malformed frame at offset {offset}: {reason}")]
    MalformedFrame { offset: u64, reason: String },

    /// A record payload does not fit the 32-bit length prefix.
    #[error("Frame payload of {0} bytes exceeds the 4 GiB frame limit")]
    FrameTooLarge(usize),

    /// A stored message body could not be decoded.
    #[error("Corrupt body for message {message_id}: {reason}")]
    CorruptBody { message_id: u32, reason: String },

    /// A value could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The checkpoint index is corrupt, stale or unreadable.
    #[error("Corrupt or incompatible index '{path}': {reason}")]
    InvalidIndex { path: PathBuf, reason: String },

    /// A label update named a message with no live copy.
    #[error("Message {0} is not archived")]
    NotArchived(u32),

    /// A write was attempted on an archive opened read-only.
    #[error("Archive '{0}' is open read-only")]
    ReadOnly(PathBuf),

    /// A failed append left a partial frame that could not be removed.
    #[error("Archive '{path}' has an unremovable partial frame at offset {offset}")]
    TornWrite { path: PathBuf, offset: u64 },

    /// The remote mail server failed a request.
    #[error("Remote server error: {0}")]
    Remote(String),

    /// A sync pipeline thread panicked.
    #[error("Sync worker panicked")]
    WorkerPanicked,
}

/// Convenience alias for `Result<T, ArchiveError>`.
pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach `path` to a path-less `Io` error; other variants pass through.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::Io { source, .. } => Self::io(path, source),
            other => other,
        }
    }

    /// Create a `Remote` variant from anything printable.
    pub fn remote(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Remote(format!("{context}: {err}"))
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `ArchiveError::io`).
impl From<std::io::Error> for ArchiveError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

impl From<bincode::Error> for ArchiveError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
