//! A single archive entry.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ArchiveError, Result};

/// SHA-256 digest of an uncompressed message body.
pub type MessageHash = [u8; 32];

/// One entry in the append-only log.
///
/// Records are never rewritten. A later record with the same `message_id`
/// supersedes earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Server UID of the message.
    pub message_id: u32,
    /// Raw message bytes, gzip-compressed when `compressed` is set.
    pub message_data: Vec<u8>,
    /// Digest of the uncompressed body. `None` on label updates and tombstones.
    pub message_hash: Option<MessageHash>,
    /// Tombstone marker.
    pub deleted: bool,
    /// Server labels in server order.
    pub labels: Vec<String>,
    /// Whether `message_data` is itself gzip-compressed.
    pub compressed: bool,
}

/// What a record does to the archive state when replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Carries a message body.
    Full,
    /// Replaces the labels of an already archived message.
    LabelUpdate,
    /// Marks the message as deleted.
    Tombstone,
}

impl Record {
    /// A full record carrying `data` and its digest.
    pub fn full(message_id: u32, data: Vec<u8>, labels: Vec<String>) -> Self {
        let hash = digest(&data);
        Self {
            message_id,
            message_data: data,
            message_hash: Some(hash),
            deleted: false,
            labels,
            compressed: false,
        }
    }

    /// A label-only record.
    pub fn label_update(message_id: u32, labels: Vec<String>) -> Self {
        Self {
            message_id,
            message_data: Vec::new(),
            message_hash: None,
            deleted: false,
            labels,
            compressed: false,
        }
    }

    /// A tombstone record.
    pub fn tombstone(message_id: u32) -> Self {
        Self {
            message_id,
            message_data: Vec::new(),
            message_hash: None,
            deleted: true,
            labels: Vec::new(),
            compressed: false,
        }
    }

    pub fn kind(&self) -> RecordKind {
        if self.deleted {
            RecordKind::Tombstone
        } else if self.message_hash.is_some() {
            RecordKind::Full
        } else {
            RecordKind::LabelUpdate
        }
    }

    /// The uncompressed message body.
    pub fn body(&self) -> Result<Cow<'_, [u8]>> {
        if !self.compressed {
            return Ok(Cow::Borrowed(&self.message_data));
        }
        let mut out = Vec::with_capacity(self.message_data.len() * 2);
        GzDecoder::new(self.message_data.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| ArchiveError::CorruptBody {
                message_id: self.message_id,
                reason: e.to_string(),
            })?;
        Ok(Cow::Owned(out))
    }

    /// Check the body against the stored digest.
    ///
    /// Records without a body have nothing to verify and always pass.
    pub fn verify(&self) -> Result<bool> {
        match self.message_hash {
            Some(expected) => Ok(digest(&self.body()?) == expected),
            None => Ok(true),
        }
    }
}

/// Compute the SHA-256 digest of `data`.
pub fn digest(data: &[u8]) -> MessageHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_kinds() {
        assert_eq!(
            Record::full(1, b"x".to_vec(), vec![]).kind(),
            RecordKind::Full
        );
        assert_eq!(
            Record::label_update(1, vec!["a".into()]).kind(),
            RecordKind::LabelUpdate
        );
        assert_eq!(Record::tombstone(1).kind(), RecordKind::Tombstone);
    }

    #[test]
    fn test_full_record_verifies() {
        let rec = Record::full(7, b"Subject: hi\r\n\r\nbody".to_vec(), vec![]);
        assert!(rec.verify().unwrap());

        let mut tampered = rec.clone();
        tampered.message_data[0] = b's';
        assert!(!tampered.verify().unwrap());
    }

    #[test]
    fn test_compressed_body_is_inflated() {
        let plain = b"From: a@example.com\n\nhello".to_vec();
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&plain).unwrap();

        let rec = Record {
            message_id: 3,
            message_data: enc.finish().unwrap(),
            message_hash: Some(digest(&plain)),
            deleted: false,
            labels: vec![],
            compressed: true,
        };
        assert_eq!(rec.body().unwrap().as_ref(), plain.as_slice());
        assert!(rec.verify().unwrap());
    }

    #[test]
    fn test_corrupt_compressed_body() {
        let rec = Record {
            compressed: true,
            ..Record::full(9, b"not gzip".to_vec(), vec![])
        };
        assert!(matches!(
            rec.body(),
            Err(ArchiveError::CorruptBody { message_id: 9, .. })
        ));
    }
}
