//! Log frame codec.
//!
//! ```text
//! ┌───────────────────────────┬──────────────────────────────┐
//! │ length: u32 (big-endian)  │ payload: gzip(bincode(Record))│
//! └───────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Every payload is gzip-compressed as a whole. A record body may in
//! addition be compressed on its own (see [`Record::compressed`]).

use std::io::{ErrorKind, Read, Write};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::archive::record::Record;
use crate::error::{ArchiveError, Result};

/// Size of the frame length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Encode a record into a complete frame (prefix + payload).
pub fn encode(record: &Record) -> Result<Vec<u8>> {
    let payload = encode_payload(record)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| ArchiveError::FrameTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.write_u32::<BigEndian>(len)?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Serialize and compress a record without the length prefix.
pub fn encode_payload(record: &Record) -> Result<Vec<u8>> {
    let raw = bincode::serialize(record)?;
    Ok(gzip(&raw)?)
}

/// Decode a frame payload. `offset` is only used for error reporting.
pub fn decode(payload: &[u8], offset: u64) -> Result<Record> {
    let raw = gunzip(payload).map_err(|e| ArchiveError::MalformedFrame {
        offset,
        reason: format!("decompression failed: {e}"),
    })?;
    bincode::deserialize(&raw).map_err(|e| ArchiveError::MalformedFrame {
        offset,
        reason: format!("record deserialization failed: {e}"),
    })
}

/// Read the next frame from `reader`, which is positioned at `offset`.
///
/// Returns `Ok(None)` at a clean end of stream, and the decoded record
/// together with the frame's on-disk length otherwise. A stream that ends
/// inside a frame yields [`ArchiveError::TruncatedFrame`].
pub fn read_frame<R: Read>(reader: &mut R, offset: u64) -> Result<Option<(Record, u64)>> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    match read_full(reader, &mut prefix)? {
        0 => return Ok(None),
        LENGTH_PREFIX_LEN => {}
        _ => return Err(ArchiveError::TruncatedFrame { offset }),
    }

    let len = BigEndian::read_u32(&prefix) as usize;
    let mut payload = Vec::new();
    let got = reader.by_ref().take(len as u64).read_to_end(&mut payload)?;
    if got < len {
        return Err(ArchiveError::TruncatedFrame { offset });
    }

    let record = decode(&payload, offset)?;
    Ok(Some((record, (LENGTH_PREFIX_LEN + len) as u64)))
}

/// Whether `rest` starts with a complete, intact gzip member.
///
/// `rest` is what follows a length prefix that claims more bytes than the
/// log holds. A torn write leaves at most a partial payload there, so a
/// complete member means the prefix itself is damaged.
pub fn holds_complete_payload<R: Read>(rest: R) -> bool {
    let mut decoder = GzDecoder::new(rest);
    let mut first = [0u8; 1];
    match read_full(&mut decoder, &mut first) {
        Ok(1) => std::io::copy(&mut decoder, &mut std::io::sink()).is_ok(),
        _ => false,
    }
}

/// Fill `buf` as far as the stream allows, returning the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Gzip `data` with the default compression level.
pub(crate) fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub(crate) fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Record {
        Record::full(
            42,
            b"From: a@example.com\r\nSubject: test\r\n\r\nbody\r\n".to_vec(),
            vec!["\\Inbox".to_string(), "Work".to_string()],
        )
    }

    #[test]
    fn test_frame_roundtrip() {
        let rec = sample();
        let frame = encode(&rec).unwrap();
        let len = BigEndian::read_u32(&frame[..4]) as usize;
        assert_eq!(len + LENGTH_PREFIX_LEN, frame.len());

        let (decoded, frame_len) = read_frame(&mut Cursor::new(&frame), 0).unwrap().unwrap();
        assert_eq!(decoded, rec);
        assert_eq!(frame_len, frame.len() as u64);
        assert!(decoded.verify().unwrap());
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let frame = encode(&Record::tombstone(5)).unwrap();
        let (decoded, _) = read_frame(&mut Cursor::new(&frame), 0).unwrap().unwrap();
        assert!(decoded.deleted);
        assert_eq!(decoded.message_id, 5);
        assert!(decoded.labels.is_empty());
    }

    #[test]
    fn test_empty_stream_is_end() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut empty, 0).unwrap().is_none());
    }

    #[test]
    fn test_sequential_frames() {
        let mut log = encode(&sample()).unwrap();
        log.extend(encode(&Record::label_update(42, vec!["Done".into()])).unwrap());
        let mut cursor = Cursor::new(log);

        let (first, len) = read_frame(&mut cursor, 0).unwrap().unwrap();
        let (second, _) = read_frame(&mut cursor, len).unwrap().unwrap();
        assert_eq!(first.message_id, 42);
        assert_eq!(second.labels, vec!["Done".to_string()]);
        assert!(read_frame(&mut cursor, 0).unwrap().is_none());
    }

    #[test]
    fn test_truncated_prefix() {
        let frame = encode(&sample()).unwrap();
        let mut cursor = Cursor::new(frame[..2].to_vec());
        assert!(matches!(
            read_frame(&mut cursor, 17),
            Err(ArchiveError::TruncatedFrame { offset: 17 })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let frame = encode(&sample()).unwrap();
        let mut cursor = Cursor::new(frame[..frame.len() - 3].to_vec());
        assert!(matches!(
            read_frame(&mut cursor, 0),
            Err(ArchiveError::TruncatedFrame { .. })
        ));
    }

    #[test]
    fn test_complete_payload_detection() {
        let frame = encode(&sample()).unwrap();
        let payload = &frame[LENGTH_PREFIX_LEN..];

        assert!(holds_complete_payload(payload));
        // Trailing frames after the member do not matter.
        assert!(holds_complete_payload(Cursor::new(frame[LENGTH_PREFIX_LEN..].repeat(2))));
        assert!(!holds_complete_payload(&payload[..payload.len() - 3]));
        assert!(!holds_complete_payload(&payload[..5]));
        assert!(!holds_complete_payload(&b""[..]));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let mut frame = Vec::new();
        frame.write_u32::<BigEndian>(6).unwrap();
        frame.extend_from_slice(b"garbag");
        assert!(matches!(
            read_frame(&mut Cursor::new(frame), 0),
            Err(ArchiveError::MalformedFrame { .. })
        ));
    }
}
