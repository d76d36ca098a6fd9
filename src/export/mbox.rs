//! Render an archive as an mbox stream.
//!
//! Every live message is written once, at the position of its latest full
//! record in the log. Labels go into an `X-Gmail-Labels` header ahead of the
//! original headers, and body lines starting with `From ` get the usual `>`
//! quoting.

use std::io::{self, BufWriter, Write};

use tracing::{debug, warn};

use crate::archive::record::digest;
use crate::archive::{ArchiveStore, RecordKind};
use crate::error::{ArchiveError, Result};

/// Separator line written before every message.
pub const FROM_LINE: &str = "From MAILER-DAEMON Thu Jan  1 01:00:00 1970";

/// Header carrying the message labels.
pub const LABELS_HEADER: &str = "X-Gmail-Labels";

/// Statistics returned by an export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub messages: u64,
    /// Messages whose body no longer matches the stored digest. They are
    /// still exported.
    pub digest_mismatches: u64,
    /// Messages whose stored body could not be decoded. They are skipped.
    pub unreadable: u64,
}

/// Write every live message in `store` to `out`.
pub fn write_mbox<W: Write>(store: &ArchiveStore, out: W) -> Result<ExportStats> {
    let mut out = BufWriter::new(out);
    let mut stats = ExportStats::default();

    store.rewind();
    while let Some((offset, record)) = store.read_record()? {
        if record.kind() != RecordKind::Full || store.offset(record.message_id) != Some(offset) {
            continue;
        }

        let body = match record.body() {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    message_id = record.message_id,
                    offset,
                    error = %e,
                    "Skipping message with an unreadable body"
                );
                stats.unreadable += 1;
                continue;
            }
        };
        if record.message_hash != Some(digest(&body)) {
            warn!(
                message_id = record.message_id,
                offset, "Message body does not match its digest"
            );
            stats.digest_mismatches += 1;
        }

        let labels = store.labels(record.message_id);
        write_message(&mut out, &body, &labels).map_err(output_error)?;
        stats.messages += 1;
    }
    out.flush().map_err(output_error)?;

    debug!(
        messages = stats.messages,
        mismatches = stats.digest_mismatches,
        unreadable = stats.unreadable,
        "mbox export finished"
    );
    Ok(stats)
}

/// Write a single mbox entry: separator, optional label header, quoted body
/// and a trailing blank line.
pub fn write_message<W: Write>(out: &mut W, body: &[u8], labels: &[String]) -> io::Result<()> {
    writeln!(out, "{FROM_LINE}")?;
    if !labels.is_empty() {
        writeln!(out, "{LABELS_HEADER}: {}", labels.join(","))?;
    }
    for line in body_lines(body) {
        if line.starts_with(b"From ") {
            out.write_all(b">")?;
        }
        out.write_all(line)?;
        out.write_all(b"\n")?;
    }
    out.write_all(b"\n")
}

/// Split a body into lines, dropping CRLF carriage returns and the final
/// line terminator.
fn body_lines(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    let lines = if body.is_empty() {
        None
    } else {
        let trimmed = body.strip_suffix(b"\n").unwrap_or(body);
        Some(trimmed.split(|&b| b == b'\n'))
    };
    lines
        .into_iter()
        .flatten()
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn output_error(err: io::Error) -> ArchiveError {
    ArchiveError::io("<output>", err)
}
