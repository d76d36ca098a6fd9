//! The remote mail server as seen by the sync pipeline.
//!
//! The pipeline only talks to a [`MailSource`]. [`imap::ImapSource`] is the
//! production implementation; tests use in-memory ones.

pub mod imap;

use crate::error::Result;

/// A message as reported by a range search: its UID and current labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub uid: u32,
    pub labels: Vec<String>,
}

impl RemoteMessage {
    pub fn new(uid: u32, labels: Vec<String>) -> Self {
        Self { uid, labels }
    }
}

/// Capabilities the sync pipeline needs from a mail server connection.
///
/// Each connection is used by a single thread at a time.
pub trait MailSource: Send {
    /// UIDs and labels of the messages with sequence numbers `begin..=end`.
    fn search_range(&mut self, begin: u32, end: u32) -> Result<Vec<RemoteMessage>>;

    /// Raw RFC 5322 bytes of the message with the given UID.
    fn fetch_by_uid(&mut self, uid: u32) -> Result<Vec<u8>>;

    /// Names of all mailboxes on the server.
    fn list_mailboxes(&mut self) -> Result<Vec<String>>;

    /// Number of messages in the selected mailbox when it was opened.
    fn mailbox_message_count(&self) -> u32;
}
