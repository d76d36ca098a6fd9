//! IMAP implementation of [`MailSource`].
//!
//! `async-imap` drives the protocol. Each [`ImapSource`] owns a
//! current-thread tokio runtime and blocks on it, so a connection can be
//! handed to a plain worker thread.

use async_imap::imap_proto::{AttributeValue, Response, Status};
use async_imap::types::Fetch;
use async_imap::Session;
use async_native_tls::TlsStream;
use futures::TryStreamExt;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, trace, warn};

use crate::error::{ArchiveError, Result};
use crate::remote::{MailSource, RemoteMessage};

/// Default IMAPS port.
pub const DEFAULT_PORT: u16 = 993;

/// TLS-encrypted TCP wrapped in the tokio compat layer.
type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

/// A logged-in IMAP connection with an optional mailbox examined read-only.
pub struct ImapSource {
    runtime: Runtime,
    session: ImapSession,
    /// Whether to ask for `X-GM-LABELS`.
    gmail_labels: bool,
    message_count: u32,
}

impl ImapSource {
    /// Connect to `server` (`host` or `host:port`) and log in.
    ///
    /// When `mailbox` is given it is opened read-only and its message count
    /// is recorded for [`MailSource::mailbox_message_count`].
    pub fn connect(
        server: &str,
        email: &str,
        password: &str,
        mailbox: Option<&str>,
    ) -> Result<Self> {
        let (host, port) = split_server(server);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ArchiveError::remote("starting IMAP runtime", e))?;

        let (session, message_count) = runtime.block_on(async {
            info!(host = %host, port, "Connecting to IMAP server");

            let tcp = TcpStream::connect((host, port))
                .await
                .map_err(|e| ArchiveError::remote("TCP connection failed", e))?;
            let tls = async_native_tls::TlsConnector::new()
                .connect(host, tcp.compat())
                .await
                .map_err(|e| ArchiveError::remote("TLS handshake failed", e))?;

            let client = async_imap::Client::new(tls);
            let mut session = client
                .login(email, password)
                .await
                .map_err(|(e, _)| ArchiveError::remote("login failed", e))?;

            let message_count = match mailbox {
                Some(name) => {
                    let selected = session
                        .examine(name)
                        .await
                        .map_err(|e| ArchiveError::remote("EXAMINE failed", e))?;
                    debug!(mailbox = name, exists = selected.exists, "Mailbox opened");
                    selected.exists
                }
                None => 0,
            };

            Ok::<_, ArchiveError>((session, message_count))
        })?;

        Ok(Self {
            runtime,
            session,
            gmail_labels: is_gmail(host),
            message_count,
        })
    }

    /// Throw away untagged responses the server pushed between commands.
    fn discard_unsolicited(&mut self) {
        let mut discarded = 0usize;
        while self.session.unsolicited_responses.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            trace!(discarded, "Discarded unsolicited server data");
        }
    }
}

impl MailSource for ImapSource {
    fn search_range(&mut self, begin: u32, end: u32) -> Result<Vec<RemoteMessage>> {
        let query = if self.gmail_labels {
            "(UID X-GM-LABELS)"
        } else {
            "(UID)"
        };
        let command = format!("FETCH {begin}:{end} {query}");

        let Self {
            runtime, session, ..
        } = self;
        let found = runtime.block_on(fetch_attributes(session, &command))?;
        self.discard_unsolicited();
        Ok(found)
    }

    fn fetch_by_uid(&mut self, uid: u32) -> Result<Vec<u8>> {
        let Self {
            runtime, session, ..
        } = self;
        let fetches: Vec<Fetch> = runtime.block_on(async {
            session
                .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
                .await
                .map_err(|e| ArchiveError::remote("FETCH body failed", e))?
                .try_collect()
                .await
                .map_err(|e| ArchiveError::remote("collecting body failed", e))
        })?;
        self.discard_unsolicited();

        fetches
            .iter()
            .find_map(|f| f.body())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| ArchiveError::Remote(format!("no body returned for UID {uid}")))
    }

    fn list_mailboxes(&mut self) -> Result<Vec<String>> {
        let Self {
            runtime, session, ..
        } = self;
        let names: Vec<String> = runtime.block_on(async {
            let names: Vec<_> = session
                .list(None, Some("*"))
                .await
                .map_err(|e| ArchiveError::remote("LIST failed", e))?
                .try_collect()
                .await
                .map_err(|e| ArchiveError::remote("collecting mailboxes failed", e))?;
            Ok::<_, ArchiveError>(names.iter().map(|n| n.name().to_string()).collect())
        })?;
        self.discard_unsolicited();

        debug!(count = names.len(), "Listed mailboxes");
        Ok(names)
    }

    fn mailbox_message_count(&self) -> u32 {
        self.message_count
    }
}

impl Drop for ImapSource {
    fn drop(&mut self) {
        let Self {
            runtime, session, ..
        } = self;
        if let Err(e) = runtime.block_on(session.logout()) {
            debug!(error = %e, "LOGOUT failed");
        }
    }
}

/// Run a raw `FETCH` and collect UID and labels from every response.
///
/// `Fetch` has no accessor for `X-GM-LABELS`, so the responses are read
/// off the connection and their attributes inspected directly.
async fn fetch_attributes(session: &mut ImapSession, command: &str) -> Result<Vec<RemoteMessage>> {
    let request = session
        .run_command(command)
        .await
        .map_err(|e| ArchiveError::remote("FETCH UIDs failed", e))?;

    let mut found = Vec::new();
    loop {
        let response = session
            .read_response()
            .await
            .ok_or_else(|| ArchiveError::Remote("connection closed during FETCH".to_string()))?
            .map_err(|e| ArchiveError::remote("reading FETCH response", e))?;

        match response.parsed() {
            Response::Fetch(seq, attrs) => match remote_message(attrs) {
                Some(message) => found.push(message),
                None => warn!(seq, "FETCH response without UID"),
            },
            Response::Done {
                tag,
                status,
                information,
                ..
            } if *tag == request => {
                if *status != Status::Ok {
                    return Err(ArchiveError::Remote(format!(
                        "FETCH UIDs failed: {status:?} {}",
                        information.as_deref().unwrap_or_default()
                    )));
                }
                return Ok(found);
            }
            other => trace!(response = ?other, "Ignoring response during FETCH"),
        }
    }
}

/// UID and sorted labels from the attributes of one FETCH response.
fn remote_message(attrs: &[AttributeValue<'_>]) -> Option<RemoteMessage> {
    let mut uid = None;
    let mut labels = Vec::new();
    for attr in attrs {
        match attr {
            AttributeValue::Uid(id) => uid = Some(*id),
            AttributeValue::GmailLabels(list) => {
                labels.extend(list.iter().map(|l| l.to_string()));
            }
            _ => {}
        }
    }
    labels.sort();
    uid.map(|uid| RemoteMessage::new(uid, labels))
}

/// Split `host:port`, defaulting to [`DEFAULT_PORT`].
fn split_server(server: &str) -> (&str, u16) {
    match server.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (server, DEFAULT_PORT),
        },
        None => (server, DEFAULT_PORT),
    }
}

/// Gmail exposes labels through the `X-GM-LABELS` fetch attribute.
fn is_gmail(host: &str) -> bool {
    host.contains("gmail.com") || host.contains("googlemail.com")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_server() {
        assert_eq!(split_server("imap.gmail.com:993"), ("imap.gmail.com", 993));
        assert_eq!(split_server("mail.example.org"), ("mail.example.org", 993));
        assert_eq!(split_server("localhost:1143"), ("localhost", 1143));
        assert_eq!(split_server("weird:port"), ("weird:port", 993));
    }

    #[test]
    fn test_remote_message_reads_uid_and_sorted_labels() {
        use std::borrow::Cow;

        let attrs = vec![
            AttributeValue::Uid(42),
            AttributeValue::GmailLabels(vec![
                Cow::Borrowed("\\Inbox"),
                Cow::Borrowed("Work"),
                Cow::Borrowed("Important"),
            ]),
        ];
        let message = remote_message(&attrs).unwrap();
        assert_eq!(message.uid, 42);
        assert_eq!(message.labels, vec!["Important", "Work", "\\Inbox"]);
    }

    #[test]
    fn test_remote_message_without_labels_or_uid() {
        assert_eq!(
            remote_message(&[AttributeValue::Uid(7)]),
            Some(RemoteMessage::new(7, vec![]))
        );
        assert_eq!(remote_message(&[AttributeValue::Rfc822Size(10)]), None);
    }

    #[test]
    fn test_is_gmail() {
        assert!(is_gmail("imap.gmail.com"));
        assert!(is_gmail("imap.googlemail.com"));
        assert!(!is_gmail("imap.fastmail.com"));
    }
}
