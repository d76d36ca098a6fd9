//! `imapvault` archives IMAP mailboxes into a durable append-only log.
//!
//! This crate provides the archive store (framing, checkpoint index and
//! crash recovery), the adaptive concurrent sync pipeline that fills it from
//! a mail server, and an mbox exporter.

pub mod archive;
pub mod config;
pub mod error;
pub mod export;
pub mod remote;
pub mod sync;

pub use archive::{ArchiveStore, Record, StoreOptions};
pub use error::{ArchiveError, Result};
