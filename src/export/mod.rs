//! Export of an archive to standard mail formats.

pub mod mbox;

pub use mbox::{write_mbox, ExportStats};
