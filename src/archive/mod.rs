//! Durable mailbox archive: record model, frame codec, checkpoint index and
//! the append-only store built on them.

pub mod checkpoint;
pub mod codec;
pub mod record;
pub mod store;
pub mod verify;

pub use record::{Record, RecordKind};
pub use store::{ArchiveStore, StoreOptions};
pub use verify::{verify_archive, VerifyReport};
