//! voltx WAL - Per-volume write-ahead intent log
//!
//! Every volume that has been written gets one log file, named after its
//! dataset GUID so a rename never orphans it. Writes and frees are recorded
//! as intents before their store transaction commits; a sync commit makes
//! all recorded intents durable with a single write and fsync shared by
//! every concurrent caller.
//!
//! Write records carry their data in one of three states:
//!
//! - **Copied**: the data travels with the record.
//! - **NeedCopy**: the data is read from the volume when the record is
//!   committed.
//! - **Indirect**: the data is made durable in the store instead, and the
//!   record only describes the range.
//!
//! After a crash, records newer than both the last checkpoint and the
//! store's synced transaction group are replayed against the volume.

pub mod error;
pub mod record;
pub mod wal;

pub use error::{WalError, WalResult};
pub use record::{LogEntry, LogRecord, Payload};
pub use wal::{LogDataSource, Wal, WriteState};
