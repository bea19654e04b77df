#![allow(clippy::result_large_err)]
//! voltx Volume - Block devices over a transactional object store
//!
//! A volume is a fixed-size byte range stored in one object of a
//! copy-on-write dataset. This crate turns block requests into store
//! transactions while keeping concurrent I/O, administrative operations
//! and crash recovery consistent.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  VolumeManager   │  lookup / open / close / read / write / free / flush
//! │  - registry      │  create_minor / remove_minor / rename / suspend
//! └────────┬─────────┘
//!          │ submit
//! ┌────────▼─────────┐
//! │  Volume          │  quiesce lock ─▶ state lock
//! │  - admission     │  bounded active contexts, FIFO deferred queue
//! │  - range lock    │  per-range readers/writer
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐     ┌──────────────┐
//! │  ObjectSession   │◀────│  Intent log  │  group commit, replay
//! └──────────────────┘     └──────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use voltx_common::{Dispatcher, VolumeConfig};
//! use voltx_store::MemoryStore;
//! use voltx_volume::VolumeManager;
//!
//! let manager = VolumeManager::new(
//!     Arc::new(MemoryStore::new()),
//!     VolumeConfig::with_log_dir("/tmp/voltx-log"),
//!     Dispatcher::Inline,
//! );
//! let volume = manager.create_volume("pool/vol", 1 << 30, 4096)?;
//! manager.open(&volume, false, false)?;
//! manager.write(&volume, 0, &b"hello"[..], true)?;
//! assert_eq!(&manager.read(&volume, 0, 5)?[..], b"hello");
//! manager.close(&volume)?;
//! # Ok::<(), voltx_volume::VolumeError>(())
//! ```

pub mod error;
mod intent;
pub mod io;
pub mod manager;
pub mod rangelock;
mod registry;
pub mod stats;
mod suspend;
pub mod volume;

pub use error::{VolumeError, VolumeResult};
pub use io::{Admission, Completion, IoKind, IoOutcome, IoRequest, IoState};
pub use manager::{VolumeManager, VolumeRef, VolumeStats, check_volblocksize, check_volsize};
pub use rangelock::{RangeGuard, RangeLock, RangeMode};
pub use stats::{IoStats, IoStatsSnapshot, LatencyHistogram, LatencySummary};
pub use suspend::SuspendedVolume;
pub use volume::{QuiesceRef, Volume, VolumeFlags};
