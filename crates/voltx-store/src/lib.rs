//! voltx Store - Transactional object store contract
//!
//! The volume layer consumes a copy-on-write, transactional object store
//! through the traits in this crate. A dataset holds the volume's data
//! object and its properties; a session owns an open dataset; transactions
//! group writes into transaction groups (txgs) that become durable when the
//! group is synced.
//!
//! ```text
//! ObjectStore ──open──▶ ObjectSession ──begin_tx──▶ Transaction
//!                            │                        │ read / write
//!                            │ wait_synced(txg)       │ commit → txg
//!                            ▼                        ▼
//!                      durable state  ◀── sync ── committed state
//! ```
//!
//! [`MemoryStore`] implements the contract in memory, including crash
//! simulation (only synced state survives) and fault injection.

pub mod error;
pub mod memory;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;

use bytes::Bytes;
use std::sync::Arc;

/// Transaction group number
pub type Txg = u64;

/// Dataset access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Reads only
    ReadOnly,
    /// Reads and writes
    ReadWrite,
}

/// Object geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Data block size in bytes
    pub block_size: u64,
    /// Number of allocated data blocks
    pub allocated_blocks: u64,
    /// Highest allocated block index, if any
    pub max_block: Option<u64>,
}

/// Space accounting for a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpaceUsage {
    /// Bytes referenced by the dataset
    pub used: u64,
    /// Bytes still available
    pub available: u64,
}

/// A transactional, copy-on-write object store
pub trait ObjectStore: Send + Sync {
    /// Create a volume dataset with its data object and size property
    fn create_volume(&self, name: &str, size: u64, block_size: u64) -> StoreResult<()>;

    /// Check whether a dataset exists
    fn exists(&self, name: &str) -> bool;

    /// Stable identifier of a dataset, unchanged by rename
    fn guid(&self, name: &str) -> StoreResult<u64>;

    /// Value of the dataset's read-only property
    fn is_read_only(&self, name: &str) -> StoreResult<bool>;

    /// Take ownership of a dataset
    fn open(&self, name: &str, mode: OpenMode) -> StoreResult<Arc<dyn ObjectSession>>;

    /// Space accounting without owning the dataset
    fn space(&self, name: &str) -> StoreResult<SpaceUsage>;

    /// Create `name@snap` from the dataset's synced state
    fn snapshot(&self, name: &str, snap: &str) -> StoreResult<()>;

    /// Revert the dataset to `name@snap`; the dataset must not be owned
    fn rollback(&self, name: &str, snap: &str) -> StoreResult<()>;

    /// Rename a dataset and its snapshots
    fn rename(&self, old: &str, new: &str) -> StoreResult<()>;

    /// Remove a dataset; the dataset must not be owned
    fn destroy(&self, name: &str) -> StoreResult<()>;
}

/// An owned, open dataset
pub trait ObjectSession: Send + Sync {
    /// Current dataset name
    fn name(&self) -> String;

    /// Mode the session was opened with
    fn mode(&self) -> OpenMode;

    /// Whether the dataset is a snapshot
    fn is_snapshot(&self) -> bool;

    /// Whether the dataset uses an encryption version this layer cannot write
    fn incompatible_encryption(&self) -> bool;

    /// Start a transaction in the currently open txg
    fn begin_tx(&self) -> StoreResult<Box<dyn Transaction>>;

    /// Free `[offset, offset + length)` of an object
    fn free_range(&self, object: u64, offset: u64, length: u64) -> StoreResult<()>;

    /// Object geometry
    fn object_info(&self, object: u64) -> StoreResult<ObjectInfo>;

    /// Read a persisted property
    fn get_property(&self, key: &str) -> StoreResult<Option<u64>>;

    /// Highest txg known to be durable
    fn synced_txg(&self) -> Txg;

    /// Wait until `txg` is durable; `0` means everything committed so far.
    /// Returns the synced txg.
    fn wait_synced(&self, txg: Txg) -> StoreResult<Txg>;

    /// Space accounting
    fn space(&self) -> SpaceUsage;

    /// Release ownership; later calls fail with [`StoreError::Closed`]
    fn close(&self);
}

/// A store transaction
pub trait Transaction: Send {
    /// Transaction group this transaction belongs to
    fn txg(&self) -> Txg;

    /// Read object data, including this transaction's own writes.
    /// Unallocated ranges read as zeroes.
    fn read(&self, object: u64, offset: u64, length: u64) -> StoreResult<Bytes>;

    /// Write object data
    fn write(&mut self, object: u64, offset: u64, data: &[u8]) -> StoreResult<()>;

    /// Free `[offset, offset + length)` of an object; freed ranges read as
    /// zeroes, including to this transaction
    fn free(&mut self, object: u64, offset: u64, length: u64) -> StoreResult<()>;

    /// Update a persisted property
    fn set_property(&mut self, key: &str, value: u64) -> StoreResult<()>;

    /// Change an object's block size; fails once data exists past the first block
    fn set_block_size(&mut self, object: u64, block_size: u64) -> StoreResult<()>;

    /// Commit the transaction, returning its txg
    fn commit(self: Box<Self>) -> StoreResult<Txg>;

    /// Discard the transaction
    fn abort(self: Box<Self>);
}
