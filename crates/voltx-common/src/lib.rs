//! voltx Common - Shared configuration and scheduling primitives
//!
//! This crate provides the configuration types, the continuation
//! dispatcher and the volume name hash used across all voltx components.

pub mod config;
pub mod dispatch;
pub mod hash;

pub use config::{IntentLogConfig, LogBias, SyncPolicy, UnmapPolicy, VolumeConfig};
pub use dispatch::Dispatcher;
pub use hash::name_hash;

/// Object number of the volume data object inside its dataset
pub const VOLUME_OBJECT: u64 = 1;

/// Property key holding the persisted volume size
pub const SIZE_PROPERTY: &str = "size";

/// Smallest supported volume block size (512 B)
pub const MIN_BLOCK_SIZE: u64 = 512;

/// Largest supported volume block size (128 KiB)
pub const MAX_BLOCK_SIZE: u64 = 128 * 1024;

/// Default volume block size (16 KiB)
pub const DEFAULT_BLOCK_SIZE: u64 = 16 * 1024;
