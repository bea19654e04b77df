//! Configuration types for voltx
//!
//! This module defines the per-volume tunables: admission, sync policy,
//! unmap handling and the intent log.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Volume layer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Maximum concurrently executing transactional I/O contexts per volume
    pub admission_limit: usize,
    /// Sync policy applied to writes
    pub sync_policy: SyncPolicy,
    /// Whether free/unmap requests are honoured
    pub unmap: UnmapPolicy,
    /// Intent log configuration
    pub intent_log: IntentLogConfig,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            admission_limit: default_admission_limit(),
            sync_policy: SyncPolicy::default(),
            unmap: UnmapPolicy::default(),
            intent_log: IntentLogConfig::default(),
        }
    }
}

impl VolumeConfig {
    /// Config with the intent log rooted at `dir`
    #[must_use]
    pub fn with_log_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            intent_log: IntentLogConfig {
                dir: dir.into(),
                ..IntentLogConfig::default()
            },
            ..Self::default()
        }
    }

    /// Admission limit, never below one
    #[must_use]
    pub fn effective_admission_limit(&self) -> usize {
        self.admission_limit.max(1)
    }
}

fn default_admission_limit() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

/// When writes are made durable in the intent log
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Only writes that request sync are committed before completion
    #[default]
    Standard,
    /// Every write is committed before completion
    Always,
    /// The log is never committed; sync requests complete immediately
    Disabled,
}

/// Handling of free/unmap requests
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmapPolicy {
    /// Free requests release backing space
    #[default]
    Enabled,
    /// Free requests fail as unsupported
    Disabled,
}

/// Intent log record placement bias
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBias {
    /// Prefer inline copies for low commit latency
    #[default]
    Latency,
    /// Always reference the persisted data
    Throughput,
}

/// Intent log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentLogConfig {
    /// Directory holding one log file per dataset
    pub dir: PathBuf,
    /// Writes below this size are always logged with an inline copy
    pub immediate_write_size: u64,
    /// Largest inline payload carried by a single record
    pub max_inline_size: u64,
    /// Whether the log lives on a separate device
    pub separate_log_device: bool,
    /// Record placement bias
    pub log_bias: LogBias,
    /// Log size that triggers rotation at the next checkpoint
    pub max_log_size: u64,
}

impl Default for IntentLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/voltx/log"),
            immediate_write_size: 32 * 1024,
            max_inline_size: 64 * 1024,
            separate_log_device: false,
            log_bias: LogBias::Latency,
            max_log_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}
