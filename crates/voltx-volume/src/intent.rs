//! Intent logging for volume writes and frees
//!
//! Decides how each write reaches the log and replays a log left behind by
//! a crash.

use crate::error::VolumeResult;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};
use voltx_common::{IntentLogConfig, LogBias, VOLUME_OBJECT};
use voltx_store::{ObjectSession, StoreError, Transaction};
use voltx_wal::{LogDataSource, LogRecord, Payload, Wal, WalError, WalResult, WriteState};

/// How a write is carried by the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Data copied into the record when the intent is logged
    Copied,
    /// Data copied into the record at commit time
    NeedCopy,
    /// Record references data persisted in the store
    Indirect,
}

/// Pick the placement of a write of `length` bytes.
///
/// Small writes are copied. Writes at or above the immediate threshold are
/// referenced, unless there is no separate log device and the write is
/// smaller than a block, in which case copying is cheaper than persisting
/// a partial block.
pub(crate) fn placement(
    config: &IntentLogConfig,
    block_size: u64,
    length: u64,
    sync: bool,
) -> Placement {
    if config.log_bias == LogBias::Throughput {
        return Placement::Indirect;
    }
    if length >= config.immediate_write_size
        && (config.separate_log_device || length >= block_size)
    {
        return Placement::Indirect;
    }
    if sync {
        Placement::Copied
    } else {
        Placement::NeedCopy
    }
}

/// Intent records of one write, held back until its transaction commits.
///
/// A record that reaches the pending list before its data is committed
/// could be resolved by a concurrent commit against the old contents, or
/// logged for a write whose commit then fails.
#[derive(Debug)]
pub(crate) struct WriteIntent {
    txg: u64,
    records: Vec<(u64, u64, WriteState)>,
}

/// Plan the records for the write of `[offset, offset + length)` made by
/// `tx`, which must still be open.
///
/// Copied payloads are split at the inline limit and referenced payloads at
/// block boundaries.
pub(crate) fn plan_write(
    tx: &dyn Transaction,
    config: &IntentLogConfig,
    block_size: u64,
    offset: u64,
    length: u64,
    sync: bool,
) -> WriteIntent {
    let choice = placement(config, block_size, length, sync);
    let max_inline = config.max_inline_size.max(1);
    let block_size = block_size.max(1);

    let mut records = Vec::new();
    let mut offset = offset;
    let mut remaining = length;
    while remaining > 0 {
        let chunk = match choice {
            Placement::Copied | Placement::NeedCopy => remaining.min(max_inline),
            Placement::Indirect => remaining.min(block_size - offset % block_size),
        };
        let state = match choice {
            Placement::Copied => match tx.read(VOLUME_OBJECT, offset, chunk) {
                Ok(data) => WriteState::Copied(data),
                Err(e) => {
                    warn!(
                        "Falling back to indirect record for [{}, +{}): {}",
                        offset, chunk, e
                    );
                    WriteState::Indirect
                }
            },
            Placement::NeedCopy => WriteState::NeedCopy,
            Placement::Indirect => WriteState::Indirect,
        };
        records.push((offset, chunk, state));
        offset += chunk;
        remaining -= chunk;
    }
    WriteIntent {
        txg: tx.txg(),
        records,
    }
}

impl WriteIntent {
    /// Append the records to `wal`. Call only after the transaction has
    /// committed.
    pub(crate) fn append(self, wal: &Wal) -> VolumeResult<()> {
        for (offset, length, state) in self.records {
            wal.log_write(self.txg, offset, length, state)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Log data source backed by an open volume session
pub(crate) struct VolumeLogSource {
    session: Arc<dyn ObjectSession>,
}

impl VolumeLogSource {
    pub(crate) fn new(session: Arc<dyn ObjectSession>) -> Self {
        Self { session }
    }
}

fn source_error(err: StoreError) -> WalError {
    WalError::Source(err.to_string())
}

impl LogDataSource for VolumeLogSource {
    fn read(&self, offset: u64, length: u64) -> WalResult<Bytes> {
        let tx = self.session.begin_tx().map_err(source_error)?;
        let data = tx.read(VOLUME_OBJECT, offset, length);
        tx.abort();
        data.map_err(source_error)
    }

    fn persist(&self, txg: u64) -> WalResult<()> {
        self.session
            .wait_synced(txg)
            .map(|_| ())
            .map_err(source_error)
    }

    fn synced_txg(&self) -> u64 {
        self.session.synced_txg()
    }
}

/// Re-apply logged operations not yet durable in the store, then sync and
/// checkpoint the log. Returns the number of records applied.
pub(crate) fn replay(session: &dyn ObjectSession, wal: &Wal) -> VolumeResult<usize> {
    let synced = session.synced_txg();
    let entries = wal.replay(synced)?;
    let mut applied = 0usize;

    for entry in &entries {
        match &entry.record {
            LogRecord::Write {
                offset,
                payload: Payload::Copied(data),
                ..
            } => {
                let mut tx = session.begin_tx()?;
                if let Err(e) = tx.write(VOLUME_OBJECT, *offset, data) {
                    tx.abort();
                    return Err(e.into());
                }
                tx.commit()?;
                applied += 1;
            }
            LogRecord::Write {
                offset,
                length,
                payload: Payload::Indirect,
                ..
            } => {
                // The data was durable before the record was written.
                debug!(
                    "Replay: indirect write [{}, +{}) already in store",
                    offset, length
                );
            }
            LogRecord::Truncate { offset, length, .. } => {
                session.free_range(VOLUME_OBJECT, *offset, *length)?;
                applied += 1;
            }
            LogRecord::Checkpoint { .. } => {}
        }
    }

    let txg = session.wait_synced(0)?;
    wal.checkpoint(txg)?;
    if !entries.is_empty() {
        info!(
            "Replayed intent log of {}: {} records, {} applied, synced txg {}",
            session.name(),
            entries.len(),
            applied,
            txg
        );
    }
    Ok(applied)
}
