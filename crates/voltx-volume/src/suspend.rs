//! Quiescing a volume for administrative operations
//!
//! A suspended volume holds its quiesce lock for writing, so new I/O
//! submissions and first opens block until it resumes. In-flight I/O is
//! drained before the session is released.

use crate::error::{VolumeError, VolumeResult};
use crate::registry::{LockMode, LockedVolume, QuiesceHeld, VolumeRegistry};
use crate::volume::{QuiesceRef, QuiesceWrite, Volume, VolumeFlags};
use std::sync::Arc;
use tracing::{info, warn};

/// A volume held quiesced; resumes on [`resume`](Self::resume) or drop.
///
/// The held lock is tied to the thread that suspended the volume.
pub struct SuspendedVolume {
    volume: Arc<Volume>,
    quiesce: Option<QuiesceWrite>,
    quiesce_ref: Option<QuiesceRef>,
}

/// Quiesce the volume registered under `name`
pub(crate) fn suspend(registry: &VolumeRegistry, name: &str) -> VolumeResult<SuspendedVolume> {
    let LockedVolume {
        state,
        quiesce,
        volume,
    } = registry
        .find_by_name(name, LockMode::Write)
        .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
    let QuiesceHeld::Write(quiesce) = quiesce else {
        return Err(VolumeError::Interrupted(format!("quiesce lock of {name}")));
    };

    let quiesce_ref = volume.refs.acquire();
    drop(state);
    // Contexts admitted or deferred before the lock was taken finish first.
    volume.refs.wait_until(1);

    let mut state = volume.state.lock();
    if state.open_count > 0 {
        volume.teardown(&mut state);
    }
    let open_count = state.open_count;
    drop(state);
    info!("Suspended volume {}: open_count={}", name, open_count);

    Ok(SuspendedVolume {
        volume,
        quiesce: Some(quiesce),
        quiesce_ref: Some(quiesce_ref),
    })
}

impl SuspendedVolume {
    /// Name of the suspended volume
    #[must_use]
    pub fn name(&self) -> String {
        self.volume.name()
    }

    /// Rebind the session if the volume is open and release the quiesce
    /// lock. On failure every handle is dropped: the volume is left closed.
    pub fn resume(mut self) -> VolumeResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> VolumeResult<()> {
        if self.quiesce.is_none() {
            return Ok(());
        }
        let mut state = self.volume.state.lock();
        let result = if state.open_count > 0 {
            let write = !state.flags.contains(VolumeFlags::RDONLY);
            self.volume.setup(&mut state, write)
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            warn!(
                "Failed to resume volume {}, closing {} handles: {}",
                self.volume.name(),
                state.open_count,
                e
            );
            state.open_count = 0;
            state.flags.remove(VolumeFlags::EXCL);
        }
        drop(state);

        self.quiesce_ref = None;
        self.quiesce = None;
        if result.is_ok() {
            info!("Resumed volume {}", self.volume.name());
        }
        result
    }
}

impl Drop for SuspendedVolume {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Implicit resume of {} failed: {}", self.volume.name(), e);
        }
    }
}
