//! Volume state and lifecycle
//!
//! Every volume carries two locks with a fixed order:
//!
//! 1. the **quiesce** lock (`RwLock<()>`): held for reading while an I/O is
//!    submitted or the volume is first opened or last closed, and for
//!    writing by a suspender for the whole quiesce period;
//! 2. the **state** lock (`Mutex<VolumeState>`): protects every mutable
//!    field.
//!
//! Paths that find themselves holding the state lock and needing the
//! quiesce lock try-acquire it; on failure they drop the state lock, block
//! on the quiesce lock, re-take the state lock and re-validate whatever
//! they read before.
//!
//! Admitted and deferred I/O contexts do not hold the quiesce lock. Each
//! holds a [`QuiesceRef`] instead, and a suspender waits for those to drain.

use crate::error::{VolumeError, VolumeResult};
use crate::intent::VolumeLogSource;
use crate::io::IoContext;
use crate::rangelock::RangeLock;
use crate::stats::IoStats;

use bitflags::bitflags;
use parking_lot::{
    ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard, Condvar, Mutex, RawMutex, RawRwLock,
    RwLock,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};
use voltx_common::{Dispatcher, SIZE_PROPERTY, VOLUME_OBJECT, VolumeConfig, name_hash};
use voltx_store::{ObjectSession, ObjectStore, OpenMode};
use voltx_wal::Wal;

bitflags! {
    /// Volume flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VolumeFlags: u32 {
        /// Writes are refused
        const RDONLY = 0x1;
        /// One handle holds exclusive access
        const EXCL = 0x2;
        /// Written since it was opened; an intent log is attached
        const WRITTEN = 0x4;
    }
}

pub(crate) type QuiesceRead = ArcRwLockReadGuard<RawRwLock, ()>;
pub(crate) type QuiesceWrite = ArcRwLockWriteGuard<RawRwLock, ()>;
pub(crate) type StateGuard = ArcMutexGuard<RawMutex, VolumeState>;

/// Name and registry key; changed only under the registry write lock
#[derive(Debug, Clone)]
pub(crate) struct Identity {
    pub name: String,
    pub hash: u64,
}

/// Mutable volume state, guarded by the state lock
pub(crate) struct VolumeState {
    pub size: u64,
    pub block_size: u64,
    pub open_count: u32,
    pub flags: VolumeFlags,
    /// Present exactly while `open_count > 0`
    pub session: Option<Arc<dyn ObjectSession>>,
    /// Created by the first write after open
    pub wal: Option<Arc<Wal>>,
    pub active_contexts: usize,
    pub deferred: VecDeque<IoContext>,
    /// Set once the volume has left the registry
    pub removed: bool,
}

/// Count of operations that hold the volume against quiescing
pub(crate) struct SuspendRefs {
    count: Mutex<usize>,
    drained: Condvar,
}

impl SuspendRefs {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> QuiesceRef {
        *self.count.lock() += 1;
        QuiesceRef {
            refs: Arc::clone(self),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until at most `target` references remain
    pub fn wait_until(&self, target: usize) {
        let mut count = self.count.lock();
        while *count > target {
            self.drained.wait(&mut count);
        }
    }
}

/// One reference against quiescing, released on drop
pub struct QuiesceRef {
    refs: Arc<SuspendRefs>,
}

impl Drop for QuiesceRef {
    fn drop(&mut self) {
        let mut count = self.refs.count.lock();
        *count = count.saturating_sub(1);
        self.refs.drained.notify_all();
    }
}

/// An emulated block device backed by one store object
pub struct Volume {
    pub(crate) identity: RwLock<Identity>,
    pub(crate) quiesce: Arc<RwLock<()>>,
    pub(crate) state: Arc<Mutex<VolumeState>>,
    pub(crate) refs: Arc<SuspendRefs>,
    pub(crate) rangelock: RangeLock,
    pub(crate) stats: IoStats,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) config: Arc<VolumeConfig>,
    pub(crate) dispatcher: Dispatcher,
}

impl Volume {
    pub(crate) fn new(
        name: &str,
        size: u64,
        block_size: u64,
        store: Arc<dyn ObjectStore>,
        config: Arc<VolumeConfig>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            identity: RwLock::new(Identity {
                name: name.to_string(),
                hash: name_hash(name),
            }),
            quiesce: Arc::new(RwLock::new(())),
            state: Arc::new(Mutex::new(VolumeState {
                size,
                block_size,
                open_count: 0,
                flags: VolumeFlags::empty(),
                session: None,
                wal: None,
                active_contexts: 0,
                deferred: VecDeque::new(),
                removed: false,
            })),
            refs: Arc::new(SuspendRefs::new()),
            rangelock: RangeLock::new(),
            stats: IoStats::new(),
            store,
            config,
            dispatcher,
        }
    }

    /// Current name
    pub fn name(&self) -> String {
        self.identity.read().name.clone()
    }

    pub(crate) fn matches(&self, hash: u64, name: &str) -> bool {
        let identity = self.identity.read();
        identity.hash == hash && identity.name == name
    }

    /// Open a handle
    pub(crate) fn open(&self, write: bool, exclusive: bool) -> VolumeResult<()> {
        let mut state = self.state.lock();
        if state.removed {
            return Err(VolumeError::NotFound(self.name()));
        }

        // First open binds the session; it must not race a suspender.
        let mut _quiesce: Option<QuiesceRead> = None;
        if state.open_count == 0 {
            if let Some(read) = self.quiesce.try_read_arc() {
                _quiesce = Some(read);
            } else {
                drop(state);
                let read = self.quiesce.read_arc();
                state = self.state.lock();
                if state.removed {
                    return Err(VolumeError::NotFound(self.name()));
                }
                if state.open_count == 0 {
                    _quiesce = Some(read);
                }
            }
        }

        let first = state.open_count == 0;
        if first {
            self.setup(&mut state, write)?;
        }

        let check = if write
            && (state.flags.contains(VolumeFlags::RDONLY)
                || state
                    .session
                    .as_ref()
                    .is_some_and(|s| s.incompatible_encryption()))
        {
            Err(VolumeError::ReadOnlyViolation(self.name()))
        } else if state.flags.contains(VolumeFlags::EXCL) {
            Err(VolumeError::AlreadyExclusive(self.name()))
        } else if exclusive && state.open_count != 0 {
            Err(VolumeError::Busy(self.name()))
        } else {
            Ok(())
        };

        if let Err(e) = check {
            if first {
                self.teardown(&mut state);
            }
            return Err(e);
        }

        if exclusive {
            state.flags.insert(VolumeFlags::EXCL);
        }
        state.open_count += 1;
        info!(
            "Opened volume {}: open_count={}, write={}, exclusive={}",
            self.name(),
            state.open_count,
            write,
            exclusive
        );
        Ok(())
    }

    /// Close a handle; the last close tears down the session and log.
    ///
    /// The last close waits for in-flight I/O, so it fails with `Busy` when
    /// made from inside a completion callback.
    pub(crate) fn close(&self) -> VolumeResult<()> {
        let mut state = self.state.lock();
        if state.open_count == 0 {
            return Err(VolumeError::Busy(format!("{} is not open", self.name())));
        }

        let mut _quiesce: Option<QuiesceRead> = None;
        if state.open_count == 1 {
            if let Some(read) = self.quiesce.try_read_arc() {
                _quiesce = Some(read);
            } else {
                drop(state);
                let read = self.quiesce.read_arc();
                state = self.state.lock();
                if state.open_count == 0 {
                    return Err(VolumeError::Busy(format!("{} is not open", self.name())));
                }
                if state.open_count == 1 {
                    _quiesce = Some(read);
                }
            }
        }

        if state.open_count == 1 && crate::io::in_completion() {
            return Err(VolumeError::Busy(format!(
                "last handle of {} closed from a completion callback",
                self.name()
            )));
        }

        // Exclusive access is only granted to a sole handle.
        state.flags.remove(VolumeFlags::EXCL);
        state.open_count -= 1;

        if state.open_count == 0 {
            if self.refs.count() > 0 {
                drop(state);
                self.refs.wait_until(0);
                state = self.state.lock();
            }
            if state.open_count == 0 {
                self.teardown(&mut state);
            }
        }
        info!(
            "Closed volume {}: open_count={}",
            self.name(),
            state.open_count
        );
        Ok(())
    }

    /// Bind a store session and load geometry from persisted metadata
    pub(crate) fn setup(&self, state: &mut VolumeState, write: bool) -> VolumeResult<()> {
        let name = self.name();
        let read_only = !write || name.contains('@') || self.store.is_read_only(&name)?;
        let mode = if read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWrite
        };
        let session = self.store.open(&name, mode)?;

        let geometry = session.get_property(SIZE_PROPERTY).and_then(|size| {
            let info = session.object_info(VOLUME_OBJECT)?;
            Ok((size, info.block_size))
        });
        let (size, block_size) = match geometry {
            Ok((Some(size), block_size)) => (size, block_size),
            Ok((None, _)) => {
                session.close();
                return Err(VolumeError::InvalidArgument(format!(
                    "{name} has no size property"
                )));
            }
            Err(e) => {
                session.close();
                return Err(e.into());
            }
        };

        state.size = size;
        state.block_size = block_size;
        state
            .flags
            .set(VolumeFlags::RDONLY, read_only || session.is_snapshot());
        state.session = Some(session);
        debug!(
            "Bound volume {} ({:?}): size={}, block_size={}",
            name, mode, size, block_size
        );
        Ok(())
    }

    /// Release the session and log, making everything written durable first.
    /// Leaves `open_count` untouched.
    pub(crate) fn teardown(&self, state: &mut VolumeState) {
        let name = self.name();
        let wal = state.wal.take();
        if let Some(wal) = &wal
            && let Err(e) = wal.commit_sync()
        {
            warn!("Failed to commit intent log of {} on teardown: {}", name, e);
        }

        if let Some(session) = state.session.take() {
            if state.flags.contains(VolumeFlags::WRITTEN) {
                match session.wait_synced(0) {
                    Ok(txg) => {
                        if let Some(wal) = &wal
                            && let Err(e) = wal.checkpoint(txg)
                        {
                            warn!("Failed to checkpoint intent log of {}: {}", name, e);
                        }
                    }
                    Err(e) => warn!("Failed to sync {} on teardown: {}", name, e),
                }
            }
            session.close();
        }

        if let Some(wal) = wal
            && let Err(e) = wal.close()
        {
            warn!("Failed to close intent log of {}: {}", name, e);
        }
        state.flags.remove(VolumeFlags::WRITTEN);
        debug!("Tore down volume {}", name);
    }

    /// Attach the intent log, taking the quiesce lock for writing. Returns
    /// the quiesce lock downgraded to a read guard.
    pub(crate) fn ensure_wal(&self) -> VolumeResult<QuiesceRead> {
        let write = self.quiesce.write_arc();
        {
            let mut state = self.state.lock();
            // Someone else may have attached it while the lock was dropped.
            if state.wal.is_none()
                && !state.flags.contains(VolumeFlags::RDONLY)
                && let Some(session) = state.session.clone()
            {
                let name = self.name();
                let guid = self.store.guid(&name)?;
                let source = Arc::new(VolumeLogSource::new(session));
                let wal = Wal::open(&self.config.intent_log, guid, source)?;
                state.wal = Some(Arc::new(wal));
                state.flags.insert(VolumeFlags::WRITTEN);
                debug!("Attached intent log to volume {}", name);
            }
        }
        Ok(ArcRwLockWriteGuard::downgrade(write))
    }

    /// Make logged writes durable
    pub(crate) fn flush(&self) -> VolumeResult<()> {
        let _quiesce = self.quiesce.read_arc();
        let wal = {
            let state = self.state.lock();
            if state.removed {
                return Err(VolumeError::NotFound(self.name()));
            }
            if state.open_count == 0 {
                return Err(VolumeError::Closed(self.name()));
            }
            state.wal.clone()
        };
        self.stats.record_flush();
        if self.config.sync_policy != voltx_common::SyncPolicy::Disabled
            && let Some(wal) = wal
        {
            wal.commit_sync()?;
            self.stats.record_log_commit();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name())
            .field("suspend_refs", &self.refs.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;
    use voltx_store::MemoryStore;

    fn volume(store: &MemoryStore, name: &str) -> (Volume, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        store.create_volume(name, 1 << 20, 4096).unwrap();
        let config = Arc::new(VolumeConfig::with_log_dir(dir.path()));
        let volume = Volume::new(
            name,
            1 << 20,
            4096,
            Arc::new(store.clone()),
            config,
            Dispatcher::Inline,
        );
        (volume, dir)
    }

    #[test]
    fn test_open_binds_and_last_close_releases() {
        let store = MemoryStore::new();
        let (volume, _dir) = volume(&store, "pool/a");
        volume.open(true, false).unwrap();
        volume.open(false, false).unwrap();
        assert!(volume.state.lock().session.is_some());

        volume.close().unwrap();
        assert!(volume.state.lock().session.is_some());
        volume.close().unwrap();
        assert!(volume.state.lock().session.is_none());
        // The dataset is free for another owner.
        assert!(store.open("pool/a", OpenMode::ReadWrite).is_ok());
    }

    #[test]
    fn test_close_when_closed_is_busy() {
        let store = MemoryStore::new();
        let (volume, _dir) = volume(&store, "pool/a");
        assert!(matches!(volume.close(), Err(VolumeError::Busy(_))));
        volume.open(false, false).unwrap();
        volume.close().unwrap();
        assert!(matches!(volume.close(), Err(VolumeError::Busy(_))));
    }

    #[test]
    fn test_exclusive_open_rules() {
        let store = MemoryStore::new();
        let (volume, _dir) = volume(&store, "pool/a");
        volume.open(true, true).unwrap();
        assert!(matches!(
            volume.open(false, false),
            Err(VolumeError::AlreadyExclusive(_))
        ));
        volume.close().unwrap();

        volume.open(false, false).unwrap();
        assert!(matches!(volume.open(true, true), Err(VolumeError::Busy(_))));
        volume.close().unwrap();
        assert_eq!(volume.state.lock().open_count, 0);
    }

    #[test]
    fn test_read_only_property_refuses_writers() {
        let store = MemoryStore::new();
        let (volume, _dir) = volume(&store, "pool/a");
        store.set_read_only("pool/a", true).unwrap();
        assert!(matches!(
            volume.open(true, false),
            Err(VolumeError::ReadOnlyViolation(_))
        ));
        // The failed first open released the session.
        assert!(volume.state.lock().session.is_none());
        volume.open(false, false).unwrap();
        assert!(volume.state.lock().flags.contains(VolumeFlags::RDONLY));
    }

    #[test]
    fn test_incompatible_encryption_refuses_writers() {
        let store = MemoryStore::new();
        let (volume, _dir) = volume(&store, "pool/a");
        store.set_incompatible_encryption("pool/a", true).unwrap();
        assert!(matches!(
            volume.open(true, false),
            Err(VolumeError::ReadOnlyViolation(_))
        ));
    }

    #[test]
    fn test_first_open_waits_for_quiesce() {
        let store = MemoryStore::new();
        let (volume, _dir) = volume(&store, "pool/a");
        let volume = Arc::new(volume);
        let write = volume.quiesce.write_arc();

        let opener = {
            let volume = Arc::clone(&volume);
            thread::spawn(move || volume.open(false, false))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(volume.state.lock().open_count, 0);

        drop(write);
        opener.join().unwrap().unwrap();
        assert_eq!(volume.state.lock().open_count, 1);
    }

    #[test]
    fn test_ensure_wal_attaches_once() {
        let store = MemoryStore::new();
        let (volume, dir) = volume(&store, "pool/a");
        volume.open(true, false).unwrap();

        let read = volume.ensure_wal().unwrap();
        let first = volume.state.lock().wal.clone().unwrap();
        drop(read);
        drop(volume.ensure_wal().unwrap());
        let second = volume.state.lock().wal.clone().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(volume.state.lock().flags.contains(VolumeFlags::WRITTEN));

        let guid = store.guid("pool/a").unwrap();
        assert!(Wal::path_for(dir.path(), guid).exists());
    }

    #[test]
    fn test_quiesce_refs_drain() {
        let refs = Arc::new(SuspendRefs::new());
        let held = refs.acquire();
        let waiter = {
            let refs = Arc::clone(&refs);
            thread::spawn(move || refs.wait_until(0))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(held);
        waiter.join().unwrap();
        assert_eq!(refs.count(), 0);
    }
}
