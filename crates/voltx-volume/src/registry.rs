//! Name-indexed registry of volumes
//!
//! Volumes are kept in fixed hash buckets keyed by [`name_hash`]. Lookups
//! never block on a volume while holding the registry lock: the volume is
//! cloned out first, its locks are taken afterwards, and the name is
//! re-checked before it is returned.

use crate::error::{VolumeError, VolumeResult};
use crate::volume::{QuiesceRead, QuiesceWrite, StateGuard, Volume};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};
use voltx_common::name_hash;

const HASH_BUCKETS: usize = 1024;

/// Quiesce lock taken by a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    None,
    Read,
    Write,
}

pub(crate) enum QuiesceHeld {
    None,
    Read(QuiesceRead),
    Write(QuiesceWrite),
}

/// A volume returned with its state lock, and optionally its quiesce lock,
/// held. Fields drop in reverse acquisition order.
pub(crate) struct LockedVolume {
    pub state: StateGuard,
    pub quiesce: QuiesceHeld,
    pub volume: Arc<Volume>,
}

struct RegistryInner {
    buckets: Vec<Vec<Arc<Volume>>>,
    count: usize,
}

impl RegistryInner {
    fn bucket(&self, hash: u64) -> &Vec<Arc<Volume>> {
        &self.buckets[bucket_index(hash)]
    }

    fn find(&self, name: &str) -> Option<Arc<Volume>> {
        let hash = name_hash(name);
        self.bucket(hash)
            .iter()
            .find(|v| v.matches(hash, name))
            .cloned()
    }

    fn unlink(&mut self, volume: &Arc<Volume>, hash: u64) {
        let bucket = &mut self.buckets[bucket_index(hash)];
        let before = bucket.len();
        bucket.retain(|v| !Arc::ptr_eq(v, volume));
        self.count -= before - bucket.len();
    }

    fn link(&mut self, volume: Arc<Volume>, hash: u64) {
        self.buckets[bucket_index(hash)].push(volume);
        self.count += 1;
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn bucket_index(hash: u64) -> usize {
    (hash % HASH_BUCKETS as u64) as usize
}

/// Registry of volumes by name
pub(crate) struct VolumeRegistry {
    inner: RwLock<RegistryInner>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                buckets: (0..HASH_BUCKETS).map(|_| Vec::new()).collect(),
                count: 0,
            }),
        }
    }

    /// Add `volume`; fails if its name is taken
    pub fn insert(&self, volume: Arc<Volume>) -> VolumeResult<()> {
        let mut inner = self.inner.write();
        let identity = volume.identity.read().clone();
        if inner.find(&identity.name).is_some() {
            return Err(VolumeError::Exists(identity.name));
        }
        inner.link(volume, identity.hash);
        debug!("Registered volume {}", identity.name);
        Ok(())
    }

    /// Volume registered under `name`, without taking any of its locks
    pub fn get(&self, name: &str) -> Option<Arc<Volume>> {
        self.inner.read().find(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Find `name` and lock it: quiesce lock per `mode`, then state lock
    pub fn find_by_name(&self, name: &str, mode: LockMode) -> Option<LockedVolume> {
        loop {
            let volume = self.get(name)?;

            let mut state = volume.state.lock_arc();
            let quiesce = match mode {
                LockMode::None => QuiesceHeld::None,
                LockMode::Read => {
                    if let Some(read) = volume.quiesce.try_read_arc() {
                        QuiesceHeld::Read(read)
                    } else {
                        drop(state);
                        let read = volume.quiesce.read_arc();
                        state = volume.state.lock_arc();
                        QuiesceHeld::Read(read)
                    }
                }
                LockMode::Write => {
                    if let Some(write) = volume.quiesce.try_write_arc() {
                        QuiesceHeld::Write(write)
                    } else {
                        drop(state);
                        let write = volume.quiesce.write_arc();
                        state = volume.state.lock_arc();
                        QuiesceHeld::Write(write)
                    }
                }
            };

            // Removed or renamed while unlocked: look again.
            if state.removed || !volume.matches(name_hash(name), name) {
                continue;
            }
            return Some(LockedVolume {
                state,
                quiesce,
                volume,
            });
        }
    }

    /// Unregister `name`. Fails with `Busy` while it is open or referenced.
    pub fn remove(&self, name: &str) -> VolumeResult<Arc<Volume>> {
        let mut inner = self.inner.write();
        let volume = inner
            .find(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
        let mut state = volume.state.lock();
        if state.open_count > 0 || volume.refs.count() > 0 {
            return Err(VolumeError::Busy(name.to_string()));
        }
        state.removed = true;
        drop(state);
        inner.unlink(&volume, name_hash(name));
        info!("Removed volume {}", name);
        Ok(volume)
    }

    /// Rename `old`, and every snapshot volume of it, to `new`
    pub fn rename(&self, old: &str, new: &str) -> VolumeResult<()> {
        let mut inner = self.inner.write();
        if inner.find(new).is_some() {
            return Err(VolumeError::Exists(new.to_string()));
        }
        let snapshot_prefix = format!("{old}@");
        let moved: Vec<Arc<Volume>> = inner
            .buckets
            .iter()
            .flatten()
            .filter(|v| {
                let identity = v.identity.read();
                identity.name == old || identity.name.starts_with(&snapshot_prefix)
            })
            .cloned()
            .collect();
        if !moved.iter().any(|v| v.matches(name_hash(old), old)) {
            return Err(VolumeError::NotFound(old.to_string()));
        }

        for volume in moved {
            let (from, hash) = {
                let identity = volume.identity.read();
                (identity.name.clone(), identity.hash)
            };
            let to = format!("{new}{}", &from[old.len()..]);
            inner.unlink(&volume, hash);
            let to_hash = name_hash(&to);
            *volume.identity.write() = crate::volume::Identity {
                name: to.clone(),
                hash: to_hash,
            };
            inner.link(volume, to_hash);
            info!("Renamed volume {} to {}", from, to);
        }
        Ok(())
    }

    /// Every registered volume
    pub fn volumes(&self) -> Vec<Arc<Volume>> {
        self.inner.read().buckets.iter().flatten().cloned().collect()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.volumes().iter().map(|v| v.name()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use voltx_common::{Dispatcher, VolumeConfig};
    use voltx_store::{MemoryStore, ObjectStore};

    fn volume(store: &MemoryStore, name: &str) -> Arc<Volume> {
        Arc::new(Volume::new(
            name,
            1 << 20,
            4096,
            Arc::new(store.clone()),
            Arc::new(VolumeConfig::default()),
            Dispatcher::Inline,
        ))
    }

    #[test]
    fn test_insert_and_find() {
        let store = MemoryStore::new();
        let registry = VolumeRegistry::new();
        registry.insert(volume(&store, "pool/a")).unwrap();
        registry.insert(volume(&store, "pool/b")).unwrap();
        assert!(matches!(
            registry.insert(volume(&store, "pool/a")),
            Err(VolumeError::Exists(_))
        ));
        assert_eq!(registry.len(), 2);

        let locked = registry.find_by_name("pool/b", LockMode::Read).unwrap();
        assert_eq!(locked.volume.name(), "pool/b");
        assert!(matches!(locked.quiesce, QuiesceHeld::Read(_)));
        drop(locked);
        assert!(registry.find_by_name("pool/c", LockMode::None).is_none());
    }

    #[test]
    fn test_remove_busy_while_open() {
        let store = MemoryStore::new();
        store.create_volume("pool/a", 1 << 20, 4096).unwrap();
        let registry = VolumeRegistry::new();
        let vol = volume(&store, "pool/a");
        registry.insert(Arc::clone(&vol)).unwrap();

        vol.open(false, false).unwrap();
        assert!(matches!(
            registry.remove("pool/a"),
            Err(VolumeError::Busy(_))
        ));
        vol.close().unwrap();
        registry.remove("pool/a").unwrap();
        assert!(!registry.contains("pool/a"));
        assert!(vol.state.lock().removed);
        assert!(matches!(
            vol.open(false, false),
            Err(VolumeError::NotFound(_))
        ));
    }

    #[test]
    fn test_rename_moves_snapshots() {
        let store = MemoryStore::new();
        let registry = VolumeRegistry::new();
        registry.insert(volume(&store, "pool/a")).unwrap();
        registry.insert(volume(&store, "pool/a@s1")).unwrap();
        registry.insert(volume(&store, "pool/ab")).unwrap();

        registry.rename("pool/a", "pool/z").unwrap();
        assert_eq!(registry.names(), vec!["pool/ab", "pool/z", "pool/z@s1"]);
        assert!(registry.find_by_name("pool/z@s1", LockMode::None).is_some());
        assert!(matches!(
            registry.rename("pool/missing", "pool/x"),
            Err(VolumeError::NotFound(_))
        ));
        assert!(matches!(
            registry.rename("pool/z", "pool/ab"),
            Err(VolumeError::Exists(_))
        ));
    }

    #[test]
    fn test_find_write_waits_for_readers() {
        let store = MemoryStore::new();
        let registry = Arc::new(VolumeRegistry::new());
        let vol = volume(&store, "pool/a");
        registry.insert(Arc::clone(&vol)).unwrap();
        let read = vol.quiesce.read_arc();

        let finder = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                registry
                    .find_by_name("pool/a", LockMode::Write)
                    .map(|locked| matches!(locked.quiesce, QuiesceHeld::Write(_)))
            })
        };
        thread::sleep(Duration::from_millis(30));
        // The finder dropped the state lock while waiting.
        assert!(vol.state.try_lock().is_some());
        drop(read);
        assert_eq!(finder.join().unwrap(), Some(true));
    }
}
