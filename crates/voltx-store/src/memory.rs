//! In-memory transactional object store
//!
//! Each dataset keeps two images: the committed (live) image that readers
//! see, and the synced image that survives [`MemoryStore::simulate_crash`].
//! Committed transactions are queued per txg until the txg is synced, at
//! which point they are applied to the synced image in commit order.
//!
//! A txg can only be synced once every transaction that joined it has
//! committed or aborted, mirroring the open/quiescing/syncing pipeline of a
//! copy-on-write pool.

use crate::{
    ObjectInfo, ObjectSession, ObjectStore, OpenMode, SpaceUsage, StoreError, StoreResult,
    Transaction, Txg,
};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};
use voltx_common::{SIZE_PROPERTY, VOLUME_OBJECT};

/// Default capacity per dataset: 1 TiB
const DEFAULT_CAPACITY: u64 = 1 << 40;

/// A change carried by a transaction
#[derive(Debug, Clone)]
enum Op {
    Write { object: u64, offset: u64, data: Bytes },
    Free { object: u64, offset: u64, length: u64 },
    SetProperty { key: String, value: u64 },
    SetBlockSize { object: u64, block_size: u64 },
}

/// Sparse contents of one object
#[derive(Debug, Clone)]
struct ObjectImage {
    block_size: u64,
    blocks: BTreeMap<u64, Bytes>,
}

impl ObjectImage {
    const fn new(block_size: u64) -> Self {
        Self {
            block_size,
            blocks: BTreeMap::new(),
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let bs = self.block_size;
        let mut pos = 0usize;
        while pos < data.len() {
            let abs = offset + pos as u64;
            let index = abs / bs;
            let within = (abs % bs) as usize;
            let n = (bs as usize - within).min(data.len() - pos);

            let mut block = self.blocks.get(&index).map_or_else(
                || BytesMut::zeroed(bs as usize),
                |b| BytesMut::from(&b[..]),
            );
            block[within..within + n].copy_from_slice(&data[pos..pos + n]);
            self.blocks.insert(index, block.freeze());
            pos += n;
        }
    }

    fn free(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let bs = self.block_size;
        let end = offset.saturating_add(length);
        let first = offset / bs;
        let last = (end - 1) / bs;

        let touched: Vec<u64> = self.blocks.range(first..=last).map(|(k, _)| *k).collect();
        for index in touched {
            let start = index * bs;
            let stop = start + bs;
            if offset <= start && end >= stop {
                self.blocks.remove(&index);
            } else if let Some(existing) = self.blocks.get(&index) {
                let lo = (offset.max(start) - start) as usize;
                let hi = (end.min(stop) - start) as usize;
                let mut block = BytesMut::from(&existing[..]);
                block[lo..hi].fill(0);
                self.blocks.insert(index, block.freeze());
            }
        }
    }

    /// Copy `[offset, offset + buf.len())` into a zero-initialised buffer
    fn read_into(&self, offset: u64, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        let bs = self.block_size;
        let end = offset + buf.len() as u64;
        for (index, block) in self.blocks.range(offset / bs..=(end - 1) / bs) {
            let start = index * bs;
            let lo = offset.max(start);
            let hi = end.min(start + bs);
            buf[(lo - offset) as usize..(hi - offset) as usize]
                .copy_from_slice(&block[(lo - start) as usize..(hi - start) as usize]);
        }
    }

    fn set_block_size(&mut self, block_size: u64) -> StoreResult<()> {
        if self.blocks.keys().any(|&index| index > 0) {
            return Err(StoreError::NotSupported(
                "object has data beyond its first block".to_string(),
            ));
        }
        if let Some(first) = self.blocks.remove(&0) {
            let mut block = BytesMut::zeroed(block_size as usize);
            let n = first.len().min(block_size as usize);
            block[..n].copy_from_slice(&first[..n]);
            self.blocks.insert(0, block.freeze());
        }
        self.block_size = block_size;
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.blocks.len() as u64 * self.block_size
    }
}

/// Objects and properties of a dataset at one point in time
#[derive(Debug, Clone, Default)]
struct Image {
    objects: HashMap<u64, ObjectImage>,
    properties: HashMap<String, u64>,
}

impl Image {
    fn object(&self, object: u64) -> StoreResult<&ObjectImage> {
        self.objects
            .get(&object)
            .ok_or_else(|| StoreError::InvalidArgument(format!("no such object: {object}")))
    }

    fn check(&self, op: &Op) -> StoreResult<()> {
        match op {
            Op::Write { object, .. } | Op::Free { object, .. } => self.object(*object).map(|_| ()),
            Op::SetBlockSize { object, .. } => {
                let image = self.object(*object)?;
                if image.blocks.keys().any(|&index| index > 0) {
                    return Err(StoreError::NotSupported(
                        "object has data beyond its first block".to_string(),
                    ));
                }
                Ok(())
            }
            Op::SetProperty { .. } => Ok(()),
        }
    }

    fn apply(&mut self, op: &Op) {
        match op {
            Op::Write {
                object,
                offset,
                data,
            } => {
                if let Some(image) = self.objects.get_mut(object) {
                    image.write(*offset, data);
                }
            }
            Op::Free {
                object,
                offset,
                length,
            } => {
                if let Some(image) = self.objects.get_mut(object) {
                    image.free(*offset, *length);
                }
            }
            Op::SetProperty { key, value } => {
                self.properties.insert(key.clone(), *value);
            }
            Op::SetBlockSize { object, block_size } => {
                if let Some(image) = self.objects.get_mut(object) {
                    // Checked before the transaction was queued.
                    let _ = image.set_block_size(*block_size);
                }
            }
        }
    }

    fn used_bytes(&self) -> u64 {
        self.objects.values().map(ObjectImage::used_bytes).sum()
    }
}

/// Mutable dataset state
#[derive(Debug)]
struct DatasetState {
    /// Committed state
    live: Image,
    /// Durable state
    synced: Image,
    /// Committed but unsynced transactions, in commit order
    pending: Vec<(Txg, Vec<Op>)>,
    /// Txg new transactions join
    open_txg: Txg,
    /// Highest durable txg
    synced_txg: Txg,
    /// Open transactions per txg
    holds: BTreeMap<Txg, usize>,
    /// Whether a session owns the dataset
    owned: bool,
    /// Bumped by crash simulation; older sessions become invalid
    generation: u64,
    /// Blocks that fail verification on read
    corrupt: HashSet<(u64, u64)>,
    /// Number of upcoming commits to fail
    failing_commits: usize,
}

impl DatasetState {
    fn new(image: Image) -> Self {
        Self {
            live: image.clone(),
            synced: image,
            pending: Vec::new(),
            open_txg: 1,
            synced_txg: 0,
            holds: BTreeMap::new(),
            owned: false,
            generation: 0,
            corrupt: HashSet::new(),
            failing_commits: 0,
        }
    }

    fn release_hold(&mut self, txg: Txg) {
        if let Some(count) = self.holds.get_mut(&txg) {
            *count -= 1;
            if *count == 0 {
                self.holds.remove(&txg);
            }
        }
    }

    fn sync_through(&mut self, target: Txg) {
        let (ready, rest): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|(txg, _)| *txg <= target);
        for (_, ops) in &ready {
            for op in ops {
                self.synced.apply(op);
            }
        }
        self.pending = rest;
        self.synced_txg = target;
    }
}

/// A dataset
#[derive(Debug)]
struct Dataset {
    guid: u64,
    name: RwLock<String>,
    snapshot: bool,
    read_only: AtomicBool,
    incompatible_encryption: AtomicBool,
    capacity: u64,
    state: Mutex<DatasetState>,
    synced_cv: Condvar,
}

impl Dataset {
    /// Close the open txg and wait for `target` (0 = all committed) to sync
    fn sync(&self, target: Txg) -> Txg {
        let mut state = self.state.lock();
        let target = if target == 0 { state.open_txg } else { target };
        if state.synced_txg >= target {
            return state.synced_txg;
        }
        if state.open_txg <= target {
            state.open_txg = target + 1;
        }
        while state.holds.range(..=target).next().is_some() {
            self.synced_cv.wait(&mut state);
        }
        if state.synced_txg < target {
            state.sync_through(target);
            debug!("Synced {} through txg {}", self.name.read(), target);
            self.synced_cv.notify_all();
        }
        state.synced_txg
    }

    fn space(&self) -> SpaceUsage {
        let used = self.state.lock().live.used_bytes();
        SpaceUsage {
            used,
            available: self.capacity.saturating_sub(used),
        }
    }
}

struct StoreInner {
    datasets: RwLock<HashMap<String, Arc<Dataset>>>,
    next_guid: AtomicU64,
    capacity: u64,
}

/// In-memory [`ObjectStore`]
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty store with a per-dataset capacity
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                datasets: RwLock::new(HashMap::new()),
                next_guid: AtomicU64::new(1),
                capacity,
            }),
        }
    }

    fn dataset(&self, name: &str) -> StoreResult<Arc<Dataset>> {
        self.inner
            .datasets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn insert_dataset(&self, name: &str, image: Image, snapshot: bool) -> StoreResult<()> {
        let mut datasets = self.inner.datasets.write();
        if datasets.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let dataset = Dataset {
            guid: self.inner.next_guid.fetch_add(1, Ordering::SeqCst),
            name: RwLock::new(name.to_string()),
            snapshot,
            read_only: AtomicBool::new(snapshot),
            incompatible_encryption: AtomicBool::new(false),
            capacity: self.inner.capacity,
            state: Mutex::new(DatasetState::new(image)),
            synced_cv: Condvar::new(),
        };
        datasets.insert(name.to_string(), Arc::new(dataset));
        Ok(())
    }

    /// Set the read-only property
    pub fn set_read_only(&self, name: &str, read_only: bool) -> StoreResult<()> {
        self.dataset(name)?
            .read_only
            .store(read_only, Ordering::SeqCst);
        Ok(())
    }

    /// Mark the dataset as using an unwritable encryption version
    pub fn set_incompatible_encryption(&self, name: &str, incompatible: bool) -> StoreResult<()> {
        self.dataset(name)?
            .incompatible_encryption
            .store(incompatible, Ordering::SeqCst);
        Ok(())
    }

    /// Fail the next `count` commits on the dataset
    pub fn fail_next_commits(&self, name: &str, count: usize) -> StoreResult<()> {
        self.dataset(name)?.state.lock().failing_commits = count;
        Ok(())
    }

    /// Make reads of the block containing `offset` fail verification
    pub fn corrupt_block(&self, name: &str, object: u64, offset: u64) -> StoreResult<()> {
        let dataset = self.dataset(name)?;
        let mut state = dataset.state.lock();
        let block_size = state.live.object(object)?.block_size;
        state.corrupt.insert((object, offset / block_size));
        Ok(())
    }

    /// Highest durable txg of a dataset
    pub fn synced_txg(&self, name: &str) -> StoreResult<Txg> {
        Ok(self.dataset(name)?.state.lock().synced_txg)
    }

    /// Lose everything not yet synced and invalidate open sessions
    pub fn simulate_crash(&self, name: &str) -> StoreResult<()> {
        let dataset = self.dataset(name)?;
        let mut state = dataset.state.lock();
        let lost = state.pending.len();
        state.live = state.synced.clone();
        state.pending.clear();
        state.holds.clear();
        state.owned = false;
        state.generation += 1;
        dataset.synced_cv.notify_all();
        info!(
            "Simulated crash of {}: dropped {} unsynced transactions, synced txg {}",
            name, lost, state.synced_txg
        );
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryStore {
    fn create_volume(&self, name: &str, size: u64, block_size: u64) -> StoreResult<()> {
        if block_size == 0 {
            return Err(StoreError::InvalidArgument(
                "block size must be positive".to_string(),
            ));
        }
        if name.contains('@') {
            return Err(StoreError::InvalidArgument(format!(
                "volume name may not name a snapshot: {name}"
            )));
        }
        let mut image = Image::default();
        image
            .objects
            .insert(VOLUME_OBJECT, ObjectImage::new(block_size));
        image.properties.insert(SIZE_PROPERTY.to_string(), size);
        self.insert_dataset(name, image, false)?;
        info!(
            "Created volume dataset {}: size={}, block_size={}",
            name, size, block_size
        );
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.datasets.read().contains_key(name)
    }

    fn guid(&self, name: &str) -> StoreResult<u64> {
        Ok(self.dataset(name)?.guid)
    }

    fn is_read_only(&self, name: &str) -> StoreResult<bool> {
        Ok(self.dataset(name)?.read_only.load(Ordering::SeqCst))
    }

    fn open(&self, name: &str, mode: OpenMode) -> StoreResult<Arc<dyn ObjectSession>> {
        let dataset = self.dataset(name)?;
        if mode == OpenMode::ReadWrite && dataset.snapshot {
            return Err(StoreError::PermissionDenied(format!(
                "snapshot {name} cannot be opened for writing"
            )));
        }
        let generation = {
            let mut state = dataset.state.lock();
            if state.owned {
                return Err(StoreError::Busy(name.to_string()));
            }
            state.owned = true;
            state.generation
        };
        debug!("Opened dataset {} ({:?})", name, mode);
        Ok(Arc::new(MemorySession {
            dataset,
            mode,
            generation,
            closed: AtomicBool::new(false),
        }))
    }

    fn space(&self, name: &str) -> StoreResult<SpaceUsage> {
        Ok(self.dataset(name)?.space())
    }

    fn snapshot(&self, name: &str, snap: &str) -> StoreResult<()> {
        let dataset = self.dataset(name)?;
        dataset.sync(0);
        let image = dataset.state.lock().synced.clone();
        self.insert_dataset(&format!("{name}@{snap}"), image, true)?;
        info!("Created snapshot {}@{}", name, snap);
        Ok(())
    }

    fn rollback(&self, name: &str, snap: &str) -> StoreResult<()> {
        let dataset = self.dataset(name)?;
        let snapshot = self.dataset(&format!("{name}@{snap}"))?;
        let image = snapshot.state.lock().synced.clone();

        let mut state = dataset.state.lock();
        if state.owned {
            return Err(StoreError::Busy(name.to_string()));
        }
        state.live = image.clone();
        state.synced = image;
        state.pending.clear();
        state.synced_txg = state.open_txg;
        state.open_txg += 1;
        info!("Rolled back {} to snapshot {}", name, snap);
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> StoreResult<()> {
        let mut datasets = self.inner.datasets.write();
        if !datasets.contains_key(old) {
            return Err(StoreError::NotFound(old.to_string()));
        }
        if datasets.contains_key(new) {
            return Err(StoreError::AlreadyExists(new.to_string()));
        }
        let snapshot_prefix = format!("{old}@");
        let moved: Vec<String> = datasets
            .keys()
            .filter(|key| *key == old || key.starts_with(&snapshot_prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(dataset) = datasets.remove(&key) {
                let renamed = format!("{new}{}", &key[old.len()..]);
                *dataset.name.write() = renamed.clone();
                datasets.insert(renamed, dataset);
            }
        }
        info!("Renamed dataset {} to {}", old, new);
        Ok(())
    }

    fn destroy(&self, name: &str) -> StoreResult<()> {
        let mut datasets = self.inner.datasets.write();
        let dataset = datasets
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if dataset.state.lock().owned {
            return Err(StoreError::Busy(name.to_string()));
        }
        let snapshot_prefix = format!("{name}@");
        datasets.retain(|key, _| key != name && !key.starts_with(&snapshot_prefix));
        info!("Destroyed dataset {}", name);
        Ok(())
    }
}

/// Session owning a [`Dataset`]
struct MemorySession {
    dataset: Arc<Dataset>,
    mode: OpenMode,
    generation: u64,
    closed: AtomicBool,
}

impl MemorySession {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst)
            || self.dataset.state.lock().generation != self.generation
        {
            return Err(StoreError::Closed(self.dataset.name.read().clone()));
        }
        Ok(())
    }

    fn begin_local_tx(&self) -> StoreResult<MemoryTransaction> {
        self.check_open()?;
        let txg = {
            let mut state = self.dataset.state.lock();
            let txg = state.open_txg;
            *state.holds.entry(txg).or_insert(0) += 1;
            txg
        };
        Ok(MemoryTransaction {
            dataset: Arc::clone(&self.dataset),
            txg,
            writable: self.mode == OpenMode::ReadWrite,
            ops: Vec::new(),
            finished: false,
        })
    }
}

impl ObjectSession for MemorySession {
    fn name(&self) -> String {
        self.dataset.name.read().clone()
    }

    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn is_snapshot(&self) -> bool {
        self.dataset.snapshot
    }

    fn incompatible_encryption(&self) -> bool {
        self.dataset.incompatible_encryption.load(Ordering::SeqCst)
    }

    fn begin_tx(&self) -> StoreResult<Box<dyn Transaction>> {
        Ok(Box::new(self.begin_local_tx()?))
    }

    fn free_range(&self, object: u64, offset: u64, length: u64) -> StoreResult<()> {
        let mut tx = self.begin_local_tx()?;
        tx.free(object, offset, length)?;
        Box::new(tx).commit().map(|_| ())
    }

    fn object_info(&self, object: u64) -> StoreResult<ObjectInfo> {
        self.check_open()?;
        let state = self.dataset.state.lock();
        let image = state.live.object(object)?;
        Ok(ObjectInfo {
            block_size: image.block_size,
            allocated_blocks: image.blocks.len() as u64,
            max_block: image.blocks.keys().next_back().copied(),
        })
    }

    fn get_property(&self, key: &str) -> StoreResult<Option<u64>> {
        self.check_open()?;
        Ok(self.dataset.state.lock().live.properties.get(key).copied())
    }

    fn synced_txg(&self) -> Txg {
        self.dataset.state.lock().synced_txg
    }

    fn wait_synced(&self, txg: Txg) -> StoreResult<Txg> {
        self.check_open()?;
        Ok(self.dataset.sync(txg))
    }

    fn space(&self) -> SpaceUsage {
        self.dataset.space()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.dataset.state.lock();
            if state.generation == self.generation {
                state.owned = false;
            }
            debug!("Closed dataset {}", self.dataset.name.read());
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Transaction against a [`Dataset`]
struct MemoryTransaction {
    dataset: Arc<Dataset>,
    txg: Txg,
    writable: bool,
    ops: Vec<Op>,
    finished: bool,
}

impl MemoryTransaction {
    fn check_writable(&self) -> StoreResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StoreError::PermissionDenied(format!(
                "{} is open read-only",
                self.dataset.name.read()
            )))
        }
    }
}

impl Transaction for MemoryTransaction {
    fn txg(&self) -> Txg {
        self.txg
    }

    fn read(&self, object: u64, offset: u64, length: u64) -> StoreResult<Bytes> {
        let len = usize::try_from(length)
            .map_err(|_| StoreError::InvalidArgument(format!("read too large: {length}")))?;
        let mut buf = vec![0u8; len];
        if len == 0 {
            return Ok(Bytes::new());
        }
        let end = offset + length;

        {
            let state = self.dataset.state.lock();
            let image = state.live.object(object)?;
            let bs = image.block_size;
            for index in offset / bs..=(end - 1) / bs {
                if state.corrupt.contains(&(object, index)) {
                    return Err(StoreError::ChecksumMismatch {
                        object,
                        offset: index * bs,
                    });
                }
            }
            image.read_into(offset, &mut buf);
        }

        // Overlay this transaction's own changes.
        for op in &self.ops {
            match op {
                Op::Write {
                    object: o,
                    offset: w_off,
                    data,
                } if *o == object => {
                    let w_end = w_off + data.len() as u64;
                    let lo = offset.max(*w_off);
                    let hi = end.min(w_end);
                    if lo < hi {
                        buf[(lo - offset) as usize..(hi - offset) as usize]
                            .copy_from_slice(&data[(lo - w_off) as usize..(hi - w_off) as usize]);
                    }
                }
                Op::Free {
                    object: o,
                    offset: f_off,
                    length: f_len,
                } if *o == object => {
                    let lo = offset.max(*f_off);
                    let hi = end.min(f_off.saturating_add(*f_len));
                    if lo < hi {
                        buf[(lo - offset) as usize..(hi - offset) as usize].fill(0);
                    }
                }
                _ => {}
            }
        }
        Ok(Bytes::from(buf))
    }

    fn write(&mut self, object: u64, offset: u64, data: &[u8]) -> StoreResult<()> {
        self.check_writable()?;
        self.ops.push(Op::Write {
            object,
            offset,
            data: Bytes::copy_from_slice(data),
        });
        Ok(())
    }

    fn free(&mut self, object: u64, offset: u64, length: u64) -> StoreResult<()> {
        self.check_writable()?;
        self.ops.push(Op::Free {
            object,
            offset,
            length,
        });
        Ok(())
    }

    fn set_property(&mut self, key: &str, value: u64) -> StoreResult<()> {
        self.check_writable()?;
        self.ops.push(Op::SetProperty {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    fn set_block_size(&mut self, object: u64, block_size: u64) -> StoreResult<()> {
        self.check_writable()?;
        self.ops.push(Op::SetBlockSize { object, block_size });
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> StoreResult<Txg> {
        let dataset = Arc::clone(&self.dataset);
        let mut state = dataset.state.lock();
        let ops = std::mem::take(&mut self.ops);

        let result = if state.failing_commits > 0 {
            state.failing_commits -= 1;
            Err(StoreError::Aborted("injected commit failure".to_string()))
        } else {
            let required: u64 = ops
                .iter()
                .map(|op| match op {
                    Op::Write { data, .. } => data.len() as u64,
                    _ => 0,
                })
                .sum();
            let available = dataset.capacity.saturating_sub(state.live.used_bytes());
            if required > available {
                Err(StoreError::NoSpace {
                    required,
                    available,
                })
            } else {
                ops.iter()
                    .try_for_each(|op| state.live.check(op))
                    .map(|()| {
                        for op in &ops {
                            state.live.apply(op);
                        }
                        let txg = self.txg;
                        state.pending.push((txg, ops));
                        txg
                    })
            }
        };

        state.release_hold(self.txg);
        self.finished = true;
        dataset.synced_cv.notify_all();
        result
    }

    fn abort(self: Box<Self>) {
        // Dropping releases the hold.
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.dataset.state.lock();
            state.release_hold(self.txg);
            self.dataset.synced_cv.notify_all();
        }
    }
}
