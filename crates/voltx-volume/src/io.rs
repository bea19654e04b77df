//! I/O submission and the per-request pipeline
//!
//! A request becomes an [`IoContext`] that moves through
//!
//! ```text
//! Created ─admit─▶ Admitted ─range lock─▶ RangeLocked ─tx─▶ TransactionExecuting
//!                                                               │
//!                          Completed ◀──log commit── WalPending ◀┘ (sync writes/frees)
//! ```
//!
//! Each transition that may wait (admission, range lock grant, log commit)
//! resumes through the volume's [`Dispatcher`](voltx_common::Dispatcher).
//! The range lock is released as soon as the transaction is committed, so
//! log commits of overlapping writes do not serialize.

use crate::error::{VolumeError, VolumeResult};
use crate::intent;
use crate::rangelock::{RangeGuard, RangeMode};
use crate::volume::{QuiesceRef, Volume, VolumeFlags, VolumeState};
use bytes::Bytes;
use std::cell::Cell;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, trace};
use voltx_common::{SyncPolicy, UnmapPolicy, VOLUME_OBJECT, VolumeConfig};
use voltx_store::ObjectSession;
use voltx_wal::Wal;

/// Kind of request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Free,
}

/// A request against a volume
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub kind: IoKind,
    pub offset: u64,
    pub length: u64,
    /// Payload of a write
    pub data: Bytes,
    /// Complete only once the operation is durable in the intent log
    pub sync: bool,
}

impl IoRequest {
    #[must_use]
    pub const fn read(offset: u64, length: u64) -> Self {
        Self {
            kind: IoKind::Read,
            offset,
            length,
            data: Bytes::new(),
            sync: false,
        }
    }

    #[must_use]
    pub fn write(offset: u64, data: impl Into<Bytes>, sync: bool) -> Self {
        let data = data.into();
        Self {
            kind: IoKind::Write,
            offset,
            length: data.len() as u64,
            data,
            sync,
        }
    }

    #[must_use]
    pub const fn free(offset: u64, length: u64, sync: bool) -> Self {
        Self {
            kind: IoKind::Free,
            offset,
            length,
            data: Bytes::new(),
            sync,
        }
    }
}

/// Successful outcome of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOutcome {
    /// Data read, clipped to the volume size
    Read(Bytes),
    /// Bytes written
    Written(u64),
    /// Bytes freed
    Freed(u64),
}

/// Completion callback; invoked exactly once per submitted request
pub type Completion = Box<dyn FnOnce(VolumeResult<IoOutcome>) + Send + 'static>;

/// What happened to a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted and started
    Started,
    /// Queued behind the admission limit
    Deferred,
    /// Failed validation; the completion has already run with the error
    Rejected,
}

/// Pipeline position of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Created,
    Admitted,
    RangeLocked,
    TransactionExecuting,
    WalPending,
    Completed,
}

thread_local! {
    /// Set while this thread runs a completion callback
    static IN_COMPLETION: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is inside a completion callback. Such a
/// callback still holds its context's quiesce reference.
pub(crate) fn in_completion() -> bool {
    IN_COMPLETION.with(Cell::get)
}

fn run_completion(completion: Completion, result: VolumeResult<IoOutcome>) {
    let outer = IN_COMPLETION.replace(true);
    completion(result);
    IN_COMPLETION.set(outer);
}

/// One in-flight request
pub(crate) struct IoContext {
    volume: Weak<Volume>,
    request: IoRequest,
    pub(crate) state: IoState,
    session: Arc<dyn ObjectSession>,
    wal: Option<Arc<Wal>>,
    config: Arc<VolumeConfig>,
    block_size: u64,
    name: String,
    range: Option<RangeGuard>,
    completion: Option<Completion>,
    /// Released last, after the admission slot
    quiesce_ref: Option<QuiesceRef>,
    submitted: Instant,
}

impl Volume {
    /// Validate, admit and start `request`. `completion` runs exactly once.
    pub(crate) fn submit(
        self: &Arc<Self>,
        mut request: IoRequest,
        completion: Completion,
    ) -> Admission {
        let submitted = Instant::now();
        let mut quiesce = self.quiesce.read_arc();

        let ctx = loop {
            let mut state = self.state.lock();
            if let Err(e) = self.validate(&state, &mut request) {
                drop(state);
                drop(quiesce);
                return self.reject(completion, e);
            }

            if request.kind != IoKind::Read && state.wal.is_none() {
                drop(state);
                drop(quiesce);
                match self.ensure_wal() {
                    Ok(read) => {
                        quiesce = read;
                        // State may have changed while unlocked.
                        continue;
                    }
                    Err(e) => return self.reject(completion, e),
                }
            }

            let Some(session) = state.session.clone() else {
                drop(state);
                drop(quiesce);
                return self.reject(completion, VolumeError::Closed(self.name()));
            };

            let ctx = IoContext {
                volume: Arc::downgrade(self),
                request,
                state: IoState::Created,
                session,
                wal: state.wal.clone(),
                config: Arc::clone(&self.config),
                block_size: state.block_size,
                name: self.name(),
                range: None,
                completion: Some(completion),
                quiesce_ref: Some(self.refs.acquire()),
                submitted,
            };
            match self.admit(&mut state, ctx) {
                Some(ctx) => break ctx,
                None => return Admission::Deferred,
            }
        };
        drop(quiesce);

        self.dispatcher.dispatch(move || ctx.start());
        Admission::Started
    }

    fn reject(&self, completion: Completion, err: VolumeError) -> Admission {
        debug!("Rejected I/O on {}: {}", self.name(), err);
        self.stats.record_error();
        completion(Err(err));
        Admission::Rejected
    }

    /// Check `request` against the volume, clipping reads to its size
    fn validate(&self, state: &VolumeState, request: &mut IoRequest) -> VolumeResult<()> {
        if state.removed {
            return Err(VolumeError::NotFound(self.name()));
        }
        if state.open_count == 0 || state.session.is_none() {
            return Err(VolumeError::Closed(self.name()));
        }
        if request.kind != IoKind::Read && state.flags.contains(VolumeFlags::RDONLY) {
            return Err(VolumeError::ReadOnlyViolation(self.name()));
        }
        if request.kind == IoKind::Free && self.config.unmap == UnmapPolicy::Disabled {
            return Err(VolumeError::Unsupported(format!(
                "unmap is disabled on {}",
                self.name()
            )));
        }

        match request.kind {
            IoKind::Read => {
                request.length = request.length.min(state.size.saturating_sub(request.offset));
            }
            IoKind::Write | IoKind::Free => {
                let fits = request
                    .offset
                    .checked_add(request.length)
                    .is_some_and(|end| end <= state.size);
                if !fits {
                    return Err(VolumeError::OutOfRange {
                        offset: request.offset,
                        length: request.length,
                        size: state.size,
                    });
                }
            }
        }
        Ok(())
    }

    /// Take an admission slot for `ctx`, or queue it. Returns the context
    /// when it may start now.
    fn admit(&self, state: &mut VolumeState, mut ctx: IoContext) -> Option<IoContext> {
        if state.active_contexts < self.config.effective_admission_limit() {
            state.active_contexts += 1;
            ctx.state = IoState::Admitted;
            return Some(ctx);
        }
        trace!(
            "Deferred {:?} [{}, +{}) on {}: {} active, {} queued",
            ctx.request.kind,
            ctx.request.offset,
            ctx.request.length,
            ctx.name,
            state.active_contexts,
            state.deferred.len()
        );
        self.stats.record_deferred();
        state.deferred.push_back(ctx);
        None
    }

    /// Hand a finished context's slot to the oldest deferred context, or
    /// give it back
    fn release_slot(&self) {
        let next = {
            let mut state = self.state.lock();
            if let Some(mut ctx) = state.deferred.pop_front() {
                ctx.state = IoState::Admitted;
                Some(ctx)
            } else {
                state.active_contexts = state.active_contexts.saturating_sub(1);
                None
            }
        };
        if let Some(ctx) = next {
            self.dispatcher.dispatch(move || ctx.start());
        }
    }
}

impl IoContext {
    fn start(self) {
        let Some(volume) = self.volume.upgrade() else {
            let name = self.name.clone();
            self.complete(Err(VolumeError::Closed(name)));
            return;
        };
        let mode = if self.request.kind == IoKind::Read {
            RangeMode::Reader
        } else {
            RangeMode::Writer
        };
        let dispatcher = volume.dispatcher.clone();
        let (offset, length) = (self.request.offset, self.request.length);
        volume
            .rangelock
            .try_enter_async(offset, length, mode, move |guard| {
                let mut ctx = self;
                ctx.range = Some(guard);
                ctx.state = IoState::RangeLocked;
                dispatcher.dispatch(move || ctx.execute());
            });
    }

    fn execute(mut self) {
        self.state = IoState::TransactionExecuting;
        let result = self.recheck_bounds().and_then(|()| match self.request.kind {
            IoKind::Read => self.execute_read(),
            IoKind::Write => self.execute_write(),
            IoKind::Free => self.execute_free(),
        });
        self.range = None;

        match result {
            Ok(outcome) if self.needs_log_commit() => self.commit_log(outcome),
            result => self.complete(result),
        }
    }

    /// Validate against the size at grant time. The volume may have shrunk
    /// while the context was deferred or queued for its range; a resize
    /// publishes the new size before it locks the freed tail.
    fn recheck_bounds(&mut self) -> VolumeResult<()> {
        let Some(volume) = self.volume.upgrade() else {
            return Err(VolumeError::Closed(self.name.clone()));
        };
        let size = volume.state.lock().size;
        match self.request.kind {
            IoKind::Read => {
                self.request.length = self.request.length.min(size.saturating_sub(self.request.offset));
                Ok(())
            }
            IoKind::Write | IoKind::Free => {
                let fits = self
                    .request
                    .offset
                    .checked_add(self.request.length)
                    .is_some_and(|end| end <= size);
                if fits {
                    Ok(())
                } else {
                    Err(VolumeError::OutOfRange {
                        offset: self.request.offset,
                        length: self.request.length,
                        size,
                    })
                }
            }
        }
    }

    fn execute_read(&self) -> VolumeResult<IoOutcome> {
        let tx = self.session.begin_tx()?;
        let data = tx.read(VOLUME_OBJECT, self.request.offset, self.request.length);
        tx.abort();
        Ok(IoOutcome::Read(data?))
    }

    fn execute_write(&self) -> VolumeResult<IoOutcome> {
        let mut tx = self.session.begin_tx()?;
        if let Err(e) = tx.write(VOLUME_OBJECT, self.request.offset, &self.request.data) {
            tx.abort();
            return Err(e.into());
        }
        let intent = self.wal.as_ref().map(|_| {
            intent::plan_write(
                tx.as_ref(),
                &self.config.intent_log,
                self.block_size,
                self.request.offset,
                self.request.length,
                self.sync_requested(),
            )
        });
        tx.commit()?;
        // Still under the range lock, so records of overlapping writes keep
        // their commit order.
        if let (Some(wal), Some(intent)) = (&self.wal, intent) {
            intent.append(wal)?;
        }
        Ok(IoOutcome::Written(self.request.length))
    }

    fn execute_free(&self) -> VolumeResult<IoOutcome> {
        let mut tx = self.session.begin_tx()?;
        if let Err(e) = tx.free(VOLUME_OBJECT, self.request.offset, self.request.length) {
            tx.abort();
            return Err(e.into());
        }
        let txg = tx.commit()?;
        if let Some(wal) = &self.wal {
            wal.log_truncate(txg, self.request.offset, self.request.length)?;
        }
        Ok(IoOutcome::Freed(self.request.length))
    }

    fn sync_requested(&self) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Standard => self.request.sync,
            SyncPolicy::Always => true,
            SyncPolicy::Disabled => false,
        }
    }

    fn needs_log_commit(&self) -> bool {
        self.request.kind != IoKind::Read && self.sync_requested() && self.wal.is_some()
    }

    fn commit_log(mut self, outcome: IoOutcome) {
        let Some(wal) = self.wal.clone() else {
            self.complete(Ok(outcome));
            return;
        };
        self.state = IoState::WalPending;
        let Some(volume) = self.volume.upgrade() else {
            let name = self.name.clone();
            self.complete(Err(VolumeError::Closed(name)));
            return;
        };
        let dispatcher = volume.dispatcher.clone();
        drop(volume);
        wal.commit_async(&dispatcher, move |result| {
            if result.is_ok()
                && let Some(volume) = self.volume.upgrade()
            {
                volume.stats.record_log_commit();
            }
            self.complete(result.map(|()| outcome).map_err(VolumeError::from));
        });
    }

    /// Report the outcome, then release the admission slot and finally the
    /// quiesce reference
    fn complete(mut self, result: VolumeResult<IoOutcome>) {
        self.state = IoState::Completed;
        self.range = None;
        let volume = self.volume.upgrade();

        if let Some(volume) = &volume {
            let latency_us =
                u64::try_from(self.submitted.elapsed().as_micros()).unwrap_or(u64::MAX);
            match &result {
                Ok(IoOutcome::Read(data)) => {
                    volume.stats.record_read(data.len() as u64, latency_us);
                }
                Ok(IoOutcome::Written(bytes)) => volume.stats.record_write(*bytes, latency_us),
                Ok(IoOutcome::Freed(bytes)) => volume.stats.record_free(*bytes),
                Err(_) => volume.stats.record_error(),
            }
        }
        if let Err(e) = &result {
            debug!(
                "{:?} [{}, +{}) on {} failed: {}",
                self.request.kind, self.request.offset, self.request.length, self.name, e
            );
        }

        if let Some(completion) = self.completion.take() {
            run_completion(completion, result);
        }
        if let Some(volume) = volume {
            volume.release_slot();
        }
        self.quiesce_ref = None;
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            error!(
                "{:?} [{}, +{}) on {} dropped in state {:?}",
                self.request.kind, self.request.offset, self.request.length, self.name, self.state
            );
            run_completion(
                completion,
                Err(VolumeError::Interrupted(format!(
                    "I/O on {} abandoned",
                    self.name
                ))),
            );
        }
    }
}
