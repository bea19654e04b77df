//! Byte-range reader/writer lock
//!
//! Grants locks over `[offset, offset + length)` of a volume. Writers
//! conflict with every overlapping range; readers only with overlapping
//! writers. Zero-length ranges never conflict.
//!
//! Waiters are queued in arrival order. A waiter is granted only when it
//! conflicts neither with a granted range nor with any waiter queued ahead
//! of it, so a stream of readers cannot starve a writer and waiters unblocked
//! by the same release are served first come, first served.
//!
//! Grant callbacks always run with the internal mutex released.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// Shared
    Reader,
    /// Exclusive
    Writer,
}

type GrantFn = Box<dyn FnOnce(RangeGuard) + Send>;

#[derive(Debug, Clone, Copy)]
struct Span {
    offset: u64,
    end: u64,
    mode: RangeMode,
}

impl Span {
    fn new(offset: u64, length: u64, mode: RangeMode) -> Self {
        Self {
            offset,
            end: offset.saturating_add(length),
            mode,
        }
    }

    const fn conflicts(&self, other: &Self) -> bool {
        let overlaps = self.offset < self.end
            && other.offset < other.end
            && self.offset < other.end
            && other.offset < self.end;
        overlaps && !matches!((self.mode, other.mode), (RangeMode::Reader, RangeMode::Reader))
    }
}

struct Waiter {
    id: u64,
    span: Span,
    on_granted: GrantFn,
}

#[derive(Default)]
struct RangeState {
    granted: Vec<(u64, Span)>,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

impl RangeState {
    fn conflicts_with_granted(&self, span: &Span) -> bool {
        self.granted.iter().any(|(_, g)| g.conflicts(span))
    }
}

struct RangeInner {
    state: Mutex<RangeState>,
}

/// Range lock manager of one volume
#[derive(Clone)]
pub struct RangeLock {
    inner: Arc<RangeInner>,
}

impl RangeLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RangeInner {
                state: Mutex::new(RangeState::default()),
            }),
        }
    }

    /// Lock `[offset, offset + length)`, blocking until granted
    #[must_use]
    pub fn enter(&self, offset: u64, length: u64, mode: RangeMode) -> RangeGuard {
        let slot = Arc::new((Mutex::new(None), Condvar::new()));
        let grant = Arc::clone(&slot);
        if let Some(guard) = self.try_enter(offset, length, mode, move |guard| {
            *grant.0.lock() = Some(guard);
            grant.1.notify_one();
        }) {
            return guard;
        }

        let (granted, cv) = &*slot;
        let mut granted = granted.lock();
        loop {
            if let Some(guard) = granted.take() {
                return guard;
            }
            cv.wait(&mut granted);
        }
    }

    /// Lock `[offset, offset + length)` without blocking.
    ///
    /// When the range is free the guard is returned directly and
    /// `on_granted` is dropped unused. Otherwise the request is queued,
    /// `None` is returned, and `on_granted` later receives the guard on the
    /// thread that released the last conflicting range.
    pub fn try_enter<F>(
        &self,
        offset: u64,
        length: u64,
        mode: RangeMode,
        on_granted: F,
    ) -> Option<RangeGuard>
    where
        F: FnOnce(RangeGuard) + Send + 'static,
    {
        self.acquire(Span::new(offset, length, mode), Box::new(on_granted))
            .map(|(_, guard)| guard)
    }

    /// Lock with a continuation that runs exactly once: synchronously when
    /// the range is free, otherwise on the thread that releases the last
    /// conflicting range
    pub fn try_enter_async<F>(&self, offset: u64, length: u64, mode: RangeMode, on_granted: F)
    where
        F: FnOnce(RangeGuard) + Send + 'static,
    {
        if let Some((on_granted, guard)) =
            self.acquire(Span::new(offset, length, mode), Box::new(on_granted))
        {
            on_granted(guard);
        }
    }

    /// Grant `span` now, handing the continuation back, or queue it
    fn acquire(&self, span: Span, on_granted: GrantFn) -> Option<(GrantFn, RangeGuard)> {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let blocked = state.conflicts_with_granted(&span)
            || state.waiters.iter().any(|w| w.span.conflicts(&span));
        if blocked {
            trace!(
                "Range [{}, {}) {:?} queued behind {} waiters",
                span.offset,
                span.end,
                span.mode,
                state.waiters.len()
            );
            state.waiters.push_back(Waiter {
                id,
                span,
                on_granted,
            });
            return None;
        }

        state.granted.push((id, span));
        Some((on_granted, self.guard(id, span)))
    }

    fn guard(&self, id: u64, span: Span) -> RangeGuard {
        RangeGuard {
            lock: self.clone(),
            id,
            offset: span.offset,
            end: span.end,
            mode: span.mode,
        }
    }

    fn release(&self, id: u64) {
        let grants: Vec<(GrantFn, RangeGuard)> = {
            let mut state = self.inner.state.lock();
            state.granted.retain(|(gid, _)| *gid != id);

            let mut grants = Vec::new();
            let mut still_waiting: VecDeque<Waiter> = VecDeque::with_capacity(state.waiters.len());
            while let Some(waiter) = state.waiters.pop_front() {
                let blocked = state.conflicts_with_granted(&waiter.span)
                    || still_waiting.iter().any(|w| w.span.conflicts(&waiter.span));
                if blocked {
                    still_waiting.push_back(waiter);
                } else {
                    state.granted.push((waiter.id, waiter.span));
                    let guard = self.guard(waiter.id, waiter.span);
                    grants.push((waiter.on_granted, guard));
                }
            }
            state.waiters = still_waiting;
            grants
        };

        for (on_granted, guard) in grants {
            on_granted(guard);
        }
    }

    /// Number of granted ranges
    #[must_use]
    pub fn granted(&self) -> usize {
        self.inner.state.lock().granted.len()
    }

    /// Number of queued requests
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }
}

impl Default for RangeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RangeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeLock")
            .field("granted", &self.granted())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// A granted range; released on drop
pub struct RangeGuard {
    lock: RangeLock,
    id: u64,
    offset: u64,
    end: u64,
    mode: RangeMode,
}

impl RangeGuard {
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.end - self.offset
    }

    #[must_use]
    pub const fn mode(&self) -> RangeMode {
        self.mode
    }
}

impl fmt::Debug for RangeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RangeGuard([{}, {}) {:?})", self.offset, self.end, self.mode)
    }
}

impl Drop for RangeGuard {
    fn drop(&mut self) {
        self.lock.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_readers_share() {
        let lock = RangeLock::new();
        let a = lock.enter(0, 100, RangeMode::Reader);
        let b = lock.enter(50, 100, RangeMode::Reader);
        assert_eq!(lock.granted(), 2);
        drop((a, b));
        assert_eq!(lock.granted(), 0);
    }

    #[test]
    fn test_disjoint_writers_proceed() {
        let lock = RangeLock::new();
        let _a = lock.enter(0, 4096, RangeMode::Writer);
        let _b = lock.enter(4096, 4096, RangeMode::Writer);
        assert_eq!(lock.granted(), 2);
    }

    #[test]
    fn test_zero_length_never_conflicts() {
        let lock = RangeLock::new();
        let _w = lock.enter(0, 4096, RangeMode::Writer);
        let z = lock.try_enter(100, 0, RangeMode::Writer, |_| {});
        assert!(z.is_some());
    }

    #[test]
    fn test_async_grant_on_release() {
        let lock = RangeLock::new();
        let writer = lock.enter(0, 100, RangeMode::Writer);
        let granted = Arc::new(AtomicUsize::new(0));
        let g = Arc::clone(&granted);
        let queued = lock.try_enter(10, 10, RangeMode::Reader, move |guard| {
            assert_eq!(guard.offset(), 10);
            g.fetch_add(1, Ordering::SeqCst);
        });
        assert!(queued.is_none());
        assert_eq!(lock.waiting(), 1);
        assert_eq!(granted.load(Ordering::SeqCst), 0);

        drop(writer);
        assert_eq!(granted.load(Ordering::SeqCst), 1);
        // The callback dropped its guard.
        assert_eq!(lock.granted(), 0);
    }

    #[test]
    fn test_waiters_granted_in_arrival_order() {
        let lock = RangeLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = Arc::new(Mutex::new(Vec::new()));
        let writer = lock.enter(0, 1000, RangeMode::Writer);

        for i in 0..3u64 {
            let (o, h) = (Arc::clone(&order), Arc::clone(&held));
            lock.try_enter_async(i * 10, 10, RangeMode::Writer, move |guard| {
                o.lock().push(i);
                h.lock().push(guard);
            });
        }
        assert_eq!(lock.waiting(), 3);
        drop(writer);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(lock.granted(), 3);
    }

    #[test]
    fn test_reader_queues_behind_waiting_writer() {
        let lock = RangeLock::new();
        let reader = lock.enter(0, 100, RangeMode::Reader);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        lock.try_enter_async(0, 100, RangeMode::Writer, move |_| o.lock().push("writer"));
        let o = Arc::clone(&order);
        lock.try_enter_async(0, 100, RangeMode::Reader, move |_| o.lock().push("reader"));
        assert!(order.lock().is_empty());

        drop(reader);
        assert_eq!(*order.lock(), vec!["writer", "reader"]);
    }

    #[test]
    fn test_try_enter_async_runs_immediately_when_free() {
        let lock = RangeLock::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        lock.try_enter_async(0, 10, RangeMode::Writer, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_overlapping_writers_serialize() {
        let lock = RangeLock::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lock = lock.clone();
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    let _guard = lock.enter(i * 10, 100, RangeMode::Writer);
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.granted(), 0);
    }
}
