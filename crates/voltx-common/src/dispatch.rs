//! Continuation dispatch
//!
//! Every asynchronous hand-off in the volume layer (a deferred I/O being
//! admitted, a range lock being granted, a log commit finishing) resumes its
//! work through a [`Dispatcher`]. The policy decides where the continuation
//! runs:
//!
//! - [`Dispatcher::Inline`] runs it on the calling thread. Continuations
//!   dispatched while another inline continuation is running on the same
//!   thread are queued and drained in order by the outermost call, so chains
//!   of completions never grow the stack.
//! - [`Dispatcher::Runtime`] hands it to the blocking pool of a tokio
//!   runtime. Continuations may block on store transactions and log fsyncs,
//!   so the async worker threads are never used.

use std::cell::RefCell;
use std::collections::VecDeque;
use tracing::error;

/// A continuation
pub type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// Continuations queued behind the one currently running on this thread.
    /// `None` when no inline continuation is running.
    static PENDING: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

/// Scheduling policy for continuations
#[derive(Clone, Debug, Default)]
pub enum Dispatcher {
    /// Run on the calling thread (trampolined)
    #[default]
    Inline,
    /// Run on the blocking pool of a tokio runtime
    Runtime(tokio::runtime::Handle),
}

impl Dispatcher {
    /// Runtime dispatcher if called inside a tokio runtime, inline otherwise
    #[must_use]
    pub fn current() -> Self {
        tokio::runtime::Handle::try_current().map_or(Self::Inline, Self::Runtime)
    }

    /// Whether continuations run on the calling thread
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        matches!(self, Self::Inline)
    }

    /// Schedule `job` according to the policy
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Self::Inline => run_inline(Box::new(job)),
            Self::Runtime(handle) => {
                // The join handle is not needed; completion is signalled by the job itself.
                drop(handle.spawn_blocking(job));
            }
        }
    }
}

fn run_inline(job: Job) {
    let first = PENDING.with(|pending| {
        let mut pending = pending.borrow_mut();
        if let Some(queue) = pending.as_mut() {
            queue.push_back(job);
            None
        } else {
            *pending = Some(VecDeque::new());
            Some(job)
        }
    });

    let Some(first) = first else {
        return;
    };

    let _drain = DrainGuard;
    first();
    while let Some(next) = PENDING.with(|pending| pending.borrow_mut().as_mut()?.pop_front()) {
        next();
    }
}

/// Resets the per-thread queue when the outermost inline continuation ends,
/// including by unwinding.
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let dropped = PENDING.with(|pending| pending.borrow_mut().take());
        if let Some(dropped) = dropped
            && !dropped.is_empty()
        {
            error!(
                "Dropping {} queued continuations after a panicking continuation",
                dropped.len()
            );
        }
    }
}
