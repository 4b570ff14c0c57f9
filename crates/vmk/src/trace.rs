//! Structured runtime tracing.
//!
//! A [`TraceHook`] sees every scheduling decision as it is made. Hooks run
//! with callback delivery masked and the runtime state locked, so they must
//! return quickly and must not call back into the runtime.

use std::sync::Arc;

use crate::mutex::MutexId;
use crate::thread::{Priority, ThreadId, ThreadState};
use crate::time::Tick;

/// Events reported to a [`TraceHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    ThreadCreated {
        thread: ThreadId,
        priority: Priority,
    },
    StateChanged {
        thread: ThreadId,
        from: ThreadState,
        to: ThreadState,
    },
    /// The CPU moved from one thread to another.
    Dispatched {
        from: ThreadId,
        to: ThreadId,
    },
    ThreadDeleted {
        thread: ThreadId,
    },
    MutexGranted {
        mutex: MutexId,
        owner: ThreadId,
    },
    MutexBlocked {
        mutex: MutexId,
        waiter: ThreadId,
    },
    MutexReleased {
        mutex: MutexId,
        owner: ThreadId,
    },
    MutexTimedOut {
        mutex: MutexId,
        waiter: ThreadId,
    },
    Tick {
        count: Tick,
    },
}

/// Receiver of [`TraceEvent`]s.
pub type TraceHook = Arc<dyn Fn(&TraceEvent) + Send + Sync>;
