//! Ready-queue scheduler.
//!
//! ## Scheduling Policy
//!
//! 1. The candidate is the head of the highest non-empty ready queue
//! 2. With no candidate, the idle thread runs (it is never queued)
//! 3. A caller that stays READY keeps the CPU unless the candidate outranks
//!    it; a voluntary yield also gives way to an equal-priority candidate
//! 4. The departing thread takes its target state and, if READY, joins the
//!    tail of its queue
//!
//! Planning only mutates [`KernelState`]; the actual switch is carried out
//! by the caller after the state lock is released.

use std::sync::Arc;

use crate::kernel::KernelState;
use crate::thread::{ThreadId, ThreadState};
use crate::trace::TraceEvent;

/// How a caller that stays READY competes with the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handoff {
    /// Switch only to a strictly higher priority.
    Preempt,
    /// Also switch to an equal priority.
    Yield,
}

/// Contexts to switch between.
pub(crate) struct Dispatch<C> {
    pub(crate) from: Arc<C>,
    pub(crate) to: Arc<C>,
}

impl<C> KernelState<C> {
    /// Decides whether the running thread leaves the CPU with `target` as
    /// its new state, and if so to whom.
    ///
    /// Returns `None` when the caller keeps running; state is untouched then.
    pub(crate) fn plan_dispatch(
        &mut self,
        target: ThreadState,
        policy: Handoff,
    ) -> Option<Dispatch<C>> {
        let current = self.running;
        let current_priority = self.threads.get(&current)?.priority;

        let next = match self.ready.peek() {
            Some((candidate, priority)) => {
                if target == ThreadState::Ready && current != ThreadId::IDLE {
                    let keep = match policy {
                        Handoff::Preempt => priority <= current_priority,
                        Handoff::Yield => priority < current_priority,
                    };
                    if keep {
                        return None;
                    }
                }
                candidate
            }
            None if target == ThreadState::Ready => return None,
            None => ThreadId::IDLE,
        };
        if next == current {
            return None;
        }

        let to = self.threads.get(&next).and_then(|tcb| tcb.context.clone());
        let from = self.threads.get(&current).and_then(|tcb| tcb.context.clone());
        let (Some(from), Some(to)) = (from, to) else {
            log::error!("no context to switch from {} to {}", current, next);
            return None;
        };

        if next != ThreadId::IDLE {
            self.ready.remove(next);
        }

        let departing = if current == ThreadId::IDLE {
            ThreadState::Dead
        } else {
            target
        };
        self.set_state(current, departing);
        if departing == ThreadState::Ready {
            self.ready.push(current, current_priority);
        }

        self.set_state(next, ThreadState::Running);
        self.running = next;
        self.emit(TraceEvent::Dispatched {
            from: current,
            to: next,
        });
        log::trace!("dispatch {} -> {}", current, next);

        Some(Dispatch { from, to })
    }
}
