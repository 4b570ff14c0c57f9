//! Mutexes with priority-ordered wait queues.
//!
//! Ownership passes directly from the releasing thread to the first waiter
//! of the highest priority level, so a released mutex never appears free
//! while threads are queued on it. There is no priority inheritance.

use std::fmt;

use mach::Machine;

use crate::error::{VmError, VmResult};
use crate::kernel::{KernelState, Vm};
use crate::queue::PriorityQueue;
use crate::scheduler::Handoff;
use crate::thread::{ThreadId, ThreadState, WaitReason};
use crate::time::Timeout;
use crate::trace::TraceEvent;

/// Mutex identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexId(pub u32);

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutex#{}", self.0)
    }
}

/// Mutex record. The mutex is locked iff `owner` is set.
#[derive(Debug, Default)]
pub(crate) struct MutexCell {
    pub(crate) owner: Option<ThreadId>,
    pub(crate) waiters: PriorityQueue,
}

impl MutexCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl<C> KernelState<C> {
    /// Passes `id` to its next waiter, if any, and makes that waiter READY.
    pub(crate) fn hand_off(&mut self, id: MutexId) -> Option<ThreadId> {
        let cell = self.mutexes.get_mut(&id)?;
        let (waiter, _) = cell.waiters.pop()?;
        cell.owner = Some(waiter);
        self.make_ready(waiter);
        self.emit(TraceEvent::MutexGranted {
            mutex: id,
            owner: waiter,
        });
        log::debug!("{} handed to thread {}", id, waiter);
        Some(waiter)
    }

    /// Releases every mutex owned by `owner`, granting each to its next
    /// waiter.
    pub(crate) fn release_owned_by(&mut self, owner: ThreadId) {
        let owned: Vec<MutexId> = self
            .mutexes
            .iter()
            .filter(|(_, cell)| cell.owner == Some(owner))
            .map(|(&id, _)| id)
            .collect();
        for id in owned {
            self.release(id, owner);
        }
    }

    fn release(&mut self, id: MutexId, owner: ThreadId) {
        if let Some(cell) = self.mutexes.get_mut(&id) {
            cell.owner = None;
        }
        self.emit(TraceEvent::MutexReleased { mutex: id, owner });
        self.hand_off(id);
    }
}

impl<M: Machine> Vm<M> {
    /// Creates an unlocked mutex.
    pub fn mutex_create(&self) -> VmResult<MutexId> {
        let _cs = self.critical();
        let mut state = self.inner.state.lock();
        let id = state.alloc_mutex_id()?;
        state.mutexes.insert(id, MutexCell::new());
        log::debug!("created {}", id);
        Ok(id)
    }

    /// Deletes an unlocked mutex.
    pub fn mutex_delete(&self, id: MutexId) -> VmResult<()> {
        let _cs = self.critical();
        let mut state = self.inner.state.lock();
        if state.mutex(id)?.owner.is_some() {
            return Err(VmError::InvalidState);
        }
        state.mutexes.remove(&id);
        log::debug!("deleted {}", id);
        Ok(())
    }

    /// Current owner of `id`, or `None` if it is unlocked.
    pub fn mutex_query(&self, id: MutexId) -> VmResult<Option<ThreadId>> {
        let _cs = self.critical();
        let owner = self.inner.state.lock().mutex(id)?.owner;
        Ok(owner)
    }

    /// Locks `id`, blocking according to `timeout` while another thread
    /// holds it.
    ///
    /// Returns [`VmError::Failure`] if the mutex could not be obtained in
    /// time, and [`VmError::InvalidState`] if the caller already owns it.
    pub fn mutex_acquire(&self, id: MutexId, timeout: impl Into<Timeout>) -> VmResult<()> {
        let timeout = timeout.into();
        let _cs = self.critical();
        let (me, plan) = {
            let mut state = self.inner.state.lock();
            let me = state.running;
            let cell = state.mutex_mut(id)?;
            let owner = cell.owner;
            match owner {
                None => {
                    cell.owner = Some(me);
                    state.emit(TraceEvent::MutexGranted {
                        mutex: id,
                        owner: me,
                    });
                    return Ok(());
                }
                Some(owner) if owner == me => return Err(VmError::InvalidState),
                Some(_) => {}
            }

            let ticks = match timeout {
                Timeout::Immediate | Timeout::Ticks(0) => return Err(VmError::Failure),
                Timeout::Infinite => None,
                Timeout::Ticks(ticks) => Some(ticks),
            };

            let priority = state.thread(me)?.priority;
            state.mutex_mut(id)?.waiters.push(me, priority);
            let tcb = state.thread_mut(me)?;
            tcb.wait = Some(WaitReason::Mutex {
                id,
                timed: ticks.is_some(),
            });
            tcb.sleep_ticks = ticks.unwrap_or(0);
            state.emit(TraceEvent::MutexBlocked {
                mutex: id,
                waiter: me,
            });
            log::debug!("thread {} waits for {}", me, id);
            (me, state.plan_dispatch(ThreadState::Waiting, Handoff::Preempt))
        };
        self.dispatch(plan);

        let state = self.inner.state.lock();
        if state.mutexes.get(&id).and_then(|cell| cell.owner) == Some(me) {
            Ok(())
        } else {
            Err(VmError::Failure)
        }
    }

    /// Unlocks `id` and hands it to the highest-priority waiter.
    ///
    /// The caller is preempted if the new owner outranks it.
    pub fn mutex_release(&self, id: MutexId) -> VmResult<()> {
        let _cs = self.critical();
        let plan = {
            let mut state = self.inner.state.lock();
            let owner = state.mutex(id)?.owner.ok_or(VmError::InvalidState)?;
            state.release(id, owner);
            state.plan_dispatch(ThreadState::Ready, Handoff::Preempt)
        };
        self.dispatch(plan);
        Ok(())
    }
}
