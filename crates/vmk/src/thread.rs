//! Thread control blocks and the thread lifecycle.
//!
//! Threads are created DEAD, become READY on activation, and cycle through
//! RUNNING and WAITING until they terminate back to DEAD. A DEAD thread can
//! be activated again or deleted.

use std::fmt;
use std::sync::Arc;

use mach::{IoReply, Machine};

use crate::error::{VmError, VmResult};
use crate::kernel::{thread_skeleton, KernelState, Vm};
use crate::mutex::MutexId;
use crate::scheduler::Handoff;
use crate::time::Tick;
use crate::trace::TraceEvent;

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// The flow of control that booted the runtime.
    pub const MAIN: Self = Self(0);
    /// Runs when nothing else is ready.
    pub const IDLE: Self = Self(1);
    pub(crate) const FIRST_USER: Self = Self(2);

    pub const fn is_reserved(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MAIN => write!(f, "main"),
            Self::IDLE => write!(f, "idle"),
            Self(id) => write!(f, "#{id}"),
        }
    }
}

/// Scheduling priority. Higher variants are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub(crate) const COUNT: usize = 3;
    pub(crate) const ALL_DESCENDING: [Self; Self::COUNT] = [Self::High, Self::Normal, Self::Low];

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u32> for Priority {
    type Error = VmError;

    /// Maps the numeric levels 1 (low), 2 (normal) and 3 (high).
    fn try_from(level: u32) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            _ => Err(VmError::InvalidParameter),
        }
    }
}

/// Thread execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Created or terminated; not schedulable.
    Dead,
    /// Queued for the CPU.
    Ready,
    /// Owns the CPU.
    Running,
    /// Blocked on a sleep, a mutex or I/O.
    Waiting,
}

/// Why a WAITING thread is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Sleep,
    Mutex { id: MutexId, timed: bool },
    Io,
}

impl WaitReason {
    /// True if the tick counts this wait down.
    pub(crate) fn is_timed(self) -> bool {
        matches!(self, Self::Sleep | Self::Mutex { timed: true, .. })
    }
}

/// Thread body. Parameters are whatever the closure captures.
pub type ThreadEntry = Arc<dyn Fn() + Send + Sync + 'static>;

/// Thread control block.
pub(crate) struct Tcb<C> {
    pub(crate) id: ThreadId,
    pub(crate) priority: Priority,
    pub(crate) state: ThreadState,
    pub(crate) stack_size: usize,
    pub(crate) entry: Option<ThreadEntry>,
    pub(crate) context: Option<Arc<C>>,
    pub(crate) wait: Option<WaitReason>,
    pub(crate) sleep_ticks: Tick,
    pub(crate) io_seq: u64,
    pub(crate) io_reply: Option<IoReply>,
}

impl<C> Tcb<C> {
    pub(crate) fn new(
        id: ThreadId,
        priority: Priority,
        stack_size: usize,
        entry: Option<ThreadEntry>,
    ) -> Self {
        Self {
            id,
            priority,
            state: ThreadState::Dead,
            stack_size,
            entry,
            context: None,
            wait: None,
            sleep_ticks: 0,
            io_seq: 0,
            io_reply: None,
        }
    }

    pub(crate) fn with_context(mut self, context: Arc<C>) -> Self {
        self.context = Some(context);
        self
    }
}

impl<C> KernelState<C> {
    /// Pulls `id` out of the ready queue and any mutex wait queue.
    pub(crate) fn detach(&mut self, id: ThreadId) {
        self.ready.remove(id);
        if let Some(tcb) = self.threads.get_mut(&id) {
            if let Some(WaitReason::Mutex { id: mutex, .. }) = tcb.wait.take() {
                if let Some(cell) = self.mutexes.get_mut(&mutex) {
                    cell.waiters.remove(id);
                }
            }
            tcb.sleep_ticks = 0;
            tcb.io_reply = None;
        }
    }
}

impl<M: Machine> Vm<M> {
    /// Creates a DEAD thread running `entry` once activated.
    pub fn thread_create<F>(&self, entry: F, stack_size: usize, priority: Priority) -> VmResult<ThreadId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if stack_size == 0 {
            return Err(VmError::InvalidParameter);
        }
        let entry: ThreadEntry = Arc::new(entry);
        let _cs = self.critical();
        let mut state = self.inner.state.lock();
        let id = state.alloc_thread_id()?;
        state
            .threads
            .insert(id, Tcb::new(id, priority, stack_size, Some(entry)));
        state.emit(TraceEvent::ThreadCreated {
            thread: id,
            priority,
        });
        log::debug!("created thread {} ({:?}, {} byte stack)", id, priority, stack_size);
        Ok(id)
    }

    /// Makes a DEAD thread READY with a fresh context.
    ///
    /// The caller is preempted at once if the thread outranks it.
    pub fn thread_activate(&self, id: ThreadId) -> VmResult<()> {
        let _cs = self.critical();
        let (stack_size, entry) = {
            let state = self.inner.state.lock();
            let tcb = state.thread(id)?;
            if id.is_reserved() || tcb.state != ThreadState::Dead {
                return Err(VmError::InvalidState);
            }
            (tcb.stack_size, tcb.entry.clone().ok_or(VmError::InvalidState)?)
        };

        let weak = self.weak();
        let context = self
            .inner
            .machine
            .create_context(stack_size, Box::new(move || thread_skeleton(weak, id, entry)))
            .map_err(|err| {
                log::error!("failed to create context for thread {}: {}", id, err);
                VmError::Failure
            })?;

        let plan = {
            let mut state = self.inner.state.lock();
            let tcb = state.thread_mut(id)?;
            if let Some(previous) = tcb.context.replace(Arc::new(context)) {
                self.inner.machine.retire(&previous);
            }
            state.make_ready(id);
            log::debug!("activated thread {}", id);
            state.plan_dispatch(ThreadState::Ready, Handoff::Preempt)
        };
        self.dispatch(plan);
        Ok(())
    }

    /// Terminates `id`, releasing every mutex it owns.
    ///
    /// Terminating the caller never returns.
    pub fn thread_terminate(&self, id: ThreadId) -> VmResult<()> {
        let _cs = self.critical();
        let plan = {
            let mut state = self.inner.state.lock();
            let tcb = state.thread(id)?;
            if id == ThreadId::IDLE || tcb.state == ThreadState::Dead {
                return Err(VmError::InvalidState);
            }
            state.release_owned_by(id);
            state.detach(id);
            log::debug!("terminated thread {}", id);
            if id == state.running {
                state.plan_dispatch(ThreadState::Dead, Handoff::Preempt)
            } else {
                state.set_state(id, ThreadState::Dead);
                state.plan_dispatch(ThreadState::Ready, Handoff::Preempt)
            }
        };
        self.dispatch(plan);
        Ok(())
    }

    /// Erases a DEAD thread.
    ///
    /// The thread's context is torn down on its own OS thread, concurrently
    /// with whichever thread owns the CPU. Values captured by the entry
    /// closure are dropped there and must not call back into the runtime
    /// from `Drop`.
    pub fn thread_delete(&self, id: ThreadId) -> VmResult<()> {
        let _cs = self.critical();
        let tcb = {
            let mut state = self.inner.state.lock();
            let tcb = state.thread(id)?;
            if id.is_reserved() || tcb.state != ThreadState::Dead {
                return Err(VmError::InvalidState);
            }
            let tcb = state.threads.remove(&id).ok_or(VmError::InvalidId)?;
            state.emit(TraceEvent::ThreadDeleted { thread: id });
            tcb
        };
        if let Some(context) = &tcb.context {
            self.inner.machine.retire(context);
        }
        log::debug!("deleted thread {}", id);
        Ok(())
    }

    /// The RUNNING thread.
    pub fn thread_id(&self) -> ThreadId {
        self.inner.state.lock().running
    }

    /// Current state of `id`.
    pub fn thread_state(&self, id: ThreadId) -> VmResult<ThreadState> {
        Ok(self.inner.state.lock().thread(id)?.state)
    }

    /// Gives the CPU to the next READY thread of equal or higher priority.
    pub fn yield_now(&self) {
        self.reschedule(ThreadState::Ready, Handoff::Yield);
    }
}
