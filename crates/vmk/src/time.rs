//! Tick accounting and sleeping.
//!
//! Every tick runs with delivery masked: the elapsed counter advances, timed
//! waits count down and expire, and finally a preemption pass lets any
//! woken thread that outranks the interrupted one take the CPU.

use mach::Machine;

use crate::error::{VmError, VmResult};
use crate::kernel::{KernelState, Vm};
use crate::scheduler::Handoff;
use crate::thread::{ThreadId, ThreadState, WaitReason};
use crate::trace::TraceEvent;

/// Tick count.
pub type Tick = u64;

/// Wait forever.
pub const TIMEOUT_INFINITE: Tick = Tick::MAX;
/// Do not wait at all.
pub const TIMEOUT_IMMEDIATE: Tick = 0;

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Immediate,
    Infinite,
    Ticks(Tick),
}

impl From<Tick> for Timeout {
    fn from(ticks: Tick) -> Self {
        match ticks {
            TIMEOUT_IMMEDIATE => Self::Immediate,
            TIMEOUT_INFINITE => Self::Infinite,
            ticks => Self::Ticks(ticks),
        }
    }
}

impl<C> KernelState<C> {
    /// Counts down timed waits and wakes the ones that ran out.
    pub(crate) fn expire_timers(&mut self) {
        let mut expired = Vec::new();
        for (&id, tcb) in self.threads.iter_mut() {
            if id == ThreadId::IDLE || tcb.state != ThreadState::Waiting {
                continue;
            }
            let Some(reason) = tcb.wait.filter(|reason| reason.is_timed()) else {
                continue;
            };
            tcb.sleep_ticks = tcb.sleep_ticks.saturating_sub(1);
            if tcb.sleep_ticks == 0 {
                expired.push((id, reason));
            }
        }

        for (id, reason) in expired {
            if let WaitReason::Mutex { id: mutex, .. } = reason {
                if let Some(cell) = self.mutexes.get_mut(&mutex) {
                    cell.waiters.remove(id);
                }
                self.emit(TraceEvent::MutexTimedOut { mutex, waiter: id });
                log::debug!("thread {} timed out on {}", id, mutex);
            }
            self.make_ready(id);
        }
    }
}

impl<M: Machine> Vm<M> {
    /// Alarm handler: one scheduler tick.
    pub(crate) fn on_tick(&self) {
        let _cs = self.critical();
        let plan = {
            let mut state = self.inner.state.lock();
            state.ticks += 1;
            let count = state.ticks;
            state.emit(TraceEvent::Tick { count });
            state.expire_timers();
            log::trace!("tick {} ({} ready)", count, state.ready.len());
            if state.ready.is_empty() {
                None
            } else {
                state.plan_dispatch(ThreadState::Ready, Handoff::Preempt)
            }
        };
        self.dispatch(plan);
    }

    /// Blocks the caller for `ticks` ticks.
    ///
    /// Zero yields once. [`TIMEOUT_INFINITE`] is rejected.
    pub fn thread_sleep(&self, ticks: Tick) -> VmResult<()> {
        match ticks {
            TIMEOUT_INFINITE => Err(VmError::InvalidParameter),
            0 => {
                self.yield_now();
                Ok(())
            }
            ticks => {
                let _cs = self.critical();
                let plan = {
                    let mut state = self.inner.state.lock();
                    let me = state.running;
                    let tcb = state.thread_mut(me)?;
                    tcb.wait = Some(WaitReason::Sleep);
                    tcb.sleep_ticks = ticks;
                    state.plan_dispatch(ThreadState::Waiting, Handoff::Preempt)
                };
                self.dispatch(plan);
                Ok(())
            }
        }
    }

    /// Configured tick length in milliseconds.
    pub fn tick_ms(&self) -> u32 {
        self.inner.config.tick_ms
    }

    /// Ticks elapsed since boot.
    pub fn tick_count(&self) -> Tick {
        let _cs = self.critical();
        let ticks = self.inner.state.lock().ticks;
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::{MutexCell, MutexId};
    use crate::thread::{Priority, Tcb};

    fn waiting(state: &mut KernelState<()>, id: u32, reason: WaitReason, ticks: Tick) {
        let mut tcb = Tcb::new(ThreadId(id), Priority::Normal, 1, None);
        tcb.state = ThreadState::Waiting;
        tcb.wait = Some(reason);
        tcb.sleep_ticks = ticks;
        state.threads.insert(ThreadId(id), tcb);
    }

    #[test]
    fn timeout_from_ticks() {
        assert_eq!(Timeout::from(TIMEOUT_IMMEDIATE), Timeout::Immediate);
        assert_eq!(Timeout::from(TIMEOUT_INFINITE), Timeout::Infinite);
        assert_eq!(Timeout::from(7), Timeout::Ticks(7));
    }

    #[test]
    fn sleeper_wakes_on_its_last_tick() {
        let mut state = KernelState::new(None);
        waiting(&mut state, 2, WaitReason::Sleep, 3);

        for _ in 0..2 {
            state.expire_timers();
            assert_eq!(state.thread(ThreadId(2)).unwrap().state, ThreadState::Waiting);
        }
        state.expire_timers();
        assert_eq!(state.thread(ThreadId(2)).unwrap().state, ThreadState::Ready);
        assert!(state.ready.contains(ThreadId(2)));
    }

    #[test]
    fn untimed_waits_are_left_alone() {
        let mut state = KernelState::new(None);
        waiting(&mut state, 2, WaitReason::Io, 0);
        waiting(
            &mut state,
            3,
            WaitReason::Mutex {
                id: MutexId(0),
                timed: false,
            },
            0,
        );

        state.expire_timers();
        assert_eq!(state.thread(ThreadId(2)).unwrap().state, ThreadState::Waiting);
        assert_eq!(state.thread(ThreadId(3)).unwrap().state, ThreadState::Waiting);
        assert!(state.ready.is_empty());
    }

    #[test]
    fn timed_mutex_wait_leaves_the_queue_on_expiry() {
        let mut state = KernelState::new(None);
        let mut cell = MutexCell::new();
        cell.owner = Some(ThreadId::MAIN);
        cell.waiters.push(ThreadId(2), Priority::Normal);
        state.mutexes.insert(MutexId(0), cell);
        waiting(
            &mut state,
            2,
            WaitReason::Mutex {
                id: MutexId(0),
                timed: true,
            },
            1,
        );

        state.expire_timers();
        let cell = state.mutex(MutexId(0)).unwrap();
        assert!(cell.waiters.is_empty());
        assert_eq!(cell.owner, Some(ThreadId::MAIN));
        assert_eq!(state.thread(ThreadId(2)).unwrap().state, ThreadState::Ready);
    }
}
