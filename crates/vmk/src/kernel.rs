//! Runtime state, boot sequence and the context-switch protocol.
//!
//! All scheduler state lives in one [`KernelState`] behind a lock that is
//! only ever taken with callback delivery masked, so it is never contended.
//! The lock is released before the machine switches contexts; the masked
//! section itself spans the switch and is closed by whichever thread resumes.

use std::collections::BTreeMap;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use mach::{HostMachine, Machine, Retired, SignalState};
use parking_lot::Mutex;

use crate::config::{VmConfig, DEFAULT_STACK_SIZE};
use crate::error::{VmError, VmResult};
use crate::module::ModuleLoader;
use crate::mutex::{MutexCell, MutexId};
use crate::queue::PriorityQueue;
use crate::scheduler::{Dispatch, Handoff};
use crate::thread::{Priority, Tcb, ThreadEntry, ThreadId, ThreadState};
use crate::time::Tick;
use crate::trace::{TraceEvent, TraceHook};

/// Registries, queues and counters shared by every runtime operation.
pub(crate) struct KernelState<C> {
    pub(crate) threads: BTreeMap<ThreadId, Tcb<C>>,
    pub(crate) mutexes: BTreeMap<MutexId, MutexCell>,
    pub(crate) ready: PriorityQueue,
    pub(crate) running: ThreadId,
    pub(crate) ticks: Tick,
    next_thread: u32,
    next_mutex: u32,
    trace: Option<TraceHook>,
}

impl<C> KernelState<C> {
    pub(crate) fn new(trace: Option<TraceHook>) -> Self {
        Self {
            threads: BTreeMap::new(),
            mutexes: BTreeMap::new(),
            ready: PriorityQueue::new(),
            running: ThreadId::MAIN,
            ticks: 0,
            next_thread: ThreadId::FIRST_USER.0,
            next_mutex: 0,
            trace,
        }
    }

    pub(crate) fn alloc_thread_id(&mut self) -> VmResult<ThreadId> {
        let id = ThreadId(self.next_thread);
        self.next_thread = self.next_thread.checked_add(1).ok_or(VmError::Failure)?;
        Ok(id)
    }

    pub(crate) fn alloc_mutex_id(&mut self) -> VmResult<MutexId> {
        let id = MutexId(self.next_mutex);
        self.next_mutex = self.next_mutex.checked_add(1).ok_or(VmError::Failure)?;
        Ok(id)
    }

    pub(crate) fn thread(&self, id: ThreadId) -> VmResult<&Tcb<C>> {
        self.threads.get(&id).ok_or(VmError::InvalidId)
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> VmResult<&mut Tcb<C>> {
        self.threads.get_mut(&id).ok_or(VmError::InvalidId)
    }

    pub(crate) fn mutex(&self, id: MutexId) -> VmResult<&MutexCell> {
        self.mutexes.get(&id).ok_or(VmError::InvalidId)
    }

    pub(crate) fn mutex_mut(&mut self, id: MutexId) -> VmResult<&mut MutexCell> {
        self.mutexes.get_mut(&id).ok_or(VmError::InvalidId)
    }

    pub(crate) fn set_state(&mut self, id: ThreadId, to: ThreadState) {
        let Some(tcb) = self.threads.get_mut(&id) else {
            return;
        };
        let from = mem::replace(&mut tcb.state, to);
        if from != to {
            self.emit(TraceEvent::StateChanged { thread: id, from, to });
        }
    }

    /// Marks `id` READY and appends it to its ready queue.
    pub(crate) fn make_ready(&mut self, id: ThreadId) {
        let Some(tcb) = self.threads.get_mut(&id) else {
            return;
        };
        tcb.wait = None;
        tcb.sleep_ticks = 0;
        let priority = tcb.priority;
        self.set_state(id, ThreadState::Ready);
        if id != ThreadId::IDLE && !self.ready.contains(id) {
            self.ready.push(id, priority);
        }
    }

    pub(crate) fn emit(&self, event: TraceEvent) {
        if let Some(hook) = &self.trace {
            hook(&event);
        }
    }
}

/// Masks callback delivery for its lifetime.
///
/// Guards nest: only the outermost one unmasks. A guard dropped while the
/// thread unwinds leaves the mask alone, since the CPU has already been
/// handed to another context.
pub(crate) struct Critical<'a, M: Machine> {
    machine: &'a M,
    saved: SignalState,
}

impl<'a, M: Machine> Critical<'a, M> {
    pub(crate) fn enter(machine: &'a M) -> Self {
        let saved = machine.suspend_signals();
        Self { machine, saved }
    }
}

impl<M: Machine> Drop for Critical<'_, M> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.machine.resume_signals(self.saved);
        }
    }
}

pub(crate) struct Inner<M: Machine> {
    pub(crate) machine: M,
    pub(crate) config: VmConfig,
    pub(crate) state: Mutex<KernelState<M::Context>>,
}

/// Handle to a running runtime instance.
///
/// Cloning is cheap; every clone drives the same scheduler. Call
/// [`Vm::shutdown`] from the main thread once the program is done, which
/// retires every other thread.
pub struct Vm<M: Machine = HostMachine> {
    pub(crate) inner: Arc<Inner<M>>,
}

impl<M: Machine> Clone for Vm<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Machine> Vm<M> {
    /// Returns a builder that boots a runtime on `machine`.
    pub fn builder(machine: M) -> VmBuilder<M> {
        VmBuilder::new(machine)
    }

    /// The machine the runtime runs on.
    pub fn machine(&self) -> &M {
        &self.inner.machine
    }

    /// Configuration the runtime was booted with.
    pub fn config(&self) -> &VmConfig {
        &self.inner.config
    }

    pub(crate) fn critical(&self) -> Critical<'_, M> {
        Critical::enter(&self.inner.machine)
    }

    pub(crate) fn weak(&self) -> Weak<Inner<M>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<Inner<M>>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Performs a switch planned under the state lock.
    ///
    /// Must be called with delivery masked and the lock released. Returns
    /// once the departing thread is dispatched again.
    pub(crate) fn dispatch(&self, plan: Option<Dispatch<M::Context>>) {
        if let Some(plan) = plan {
            self.inner.machine.switch(&plan.from, &plan.to);
        }
    }

    pub(crate) fn reschedule(&self, target: ThreadState, policy: Handoff) {
        let _cs = self.critical();
        let plan = self.inner.state.lock().plan_dispatch(target, policy);
        self.dispatch(plan);
    }

    /// Stops the machine and releases every thread and mutex.
    ///
    /// Only the main thread may shut the runtime down.
    pub fn shutdown(&self) -> VmResult<()> {
        let _cs = self.critical();
        let (threads, ticks) = {
            let mut state = self.inner.state.lock();
            if state.running != ThreadId::MAIN {
                return Err(VmError::InvalidState);
            }
            state.ready.clear();
            state.mutexes.clear();
            (mem::take(&mut state.threads), state.ticks)
        };
        self.inner.machine.terminate();

        for tcb in threads.values() {
            if tcb.id == ThreadId::MAIN {
                continue;
            }
            if let Some(context) = &tcb.context {
                self.inner.machine.retire(context);
            }
        }
        drop(threads);
        log::info!("{} shut down after {} ticks", self.inner.config.name, ticks);
        Ok(())
    }

    /// Terminates the calling thread. Used when a thread entry returns.
    pub(crate) fn exit_current(&self) {
        let me = self.thread_id();
        if let Err(err) = self.thread_terminate(me) {
            log::error!("thread {} failed to exit: {}", me, err);
        }
    }
}

/// Builder for booting a [`Vm`].
pub struct VmBuilder<M: Machine = HostMachine> {
    machine: M,
    config: VmConfig,
    trace: Option<TraceHook>,
}

impl<M: Machine> VmBuilder<M> {
    pub fn new(machine: M) -> Self {
        Self {
            machine,
            config: VmConfig::default(),
            trace: None,
        }
    }

    /// Replaces the default configuration.
    pub fn config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the trace hook for runtime events.
    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    /// Boots the runtime and makes the caller its main thread.
    ///
    /// The boot sequence:
    /// 1. Brings up the machine
    /// 2. Adopts the calling flow of control as the RUNNING main thread
    /// 3. Creates the idle thread
    /// 4. Arms the periodic tick
    pub fn boot(self) -> VmResult<Vm<M>> {
        self.config.validate()?;
        self.machine.initialize().map_err(|err| {
            log::error!("machine failed to initialize: {}", err);
            VmError::Failure
        })?;

        let mut state = KernelState::new(self.trace);
        let main_context = Arc::new(self.machine.adopt_current());
        state.threads.insert(
            ThreadId::MAIN,
            Tcb::new(ThreadId::MAIN, Priority::Normal, DEFAULT_STACK_SIZE, None)
                .with_context(main_context),
        );
        state.emit(TraceEvent::ThreadCreated {
            thread: ThreadId::MAIN,
            priority: Priority::Normal,
        });
        state.set_state(ThreadId::MAIN, ThreadState::Running);

        let idle_stack = self.config.idle_stack_size;
        let tick_period = self.config.tick_period();
        let vm = Vm {
            inner: Arc::new(Inner {
                machine: self.machine,
                config: self.config,
                state: Mutex::new(state),
            }),
        };

        let weak = vm.weak();
        let idle_context = vm
            .inner
            .machine
            .create_context(idle_stack, Box::new(move || idle_loop(weak)))
            .map_err(|err| {
                log::error!("failed to create idle thread: {}", err);
                vm.inner.machine.terminate();
                VmError::Failure
            })?;
        {
            let mut state = vm.inner.state.lock();
            state.threads.insert(
                ThreadId::IDLE,
                Tcb::new(ThreadId::IDLE, Priority::Low, idle_stack, None)
                    .with_context(Arc::new(idle_context)),
            );
            state.emit(TraceEvent::ThreadCreated {
                thread: ThreadId::IDLE,
                priority: Priority::Low,
            });
        }

        let weak = vm.weak();
        vm.inner
            .machine
            .request_alarm(
                tick_period,
                Arc::new(move || {
                    if let Some(vm) = Vm::upgrade(&weak) {
                        vm.on_tick();
                    }
                }),
            )
            .map_err(|err| {
                log::error!("failed to arm tick: {}", err);
                VmError::Failure
            })?;

        log::info!(
            "{} booted, tick {} ms",
            vm.inner.config.name,
            vm.inner.config.tick_ms
        );
        Ok(vm)
    }

    /// Boots, runs the module named by `argv[0]` on the main thread and
    /// shuts down again.
    pub fn start(self, loader: &dyn ModuleLoader<M>, argv: &[String]) -> VmResult<()> {
        let name = argv.first().ok_or(VmError::InvalidParameter)?;
        let vm = self.boot()?;
        let outcome = match loader.load(name) {
            Some(main) => {
                log::debug!("running module {}", name);
                main(&vm, argv);
                Ok(())
            }
            None => {
                log::warn!("module {} not found", name);
                Err(VmError::Failure)
            }
        };
        vm.shutdown()?;
        outcome
    }
}

/// Body of the idle thread: run whatever becomes ready, otherwise wait for
/// the next signal.
fn idle_loop<M: Machine>(inner: Weak<Inner<M>>) {
    if let Some(vm) = Vm::upgrade(&inner) {
        vm.inner.machine.enable_signals();
    }
    loop {
        let Some(vm) = Vm::upgrade(&inner) else {
            return;
        };
        let has_ready = {
            let _cs = vm.critical();
            let ready = !vm.inner.state.lock().ready.is_empty();
            ready
        };
        if has_ready {
            vm.reschedule(ThreadState::Dead, Handoff::Preempt);
        } else {
            vm.inner.machine.wait_for_signals(vm.inner.config.tick_period());
        }
    }
}

/// Entry point of every activated thread context.
pub(crate) fn thread_skeleton<M: Machine>(inner: Weak<Inner<M>>, id: ThreadId, entry: ThreadEntry) {
    let Some(vm) = Vm::upgrade(&inner) else {
        return;
    };
    vm.inner.machine.enable_signals();

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry())) {
        if payload.is::<Retired>() {
            panic::resume_unwind(payload);
        }
        log::error!("thread {} panicked, terminating it", id);
    }
    vm.exit_current();
}
