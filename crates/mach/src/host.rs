//! Host implementation of [`Machine`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::alarm::{AlarmCallback, Clock, Ticker};
use crate::context::HostContext;
use crate::file::{Completion, FileOp, IoReply, IoWorker};
use crate::machine::{ContextEntry, Machine, MachineError};
use crate::signals::{Signal, SignalMask, SignalState};

/// Configuration for [`HostMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub clock: Clock,
    /// Floor applied to every requested context stack.
    pub min_stack_size: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            clock: Clock::Realtime,
            min_stack_size: 64 * 1024,
        }
    }
}

struct Shared {
    config: MachineConfig,
    signals: Arc<SignalMask>,
    alarm: Mutex<Option<AlarmCallback>>,
    ticker: Ticker,
    io: IoWorker,
}

/// A single emulated CPU on top of OS threads.
///
/// Cloning yields another handle to the same machine.
#[derive(Clone)]
pub struct HostMachine {
    shared: Arc<Shared>,
}

impl HostMachine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                signals: Arc::new(SignalMask::new()),
                alarm: Mutex::new(None),
                ticker: Ticker::new(),
                io: IoWorker::new(),
            }),
        }
    }

    pub fn realtime() -> Self {
        Self::new(MachineConfig::default())
    }

    /// A machine driven by the virtual clock, for deterministic runs.
    pub fn virtual_clock() -> Self {
        Self::new(MachineConfig {
            clock: Clock::Virtual,
            ..MachineConfig::default()
        })
    }

    pub fn config(&self) -> MachineConfig {
        self.shared.config
    }

    /// Marks the alarm pending and delivers it if the CPU is unmasked.
    ///
    /// Must be called from the logical thread that owns the CPU.
    pub fn raise_alarm(&self) {
        self.shared.signals.raise_alarm();
        self.deliver_pending();
    }

    /// Returns true if an alarm or completion awaits delivery.
    pub fn has_pending(&self) -> bool {
        self.shared.signals.has_pending()
    }

    /// Number of file operations submitted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.shared.io.in_flight()
    }

    fn deliver_pending(&self) {
        let signals = &self.shared.signals;
        while let Some(signal) = signals.take() {
            match signal {
                Signal::Alarm => {
                    let callback = self.shared.alarm.lock().clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
                Signal::Completion(handler) => handler(),
            }
            signals.unmask();
        }
    }
}

impl Default for HostMachine {
    fn default() -> Self {
        Self::realtime()
    }
}

impl Machine for HostMachine {
    type Context = HostContext;

    fn initialize(&self) -> Result<(), MachineError> {
        self.shared
            .io
            .start(Arc::clone(&self.shared.signals))
            .map_err(MachineError::Io)?;
        log::debug!("host machine up ({:?} clock)", self.shared.config.clock);
        Ok(())
    }

    fn terminate(&self) {
        self.shared.ticker.stop();
        self.shared.io.stop();
        self.shared.alarm.lock().take();
        log::debug!("host machine down");
    }

    fn adopt_current(&self) -> HostContext {
        HostContext::adopt()
    }

    fn create_context(
        &self,
        stack_size: usize,
        entry: ContextEntry,
    ) -> Result<HostContext, MachineError> {
        let stack_size = stack_size.max(self.shared.config.min_stack_size);
        HostContext::spawn("mach-context".into(), stack_size, entry).map_err(MachineError::Spawn)
    }

    fn switch(&self, from: &HostContext, to: &HostContext) {
        HostContext::switch(from, to);
    }

    fn retire(&self, context: &HostContext) {
        context.retire();
    }

    fn suspend_signals(&self) -> SignalState {
        self.shared.signals.suspend()
    }

    fn resume_signals(&self, state: SignalState) {
        if self.shared.signals.restore(state) {
            self.deliver_pending();
        }
    }

    fn enable_signals(&self) {
        self.shared.signals.unmask();
        self.deliver_pending();
    }

    fn wait_for_signals(&self, timeout: Duration) {
        // The worker posts before it decrements, so reading the count first
        // cannot miss a completion.
        let idle = self.shared.io.in_flight() == 0 && !self.shared.signals.has_pending();
        let armed = self.shared.alarm.lock().is_some();
        if self.shared.config.clock == Clock::Virtual && idle && armed {
            // Nothing else can make progress, so advance virtual time.
            self.shared.signals.raise_alarm();
        } else {
            self.shared.signals.wait(timeout);
        }
        self.deliver_pending();
    }

    fn request_alarm(&self, period: Duration, callback: AlarmCallback) -> Result<(), MachineError> {
        *self.shared.alarm.lock() = Some(callback);
        if self.shared.config.clock == Clock::Realtime {
            self.shared
                .ticker
                .start(period, Arc::clone(&self.shared.signals))
                .map_err(MachineError::Alarm)?;
        }
        Ok(())
    }

    fn submit(&self, op: FileOp, done: Completion) {
        if let Err(done) = self.shared.io.submit(op, done) {
            log::warn!("I/O device not running, failing request");
            self.shared.signals.post(Box::new(move || done(IoReply::failed())));
        }
    }
}
