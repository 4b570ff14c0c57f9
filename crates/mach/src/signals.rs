//! Signal masking for the host machine.
//!
//! The host emulates one CPU whose interrupt lines are the periodic alarm and
//! I/O completions. Background threads only queue signals here; they are
//! delivered on the logical thread that owns the CPU, at the point where it
//! unmasks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Mask token returned by [`Machine::suspend_signals`](crate::Machine::suspend_signals).
///
/// Restoring tokens in reverse order of acquisition makes nested critical
/// sections safe: only the outermost restore unmasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalState {
    masked: bool,
}

impl SignalState {
    /// Token describing an unmasked CPU.
    pub const ENABLED: Self = Self { masked: false };
    /// Token describing a masked CPU.
    pub const MASKED: Self = Self { masked: true };

    /// Returns true if delivery was masked when the token was taken.
    pub const fn is_masked(self) -> bool {
        self.masked
    }
}

pub(crate) type Handler = Box<dyn FnOnce() + Send>;

/// A signal ready to be run on the current context.
pub(crate) enum Signal {
    Alarm,
    Completion(Handler),
}

#[derive(Default)]
struct Pending {
    // Alarms coalesce like a POSIX signal: at most one is pending.
    alarm: bool,
    completions: VecDeque<Handler>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        !self.alarm && self.completions.is_empty()
    }
}

/// Machine-wide interrupt flag plus the queue of undelivered signals.
pub(crate) struct SignalMask {
    masked: AtomicBool,
    pending: Mutex<Pending>,
    arrived: Condvar,
}

impl SignalMask {
    pub(crate) fn new() -> Self {
        Self {
            masked: AtomicBool::new(false),
            pending: Mutex::new(Pending::default()),
            arrived: Condvar::new(),
        }
    }

    pub(crate) fn suspend(&self) -> SignalState {
        SignalState {
            masked: self.masked.swap(true, Ordering::SeqCst),
        }
    }

    /// Restores `state`. Returns true if delivery is now unmasked.
    pub(crate) fn restore(&self, state: SignalState) -> bool {
        if state.masked {
            false
        } else {
            self.masked.store(false, Ordering::SeqCst);
            true
        }
    }

    pub(crate) fn unmask(&self) {
        self.masked.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_masked(&self) -> bool {
        self.masked.load(Ordering::SeqCst)
    }

    pub(crate) fn raise_alarm(&self) {
        let mut pending = self.pending.lock();
        pending.alarm = true;
        self.arrived.notify_all();
    }

    pub(crate) fn post(&self, handler: Handler) {
        let mut pending = self.pending.lock();
        pending.completions.push_back(handler);
        self.arrived.notify_all();
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Sleeps until something is pending or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            let _ = self.arrived.wait_for(&mut pending, timeout);
        }
    }

    /// Takes the next deliverable signal and masks delivery while it runs.
    ///
    /// Returns `None` while masked. The caller must [`unmask`](Self::unmask)
    /// once the handler returns.
    pub(crate) fn take(&self) -> Option<Signal> {
        if self.is_masked() {
            return None;
        }
        let mut pending = self.pending.lock();
        let signal = if pending.alarm {
            pending.alarm = false;
            Signal::Alarm
        } else {
            Signal::Completion(pending.completions.pop_front()?)
        };
        self.masked.store(true, Ordering::SeqCst);
        Some(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_suspend_only_outermost_unmasks() {
        let mask = SignalMask::new();
        let outer = mask.suspend();
        let inner = mask.suspend();
        assert!(!outer.is_masked());
        assert!(inner.is_masked());

        assert!(!mask.restore(inner));
        assert!(mask.is_masked());

        assert!(mask.restore(outer));
        assert!(!mask.is_masked());
    }

    #[test]
    fn take_is_blocked_while_masked() {
        let mask = SignalMask::new();
        mask.raise_alarm();

        let saved = mask.suspend();
        assert!(mask.take().is_none());
        assert!(mask.has_pending());

        mask.restore(saved);
        assert!(matches!(mask.take(), Some(Signal::Alarm)));
        // Delivery stays masked until the handler finishes.
        assert!(mask.is_masked());
        mask.unmask();
        assert!(!mask.has_pending());
    }

    #[test]
    fn alarms_coalesce_and_precede_completions() {
        let mask = SignalMask::new();
        mask.post(Box::new(|| {}));
        mask.raise_alarm();
        mask.raise_alarm();

        assert!(matches!(mask.take(), Some(Signal::Alarm)));
        mask.unmask();
        assert!(matches!(mask.take(), Some(Signal::Completion(_))));
        mask.unmask();
        assert!(mask.take().is_none());
    }
}
