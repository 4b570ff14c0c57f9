//! The machine contract consumed by the runtime.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::alarm::AlarmCallback;
use crate::file::{Completion, FileOp};
use crate::signals::SignalState;

/// Code run by a freshly created execution context on its first switch-in.
pub type ContextEntry = Box<dyn FnOnce() + Send + 'static>;

/// Errors reported by a machine backend.
#[derive(Error, Debug)]
pub enum MachineError {
    #[error("failed to spawn execution context: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to start alarm: {0}")]
    Alarm(#[source] io::Error),
    #[error("failed to start I/O worker: {0}")]
    Io(#[source] io::Error),
}

/// A single logical CPU with switchable execution contexts.
///
/// Implementations must guarantee that exactly one context executes at a
/// time, and that alarm and completion callbacks are only ever run on the
/// context that currently owns the CPU, with delivery masked for their
/// duration.
pub trait Machine: Send + Sync + 'static {
    /// Saved, resumable execution state bound to a stack.
    type Context: Send + Sync + 'static;

    /// Brings up the machine (I/O device, signal plumbing).
    fn initialize(&self) -> Result<(), MachineError>;

    /// Stops the alarm and the I/O device. Live contexts are left to their
    /// owners to retire.
    fn terminate(&self);

    /// Wraps the calling flow of control in a context so it can be switched
    /// away from and back to.
    fn adopt_current(&self) -> Self::Context;

    /// Creates a context that starts executing `entry` when first switched to.
    fn create_context(
        &self,
        stack_size: usize,
        entry: ContextEntry,
    ) -> Result<Self::Context, MachineError>;

    /// Saves the state of `from` and resumes `to`.
    ///
    /// Returns when some other context switches back to `from`.
    fn switch(&self, from: &Self::Context, to: &Self::Context);

    /// Ends a context that will never be switched to again.
    ///
    /// A context parked inside [`Machine::switch`] keeps itself alive, so
    /// dropping the last owner is not enough to release it.
    ///
    /// Retirement may run the context's remaining destructors concurrently
    /// with the current owner of the CPU, so those destructors must not
    /// re-enter the runtime.
    fn retire(&self, context: &Self::Context);

    /// Masks signal delivery, returning the previous mask for nesting.
    fn suspend_signals(&self) -> SignalState;

    /// Restores a mask returned by [`Machine::suspend_signals`]. Delivers any
    /// pending signals if this unmasks.
    fn resume_signals(&self, state: SignalState);

    /// Unconditionally unmasks delivery. Used at the top of new contexts.
    fn enable_signals(&self);

    /// Blocks the CPU until a signal is pending (or `timeout` elapses) and
    /// delivers it. Called by the idle loop.
    fn wait_for_signals(&self, timeout: Duration);

    /// Arms `callback` to be delivered every `period`.
    fn request_alarm(&self, period: Duration, callback: AlarmCallback)
        -> Result<(), MachineError>;

    /// Starts an asynchronous file operation. `done` runs exactly once, as a
    /// signal, when the operation completes.
    fn submit(&self, op: FileOp, done: Completion);
}
