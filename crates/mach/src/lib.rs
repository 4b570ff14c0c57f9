//! # mach - Execution Context Bridge
//!
//! The lowest layer under the `vmk` runtime. It knows nothing about threads,
//! priorities or mutexes; it only provides the primitives a single-CPU
//! machine would:
//!
//! - resumable execution contexts and a switch between them
//! - an interrupt mask guarding delivery of the periodic alarm and of I/O
//!   completions
//! - a periodic alarm
//! - asynchronous file operations with completion callbacks
//!
//! ## Module Overview
//!
//! - [`machine`] - the [`Machine`] trait every runtime backend implements
//! - [`signals`] - signal mask tokens and the pending-signal queue
//! - [`context`] - OS-thread backed contexts with baton handoff
//! - [`alarm`] - clock modes and the drift-free ticker thread
//! - [`file`] - file operation requests, replies and the I/O worker
//! - [`host`] - [`HostMachine`], the implementation for hosted targets

pub mod alarm;
pub mod context;
pub mod file;
pub mod host;
pub mod machine;
pub mod signals;

pub use alarm::{AlarmCallback, Clock};
pub use context::{HostContext, Retired};
pub use file::{Completion, Fd, FileOp, IoReply, OpenFlags, Whence};
pub use host::{HostMachine, MachineConfig};
pub use machine::{ContextEntry, Machine, MachineError};
pub use signals::SignalState;
