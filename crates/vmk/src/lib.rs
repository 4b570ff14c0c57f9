//! # vmk - Cooperative Thread Runtime
//!
//! A user-level thread runtime for a single logical CPU. Threads run one at
//! a time on contexts provided by a [`mach::Machine`]; the runtime decides
//! who runs next.
//!
//! ## Features
//!
//! - Three priority levels, FIFO within a level
//! - Mutexes that hand ownership to the highest-priority waiter
//! - Tick-driven sleeps and timed mutex waits
//! - Blocking file calls layered over asynchronous completions
//! - Structured tracing through a [`TraceHook`]
//!
//! ## Example
//!
//! ```no_run
//! use vmk::{HostMachine, Priority, Vm};
//!
//! let vm = Vm::builder(HostMachine::realtime()).boot().unwrap();
//! let worker = vm.clone();
//! let id = vm
//!     .thread_create(
//!         move || {
//!             worker.file_write(1, b"hello\n").unwrap();
//!         },
//!         0x10000,
//!         Priority::High,
//!     )
//!     .unwrap();
//! vm.thread_activate(id).unwrap();
//! vm.shutdown().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod file;
pub mod kernel;
pub mod module;
pub mod mutex;
mod queue;
mod scheduler;
pub mod thread;
pub mod time;
pub mod trace;

pub use config::{VmConfig, VmConfigBuilder, DEFAULT_STACK_SIZE};
pub use error::{Status, VmError, VmResult};
pub use file::{Fd, OpenFlags, Whence};
pub use kernel::{Vm, VmBuilder};
pub use mach::{Clock, HostMachine, Machine, MachineConfig};
pub use module::{start, MainEntry, ModuleLoader, ModuleRegistry};
pub use mutex::MutexId;
pub use thread::{Priority, ThreadEntry, ThreadId, ThreadState, WaitReason};
pub use time::{Tick, Timeout, TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE};
pub use trace::{TraceEvent, TraceHook};
