//! Alarm sources for the host machine.
//!
//! The realtime ticker runs on its own OS thread and only marks the alarm
//! pending; the callback itself is delivered on the logical thread that owns
//! the CPU.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::signals::SignalMask;

/// Callback invoked once per alarm period.
pub type AlarmCallback = Arc<dyn Fn() + Send + Sync>;

/// Source of alarm signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    /// Wall-clock ticker thread.
    #[default]
    Realtime,
    /// Time only advances when the machine idles with nothing in flight, or
    /// when [`HostMachine::raise_alarm`](crate::HostMachine::raise_alarm) is
    /// called.
    Virtual,
}

/// Drift-free periodic alarm thread.
pub(crate) struct Ticker {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self, period: Duration, signals: Arc<SignalMask>) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = Arc::clone(&self.running);
        let spawned = thread::Builder::new()
            .name("mach-ticker".into())
            .spawn(move || {
                // Sleep to absolute deadlines so the period does not drift.
                let mut next_tick = Instant::now();
                while running.load(Ordering::Relaxed) {
                    next_tick += period;
                    let now = Instant::now();
                    if next_tick > now {
                        thread::sleep(next_tick - now);
                    }
                    if running.load(Ordering::Relaxed) {
                        signals.raise_alarm();
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
