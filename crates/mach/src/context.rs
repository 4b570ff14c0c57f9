//! Host execution contexts.
//!
//! Every context is backed by its own OS thread, but only the holder of the
//! baton executes. A switch hands the baton to the target and parks the
//! caller until the baton comes back, so the OS scheduler never runs two
//! contexts at once.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::machine::ContextEntry;

/// Unwind payload used to end the OS thread behind a dropped context.
///
/// Code that catches panics inside a context must re-raise this payload
/// with [`std::panic::resume_unwind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Parked,
    Run,
    Retired,
}

struct Baton {
    turn: Mutex<Turn>,
    changed: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            turn: Mutex::new(Turn::Parked),
            changed: Condvar::new(),
        }
    }

    fn give(&self) {
        let mut turn = self.turn.lock();
        if *turn != Turn::Retired {
            *turn = Turn::Run;
        }
        self.changed.notify_one();
    }

    /// Parks until given the baton. Unwinds with [`Retired`] if the context
    /// was dropped in the meantime.
    fn take(&self) {
        let mut turn = self.turn.lock();
        loop {
            match *turn {
                Turn::Run => {
                    *turn = Turn::Parked;
                    return;
                }
                Turn::Retired => {
                    drop(turn);
                    panic::resume_unwind(Box::new(Retired));
                }
                Turn::Parked => self.changed.wait(&mut turn),
            }
        }
    }

    fn retire(&self) {
        *self.turn.lock() = Turn::Retired;
        self.changed.notify_all();
    }
}

/// Execution context of the [`HostMachine`](crate::HostMachine).
pub struct HostContext {
    baton: Arc<Baton>,
}

impl HostContext {
    pub(crate) fn adopt() -> Self {
        Self {
            baton: Arc::new(Baton::new()),
        }
    }

    pub(crate) fn spawn(name: String, stack_size: usize, entry: ContextEntry) -> io::Result<Self> {
        let baton = Arc::new(Baton::new());
        let turn = Arc::clone(&baton);
        thread::Builder::new()
            .name(name)
            .stack_size(stack_size)
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
                    turn.take();
                    entry();
                }));
                if let Err(payload) = outcome {
                    if !payload.is::<Retired>() {
                        log::error!(
                            "context {:?} unwound past its entry",
                            thread::current().name()
                        );
                    }
                }
            })?;
        Ok(Self { baton })
    }

    pub(crate) fn switch(from: &Self, to: &Self) {
        to.baton.give();
        from.baton.take();
    }

    pub(crate) fn retire(&self) {
        self.baton.retire();
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn spawned_context_waits_for_first_switch() {
        let (tx, rx) = mpsc::channel();
        let main = HostContext::adopt();
        let worker = HostContext::spawn(
            "worker".into(),
            64 * 1024,
            Box::new(move || {
                tx.send(1).unwrap();
            }),
        )
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        // The worker never switches back, so hand it the baton directly.
        worker.baton.give();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));
        drop(main);
    }

    #[test]
    fn dropping_a_parked_context_ends_its_thread() {
        let (tx, rx) = mpsc::channel::<()>();
        let worker = HostContext::spawn(
            "retiree".into(),
            64 * 1024,
            Box::new(move || {
                let _keep = tx;
            }),
        )
        .unwrap();

        drop(worker);
        // The sender is dropped while unwinding, which disconnects the channel.
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        );
    }
}
