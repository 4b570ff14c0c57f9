//! Blocking file calls over the machine's asynchronous file device.
//!
//! Each call submits its request, parks the caller in WAITING and lets
//! other threads run. The completion stores the reply in the caller's
//! control block and makes it READY again.

use std::path::Path;

use mach::{FileOp, IoReply, Machine};

pub use mach::{Fd, OpenFlags, Whence};

use crate::error::{VmError, VmResult};
use crate::kernel::Vm;
use crate::scheduler::Handoff;
use crate::thread::{ThreadId, ThreadState, WaitReason};

impl<M: Machine> Vm<M> {
    /// Opens `path` and returns its descriptor. `mode` applies when the file
    /// is created.
    pub fn file_open(&self, path: impl AsRef<Path>, flags: OpenFlags, mode: u32) -> VmResult<Fd> {
        let reply = self.submit_and_wait(FileOp::Open {
            path: path.as_ref().to_path_buf(),
            flags,
            mode,
        })?;
        Ok(reply.result)
    }

    /// Closes `fd`.
    pub fn file_close(&self, fd: Fd) -> VmResult<()> {
        self.submit_and_wait(FileOp::Close { fd })?;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes. Returns 0 at end of file.
    pub fn file_read(&self, fd: Fd, buf: &mut [u8]) -> VmResult<usize> {
        let reply = self.submit_and_wait(FileOp::Read { fd, len: buf.len() })?;
        let count = reply.data.len().min(buf.len());
        buf[..count].copy_from_slice(&reply.data[..count]);
        Ok(count)
    }

    /// Writes `data` and returns the number of bytes written.
    pub fn file_write(&self, fd: Fd, data: &[u8]) -> VmResult<usize> {
        let reply = self.submit_and_wait(FileOp::Write {
            fd,
            data: data.to_vec(),
        })?;
        usize::try_from(reply.result).map_err(|_| VmError::Failure)
    }

    /// Moves the file offset. Returns the new offset from the start.
    pub fn file_seek(&self, fd: Fd, offset: i64, whence: Whence) -> VmResult<u64> {
        let reply = self.submit_and_wait(FileOp::Seek { fd, offset, whence })?;
        u64::try_from(reply.result).map_err(|_| VmError::Failure)
    }

    fn submit_and_wait(&self, op: FileOp) -> VmResult<IoReply> {
        let _cs = self.critical();
        let (me, seq) = {
            let mut state = self.inner.state.lock();
            let me = state.running;
            let tcb = state.thread_mut(me)?;
            tcb.io_seq = tcb.io_seq.wrapping_add(1);
            tcb.io_reply = None;
            tcb.wait = Some(WaitReason::Io);
            (me, tcb.io_seq)
        };

        let weak = self.weak();
        self.inner.machine.submit(
            op,
            Box::new(move |reply| match Vm::upgrade(&weak) {
                Some(vm) => vm.complete_io(me, seq, reply),
                None => log::warn!("I/O completion for thread {} after shutdown", me),
            }),
        );

        let plan = self
            .inner
            .state
            .lock()
            .plan_dispatch(ThreadState::Waiting, Handoff::Preempt);
        self.dispatch(plan);

        let reply = self
            .inner
            .state
            .lock()
            .thread_mut(me)?
            .io_reply
            .take()
            .ok_or(VmError::Failure)?;
        if reply.is_failure() {
            Err(VmError::Failure)
        } else {
            Ok(reply)
        }
    }

    /// Completion callback: hands `reply` to the waiting thread.
    fn complete_io(&self, id: ThreadId, seq: u64, reply: IoReply) {
        let _cs = self.critical();
        let plan = {
            let mut state = self.inner.state.lock();
            let waiting = state.threads.get_mut(&id).filter(|tcb| {
                tcb.state == ThreadState::Waiting
                    && tcb.wait == Some(WaitReason::Io)
                    && tcb.io_seq == seq
            });
            match waiting {
                Some(tcb) => {
                    tcb.io_reply = Some(reply);
                    state.make_ready(id);
                    state.plan_dispatch(ThreadState::Ready, Handoff::Preempt)
                }
                None => {
                    log::warn!("dropping stale I/O completion for thread {}", id);
                    None
                }
            }
        };
        self.dispatch(plan);
    }
}
