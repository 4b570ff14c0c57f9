//! Asynchronous file device.
//!
//! Requests are executed on a dedicated worker thread against a descriptor
//! table. Each reply is queued as a signal, so the completion callback runs
//! on whichever logical thread owns the CPU when delivery is next unmasked.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::signals::SignalMask;

/// File descriptor as seen by runtime programs.
pub type Fd = i32;

/// First descriptor handed out for opened files. 0, 1 and 2 are stdio.
pub const FIRST_FILE_FD: Fd = 3;

bitflags! {
    /// Open mode for [`FileOp::Open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const TRUNCATE = 1 << 3;
        const APPEND = 1 << 4;
    }
}

/// Origin for [`FileOp::Seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// A file request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Open {
        path: PathBuf,
        flags: OpenFlags,
        mode: u32,
    },
    Close {
        fd: Fd,
    },
    Read {
        fd: Fd,
        len: usize,
    },
    Write {
        fd: Fd,
        data: Vec<u8>,
    },
    Seek {
        fd: Fd,
        offset: i64,
        whence: Whence,
    },
}

/// Device reply: a negative `result` signals failure.
///
/// On success `result` is the new descriptor (open), the byte count (read,
/// write), the new offset (seek) or zero (close). `data` carries the bytes
/// of a read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoReply {
    pub result: i32,
    pub data: Vec<u8>,
}

impl IoReply {
    pub fn ok(result: i32) -> Self {
        Self {
            result,
            data: Vec::new(),
        }
    }

    pub fn failed() -> Self {
        Self::ok(-1)
    }

    pub fn is_failure(&self) -> bool {
        self.result < 0
    }
}

/// Completion callback for a submitted [`FileOp`].
pub type Completion = Box<dyn FnOnce(IoReply) + Send + 'static>;

/// Descriptor table owned by the I/O worker.
pub(crate) struct FileTable {
    files: BTreeMap<Fd, File>,
    next_fd: Fd,
}

impl FileTable {
    pub(crate) fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            next_fd: FIRST_FILE_FD,
        }
    }

    pub(crate) fn execute(&mut self, op: FileOp) -> IoReply {
        match self.try_execute(op) {
            Ok(reply) => reply,
            Err(err) => {
                log::debug!("file operation failed: {}", err);
                IoReply::failed()
            }
        }
    }

    fn try_execute(&mut self, op: FileOp) -> io::Result<IoReply> {
        match op {
            FileOp::Open { path, flags, mode } => {
                let file = open_options(flags, mode).open(&path)?;
                let fd = self.next_fd;
                self.next_fd = self.next_fd.checked_add(1).ok_or_else(exhausted)?;
                self.files.insert(fd, file);
                Ok(IoReply::ok(fd))
            }
            FileOp::Close { fd } => {
                if (0..FIRST_FILE_FD).contains(&fd) {
                    return Ok(IoReply::ok(0));
                }
                self.files.remove(&fd).ok_or_else(|| bad_fd(fd))?;
                Ok(IoReply::ok(0))
            }
            FileOp::Read { fd, len } => {
                let mut data = vec![0u8; len];
                let count = match fd {
                    0 => io::stdin().read(&mut data)?,
                    _ => self.file(fd)?.read(&mut data)?,
                };
                data.truncate(count);
                Ok(IoReply {
                    result: to_result(count as u64)?,
                    data,
                })
            }
            FileOp::Write { fd, data } => {
                let count = match fd {
                    1 => {
                        let mut out = io::stdout().lock();
                        out.write_all(&data)?;
                        out.flush()?;
                        data.len()
                    }
                    2 => {
                        io::stderr().write_all(&data)?;
                        data.len()
                    }
                    _ => self.file(fd)?.write(&data)?,
                };
                Ok(IoReply::ok(to_result(count as u64)?))
            }
            FileOp::Seek { fd, offset, whence } => {
                let from = match whence {
                    Whence::Start => {
                        SeekFrom::Start(u64::try_from(offset).map_err(|_| invalid_offset())?)
                    }
                    Whence::Current => SeekFrom::Current(offset),
                    Whence::End => SeekFrom::End(offset),
                };
                let position = self.file(fd)?.seek(from)?;
                Ok(IoReply::ok(to_result(position)?))
            }
        }
    }

    fn file(&mut self, fd: Fd) -> io::Result<&mut File> {
        self.files.get_mut(&fd).ok_or_else(|| bad_fd(fd))
    }
}

fn open_options(flags: OpenFlags, mode: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    options
        .read(flags.contains(OpenFlags::READ))
        .write(flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND))
        .append(flags.contains(OpenFlags::APPEND))
        .create(flags.contains(OpenFlags::CREATE))
        .truncate(flags.contains(OpenFlags::TRUNCATE));

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    options
}

fn to_result(value: u64) -> io::Result<i32> {
    i32::try_from(value).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "result out of range"))
}

fn bad_fd(fd: Fd) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("bad descriptor {}", fd))
}

fn invalid_offset() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "negative absolute offset")
}

fn exhausted() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "descriptor space exhausted")
}

type Request = (FileOp, Completion);

/// Worker thread executing file requests in submission order.
pub(crate) struct IoWorker {
    sender: Mutex<Option<Sender<Request>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
}

impl IoWorker {
    pub(crate) fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            handle: Mutex::new(None),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn start(&self, signals: Arc<SignalMask>) -> io::Result<()> {
        let mut sender = self.sender.lock();
        if sender.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<Request>();
        let in_flight = Arc::clone(&self.in_flight);
        let handle = thread::Builder::new()
            .name("mach-io".into())
            .spawn(move || {
                let mut table = FileTable::new();
                for (op, done) in rx {
                    let reply = table.execute(op);
                    signals.post(Box::new(move || done(reply)));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            })?;

        *sender = Some(tx);
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Queues `op`. Returns the request back if the worker is not running.
    pub(crate) fn submit(&self, op: FileOp, done: Completion) -> Result<(), Completion> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(done);
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        match tx.send((op, done)) {
            Ok(()) => Ok(()),
            Err(mpsc::SendError((_, done))) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(done)
            }
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        // Dropping the sender ends the worker loop once the queue drains.
        self.sender.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use std::process;

    fn scratch(name: &str) -> PathBuf {
        env::temp_dir().join(format!("mach-{}-{}", process::id(), name))
    }

    #[test]
    fn table_round_trips_a_file() {
        let path = scratch("table");
        let mut table = FileTable::new();

        let fd = table
            .execute(FileOp::Open {
                path: path.clone(),
                flags: OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode: 0o644,
            })
            .result;
        assert_eq!(fd, FIRST_FILE_FD);

        let written = table.execute(FileOp::Write {
            fd,
            data: b"hello".to_vec(),
        });
        assert_eq!(written.result, 5);

        let rewound = table.execute(FileOp::Seek {
            fd,
            offset: 0,
            whence: Whence::Start,
        });
        assert_eq!(rewound.result, 0);

        let read = table.execute(FileOp::Read { fd, len: 16 });
        assert_eq!(read.result, 5);
        assert_eq!(read.data, b"hello");

        let eof = table.execute(FileOp::Read { fd, len: 16 });
        assert_eq!(eof.result, 0);
        assert!(eof.data.is_empty());

        assert_eq!(table.execute(FileOp::Close { fd }).result, 0);
        assert!(table.execute(FileOp::Close { fd }).is_failure());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn descriptors_are_not_reused() {
        let path = scratch("reuse");
        let mut table = FileTable::new();
        let open = || FileOp::Open {
            path: path.clone(),
            flags: OpenFlags::WRITE | OpenFlags::CREATE,
            mode: 0o644,
        };

        let first = table.execute(open()).result;
        table.execute(FileOp::Close { fd: first });
        let second = table.execute(open()).result;
        assert_eq!(second, first + 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn bad_requests_fail() {
        let mut table = FileTable::new();
        assert!(table.execute(FileOp::Read { fd: 42, len: 1 }).is_failure());
        assert!(table
            .execute(FileOp::Open {
                path: scratch("missing/nested"),
                flags: OpenFlags::READ,
                mode: 0,
            })
            .is_failure());
        assert!(table
            .execute(FileOp::Seek {
                fd: 42,
                offset: -1,
                whence: Whence::Start,
            })
            .is_failure());
    }

    #[test]
    fn worker_posts_completions_as_signals() {
        let signals = Arc::new(SignalMask::new());
        let worker = IoWorker::new();
        worker.start(Arc::clone(&signals)).unwrap();

        let (tx, rx) = mpsc::channel();
        worker
            .submit(
                FileOp::Close { fd: 1 },
                Box::new(move |reply| tx.send(reply.result).unwrap()),
            )
            .map_err(|_| ())
            .unwrap();

        worker.stop();
        assert_eq!(worker.in_flight(), 0);
        assert!(rx.try_recv().is_err());

        match signals.take() {
            Some(crate::signals::Signal::Completion(handler)) => handler(),
            _ => panic!("expected a queued completion"),
        }
        assert_eq!(rx.try_recv(), Ok(0));
    }

    #[test]
    fn submit_without_worker_hands_back_the_completion() {
        let worker = IoWorker::new();
        let rejected = worker.submit(FileOp::Close { fd: 3 }, Box::new(|_| {}));
        assert!(rejected.is_err());
    }
}
