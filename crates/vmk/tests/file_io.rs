//! Integration tests for the blocking file calls.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};

use vmk::{HostMachine, OpenFlags, Priority, Vm, VmError, Whence};

fn boot() -> Vm {
    Vm::builder(HostMachine::virtual_clock())
        .boot()
        .expect("boot runtime")
}

fn scratch(name: &str) -> PathBuf {
    env::temp_dir().join(format!("vmk-{}-{}", process::id(), name))
}

#[test]
fn file_round_trip() {
    let vm = boot();
    let path = scratch("round-trip");

    let fd = vm
        .file_open(
            &path,
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
        )
        .expect("open");
    assert!(fd >= 3);

    assert_eq!(vm.file_write(fd, b"hello, world"), Ok(12));
    assert_eq!(vm.file_seek(fd, 7, Whence::Start), Ok(7));

    let mut buf = [0u8; 32];
    let count = vm.file_read(fd, &mut buf).expect("read");
    assert_eq!(&buf[..count], b"world");

    // End of file reads zero bytes and is still a success.
    assert_eq!(vm.file_read(fd, &mut buf), Ok(0));
    assert_eq!(vm.file_seek(fd, 0, Whence::Start), Ok(0));
    vm.file_close(fd).expect("close");

    assert_eq!(fs::read(&path).expect("read back"), b"hello, world");
    let _ = fs::remove_file(path);
    vm.shutdown().expect("shutdown");
}

#[test]
fn device_failures_surface_as_failure() {
    let vm = boot();
    assert_eq!(
        vm.file_open(scratch("missing/dir/file"), OpenFlags::READ, 0),
        Err(VmError::Failure)
    );
    assert_eq!(vm.file_close(99), Err(VmError::Failure));
    let mut buf = [0u8; 4];
    assert_eq!(vm.file_read(99, &mut buf), Err(VmError::Failure));
    vm.shutdown().expect("shutdown");
}

#[test]
fn thread_blocks_on_io_and_resumes() {
    let vm = boot();
    let path = scratch("concurrent");
    let log = Arc::new(Mutex::new(Vec::new()));

    let (worker, thread_log, thread_path) = (vm.clone(), log.clone(), path.clone());
    let writer = vm
        .thread_create(
            move || {
                let fd = worker
                    .file_open(&thread_path, OpenFlags::WRITE | OpenFlags::CREATE, 0o644)
                    .unwrap();
                thread_log.lock().unwrap().push("opened");
                worker.file_write(fd, b"data").unwrap();
                worker.file_close(fd).unwrap();
                thread_log.lock().unwrap().push("closed");
            },
            0x10000,
            Priority::High,
        )
        .expect("create thread");

    // The writer blocks on its open and hands the CPU back to main.
    vm.thread_activate(writer).expect("activate");

    vm.thread_sleep(1).expect("sleep");
    assert_eq!(*log.lock().unwrap(), vec!["opened", "closed"]);
    assert_eq!(vm.thread_state(writer), Ok(vmk::ThreadState::Dead));
    assert_eq!(fs::read(&path).expect("read back"), b"data");
    let _ = fs::remove_file(path);
    vm.shutdown().expect("shutdown");
}
