//! Integration tests for the thread lifecycle, boot and program start.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vmk::{
    start, HostMachine, ModuleRegistry, Priority, Status, ThreadId, ThreadState, Vm, VmConfig,
    VmError,
};

fn boot() -> Vm {
    Vm::builder(HostMachine::virtual_clock())
        .boot()
        .expect("boot runtime")
}

#[test]
fn boot_adopts_the_caller_as_main() {
    let vm = boot();
    assert_eq!(vm.thread_id(), ThreadId::MAIN);
    assert_eq!(vm.thread_state(ThreadId::MAIN), Ok(ThreadState::Running));
    assert_eq!(vm.thread_state(ThreadId::IDLE), Ok(ThreadState::Dead));
    vm.shutdown().expect("shutdown");
}

#[test]
fn threads_are_created_dead_with_fresh_ids() {
    let vm = boot();
    let first = vm.thread_create(|| {}, 0x1000, Priority::Low).expect("create");
    let second = vm.thread_create(|| {}, 0x1000, Priority::Low).expect("create");

    assert!(!first.is_reserved());
    assert!(second > first);
    assert_eq!(vm.thread_state(first), Ok(ThreadState::Dead));

    vm.thread_delete(first).expect("delete");
    let third = vm.thread_create(|| {}, 0x1000, Priority::Low).expect("create");
    assert!(third > second);
    vm.shutdown().expect("shutdown");
}

#[test]
fn dead_thread_can_run_again() {
    let vm = boot();
    let runs = Arc::new(Mutex::new(0));
    let counter = runs.clone();
    let id = vm
        .thread_create(move || *counter.lock().unwrap() += 1, 0x10000, Priority::High)
        .expect("create");

    vm.thread_activate(id).expect("first run");
    vm.thread_activate(id).expect("second run");
    assert_eq!(*runs.lock().unwrap(), 2);
    vm.shutdown().expect("shutdown");
}

#[test]
fn terminating_a_ready_thread_keeps_it_from_running() {
    let vm = boot();
    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();
    let id = vm
        .thread_create(move || *flag.lock().unwrap() = true, 0x10000, Priority::Low)
        .expect("create");

    vm.thread_activate(id).expect("activate");
    assert_eq!(vm.thread_state(id), Ok(ThreadState::Ready));
    vm.thread_terminate(id).expect("terminate");
    assert_eq!(vm.thread_state(id), Ok(ThreadState::Dead));

    vm.thread_sleep(2).expect("sleep");
    assert!(!*ran.lock().unwrap());
    vm.shutdown().expect("shutdown");
}

#[test]
fn lifecycle_misuse_is_rejected() {
    let vm = boot();
    let id = vm.thread_create(|| {}, 0x1000, Priority::Normal).expect("create");

    assert_eq!(
        vm.thread_create(|| {}, 0, Priority::Normal),
        Err(VmError::InvalidParameter)
    );
    assert_eq!(vm.thread_terminate(id), Err(VmError::InvalidState));
    assert_eq!(vm.thread_state(ThreadId(999)), Err(VmError::InvalidId));
    assert_eq!(vm.thread_activate(ThreadId(999)), Err(VmError::InvalidId));
    assert_eq!(vm.thread_delete(ThreadId(999)), Err(VmError::InvalidId));

    assert_eq!(vm.thread_activate(ThreadId::IDLE), Err(VmError::InvalidState));
    assert_eq!(vm.thread_terminate(ThreadId::IDLE), Err(VmError::InvalidState));
    assert_eq!(vm.thread_delete(ThreadId::IDLE), Err(VmError::InvalidState));
    assert_eq!(vm.thread_delete(ThreadId::MAIN), Err(VmError::InvalidState));
    assert_eq!(vm.thread_activate(ThreadId::MAIN), Err(VmError::InvalidState));

    let busy = vm.thread_create(|| {}, 0x1000, Priority::Low).expect("create");
    vm.thread_activate(busy).expect("activate");
    assert_eq!(vm.thread_delete(busy), Err(VmError::InvalidState));
    assert_eq!(Status::from(&vm.thread_delete(busy)).code(), 4);
    vm.shutdown().expect("shutdown");
}

#[test]
fn only_main_may_shut_down() {
    let vm = boot();
    let outcome = Arc::new(Mutex::new(None));
    let (worker, slot) = (vm.clone(), outcome.clone());
    let id = vm
        .thread_create(
            move || *slot.lock().unwrap() = Some(worker.shutdown()),
            0x10000,
            Priority::High,
        )
        .expect("create");
    vm.thread_activate(id).expect("activate");

    assert_eq!(*outcome.lock().unwrap(), Some(Err(VmError::InvalidState)));
    vm.shutdown().expect("shutdown");
}

#[test]
fn start_runs_the_named_module_with_its_arguments() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let registry = ModuleRegistry::new().register("echo", move |vm: &Vm, argv: &[String]| {
        assert_eq!(vm.thread_id(), ThreadId::MAIN);
        record.lock().unwrap().extend(argv.iter().cloned());
    });

    let argv = vec!["echo".to_string(), "one".to_string(), "two".to_string()];
    start(
        HostMachine::virtual_clock(),
        VmConfig::default(),
        &registry,
        &argv,
    )
    .expect("start");
    assert_eq!(*seen.lock().unwrap(), argv);
}

#[test]
fn start_rejects_unknown_modules_and_empty_arguments() {
    let registry: ModuleRegistry = ModuleRegistry::new();
    assert_eq!(
        start(
            HostMachine::virtual_clock(),
            VmConfig::default(),
            &registry,
            &["nothing".to_string()],
        ),
        Err(VmError::Failure)
    );
    assert_eq!(
        start(HostMachine::virtual_clock(), VmConfig::default(), &registry, &[]),
        Err(VmError::InvalidParameter)
    );
}

#[test]
fn deleting_a_thread_drops_what_its_entry_captured() {
    let vm = boot();
    let captured = Arc::new(());

    let held = captured.clone();
    let id = vm
        .thread_create(
            move || {
                let _ = &held;
            },
            0x10000,
            Priority::High,
        )
        .expect("create thread");
    vm.thread_activate(id).expect("activate");
    assert_eq!(vm.thread_state(id), Ok(ThreadState::Dead));
    assert!(Arc::strong_count(&captured) > 1);

    vm.thread_delete(id).expect("delete");
    // The retired context unwinds on its own OS thread.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Arc::strong_count(&captured) > 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(Arc::strong_count(&captured), 1);
    vm.shutdown().expect("shutdown");
}
