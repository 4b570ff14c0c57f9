//! Built-in programs.

use vmk::{
    ModuleRegistry, MutexId, OpenFlags, Priority, ThreadId, ThreadState, Vm, VmResult,
    DEFAULT_STACK_SIZE, TIMEOUT_INFINITE,
};

pub fn registry() -> ModuleRegistry {
    ModuleRegistry::new()
        .register("hello", hello)
        .register("yield", yield_demo)
        .register("mutex", mutex_demo)
        .register("sleep", sleep_demo)
        .register("cat", cat)
}

fn say(vm: &Vm, text: &str) {
    if let Err(err) = vm.file_write(1, text.as_bytes()) {
        log::warn!("write to stdout failed: {}", err);
    }
}

fn hello(vm: &Vm, _argv: &[String]) {
    say(vm, "Hello, world!\n");
}

/// Two NORMAL threads taking turns with explicit yields.
fn yield_demo(vm: &Vm, argv: &[String]) {
    let rounds: u32 = argv.get(1).and_then(|arg| arg.parse().ok()).unwrap_or(3);
    let mut ids = Vec::new();
    for name in ["A", "B"] {
        let worker = vm.clone();
        let spawned = vm.thread_create(
            move || {
                for round in 0..rounds {
                    say(&worker, &format!("thread {} round {}\n", name, round));
                    worker.yield_now();
                }
            },
            DEFAULT_STACK_SIZE,
            Priority::Normal,
        );
        match spawned.and_then(|id| vm.thread_activate(id).map(|()| id)) {
            Ok(id) => ids.push(id),
            Err(err) => say(vm, &format!("cannot start thread {}: {}\n", name, err)),
        }
    }
    wait_all_dead(vm, &ids);
}

/// LOW and HIGH waiters on one mutex; the HIGH one is served first.
fn mutex_demo(vm: &Vm, _argv: &[String]) {
    let run = || -> VmResult<()> {
        let mutex = vm.mutex_create()?;
        vm.mutex_acquire(mutex, TIMEOUT_INFINITE)?;
        say(vm, "main holds the mutex\n");

        let low = spawn_waiter(vm, mutex, "low", Priority::Low)?;
        vm.thread_activate(low)?;
        // Let the low thread queue up before the high one.
        vm.thread_sleep(1)?;
        let high = spawn_waiter(vm, mutex, "high", Priority::High)?;
        vm.thread_activate(high)?;

        say(vm, "main releases the mutex\n");
        vm.mutex_release(mutex)?;
        wait_all_dead(vm, &[low, high]);
        vm.mutex_delete(mutex)
    };
    if let Err(err) = run() {
        say(vm, &format!("mutex demo failed: {}\n", err));
    }
}

fn spawn_waiter(
    vm: &Vm,
    mutex: MutexId,
    name: &'static str,
    priority: Priority,
) -> VmResult<ThreadId> {
    let worker = vm.clone();
    vm.thread_create(
        move || {
            if worker.mutex_acquire(mutex, TIMEOUT_INFINITE).is_ok() {
                say(&worker, &format!("{} thread got the mutex\n", name));
                let _ = worker.mutex_release(mutex);
            }
        },
        DEFAULT_STACK_SIZE,
        priority,
    )
}

fn sleep_demo(vm: &Vm, argv: &[String]) {
    let ticks = argv.get(1).and_then(|arg| arg.parse().ok()).unwrap_or(10);
    let before = vm.tick_count();
    match vm.thread_sleep(ticks) {
        Ok(()) => say(
            vm,
            &format!(
                "slept {} ticks of {} ms (tick {} -> {})\n",
                ticks,
                vm.tick_ms(),
                before,
                vm.tick_count()
            ),
        ),
        Err(err) => say(vm, &format!("sleep failed: {}\n", err)),
    }
}

/// Copies each named file to stdout.
fn cat(vm: &Vm, argv: &[String]) {
    let copy = |path: &str| -> VmResult<()> {
        let fd = vm.file_open(path, OpenFlags::READ, 0)?;
        let mut buf = [0u8; 512];
        loop {
            let count = vm.file_read(fd, &mut buf)?;
            if count == 0 {
                break;
            }
            vm.file_write(1, &buf[..count])?;
        }
        vm.file_close(fd)
    };
    for path in argv.iter().skip(1) {
        if let Err(err) = copy(path.as_str()) {
            say(vm, &format!("cat: {}: {}\n", path, err));
        }
    }
}

/// Sleeps one tick at a time until every thread in `ids` is DEAD, then
/// deletes them.
fn wait_all_dead(vm: &Vm, ids: &[ThreadId]) {
    let alive = |id: &ThreadId| matches!(vm.thread_state(*id), Ok(state) if state != ThreadState::Dead);
    while ids.iter().any(alive) {
        if vm.thread_sleep(1).is_err() {
            return;
        }
    }
    for &id in ids {
        let _ = vm.thread_delete(id);
    }
}
