//! The user-process subsystem: bounded virtual-memory copies, the fd
//! table, fault-driven page allocation, and process
//! spawn/join/exit — with real guest programs where it matters.

mod common;

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;

use churro_os::config::SchedulerPolicy;
use churro_os::machine::object_file::ObjectFileBuilder;
use churro_os::machine::{console, processor};
use churro_os::threads::KThread;
use churro_os::userprog::process::{
    SYS_CLOSE, SYS_CREATE, SYS_EXEC, SYS_EXIT, SYS_HALT, SYS_JOIN, SYS_OPEN, SYS_READ,
    SYS_UNLINK, SYS_WRITE,
};
use churro_os::userprog::{frame_pool, SyscallOutcome, UserProcess};

use common::{Asm, A0, A1, A2, A3, V0};

fn syscall(process: &mut UserProcess, number: i32, args: [i32; 4]) -> i32 {
    match process.handle_syscall(number, args) {
        SyscallOutcome::Return(value) => value,
        SyscallOutcome::Exit => panic!("syscall unexpectedly exited the process"),
    }
}

#[test]
fn virtual_memory_round_trips_across_pages() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let mut process = UserProcess::new("vm");
    assert!(process.allocate_page(0));
    assert!(process.allocate_page(1));

    let data: Vec<u8> = (0..2000).map(|i| (i * 7 % 251) as u8).collect();
    assert_eq!(process.write_virtual_memory(40, &data), 2000);
    let mut back = vec![0u8; 2000];
    assert_eq!(process.read_virtual_memory(40, &mut back), 2000);
    assert_eq!(back, data);
}

#[test]
fn copies_stop_at_invalid_pages_and_never_panic() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let mut process = UserProcess::new("vm");
    assert!(process.allocate_page(0));

    // First page bad: zero bytes transferred.
    let mut buf = [0u8; 16];
    assert_eq!(process.read_virtual_memory(5 * 1024, &mut buf), 0);
    assert_eq!(process.write_virtual_memory(5 * 1024, &buf), 0);

    // Copy runs into the unmapped second page and stops at the seam.
    let data = [7u8; 300];
    let moved = process.write_virtual_memory(900, &data);
    assert_eq!(moved, 1024 - 900);

    // Far outside the address space entirely.
    assert_eq!(process.write_virtual_memory(u32::MAX - 8, &data), 0);
}

#[test]
fn string_reads_require_a_terminator() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let mut process = UserProcess::new("vm");
    assert!(process.allocate_page(0));

    process.write_virtual_memory(100, b"hello\0");
    assert_eq!(
        process.read_virtual_memory_string(100),
        Some("hello".to_string())
    );

    // 300 bytes of garbage, no NUL within the limit.
    process.write_virtual_memory(400, &[b'x'; 300]);
    assert_eq!(process.read_virtual_memory_string(400), None);
}

#[test]
fn fd_table_create_open_read_write_close_unlink() {
    let kernel = common::boot(SchedulerPolicy::Priority);
    let mut process = UserProcess::new("files");
    assert!(process.allocate_page(0));

    process.write_virtual_memory(16, b"f.txt\0");
    let payload = b"one hundred twenty-eight bytes? no - but enough to check cursors";
    process.write_virtual_memory(256, payload);

    // fds are monotonic from 2; 0 and 1 belong to the console.
    let fd = syscall(&mut process, SYS_CREATE, [16, 0, 0, 0]);
    assert_eq!(fd, 2);
    let fd2 = syscall(&mut process, SYS_OPEN, [16, 0, 0, 0]);
    assert_eq!(fd2, 3);

    let wrote = syscall(&mut process, SYS_WRITE, [fd, 256, payload.len() as i32, 0]);
    assert_eq!(wrote, payload.len() as i32);
    assert_eq!(kernel.fs.contents("f.txt").unwrap(), payload);

    // The second handle has its own cursor at zero.
    let got = syscall(&mut process, SYS_READ, [fd2, 512, payload.len() as i32, 0]);
    assert_eq!(got, payload.len() as i32);
    let mut back = vec![0u8; payload.len()];
    process.read_virtual_memory(512, &mut back);
    assert_eq!(back, payload);

    assert_eq!(syscall(&mut process, SYS_CLOSE, [fd, 0, 0, 0]), 0);
    assert_eq!(syscall(&mut process, SYS_CLOSE, [fd, 0, 0, 0]), -1);

    // Bad arguments come back as -1, not as crashes.
    assert_eq!(syscall(&mut process, SYS_READ, [99, 512, 4, 0]), -1);
    assert_eq!(syscall(&mut process, SYS_READ, [fd2, 512, -4, 0]), -1);
    assert_eq!(syscall(&mut process, SYS_OPEN, [5 * 1024, 0, 0, 0]), -1);

    assert_eq!(syscall(&mut process, SYS_UNLINK, [16, 0, 0, 0]), 0);
    assert_eq!(syscall(&mut process, SYS_UNLINK, [16, 0, 0, 0]), -1);
    assert_eq!(syscall(&mut process, SYS_OPEN, [16, 0, 0, 0]), -1);
}

#[test]
fn console_fds_are_preinstalled() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let mut process = UserProcess::new("console");
    assert!(process.allocate_page(0));

    console::feed_input(b"in");
    let got = syscall(&mut process, SYS_READ, [0, 64, 8, 0]);
    assert_eq!(got, 2);
    let mut back = [0u8; 2];
    process.read_virtual_memory(64, &mut back);
    assert_eq!(&back, b"in");

    process.write_virtual_memory(128, b"out");
    assert_eq!(syscall(&mut process, SYS_WRITE, [1, 128, 3, 0]), 3);
    assert_eq!(console::take_output(), b"out");
}

#[test]
fn halt_is_root_only() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let mut root = UserProcess::new("root");
    assert_eq!(root.pid(), 0);
    let mut other = UserProcess::new("other");
    assert_eq!(other.pid(), 1);

    assert_eq!(syscall(&mut other, SYS_HALT, [0, 0, 0, 0]), -1);
    assert!(!churro_os::machine::halted());

    assert!(root.allocate_page(0));
    assert_eq!(
        root.handle_syscall(SYS_HALT, [0, 0, 0, 0]),
        SyscallOutcome::Exit
    );
    assert!(churro_os::machine::halted());
}

/// Child program for the spawn/join scenario: create "out.dat", write
/// 128 bytes from its data section, close, exit(0). Fifteen
/// instructions of code, then the name, then the payload.
fn writer_program() -> Vec<u8> {
    const NAME_ADDR: u32 = 15 * 8;
    const DATA_ADDR: u32 = NAME_ADDR + 8;
    let mut asm = Asm::new();
    asm.li(A0, NAME_ADDR)
        .li(V0, SYS_CREATE as u32)
        .sys()
        .mov(A3, V0)
        .mov(A0, A3)
        .li(A1, DATA_ADDR)
        .li(A2, 128)
        .li(V0, SYS_WRITE as u32)
        .sys()
        .mov(A0, A3)
        .li(V0, SYS_CLOSE as u32)
        .sys()
        .li(A0, 0)
        .li(V0, SYS_EXIT as u32)
        .sys();
    assert_eq!(asm.pos(), NAME_ADDR);
    asm.data(b"out.dat\0");
    assert_eq!(asm.pos(), DATA_ADDR);
    let payload: Vec<u8> = (0..128).map(|i| i as u8).collect();
    asm.data(&payload);
    ObjectFileBuilder::new(0).section(asm.finish(), false).build()
}

#[test]
fn exec_join_exit_round_trip() {
    let kernel = common::boot(SchedulerPolicy::Priority);
    kernel.fs.install("child", writer_program());

    let mut parent = UserProcess::new("parent");
    assert_eq!(parent.pid(), 0);
    assert!(parent.allocate_page(0));
    parent.write_virtual_memory(16, b"child\0");

    let child_pid = syscall(&mut parent, SYS_EXEC, [16, 0, 0, 0]);
    assert!(child_pid > 0, "exec failed: {}", child_pid);

    // Join: blocks until the child is done, writes its status word.
    let joined = syscall(&mut parent, SYS_JOIN, [child_pid, 64, 0, 0]);
    assert_eq!(joined, 1);
    let mut status = [0u8; 4];
    parent.read_virtual_memory(64, &mut status);
    assert_eq!(i32::from_le_bytes(status), 0);

    let expected: Vec<u8> = (0..128).map(|i| i as u8).collect();
    assert_eq!(kernel.fs.contents("out.dat").unwrap(), expected);

    // Joining the same pid twice fails: the record was consumed.
    assert_eq!(syscall(&mut parent, SYS_JOIN, [child_pid, 64, 0, 0]), -1);

    parent.write_virtual_memory(96, b"out.dat\0");
    assert_eq!(syscall(&mut parent, SYS_UNLINK, [96, 0, 0, 0]), 0);
    assert_eq!(syscall(&mut parent, SYS_OPEN, [96, 0, 0, 0]), -1);
}

#[test]
fn exec_of_a_missing_program_fails() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let mut parent = UserProcess::new("parent");
    assert!(parent.allocate_page(0));
    parent.write_virtual_memory(16, b"nope\0");
    assert_eq!(syscall(&mut parent, SYS_EXEC, [16, 0, 0, 0]), -1);
}

#[test]
fn page_faults_allocate_on_demand() {
    let fs = Arc::new(churro_os::machine::filesys::MemFileSystem::new());
    let mut asm = Asm::new();
    asm.li(A1, 0xABCD)
        .li(A0, 3 * 1024)
        .sw(A0, A1, 0)
        .lw(A2, A0, 0)
        .bne(A2, A1, 64)
        .li(A0, 0)
        .li(V0, SYS_EXIT as u32)
        .sys()
        .li(A0, 1)
        .li(V0, SYS_EXIT as u32)
        .sys();
    fs.install(
        "faulter",
        ObjectFileBuilder::new(0).section(asm.finish(), false).build(),
    );

    let (status, _turn) = common::run_program(SchedulerPolicy::Priority, fs, "faulter", &[]);
    let status = status.expect("no exit status");
    assert!(status.normal);
    assert_eq!(status.code, 0);
}

#[test]
fn writes_to_read_only_pages_kill_the_process() {
    let fs = Arc::new(churro_os::machine::filesys::MemFileSystem::new());
    let mut asm = Asm::new();
    asm.li(A0, 0).li(A1, 1).sw(A0, A1, 0);
    fs.install(
        "scribbler",
        ObjectFileBuilder::new(0).section(asm.finish(), true).build(),
    );

    let (status, _turn) = common::run_program(SchedulerPolicy::Priority, fs, "scribbler", &[]);
    let status = status.expect("no exit status");
    assert!(!status.normal);
    assert_eq!(status.code, processor::Exception::ReadOnly as i32);
}

#[test]
fn guest_console_output_arrives() {
    let fs = Arc::new(churro_os::machine::filesys::MemFileSystem::new());
    // Eight instructions of code, then the two output bytes.
    let mut asm = Asm::new();
    asm.li(A0, 1)
        .li(A1, 8 * 8)
        .li(A2, 2)
        .li(V0, SYS_WRITE as u32)
        .sys()
        .li(A0, 0)
        .li(V0, SYS_EXIT as u32)
        .sys();
    assert_eq!(asm.pos(), 8 * 8);
    asm.data(b"hi");
    fs.install(
        "greeter",
        ObjectFileBuilder::new(0).section(asm.finish(), false).build(),
    );

    let (status, _turn) = common::run_program(SchedulerPolicy::Priority, fs, "greeter", &[]);
    assert_eq!(status.unwrap().code, 0);
    assert_eq!(console::take_output(), b"hi");
}

#[test]
fn argv_lands_in_the_last_page() {
    let kernel = common::boot(SchedulerPolicy::Priority);
    let mut asm = Asm::new();
    asm.li(A0, 0).li(V0, SYS_EXIT as u32).sys();
    kernel
        .fs
        .install("argued", ObjectFileBuilder::new(0).section(asm.finish(), false).build());

    let mut process = UserProcess::new("argued");
    process
        .load(&["alpha".to_string(), "bc".to_string()])
        .expect("load failed");

    let base = (processor::num_phys_pages() as u32 - 1) * 1024;
    let mut pointers = [0u8; 8];
    assert_eq!(process.read_virtual_memory(base, &mut pointers), 8);
    let p0 = u32::from_le_bytes(pointers[0..4].try_into().unwrap());
    let p1 = u32::from_le_bytes(pointers[4..8].try_into().unwrap());
    assert_eq!(p0, base + 8);
    assert_eq!(p1, base + 8 + 6);
    assert_eq!(process.read_virtual_memory_string(p0).unwrap(), "alpha");
    assert_eq!(process.read_virtual_memory_string(p1).unwrap(), "bc");
}

#[test]
fn guest_receives_argc() {
    let fs = Arc::new(churro_os::machine::filesys::MemFileSystem::new());
    // Exit status = A0 = argc, staged by the loader.
    let mut asm = Asm::new();
    asm.li(V0, SYS_EXIT as u32).sys();
    fs.install(
        "argc",
        ObjectFileBuilder::new(0).section(asm.finish(), false).build(),
    );

    let (status, _turn) = common::run_program(SchedulerPolicy::Priority, fs, "argc", &["x", "y"]);
    let status = status.unwrap();
    assert!(status.normal);
    assert_eq!(status.code, 2);
}

#[test]
fn frame_starvation_blocks_until_frames_return() {
    let _kernel = common::boot_with(SchedulerPolicy::Priority, 8, 1);

    // Drain the pool.
    let mut hoard = Vec::new();
    while let Some(frame) = frame_pool::try_allocate() {
        hoard.push(frame);
    }
    assert_eq!(hoard.len(), 8);

    let got: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
    let starved = {
        let got = got.clone();
        KThread::new("starved", move || {
            *got.lock().unwrap() = Some(frame_pool::allocate_or_wait());
        })
    };
    starved.fork();
    KThread::yield_now();
    assert_eq!(*got.lock().unwrap(), None);

    // Giving one frame back wakes the starved thread.
    frame_pool::release(&hoard[..1]);
    starved.join();
    assert_eq!(*got.lock().unwrap(), Some(hoard[0]));
}
