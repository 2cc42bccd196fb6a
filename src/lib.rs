//! ChurroOS: a didactic operating-system kernel on a simulated
//! machine.
//!
//! The interesting part is the donation-aware scheduler — wait queues
//! that carry priority (or lottery-ticket) donation from waiters to
//! resource holders, across chains of held and waited-for resources.
//! On top of it sit an alarm service, locks, condition variables, a
//! rendezvous channel, and a user-process subsystem with paged
//! address spaces and a ten-call syscall surface.
//!
//! The machine is simulated, so the whole kernel runs (and is tested)
//! as an ordinary hosted crate: kernel threads ride parked host
//! threads with a baton handoff, the clock is a tick counter advanced
//! by the interrupt gate, and the processor interprets a small
//! fixed-width instruction set against paged byte memory.

pub mod config;
pub mod machine;
pub mod threads;
pub mod userprog;

use std::sync::Arc;

use config::KernelConfig;
use machine::filesys::{self, MemFileSystem};
use machine::interrupt;
use machine::object_file::LoadError;
use threads::KThread;
use userprog::ExitStatus;

/// Bring the kernel up: machine, file system, thread system, process
/// subsystem, in that order, then open the interrupt gate. The
/// calling host thread becomes the kernel's main thread. Idempotent
/// across calls in one host process; each call is a fresh boot.
pub fn boot(config: &KernelConfig) {
    machine::init(&config.machine);
    let fs = config
        .file_system
        .clone()
        .unwrap_or_else(|| Arc::new(MemFileSystem::new()));
    filesys::mount(fs);
    threads::init(config.policy);
    userprog::kernel::init();
    interrupt::enable();
    log::info!("kernel: boot complete");
}

/// Boot, run the configured root program, and wait for the machine to
/// halt (last process gone, or root called `halt`). Returns the root
/// process's exit status, or `None` if it never recorded one.
pub fn run(config: &KernelConfig) -> Result<Option<ExitStatus>, LoadError> {
    boot(config);
    let root = userprog::kernel::start_root(config)?;
    while !machine::halted() {
        KThread::yield_now();
    }
    let status = *root.status.lock();
    log::info!("kernel: machine halted, root status {:?}", status);
    Ok(status)
}
