//! Process-level kernel state: the pid map, process launch, and the
//! dispatch loop that runs guest code and routes its exceptions.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::KernelConfig;
use crate::machine::object_file::LoadError;
use crate::machine::processor;
use crate::threads::{KThread, ThreadContext};
use crate::userprog::process::{Action, ChildRecord, ExitStatus, UserProcess};

/// One live process, as the rest of the kernel sees it.
pub struct ProcessRecord {
    pub thread: KThread,
    pub status: Arc<Mutex<Option<ExitStatus>>>,
}

lazy_static! {
    static ref PROCESSES: Mutex<HashMap<u32, ProcessRecord>> = Mutex::new(HashMap::new());
    static ref NEXT_PID: Mutex<u32> = Mutex::new(0);
}

/// Reset process state and refill the frame pool. Runs at boot.
pub fn init() {
    PROCESSES.lock().clear();
    *NEXT_PID.lock() = 0;
    super::frame_pool::init(processor::num_phys_pages());
}

pub(crate) fn next_pid() -> u32 {
    let mut next = NEXT_PID.lock();
    let pid = *next;
    *next += 1;
    pid
}

/// Live processes.
pub fn process_count() -> usize {
    PROCESSES.lock().len()
}

/// Drop `pid` from the map. True when it was the last process — the
/// caller halts the machine.
pub(crate) fn unregister(pid: u32) -> bool {
    let mut processes = PROCESSES.lock();
    processes.remove(&pid).is_some() && processes.is_empty()
}

/// Start a loaded process on its own kernel thread and register it.
/// Returns the pid and the record the parent keeps for `join`.
pub fn launch(process: UserProcess) -> (u32, ChildRecord) {
    let pid = process.pid();
    let status = process.exit_record();
    let context = UserContext {
        registers: process.initial_registers(),
        page_table: process.page_table(),
    };

    let thread_name = format!("{}#{}", process.name(), pid);
    let thread = KThread::new(&thread_name, move || process_entry(process));
    thread.set_context(Box::new(context));

    PROCESSES.lock().insert(
        pid,
        ProcessRecord {
            thread: thread.clone(),
            status: status.clone(),
        },
    );
    thread.fork();
    (pid, ChildRecord { thread, status })
}

/// Create, load, and launch the root process from the boot
/// configuration.
pub fn start_root(config: &KernelConfig) -> Result<ChildRecord, LoadError> {
    let mut root = UserProcess::new(&config.program);
    root.load(&config.args)?;
    let (pid, record) = launch(root);
    log::info!("kernel: root process '{}' is pid {}", config.program, pid);
    Ok(record)
}

/// Per-thread machine context of a user thread: the register file and
/// the page table the processor translates through.
struct UserContext {
    registers: [i32; processor::NUM_REGS],
    page_table: Arc<Mutex<Vec<processor::TranslationEntry>>>,
}

impl ThreadContext for UserContext {
    fn save(&mut self) {
        self.registers = processor::save_registers();
    }

    fn restore(&mut self) {
        processor::load_registers(&self.registers);
        processor::set_page_table(self.page_table.clone());
    }
}

/// Body of every process thread: run guest instructions, hand each
/// exception to the owning process, stop when it exits or the machine
/// halts. The thread finishes (waking joiners) when this returns.
fn process_entry(mut process: UserProcess) {
    loop {
        if crate::machine::halted() {
            break;
        }
        match processor::step() {
            Ok(()) => {}
            Err(cause) => {
                if process.handle_exception(cause) == Action::Exit {
                    break;
                }
            }
        }
    }
}
