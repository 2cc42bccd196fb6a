//! The simulated machine: everything the kernel proper treats as
//! hardware. Interrupt gate and clock, timer, context switching,
//! processor and physical memory, console, file systems, and the
//! object-code loader.

pub mod console;
pub mod filesys;
pub mod interrupt;
pub mod object_file;
pub mod processor;
pub mod rng;
pub mod tcb;
pub mod timer;

use std::sync::atomic::{AtomicBool, Ordering};

/// Machine-level knobs, fixed at boot.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub num_phys_pages: usize,
    pub seed: u64,
    pub mirror_console: bool,
}

impl Default for MachineConfig {
    fn default() -> MachineConfig {
        MachineConfig {
            num_phys_pages: 64,
            seed: 0,
            mirror_console: false,
        }
    }
}

static HALTED: AtomicBool = AtomicBool::new(false);

/// Power on (or reset) the machine. Interrupts come up disabled; the
/// kernel enables them once its own state is ready.
pub fn init(config: &MachineConfig) {
    HALTED.store(false, Ordering::SeqCst);
    rng::seed(config.seed);
    interrupt::init();
    processor::init(config.num_phys_pages);
    console::init(config.mirror_console);
    timer::init();
    log::debug!(
        "machine: {} pages of physical memory, seed {}",
        config.num_phys_pages,
        config.seed
    );
}

/// Stop the machine. Running kernel threads observe this and wind
/// down; parked ones are abandoned with it.
pub fn halt() {
    log::info!("machine: halting");
    HALTED.store(true, Ordering::SeqCst);
}

pub fn halted() -> bool {
    HALTED.load(Ordering::SeqCst)
}
