//! The interrupt gate and the simulated clock.
//!
//! Interrupt disable/restore is the single mutual-exclusion primitive
//! for scheduler state: every scheduler-touching operation brackets
//! itself with `disable`/`restore`. The clock only moves while
//! interrupts are enabled — by `KERNEL_TICK` whenever they are
//! re-enabled and by `USER_TICK` per executed guest instruction — and
//! due device interrupts are serviced at those points, with the gate
//! closed, on the current thread's stack.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use lazy_static::lazy_static;
use spin::Mutex;

/// Ticks charged when interrupts are re-enabled from kernel code.
pub const KERNEL_TICK: u64 = 10;
/// Ticks charged per executed guest instruction.
pub const USER_TICK: u64 = 1;

/// The interrupting devices of the simulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Device {
    Timer,
}

struct InterruptState {
    enabled: bool,
    ticks: u64,
    /// Min-heap of (due-tick, sequence, device).
    pending: BinaryHeap<Reverse<(u64, u64, Device)>>,
    next_seq: u64,
}

lazy_static! {
    static ref INTERRUPT: Mutex<InterruptState> = Mutex::new(InterruptState {
        enabled: false,
        ticks: 0,
        pending: BinaryHeap::new(),
        next_seq: 0,
    });
}

/// Reset the gate: interrupts disabled, clock at zero, nothing pending.
pub fn init() {
    let mut st = INTERRUPT.lock();
    st.enabled = false;
    st.ticks = 0;
    st.pending.clear();
    st.next_seq = 0;
}

/// Current time of the simulated clock, in ticks.
pub fn ticks() -> u64 {
    INTERRUPT.lock().ticks
}

pub fn enabled() -> bool {
    INTERRUPT.lock().enabled
}

/// Close the gate, returning the previous state for `restore`.
pub fn disable() -> bool {
    let mut st = INTERRUPT.lock();
    let old = st.enabled;
    st.enabled = false;
    old
}

/// Reopen the gate if `old` says it was open.
pub fn restore(old: bool) {
    if old {
        enable();
    }
}

/// Open the gate. Must currently be closed; re-enabling advances the
/// clock and services anything that came due meanwhile.
pub fn enable() {
    {
        let mut st = INTERRUPT.lock();
        assert!(!st.enabled, "interrupt: enable while already enabled");
        st.enabled = true;
    }
    tick(KERNEL_TICK);
}

/// Panic unless the gate is closed. Scheduler entry points call this.
pub fn assert_disabled() {
    assert!(!INTERRUPT.lock().enabled, "interrupt: expected interrupts disabled");
}

/// Schedule `device` to interrupt `delay` ticks from now.
pub fn schedule(delay: u64, device: Device) {
    let mut st = INTERRUPT.lock();
    let due = st.ticks + delay.max(1);
    let seq = st.next_seq;
    st.next_seq += 1;
    st.pending.push(Reverse((due, seq, device)));
}

/// Advance the clock and service due interrupts. Callers hold the gate
/// open; each handler runs with it closed and may context-switch away
/// (the service loop resumes when the thread is scheduled back in).
pub(crate) fn tick(amount: u64) {
    {
        let mut st = INTERRUPT.lock();
        debug_assert!(st.enabled, "interrupt: tick with interrupts disabled");
        st.ticks += amount;
    }
    loop {
        let device = {
            let mut st = INTERRUPT.lock();
            match st.pending.peek() {
                Some(&Reverse((due, _, _))) if due <= st.ticks => {
                    st.enabled = false;
                    let Reverse((_, _, device)) = st.pending.pop().unwrap();
                    Some(device)
                }
                _ => None,
            }
        };
        let Some(device) = device else { break };
        dispatch(device);
        INTERRUPT.lock().enabled = true;
    }
}

fn dispatch(device: Device) {
    match device {
        Device::Timer => super::timer::interrupt(),
    }
}
