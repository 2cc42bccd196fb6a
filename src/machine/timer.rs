//! The timer device.
//!
//! Interrupts roughly every [`TIMER_TICKS`] ticks (jittered, average
//! equal to the period) and invokes a kernel-installed hook. The
//! thread system points the hook at the alarm service, which wakes
//! expired sleepers and then yields the interrupted thread.

use std::sync::Arc;

use lazy_static::lazy_static;
use spin::Mutex;

use super::interrupt::{self, Device};
use super::rng;

/// Average number of ticks between timer interrupts.
pub const TIMER_TICKS: u64 = 500;

lazy_static! {
    static ref HANDLER: Mutex<Option<Arc<dyn Fn() + Send + Sync>>> = Mutex::new(None);
}

/// Reset the device and schedule the first interrupt.
pub fn init() {
    *HANDLER.lock() = None;
    interrupt::schedule(next_delay(), Device::Timer);
}

/// Install the interrupt hook. At most one is active.
pub fn set_handler(handler: Arc<dyn Fn() + Send + Sync>) {
    *HANDLER.lock() = Some(handler);
}

/// Current time in ticks.
pub fn get_time() -> u64 {
    interrupt::ticks()
}

fn next_delay() -> u64 {
    TIMER_TICKS / 2 + rng::next_range(TIMER_TICKS)
}

/// Service routine: reschedule, then run the hook. Runs with
/// interrupts disabled; the hook may context-switch away.
pub(crate) fn interrupt() {
    interrupt::schedule(next_delay(), Device::Timer);
    let handler = HANDLER.lock().clone();
    if let Some(handler) = handler {
        handler();
    }
}
