//! The alarm: timer-driven sleep service.
//!
//! Sleepers enqueue `(wake_tick, thread)` into a min-heap and block;
//! each timer interrupt readies everything strictly past its wake
//! tick, then yields the interrupted thread. The comparator is a
//! strict `<`, so a thread whose deadline lands exactly on the
//! interrupt tick waits one more period.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::machine::{interrupt, timer};
use crate::threads::KThread;

struct Waiter {
    wake: u64,
    seq: u64,
    thread: KThread,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Waiter) -> bool {
        (self.wake, self.seq) == (other.wake, other.seq)
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Waiter) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Waiter) -> Ordering {
        (self.wake, self.seq).cmp(&(other.wake, other.seq))
    }
}

struct AlarmState {
    heap: BinaryHeap<Reverse<Waiter>>,
    next_seq: u64,
}

lazy_static! {
    static ref ALARM: Mutex<AlarmState> = Mutex::new(AlarmState {
        heap: BinaryHeap::new(),
        next_seq: 0,
    });
}

pub fn init() {
    let mut alarm = ALARM.lock();
    alarm.heap.clear();
    alarm.next_seq = 0;
}

/// Block the caller until the clock reads at least `now + delay`.
pub fn wait_until(delay: u64) {
    let wake = timer::get_time() + delay;
    let old = interrupt::disable();
    while timer::get_time() < wake {
        {
            let mut alarm = ALARM.lock();
            let seq = alarm.next_seq;
            alarm.next_seq += 1;
            alarm.heap.push(Reverse(Waiter {
                wake,
                seq,
                thread: crate::threads::current(),
            }));
        }
        KThread::sleep();
    }
    interrupt::restore(old);
}

/// Timer hook: ready every expired sleeper, then give up the
/// processor on the interrupted thread's behalf.
pub(crate) fn timer_interrupt() {
    let now = timer::get_time();
    loop {
        let thread = {
            let mut alarm = ALARM.lock();
            match alarm.heap.peek() {
                Some(Reverse(waiter)) if waiter.wake < now => {
                    Some(alarm.heap.pop().unwrap().0.thread)
                }
                _ => None,
            }
        };
        match thread {
            Some(thread) => thread.ready(),
            None => break,
        }
    }
    KThread::yield_now();
}
