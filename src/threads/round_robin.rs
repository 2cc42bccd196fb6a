//! First-come-first-served scheduling. No priorities, no donation;
//! queues are plain FIFOs.

use std::collections::VecDeque;

use spin::Mutex;

use crate::machine::interrupt;
use crate::threads::scheduler::{Scheduler, WaitQueue};
use crate::threads::KThread;

pub struct RoundRobinScheduler;

impl RoundRobinScheduler {
    pub fn new() -> RoundRobinScheduler {
        RoundRobinScheduler
    }
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for RoundRobinScheduler {
    fn new_wait_queue(&self, _transfer_donation: bool) -> Box<dyn WaitQueue> {
        Box::new(FifoQueue {
            waiters: Mutex::new(VecDeque::new()),
        })
    }

    fn priority(&self, _thread: &KThread) -> i32 {
        1
    }

    fn effective_priority(&self, _thread: &KThread) -> i32 {
        1
    }

    fn set_priority(&self, _thread: &KThread, _priority: i32) {}

    fn default_priority(&self) -> i32 {
        1
    }

    fn min_priority(&self) -> i32 {
        1
    }

    fn max_priority(&self) -> i32 {
        1
    }
}

struct FifoQueue {
    waiters: Mutex<VecDeque<KThread>>,
}

impl WaitQueue for FifoQueue {
    fn wait_for_access(&self, thread: &KThread) {
        interrupt::assert_disabled();
        self.waiters.lock().push_back(thread.clone());
    }

    fn acquire(&self, _thread: &KThread) {
        interrupt::assert_disabled();
        assert!(self.waiters.lock().is_empty(), "acquire on a busy queue");
    }

    fn next_thread(&self) -> Option<KThread> {
        interrupt::assert_disabled();
        self.waiters.lock().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}
