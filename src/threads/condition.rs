//! Condition variables over a non-transferring wait queue.
//!
//! The queue must not transfer donation: a condition has no holder,
//! so blocked waiters would otherwise donate to nobody. `wake_all`
//! tracks exhaustion with a boolean set by the last `next_thread`
//! returning nothing and cleared by `sleep`; every caller holds the
//! associated lock, which is what makes the flag safe.

use std::sync::Arc;

use spin::Mutex;

use crate::machine::interrupt;
use crate::threads::scheduler::WaitQueue;
use crate::threads::{KThread, Lock};

pub struct Condition {
    lock: Arc<Lock>,
    queue: Box<dyn WaitQueue>,
    empty: Mutex<bool>,
}

impl Condition {
    /// A condition tied to `lock`; every operation asserts the caller
    /// holds it.
    pub fn new(lock: Arc<Lock>) -> Condition {
        Condition {
            lock,
            queue: crate::threads::scheduler().new_wait_queue(false),
            empty: Mutex::new(true),
        }
    }

    /// Atomically release the lock and block; reacquires before
    /// returning.
    pub fn sleep(&self) {
        assert!(
            self.lock.is_held_by_current_thread(),
            "condition: sleep without the lock"
        );
        let old = interrupt::disable();
        *self.empty.lock() = false;
        self.queue.wait_for_access(&crate::threads::current());
        self.lock.release();
        KThread::sleep();
        interrupt::restore(old);
        self.lock.acquire();
    }

    /// Ready one waiter, if any.
    pub fn wake(&self) {
        assert!(
            self.lock.is_held_by_current_thread(),
            "condition: wake without the lock"
        );
        let old = interrupt::disable();
        self.wake_one();
        interrupt::restore(old);
    }

    /// Ready every current waiter.
    pub fn wake_all(&self) {
        assert!(
            self.lock.is_held_by_current_thread(),
            "condition: wake without the lock"
        );
        let old = interrupt::disable();
        while !*self.empty.lock() {
            self.wake_one();
        }
        interrupt::restore(old);
    }

    fn wake_one(&self) {
        if *self.empty.lock() {
            return;
        }
        match self.queue.next_thread() {
            Some(thread) => thread.ready(),
            None => *self.empty.lock() = true,
        }
    }
}
