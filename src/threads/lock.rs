//! Binary mutex over a donation-transferring wait queue.
//!
//! Waiters donate to the holder, so a high-priority thread stuck on a
//! lock boosts whoever currently owns it. Release hands the lock
//! directly to the queue's pick — there is no observable unowned
//! window under the interrupt gate.

use spin::Mutex;

use crate::machine::interrupt;
use crate::threads::scheduler::WaitQueue;
use crate::threads::KThread;

pub struct Lock {
    queue: Box<dyn WaitQueue>,
    holder: Mutex<Option<KThread>>,
}

impl Lock {
    pub fn new() -> Lock {
        Lock {
            queue: crate::threads::scheduler().new_wait_queue(true),
            holder: Mutex::new(None),
        }
    }

    /// Take the lock, blocking while another thread holds it.
    pub fn acquire(&self) {
        let old = interrupt::disable();
        let current = crate::threads::current();
        assert!(!self.is_held_by_current_thread(), "lock: recursive acquire");

        if self.holder.lock().is_none() {
            self.queue.acquire(&current);
            *self.holder.lock() = Some(current);
        } else {
            self.queue.wait_for_access(&current);
            KThread::sleep();
            // The releaser installed us before waking us.
            debug_assert!(self.is_held_by_current_thread());
        }
        interrupt::restore(old);
    }

    /// Give the lock up, handing it to the queue's next pick.
    pub fn release(&self) {
        let old = interrupt::disable();
        assert!(self.is_held_by_current_thread(), "lock: release by non-holder");
        *self.holder.lock() = None;
        let next = self.queue.next_thread();
        if let Some(next) = next {
            *self.holder.lock() = Some(next.clone());
            next.ready();
        }
        interrupt::restore(old);
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder
            .lock()
            .as_ref()
            .is_some_and(|holder| *holder == crate::threads::current())
    }
}

impl Default for Lock {
    fn default() -> Lock {
        Lock::new()
    }
}
