//! Priority scheduling with donation by maximum.
//!
//! A thread's effective priority is the max of its own priority and
//! the effective priorities of every thread waiting on a
//! donation-transferring queue it holds. The bookkeeping is a graph:
//! per-thread `held` queues and a single `waiting_on` edge, walked
//! whenever a priority or a queue membership changes. Walks carry the
//! propagation path and stop on a revisit, which is what keeps the
//! mutual-join pathology finite.

use std::collections::HashMap;
use std::sync::Arc;

use spin::Mutex;

use crate::machine::interrupt;
use crate::threads::scheduler::{Scheduler, WaitQueue};
use crate::threads::KThread;

pub const PRIORITY_MIN: i32 = 0;
pub const PRIORITY_MAX: i32 = 7;
pub const PRIORITY_DEFAULT: i32 = 1;

pub struct PriorityScheduler {
    core: Arc<Mutex<Core>>,
}

impl PriorityScheduler {
    pub fn new() -> PriorityScheduler {
        PriorityScheduler {
            core: Arc::new(Mutex::new(Core {
                next_queue_id: 0,
                threads: HashMap::new(),
                queues: HashMap::new(),
            })),
        }
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for PriorityScheduler {
    fn new_wait_queue(&self, transfer_donation: bool) -> Box<dyn WaitQueue> {
        let mut core = self.core.lock();
        let id = core.next_queue_id;
        core.next_queue_id += 1;
        core.queues.insert(
            id,
            QueueState {
                transfer: transfer_donation,
                waiters: Vec::new(),
                holder: None,
                best: None,
            },
        );
        Box::new(PriorityQueue {
            core: self.core.clone(),
            id,
            transfer: transfer_donation,
        })
    }

    fn priority(&self, thread: &KThread) -> i32 {
        interrupt::assert_disabled();
        let mut core = self.core.lock();
        core.ensure(thread);
        core.threads[&thread.id()].priority
    }

    fn effective_priority(&self, thread: &KThread) -> i32 {
        interrupt::assert_disabled();
        let mut core = self.core.lock();
        core.ensure(thread);
        core.threads[&thread.id()].effective
    }

    fn set_priority(&self, thread: &KThread, priority: i32) {
        interrupt::assert_disabled();
        assert!(
            (PRIORITY_MIN..=PRIORITY_MAX).contains(&priority),
            "priority out of range"
        );
        let mut core = self.core.lock();
        core.ensure(thread);
        core.threads.get_mut(&thread.id()).unwrap().priority = priority;
        core.refresh(thread.id(), &mut Vec::new());
    }

    fn default_priority(&self) -> i32 {
        PRIORITY_DEFAULT
    }

    fn min_priority(&self) -> i32 {
        PRIORITY_MIN
    }

    fn max_priority(&self) -> i32 {
        PRIORITY_MAX
    }
}

struct ThreadState {
    thread: KThread,
    priority: i32,
    effective: i32,
    /// Queues this thread currently holds.
    held: Vec<u64>,
    /// The single queue this thread waits on, if any.
    waiting_on: Option<u64>,
}

struct QueueState {
    transfer: bool,
    /// Insertion order; FIFO breaks priority ties.
    waiters: Vec<u64>,
    holder: Option<u64>,
    /// Cached best donor among the waiters. Invalidated when a
    /// waiter's effective priority changes, the holder changes, or
    /// the cached thread leaves the queue.
    best: Option<u64>,
}

struct Core {
    next_queue_id: u64,
    threads: HashMap<u64, ThreadState>,
    queues: HashMap<u64, QueueState>,
}

impl Core {
    fn ensure(&mut self, thread: &KThread) {
        self.threads.entry(thread.id()).or_insert_with(|| ThreadState {
            thread: thread.clone(),
            priority: PRIORITY_DEFAULT,
            effective: PRIORITY_DEFAULT,
            held: Vec::new(),
            waiting_on: None,
        });
    }

    fn effective(&self, tid: u64) -> i32 {
        self.threads[&tid].effective
    }

    /// Best waiter of `qid` by effective priority, oldest first on
    /// ties. Uses the cache when it is still a member of the queue.
    fn queue_best(&mut self, qid: u64) -> Option<u64> {
        let queue = &self.queues[&qid];
        if let Some(cached) = queue.best {
            if queue.waiters.contains(&cached) {
                return Some(cached);
            }
        }
        let mut best: Option<u64> = None;
        for &waiter in &queue.waiters {
            best = match best {
                None => Some(waiter),
                Some(b) if self.effective(waiter) > self.effective(b) => Some(waiter),
                keep => keep,
            };
        }
        self.queues.get_mut(&qid).unwrap().best = best;
        best
    }

    /// Recompute `tid`'s effective priority from its own priority and
    /// its held transferring queues, then push any change along its
    /// wait chain. Stops when it meets a thread already on `path`.
    fn refresh(&mut self, tid: u64, path: &mut Vec<u64>) {
        if path.contains(&tid) {
            return;
        }
        path.push(tid);

        let (own, held) = {
            let state = &self.threads[&tid];
            (state.priority, state.held.clone())
        };
        let mut effective = own;
        for qid in held {
            if self.queues[&qid].transfer {
                if let Some(best) = self.queue_best(qid) {
                    effective = effective.max(self.effective(best));
                }
            }
        }

        let waiting_on = {
            let state = self.threads.get_mut(&tid).unwrap();
            if state.effective == effective {
                return;
            }
            state.effective = effective;
            state.waiting_on
        };

        if let Some(qid) = waiting_on {
            let (transfer, holder) = {
                let queue = self.queues.get_mut(&qid).unwrap();
                queue.best = None;
                (queue.transfer, queue.holder)
            };
            if transfer {
                if let Some(holder) = holder {
                    self.refresh(holder, path);
                }
            }
        }
    }

    /// Strip `qid` from its holder and rebalance the ex-holder.
    fn release_holder(&mut self, qid: u64) {
        let Some(holder) = self.queues.get_mut(&qid).unwrap().holder.take() else {
            return;
        };
        self.queues.get_mut(&qid).unwrap().best = None;
        self.threads
            .get_mut(&holder)
            .unwrap()
            .held
            .retain(|&q| q != qid);
        self.refresh(holder, &mut Vec::new());
    }

    fn install_holder(&mut self, qid: u64, tid: u64) {
        let queue = self.queues.get_mut(&qid).unwrap();
        debug_assert!(queue.holder.is_none());
        queue.holder = Some(tid);
        queue.best = None;
        self.threads.get_mut(&tid).unwrap().held.push(qid);
        self.refresh(tid, &mut Vec::new());
    }
}

struct PriorityQueue {
    core: Arc<Mutex<Core>>,
    id: u64,
    transfer: bool,
}

impl WaitQueue for PriorityQueue {
    fn wait_for_access(&self, thread: &KThread) {
        interrupt::assert_disabled();
        let mut core = self.core.lock();
        core.ensure(thread);
        let tid = thread.id();

        // A thread queuing up on a queue it holds gives it up first
        // (the running thread re-entering the ready set).
        if core.queues[&self.id].holder == Some(tid) {
            core.release_holder(self.id);
        }
        assert!(
            core.threads[&tid].waiting_on.is_none(),
            "thread already waiting on a queue"
        );

        core.threads.get_mut(&tid).unwrap().waiting_on = Some(self.id);
        let newcomer_effective = core.effective(tid);
        let was_empty = {
            let queue = core.queues.get_mut(&self.id).unwrap();
            let was_empty = queue.waiters.is_empty();
            queue.waiters.push(tid);
            was_empty
        };
        // Keep the best-donor cache warm: an empty queue's first
        // waiter is trivially best, and a newcomer that beats a live
        // cached best replaces it. An invalidated cache stays cold.
        let promote = if was_empty {
            true
        } else {
            match core.queues[&self.id].best {
                Some(best) => core.effective(best) < newcomer_effective,
                None => false,
            }
        };
        if promote {
            core.queues.get_mut(&self.id).unwrap().best = Some(tid);
        }

        if self.transfer {
            if let Some(holder) = core.queues[&self.id].holder {
                let mut path = vec![tid];
                core.refresh(holder, &mut path);
            }
        }
    }

    fn acquire(&self, thread: &KThread) {
        interrupt::assert_disabled();
        let mut core = self.core.lock();
        core.ensure(thread);
        {
            let queue = &core.queues[&self.id];
            assert!(
                queue.holder.is_none() && queue.waiters.is_empty(),
                "acquire on a busy queue"
            );
        }
        core.install_holder(self.id, thread.id());
    }

    fn next_thread(&self) -> Option<KThread> {
        interrupt::assert_disabled();
        let mut core = self.core.lock();
        core.release_holder(self.id);

        let winner = core.queue_best(self.id)?;
        let queue = core.queues.get_mut(&self.id).unwrap();
        queue.waiters.retain(|&w| w != winner);
        queue.best = None;
        core.threads.get_mut(&winner).unwrap().waiting_on = None;
        core.install_holder(self.id, winner);
        Some(core.threads[&winner].thread.clone())
    }

    fn is_empty(&self) -> bool {
        self.core.lock().queues[&self.id].waiters.is_empty()
    }
}

impl Drop for PriorityQueue {
    fn drop(&mut self) {
        let mut core = self.core.lock();
        if let Some(queue) = core.queues.remove(&self.id) {
            if let Some(holder) = queue.holder {
                if let Some(state) = core.threads.get_mut(&holder) {
                    state.held.retain(|&q| q != self.id);
                }
                core.refresh(holder, &mut Vec::new());
            }
            for waiter in queue.waiters {
                if let Some(state) = core.threads.get_mut(&waiter) {
                    state.waiting_on = None;
                }
            }
        }
    }
}
