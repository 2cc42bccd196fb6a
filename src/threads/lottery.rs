//! Lottery scheduling with donation by addition.
//!
//! A thread's effective ticket count is its own tickets plus the sum
//! of the effective tickets of every waiter on each transferring
//! queue it holds. Queues cache two running sums over their waiters —
//! own tickets and effective tickets — so a dequeue draws a uniform
//! number below the relevant total and scans in insertion order,
//! without per-ticket storage. Donation moves as deltas along the
//! waiter→holder chain; walks carry the propagation path and stop on
//! a revisit, so mutual joins cannot recurse forever.

use std::collections::HashMap;
use std::sync::Arc;

use spin::Mutex;

use crate::machine::interrupt;
use crate::machine::rng;
use crate::threads::scheduler::{Scheduler, WaitQueue};
use crate::threads::KThread;

pub const TICKET_MIN: i32 = 1;
pub const TICKET_MAX: i32 = i32::MAX;
pub const TICKET_DEFAULT: i32 = 1;

pub struct LotteryScheduler {
    core: Arc<Mutex<Core>>,
}

impl LotteryScheduler {
    pub fn new() -> LotteryScheduler {
        LotteryScheduler {
            core: Arc::new(Mutex::new(Core {
                next_queue_id: 0,
                threads: HashMap::new(),
                queues: HashMap::new(),
            })),
        }
    }
}

impl Default for LotteryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for LotteryScheduler {
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
                sum_own: 0,
                sum_effective: 0,
            },
        );
        Box::new(LotteryQueue {
            core: self.core.clone(),
            id,
            transfer: transfer_donation,
        })
    }

    fn priority(&self, thread: &KThread) -> i32 {
        interrupt::assert_disabled();
        let mut core = self.core.lock();
        core.ensure(thread);
        core.threads[&thread.id()].tickets as i32
    }

    fn effective_priority(&self, thread: &KThread) -> i32 {
        interrupt::assert_disabled();
        let mut core = self.core.lock();
        core.ensure(thread);
        core.threads[&thread.id()].effective.min(i32::MAX as i64) as i32
    }

    fn set_priority(&self, thread: &KThread, tickets: i32) {
        interrupt::assert_disabled();
        assert!(tickets >= TICKET_MIN, "tickets must be positive");
        let mut core = self.core.lock();
        core.ensure(thread);
        let tid = thread.id();
        let delta = tickets as i64 - core.threads[&tid].tickets;
        if delta == 0 {
            return;
        }
        {
            let state = core.threads.get_mut(&tid).unwrap();
            state.tickets += delta;
            state.effective += delta;
        }
        if let Some(qid) = core.threads[&tid].waiting_on {
            let (transfer, holder) = {
                let queue = core.queues.get_mut(&qid).unwrap();
                queue.sum_own += delta;
                if queue.transfer {
                    queue.sum_effective += delta;
                }
                (queue.transfer, queue.holder)
            };
            if transfer {
                if let Some(holder) = holder {
                    let mut path = vec![tid];
                    core.ripple(holder, delta, &mut path);
                }
            }
        }
    }

    fn default_priority(&self) -> i32 {
        TICKET_DEFAULT
    }

    fn min_priority(&self) -> i32 {
        TICKET_MIN
    }

    fn max_priority(&self) -> i32 {
        TICKET_MAX
    }
}

struct ThreadState {
    thread: KThread,
    tickets: i64,
    effective: i64,
    held: Vec<u64>,
    waiting_on: Option<u64>,
}

struct QueueState {
    transfer: bool,
    /// Insertion order; draws scan it front to back.
    waiters: Vec<u64>,
    holder: Option<u64>,
    /// Σ own tickets over the waiters.
    sum_own: i64,
    /// Σ effective tickets over the waiters; maintained only for
    /// transferring queues, where it both feeds the draw and is the
    /// amount the holder currently enjoys as donation.
    sum_effective: i64,
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
            tickets: TICKET_DEFAULT as i64,
            effective: TICKET_DEFAULT as i64,
            held: Vec::new(),
            waiting_on: None,
        });
    }

    /// Apply `delta` to `tid`'s effective tickets and push it along
    /// the wait chain. A thread already on `path` ends the walk: the
    /// back edge of a mutual join never receives its feedback credit.
    fn ripple(&mut self, tid: u64, delta: i64, path: &mut Vec<u64>) {
        if delta == 0 || path.contains(&tid) {
            return;
        }
        path.push(tid);
        let waiting_on = {
            let state = self.threads.get_mut(&tid).unwrap();
            state.effective += delta;
            state.waiting_on
        };
        if let Some(qid) = waiting_on {
            let (transfer, holder) = {
                let queue = self.queues.get_mut(&qid).unwrap();
                if queue.transfer {
                    queue.sum_effective += delta;
                }
                (queue.transfer, queue.holder)
            };
            if transfer {
                if let Some(holder) = holder {
                    self.ripple(holder, delta, path);
                }
            }
        }
    }

    /// Strip `qid` from its holder, taking the queue's donation away
    /// with it.
    fn release_holder(&mut self, qid: u64) {
        let Some(holder) = self.queues.get_mut(&qid).unwrap().holder.take() else {
            return;
        };
        self.threads
            .get_mut(&holder)
            .unwrap()
            .held
            .retain(|&q| q != qid);
        let (transfer, donated) = {
            let queue = &self.queues[&qid];
            (queue.transfer, queue.sum_effective)
        };
        if transfer {
            self.ripple(holder, -donated, &mut Vec::new());
        }
    }
}

struct LotteryQueue {
    core: Arc<Mutex<Core>>,
    id: u64,
    transfer: bool,
}

impl WaitQueue for LotteryQueue {
    fn wait_for_access(&self, thread: &KThread) {
        interrupt::assert_disabled();
        let mut core = self.core.lock();
        core.ensure(thread);
        let tid = thread.id();

        if core.queues[&self.id].holder == Some(tid) {
            core.release_holder(self.id);
        }
        assert!(
            core.threads[&tid].waiting_on.is_none(),
            "thread already waiting on a queue"
        );

        core.threads.get_mut(&tid).unwrap().waiting_on = Some(self.id);
        let (tickets, effective) = {
            let state = &core.threads[&tid];
            (state.tickets, state.effective)
        };
        let holder = {
            let queue = core.queues.get_mut(&self.id).unwrap();
            queue.waiters.push(tid);
            queue.sum_own += tickets;
            if queue.transfer {
                queue.sum_effective += effective;
            }
            queue.holder
        };
        if self.transfer {
            if let Some(holder) = holder {
                let mut path = vec![tid];
                core.ripple(holder, effective, &mut path);
            }
        }
    }

    fn acquire(&self, thread: &KThread) {
        interrupt::assert_disabled();
        let mut core = self.core.lock();
        core.ensure(thread);
        let tid = thread.id();
        {
            let queue = &core.queues[&self.id];
            assert!(
                queue.holder.is_none() && queue.waiters.is_empty(),
                "acquire on a busy queue"
            );
        }
        core.queues.get_mut(&self.id).unwrap().holder = Some(tid);
        core.threads.get_mut(&tid).unwrap().held.push(self.id);
    }

    fn next_thread(&self) -> Option<KThread> {
        interrupt::assert_disabled();
        let mut core = self.core.lock();
        core.release_holder(self.id);

        if core.queues[&self.id].waiters.is_empty() {
            return None;
        }

        // Weighted draw: uniform below the total, then scan insertion
        // order accumulating each waiter's contribution.
        let total = if self.transfer {
            core.queues[&self.id].sum_effective
        } else {
            core.queues[&self.id].sum_own
        };
        debug_assert!(total > 0, "lottery queue with non-positive ticket total");
        let draw = rng::next_range(total as u64) as i64;
        let mut accumulated = 0i64;
        let mut winner = *core.queues[&self.id].waiters.last().unwrap();
        for &waiter in &core.queues[&self.id].waiters {
            let state = &core.threads[&waiter];
            accumulated += if self.transfer {
                state.effective
            } else {
                state.tickets
            };
            if accumulated > draw {
                winner = waiter;
                break;
            }
        }

        let (tickets, effective) = {
            let state = &core.threads[&winner];
            (state.tickets, state.effective)
        };
        {
            let queue = core.queues.get_mut(&self.id).unwrap();
            queue.waiters.retain(|&w| w != winner);
            queue.sum_own -= tickets;
            if queue.transfer {
                queue.sum_effective -= effective;
            }
            queue.holder = Some(winner);
        }
        {
            let state = core.threads.get_mut(&winner).unwrap();
            state.waiting_on = None;
            state.held.push(self.id);
        }
        if self.transfer {
            // The new holder inherits what the remaining waiters donate.
            let donated = core.queues[&self.id].sum_effective;
            core.threads.get_mut(&winner).unwrap().effective += donated;
        }
        Some(core.threads[&winner].thread.clone())
    }

    fn is_empty(&self) -> bool {
        self.core.lock().queues[&self.id].waiters.is_empty()
    }
}

impl Drop for LotteryQueue {
    fn drop(&mut self) {
        let mut core = self.core.lock();
        if core.queues.contains_key(&self.id) {
            core.release_holder(self.id);
            let queue = core.queues.remove(&self.id).unwrap();
            for waiter in queue.waiters {
                if let Some(state) = core.threads.get_mut(&waiter) {
                    state.waiting_on = None;
                }
            }
        }
    }
}
