//! The kernel-wide pool of free physical frames.
//!
//! A plain list of frame numbers behind a kernel lock, plus a second
//! lock-guarded list of threads that faulted while the pool was dry.
//! Returning frames wakes every starved thread; each retries its
//! allocation.

use std::sync::Arc;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::machine::interrupt;
use crate::threads::{KThread, Lock};

pub struct FramePool {
    lock: Lock,
    free: Mutex<Vec<u32>>,
    waiters_lock: Lock,
    waiters: Mutex<Vec<KThread>>,
}

lazy_static! {
    static ref POOL: Mutex<Option<Arc<FramePool>>> = Mutex::new(None);
}

/// Fill the pool with every physical frame. Runs at boot, before any
/// process exists.
pub fn init(num_phys_pages: usize) {
    let pool = FramePool {
        lock: Lock::new(),
        free: Mutex::new((0..num_phys_pages as u32).rev().collect()),
        waiters_lock: Lock::new(),
        waiters: Mutex::new(Vec::new()),
    };
    *POOL.lock() = Some(Arc::new(pool));
}

fn pool() -> Arc<FramePool> {
    POOL.lock().clone().expect("frame pool not initialized")
}

/// Pop a free frame, or `None` when the pool is dry. Loaders use
/// this: load-time exhaustion fails the load instead of blocking.
pub fn try_allocate() -> Option<u32> {
    let pool = pool();
    pool.lock.acquire();
    let frame = pool.free.lock().pop();
    pool.lock.release();
    frame
}

/// Pop a free frame, blocking in the starvation list until another
/// process gives frames back. The page-fault path uses this.
pub fn allocate_or_wait() -> u32 {
    let pool = pool();
    loop {
        pool.waiters_lock.acquire();
        if let Some(frame) = try_allocate() {
            pool.waiters_lock.release();
            return frame;
        }
        let old = interrupt::disable();
        pool.waiters.lock().push(crate::threads::current());
        pool.waiters_lock.release();
        KThread::sleep();
        interrupt::restore(old);
    }
}

/// Return frames to the pool and wake every frame-starved thread so
/// it can retry.
pub fn release(frames: &[u32]) {
    let pool = pool();
    pool.lock.acquire();
    pool.free.lock().extend_from_slice(frames);
    pool.lock.release();

    pool.waiters_lock.acquire();
    let starved = std::mem::take(&mut *pool.waiters.lock());
    let old = interrupt::disable();
    for thread in starved {
        thread.ready();
    }
    interrupt::restore(old);
    pool.waiters_lock.release();
}

/// Free frames currently available.
pub fn available() -> usize {
    let pool = pool();
    pool.lock.acquire();
    let count = pool.free.lock().len();
    pool.lock.release();
    count
}
