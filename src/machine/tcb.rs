//! Host-thread backed context switching.
//!
//! Every kernel thread is carried by a parked host thread; a baton
//! handoff guarantees that exactly one of them executes at any
//! instant, which is what makes interrupt disable a sound mutual
//! exclusion primitive for the rest of the kernel. This is the one
//! module that must use the standard library's blocking primitives —
//! parking a host thread is the single thing a spin lock cannot do.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

struct Baton {
    /// True while the owning thread is allowed to run.
    running: Mutex<bool>,
    signal: Condvar,
}

/// A thread control block: the host-thread half of a kernel thread.
#[derive(Clone)]
pub struct Tcb {
    baton: Arc<Baton>,
}

impl Tcb {
    pub fn new() -> Tcb {
        Tcb {
            baton: Arc::new(Baton {
                running: Mutex::new(false),
                signal: Condvar::new(),
            }),
        }
    }

    /// Adopt the calling host thread as a kernel thread. Used once, for
    /// the boot thread, which is already running and never parked first.
    pub fn adopt_current() -> Tcb {
        Tcb::new()
    }

    /// Spawn the carrying host thread. It parks until the first switch
    /// hands it the baton, then runs `entry` to completion and exits.
    pub fn start(&self, name: String, entry: impl FnOnce() + Send + 'static) {
        let baton = self.baton.clone();
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                wait_for_baton(&baton);
                entry();
            })
            .expect("tcb: host thread spawn failed");
    }

    /// Hand the baton from `from` to `to` and park. With `dying` the
    /// caller's host thread keeps running just long enough to unwind
    /// and exit; it never takes the baton again.
    pub fn switch(from: &Tcb, to: &Tcb, dying: bool) {
        {
            let mut running = to.baton.running.lock().unwrap();
            *running = true;
            to.baton.signal.notify_one();
        }
        if !dying {
            wait_for_baton(&from.baton);
        }
    }
}

fn wait_for_baton(baton: &Baton) {
    let mut running = baton.running.lock().unwrap();
    while !*running {
        running = baton.signal.wait(running).unwrap();
    }
    *running = false;
}
