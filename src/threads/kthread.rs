//! Kernel threads.
//!
//! A thread is a handle around shared state; clones refer to the same
//! thread. The lifecycle is New → Ready → Running ⇄ (Ready | Blocked)
//! → Finished. Each thread owns a donation-transferring join queue,
//! acquired by the thread itself at creation, so threads joining it
//! donate to it for as long as they wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::machine::interrupt;
use crate::machine::tcb::Tcb;
use crate::threads::scheduler::{Scheduler, WaitQueue};

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    New,
    Ready,
    Running,
    Blocked,
    Finished,
}

/// Per-thread machine context, saved and restored across context
/// switches. Kernel-only threads carry none; user threads save the
/// register file and swap the processor's page table.
pub trait ThreadContext: Send {
    fn save(&mut self);
    fn restore(&mut self);
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

struct ThreadInner {
    id: u64,
    name: String,
    is_idle: bool,
    status: Mutex<ThreadStatus>,
    tcb: Tcb,
    target: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    join_queue: Box<dyn WaitQueue>,
    context: Mutex<Option<Box<dyn ThreadContext>>>,
}

/// Handle to a kernel thread.
#[derive(Clone)]
pub struct KThread {
    inner: Arc<ThreadInner>,
}

impl PartialEq for KThread {
    fn eq(&self, other: &KThread) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for KThread {}

impl std::fmt::Debug for KThread {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "KThread({}, {:?})", self.inner.name, self.status())
    }
}

impl KThread {
    /// Create a thread that will run `target` once forked.
    pub fn new(name: &str, target: impl FnOnce() + Send + 'static) -> KThread {
        let scheduler = crate::threads::scheduler();
        let thread = KThread::build(name, false, scheduler.as_ref(), Tcb::new());
        *thread.inner.target.lock() = Some(Box::new(target));
        thread
    }

    pub(crate) fn build(
        name: &str,
        is_idle: bool,
        scheduler: &dyn Scheduler,
        tcb: Tcb,
    ) -> KThread {
        let thread = KThread {
            inner: Arc::new(ThreadInner {
                id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
                name: name.to_string(),
                is_idle,
                status: Mutex::new(ThreadStatus::New),
                tcb,
                target: Mutex::new(None),
                join_queue: scheduler.new_wait_queue(true),
                context: Mutex::new(None),
            }),
        };
        let old = interrupt::disable();
        thread.inner.join_queue.acquire(&thread);
        interrupt::restore(old);
        thread
    }

    pub(crate) fn set_target(&self, target: Box<dyn FnOnce() + Send>) {
        *self.inner.target.lock() = Some(target);
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> ThreadStatus {
        *self.inner.status.lock()
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        *self.inner.status.lock() = status;
    }

    /// Attach a machine context, saved/restored around every switch.
    pub fn set_context(&self, context: Box<dyn ThreadContext>) {
        *self.inner.context.lock() = Some(context);
    }

    pub(crate) fn save_context(&self) {
        if let Some(context) = self.inner.context.lock().as_mut() {
            context.save();
        }
    }

    pub(crate) fn restore_context(&self) {
        if let Some(context) = self.inner.context.lock().as_mut() {
            context.restore();
        }
    }

    /// Begin execution: spawn the carrying host thread and enter the
    /// ready set.
    pub fn fork(&self) {
        let old = interrupt::disable();
        assert_eq!(self.status(), ThreadStatus::New, "thread: double fork");
        let me = self.clone();
        self.inner
            .tcb
            .start(self.inner.name.clone(), move || kthread_entry(me));
        self.ready();
        interrupt::restore(old);
        log::trace!("thread: forked {:?}", self);
    }

    /// Move this thread to READY and enqueue it on the ready set. The
    /// idle thread never enters the queue; it is the fallback pick.
    pub fn ready(&self) {
        interrupt::assert_disabled();
        assert_ne!(self.status(), ThreadStatus::Finished);
        self.set_status(ThreadStatus::Ready);
        if !self.inner.is_idle {
            crate::threads::ready_enqueue(self);
        }
    }

    /// Relinquish the processor; the caller re-enters the ready set
    /// and runs again once chosen.
    pub fn yield_now() {
        let old = interrupt::disable();
        let current = crate::threads::current();
        current.ready();
        run_next_thread(false);
        interrupt::restore(old);
    }

    /// Block the calling thread. Interrupts must be disabled, and the
    /// caller must already stand in some wait structure with a wake
    /// path back to `ready`.
    pub fn sleep() {
        interrupt::assert_disabled();
        let current = crate::threads::current();
        current.set_status(ThreadStatus::Blocked);
        run_next_thread(false);
    }

    /// Terminate the calling thread: wake every joiner, mark
    /// FINISHED, and hand the processor on. The carrying host thread
    /// unwinds after the final switch.
    pub fn finish() {
        interrupt::disable();
        let current = crate::threads::current();
        log::trace!("thread: finishing {:?}", current);
        while let Some(joiner) = current.inner.join_queue.next_thread() {
            joiner.ready();
        }
        current.set_status(ThreadStatus::Finished);
        run_next_thread(true);
    }

    /// Block until this thread finishes. Waiting joiners donate their
    /// effective priority to the joinee.
    pub fn join(&self) {
        let old = interrupt::disable();
        let current = crate::threads::current();
        assert!(*self != current, "thread: join with self");
        if self.status() != ThreadStatus::Finished {
            self.inner.join_queue.wait_for_access(&current);
            KThread::sleep();
        }
        interrupt::restore(old);
    }
}

/// First code run by every forked thread. The baton arrives with
/// interrupts disabled, exactly as if we had returned from a switch.
fn kthread_entry(thread: KThread) {
    crate::threads::finish_switch();
    interrupt::enable();
    let target = thread
        .inner
        .target
        .lock()
        .take()
        .expect("thread: forked without target");
    target();
    KThread::finish();
}

/// Pick the next thread and switch to it. With `dying`, the caller
/// never resumes and its host thread unwinds after the handoff.
pub(crate) fn run_next_thread(dying: bool) {
    interrupt::assert_disabled();
    let current = crate::threads::current();
    let next = crate::threads::ready_dequeue();
    if next == current {
        debug_assert!(!dying);
        next.set_status(ThreadStatus::Running);
        return;
    }
    next.set_status(ThreadStatus::Running);
    crate::threads::set_current(next.clone());
    if !dying {
        current.save_context();
    }
    Tcb::switch(&current.inner.tcb, &next.inner.tcb, dying);
    if !dying {
        crate::threads::finish_switch();
    }
}
