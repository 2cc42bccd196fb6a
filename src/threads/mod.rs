//! The thread system: kernel threads, the pluggable scheduler, and
//! the synchronization primitives built on its wait queues.

pub mod alarm;
pub mod communicator;
pub mod condition;
pub mod kthread;
pub mod lock;
pub mod lottery;
pub mod priority;
pub mod round_robin;
pub mod scheduler;

use std::sync::Arc;

use lazy_static::lazy_static;
use spin::Mutex;

pub use communicator::Communicator;
pub use condition::Condition;
pub use kthread::{KThread, ThreadContext, ThreadStatus};
pub use lock::Lock;
pub use scheduler::{Scheduler, WaitQueue};

use crate::config::SchedulerPolicy;
use crate::machine::tcb::Tcb;
use crate::machine::timer;

struct ThreadSystem {
    scheduler: Arc<dyn Scheduler>,
    ready: Box<dyn WaitQueue>,
    current: KThread,
    idle: KThread,
}

lazy_static! {
    static ref SYSTEM: Mutex<Option<ThreadSystem>> = Mutex::new(None);
}

/// Bring up the thread system under the chosen policy. The calling
/// host thread is adopted as the kernel's main thread; the idle
/// thread is forked but stays out of the ready set. Interrupts must
/// still be disabled (the machine leaves them that way at power-on).
pub fn init(policy: SchedulerPolicy) -> KThread {
    let scheduler: Arc<dyn Scheduler> = match policy {
        SchedulerPolicy::RoundRobin => Arc::new(round_robin::RoundRobinScheduler::new()),
        SchedulerPolicy::Priority => Arc::new(priority::PriorityScheduler::new()),
        SchedulerPolicy::Lottery => Arc::new(lottery::LotteryScheduler::new()),
    };
    let ready = scheduler.new_wait_queue(false);

    let main = KThread::build("main", false, scheduler.as_ref(), Tcb::adopt_current());
    main.set_status(ThreadStatus::Running);

    let idle = KThread::build("idle", true, scheduler.as_ref(), Tcb::new());
    idle.set_target(Box::new(|| loop {
        KThread::yield_now();
    }));

    *SYSTEM.lock() = Some(ThreadSystem {
        scheduler,
        ready,
        current: main.clone(),
        idle: idle.clone(),
    });
    idle.fork();

    alarm::init();
    timer::set_handler(Arc::new(alarm::timer_interrupt));

    log::debug!("threads: system up under {:?} policy", policy);
    main
}

/// The running thread.
pub fn current() -> KThread {
    SYSTEM
        .lock()
        .as_ref()
        .expect("thread system not initialized")
        .current
        .clone()
}

/// The active scheduling policy.
pub fn scheduler() -> Arc<dyn Scheduler> {
    SYSTEM
        .lock()
        .as_ref()
        .expect("thread system not initialized")
        .scheduler
        .clone()
}

pub(crate) fn set_current(thread: KThread) {
    SYSTEM.lock().as_mut().unwrap().current = thread;
}

pub(crate) fn ready_enqueue(thread: &KThread) {
    let guard = SYSTEM.lock();
    guard.as_ref().unwrap().ready.wait_for_access(thread);
}

/// Next thread to run: the ready set's pick, or the idle thread.
pub(crate) fn ready_dequeue() -> KThread {
    let guard = SYSTEM.lock();
    let sys = guard.as_ref().unwrap();
    sys.ready.next_thread().unwrap_or_else(|| sys.idle.clone())
}

/// Post-switch fixup, run by the incoming thread: restore its machine
/// context. Also the first thing a freshly forked thread does.
pub(crate) fn finish_switch() {
    current().restore_context();
}
