//! The alarm service: sleepers wake in deadline order, never early,
//! and a zero wait returns immediately.

mod common;

use std::sync::{Arc, Mutex};

use churro_os::config::SchedulerPolicy;
use churro_os::machine::timer;
use churro_os::threads::{alarm, KThread};

#[test]
fn sleepers_wake_in_order_and_never_early() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let wakes: Arc<Mutex<Vec<(&'static str, u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));

    let a = {
        let wakes = wakes.clone();
        KThread::new("a", move || {
            let deadline = timer::get_time() + 200;
            alarm::wait_until(200);
            wakes.lock().unwrap().push(("a", deadline, timer::get_time()));
        })
    };
    let b = {
        let wakes = wakes.clone();
        KThread::new("b", move || {
            let deadline = timer::get_time() + 100;
            alarm::wait_until(100);
            wakes.lock().unwrap().push(("b", deadline, timer::get_time()));
        })
    };

    a.fork();
    // Give a its head start before b enqueues its earlier deadline.
    KThread::yield_now();
    b.fork();

    a.join();
    b.join();

    let wakes = wakes.lock().unwrap();
    assert_eq!(wakes.len(), 2);
    let a_entry = wakes.iter().find(|w| w.0 == "a").copied().unwrap();
    let b_entry = wakes.iter().find(|w| w.0 == "b").copied().unwrap();
    // Neither wakes before its deadline.
    assert!(a_entry.2 >= a_entry.1, "a woke early: {:?}", a_entry);
    assert!(b_entry.2 >= b_entry.1, "b woke early: {:?}", b_entry);
    // The earlier deadline wakes no later than the later one.
    assert!(b_entry.2 <= a_entry.2, "b after a: {:?} {:?}", b_entry, a_entry);
}

#[test]
fn zero_wait_returns_immediately() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let before = timer::get_time();
    alarm::wait_until(0);
    // No timer period elapsed: the call never blocked.
    assert!(timer::get_time() - before < timer::TIMER_TICKS);
}

#[test]
fn many_sleepers_all_wake() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let woken = Arc::new(Mutex::new(0usize));

    let sleepers: Vec<KThread> = (0..8)
        .map(|index| {
            let woken = woken.clone();
            KThread::new(&format!("sleeper-{}", index), move || {
                alarm::wait_until(50 * (index as u64 + 1));
                *woken.lock().unwrap() += 1;
            })
        })
        .collect();
    for sleeper in &sleepers {
        sleeper.fork();
    }
    for sleeper in &sleepers {
        sleeper.join();
    }
    assert_eq!(*woken.lock().unwrap(), 8);
}
