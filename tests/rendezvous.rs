//! The communicator and the condition variables under it: one word
//! per pairing, nobody returns unpaired, and the two-children boat
//! crossing built from the same primitives.

mod common;

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;

use churro_os::config::SchedulerPolicy;
use churro_os::threads::{Communicator, Condition, KThread, Lock};

#[test]
fn one_speaker_pairs_with_one_listener() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let channel = Arc::new(Communicator::new());

    let speaker = {
        let channel = channel.clone();
        KThread::new("speaker", move || channel.speak(42))
    };
    speaker.fork();

    assert_eq!(channel.listen(), 42);
    speaker.join();
}

#[test]
fn listener_first_still_pairs() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let channel = Arc::new(Communicator::new());
    let heard = Arc::new(Mutex::new(None));

    let listener = {
        let channel = channel.clone();
        let heard = heard.clone();
        KThread::new("listener", move || {
            *heard.lock().unwrap() = Some(channel.listen());
        })
    };
    listener.fork();
    // Let the listener block first.
    KThread::yield_now();

    channel.speak(7);
    listener.join();
    assert_eq!(*heard.lock().unwrap(), Some(7));
}

#[test]
fn every_word_reaches_exactly_one_listener() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let channel = Arc::new(Communicator::new());
    let heard: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

    let mut threads = Vec::new();
    for word in 0..4 {
        let channel = channel.clone();
        let speaker = KThread::new(&format!("speaker-{}", word), move || channel.speak(word));
        speaker.fork();
        threads.push(speaker);
    }
    for index in 0..4 {
        let channel = channel.clone();
        let heard = heard.clone();
        let listener = KThread::new(&format!("listener-{}", index), move || {
            let word = channel.listen();
            heard.lock().unwrap().push(word);
        });
        listener.fork();
        threads.push(listener);
    }
    for thread in threads {
        thread.join();
    }

    let mut heard = heard.lock().unwrap().clone();
    heard.sort_unstable();
    assert_eq!(heard, vec![0, 1, 2, 3]);
}

#[test]
fn condition_wake_all_releases_every_waiter() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let lock = Arc::new(Lock::new());
    let condition = Arc::new(Condition::new(lock.clone()));
    let released = Arc::new(Mutex::new(0usize));

    let waiters: Vec<KThread> = (0..3)
        .map(|index| {
            let lock = lock.clone();
            let condition = condition.clone();
            let released = released.clone();
            KThread::new(&format!("waiter-{}", index), move || {
                lock.acquire();
                condition.sleep();
                *released.lock().unwrap() += 1;
                lock.release();
            })
        })
        .collect();
    for waiter in &waiters {
        waiter.fork();
    }
    // Let all three reach their sleep.
    for _ in 0..4 {
        KThread::yield_now();
    }

    lock.acquire();
    condition.wake_all();
    lock.release();

    for waiter in &waiters {
        waiter.join();
    }
    assert_eq!(*released.lock().unwrap(), 3);
}

// The two-children boat crossing: a pilot and a rider elect
// themselves, cross once, and the boat operations never interleave.
struct Boat {
    lock: Arc<Lock>,
    change: Condition,
    state: Mutex<BoatState>,
}

#[derive(Default)]
struct BoatState {
    pilot_chosen: bool,
    rider_aboard: bool,
    boat_left: bool,
    on_molokai: usize,
    trips: Vec<&'static str>,
}

impl Boat {
    fn new() -> Boat {
        let lock = Arc::new(Lock::new());
        Boat {
            change: Condition::new(lock.clone()),
            lock,
            state: Mutex::new(BoatState::default()),
        }
    }

    fn child(&self) {
        self.lock.acquire();
        let pilot = {
            let mut state = self.state.lock().unwrap();
            if state.pilot_chosen {
                false
            } else {
                state.pilot_chosen = true;
                true
            }
        };
        if pilot {
            // Wait for a rider, then row across.
            while !self.state.lock().unwrap().rider_aboard {
                self.change.sleep();
            }
            {
                let mut state = self.state.lock().unwrap();
                state.trips.push("child rows to molokai");
                state.boat_left = true;
                state.on_molokai += 1;
            }
            self.change.wake_all();
        } else {
            {
                let mut state = self.state.lock().unwrap();
                state.rider_aboard = true;
            }
            self.change.wake_all();
            while !self.state.lock().unwrap().boat_left {
                self.change.sleep();
            }
            let mut state = self.state.lock().unwrap();
            state.trips.push("child rides to molokai");
            state.on_molokai += 1;
        }
        self.lock.release();
    }
}

#[test]
fn two_children_cross_to_molokai() {
    let _kernel = common::boot(SchedulerPolicy::Priority);
    let boat = Arc::new(Boat::new());

    let children: Vec<KThread> = (0..2)
        .map(|index| {
            let boat = boat.clone();
            KThread::new(&format!("child-{}", index), move || boat.child())
        })
        .collect();
    for child in &children {
        child.fork();
    }
    for child in &children {
        child.join();
    }

    let state = boat.state.lock().unwrap();
    assert_eq!(state.on_molokai, 2);
    assert_eq!(
        state.trips,
        vec!["child rows to molokai", "child rides to molokai"]
    );
}
