//! Rendezvous channel: synchronous exchange of one 32-bit word.
//!
//! Each `speak` pairs with exactly one `listen`; neither side returns
//! until paired. Pairing order among queued speakers and listeners
//! follows the scheduler's wake policy on the underlying
//! non-transferring queues.

use std::sync::Arc;

use spin::Mutex;

use crate::threads::{Condition, Lock};

struct State {
    /// Word placed by a speaker, not yet collected.
    word: Option<i32>,
    /// Listeners that have announced themselves and wait for a word.
    listeners: usize,
}

pub struct Communicator {
    lock: Arc<Lock>,
    /// Speakers sleep here until a listener shows up.
    non_listener: Condition,
    /// Listeners sleep here until a word is in flight.
    non_speaker: Condition,
    state: Mutex<State>,
}

impl Communicator {
    pub fn new() -> Communicator {
        let lock = Arc::new(Lock::new());
        Communicator {
            non_listener: Condition::new(lock.clone()),
            non_speaker: Condition::new(lock.clone()),
            lock,
            state: Mutex::new(State {
                word: None,
                listeners: 0,
            }),
        }
    }

    /// Deliver `word` to exactly one listener, blocking until one has
    /// taken it.
    pub fn speak(&self, word: i32) {
        self.lock.acquire();
        loop {
            let clear = {
                let state = self.state.lock();
                state.listeners > 0 && state.word.is_none()
            };
            if clear {
                break;
            }
            self.non_listener.sleep();
        }
        {
            let mut state = self.state.lock();
            state.word = Some(word);
            state.listeners -= 1;
        }
        self.non_speaker.wake();
        self.lock.release();
    }

    /// Collect one word from a speaker, blocking until paired.
    pub fn listen(&self) -> i32 {
        self.lock.acquire();
        loop {
            if self.state.lock().word.is_some() {
                break;
            }
            self.non_listener.wake();
            self.state.lock().listeners += 1;
            self.non_speaker.sleep();
        }
        let word = self.state.lock().word.take().unwrap();
        self.non_listener.wake();
        self.lock.release();
        word
    }
}

impl Default for Communicator {
    fn default() -> Communicator {
        Communicator::new()
    }
}
