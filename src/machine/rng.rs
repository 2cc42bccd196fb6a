//! Deterministic pseudo-random stream for the simulated machine.
//!
//! One xorshift64* generator drives both the timer jitter and the
//! lottery scheduler, so a fixed `-s` seed reproduces the exact same
//! schedule run after run.

use lazy_static::lazy_static;
use spin::Mutex;

lazy_static! {
    static ref STATE: Mutex<u64> = Mutex::new(0x853c_49e6_748f_ea9b);
}

/// Reseed the stream. A zero seed is remapped — xorshift has a fixed
/// point at zero.
pub fn seed(seed: u64) {
    let mut state = STATE.lock();
    *state = if seed == 0 { 0x853c_49e6_748f_ea9b } else { seed };
}

/// Next raw 64-bit value.
pub fn next() -> u64 {
    let mut state = STATE.lock();
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x.wrapping_mul(0x2545_f491_4f6c_dd1d)
}

/// Uniform draw in `[0, bound)`. `bound` must be positive.
pub fn next_range(bound: u64) -> u64 {
    assert!(bound > 0, "rng: empty range");
    next() % bound
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test so nothing else races the global stream.
    #[test]
    fn deterministic_and_bounded() {
        seed(42);
        let a: Vec<u64> = (0..8).map(|_| next()).collect();
        seed(42);
        let b: Vec<u64> = (0..8).map(|_| next()).collect();
        assert_eq!(a, b);
        for _ in 0..1000 {
            assert!(next_range(20) < 20);
        }
    }
}
