//! Time and randomness collaborators.
//!
//! The responder never reads the system clock or entropy pool directly; it
//! goes through these traits so that tests can drive the state machine with
//! a manual clock and pin all jitter to zero.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

/// A source of monotonic milliseconds.
pub trait Clock: Send {
    /// Returns the number of milliseconds elapsed since an arbitrary, fixed
    /// point in the past.
    fn now_ms(&self) -> u64;
}

/// The default [`Clock`], backed by [`Instant`].
pub struct Monotonic {
    epoch: Instant,
}

impl Monotonic {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for Monotonic {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for Monotonic {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// A manually advanced [`Clock`] for tests.
///
/// Cloning shares the underlying time, so a copy can be handed to the
/// responder while the test advances it.
#[derive(Clone, Default)]
pub struct ManualClock {
    ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward by `ms` milliseconds.
    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// A source of randomness for transmission jitter.
pub trait Rng: Send {
    fn next_u32(&mut self) -> u32;
}

/// The default [`Rng`], drawing from the thread's entropy source.
#[derive(Default)]
pub struct Entropy;

impl Rng for Entropy {
    fn next_u32(&mut self) -> u32 {
        rand::random()
    }
}

/// An [`Rng`] that always returns the same value. Pinning it to 0 removes
/// all scheduling jitter in tests.
pub struct FixedRng(pub u32);

impl Rng for FixedRng {
    fn next_u32(&mut self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock() {
        let clock = ManualClock::new();
        let copy = clock.clone();
        assert_eq!(clock.now_ms(), 0);
        copy.advance(250);
        assert_eq!(clock.now_ms(), 250);
    }

    #[test]
    fn monotonic_does_not_go_backwards() {
        let clock = Monotonic::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
