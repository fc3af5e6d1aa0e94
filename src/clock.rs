//! Monotonic time source.
//!
//! Everything that compares timestamps takes a [`Clock`] instead of calling
//! `Instant::now()` directly, so the loop can be driven by a manual clock.

use embassy_time::Instant;

pub trait Clock {
    fn now(&self) -> Instant;
}

/// The embassy time driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}
