//! Millisecond clock abstraction used by the worker and by `schedule`.
//!
//! All deadlines live in a single monotonic millisecond domain: "ms since
//! the clock's epoch".  The default [`MonotonicClock`] anchors that epoch
//! at construction time, so deadline arithmetic is immune to system
//! clock jumps.  [`ManualClock`] is a hand-cranked clock for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A source of monotonic wall-time in milliseconds.
///
/// The same clock instance feeds both the scheduling path (deadline
/// computation) and the worker's tick loop, so implementations only need
/// to be consistent with themselves.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds elapsed since this clock's epoch.
    fn now_millis(&self) -> u64;
}

// ---------------------------------------------------------------------------
// MonotonicClock
// ---------------------------------------------------------------------------

/// The default clock: milliseconds since the instant the clock was created.
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// A clock that only moves when told to.
///
/// Intended for deterministic tests: share it with a timer via
/// [`TimerBuilder::clock`](crate::TimerBuilder::clock) and call
/// [`advance`](ManualClock::advance) to move time forward.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        ManualClock {
            now: AtomicU64::new(start_millis),
        }
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::Release);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
