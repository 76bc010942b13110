use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::BuildError;
use crate::stats::{DeviationObserver, RateObserver};
use crate::timer::WheelTimer;
use crate::wheel::MAX_TICKS_PER_WHEEL;

/// Builder for configuring and constructing a [`WheelTimer`].
///
/// # Example
/// ```
/// use tourbillon::TimerBuilder;
/// use std::time::Duration;
///
/// let timer = TimerBuilder::new()
///     .tick_duration(Duration::from_millis(50))
///     .ticks_per_wheel(256)
///     .build()
///     .unwrap();
/// # let _ = timer.stop();
/// ```
pub struct TimerBuilder {
    tick_duration: Duration,
    ticks_per_wheel: usize,
    thread_name: String,
    clock: Arc<dyn Clock>,
    rate_observer: Option<Arc<dyn RateObserver>>,
    deviation_observer: Option<Arc<dyn DeviationObserver>>,
}

impl TimerBuilder {
    pub fn new() -> Self {
        TimerBuilder {
            tick_duration: Duration::from_millis(100),
            ticks_per_wheel: 512,
            thread_name: "tourbillon-worker".to_string(),
            clock: Arc::new(MonotonicClock::new()),
            rate_observer: None,
            deviation_observer: None,
        }
    }

    /// Set the tick granularity (default: 100 ms).
    ///
    /// Every timeout fires on a tick boundary, so this bounds both the
    /// firing jitter and the wake-up rate of the worker thread.  Network
    /// I/O deadlines rarely need anything finer than the default.
    pub fn tick_duration(mut self, tick: Duration) -> Self {
        self.tick_duration = tick;
        self
    }

    /// Set the number of wheel slots (default: 512; rounded up to a power
    /// of two).
    ///
    /// A larger wheel spreads concurrently pending timeouts across more
    /// buckets and lengthens one revolution, reducing per-tick work when
    /// many timeouts are in flight.
    pub fn ticks_per_wheel(mut self, ticks: usize) -> Self {
        self.ticks_per_wheel = ticks;
        self
    }

    /// Set the name of the worker thread (default: `"tourbillon-worker"`).
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Replace the millisecond clock.  Primarily for deterministic tests
    /// via [`ManualClock`](crate::clock::ManualClock).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Install an observer notified once per fired timeout.
    pub fn rate_observer(mut self, observer: Arc<dyn RateObserver>) -> Self {
        self.rate_observer = Some(observer);
        self
    }

    /// Install an observer of the expiration deviation
    /// (`fire_time − deadline`) of each fired timeout.
    pub fn deviation_observer(mut self, observer: Arc<dyn DeviationObserver>) -> Self {
        self.deviation_observer = Some(observer);
        self
    }

    /// Validates the configuration and constructs the timer.
    ///
    /// The worker thread is not spawned until [`WheelTimer::start`] (or
    /// the first [`WheelTimer::schedule`]).
    pub fn build(self) -> Result<WheelTimer, BuildError> {
        let tick_ms = self.tick_duration.as_millis().min(u64::MAX as u128) as u64;
        if tick_ms == 0 {
            return Err(BuildError::ZeroTickDuration);
        }
        if self.ticks_per_wheel == 0 {
            return Err(BuildError::ZeroTicksPerWheel);
        }
        if self.ticks_per_wheel > MAX_TICKS_PER_WHEEL {
            return Err(BuildError::TicksPerWheelTooLarge(self.ticks_per_wheel));
        }

        // Guard the round duration against overflowing the millisecond
        // domain, using the normalized (power-of-two) slot count.
        let wheel_size = self.ticks_per_wheel.next_power_of_two();
        if tick_ms >= u64::MAX / wheel_size as u64 {
            return Err(BuildError::RoundDurationOverflow { tick_ms, wheel_size });
        }

        Ok(WheelTimer::new(
            tick_ms,
            self.ticks_per_wheel,
            self.thread_name,
            self.clock,
            self.rate_observer,
            self.deviation_observer,
        ))
    }
}

impl Default for TimerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;

    #[test]
    fn sub_millisecond_tick_is_rejected() {
        let err = TimerBuilder::new()
            .tick_duration(Duration::from_micros(500))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::ZeroTickDuration));
    }

    #[test]
    fn zero_ticks_per_wheel_is_rejected() {
        let err = TimerBuilder::new().ticks_per_wheel(0).build().unwrap_err();
        assert!(matches!(err, BuildError::ZeroTicksPerWheel));
    }

    #[test]
    fn oversized_wheel_is_rejected() {
        let err = TimerBuilder::new()
            .ticks_per_wheel((1 << 30) + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::TicksPerWheelTooLarge(_)));
    }

    #[test]
    fn round_duration_overflow_is_rejected() {
        let err = TimerBuilder::new()
            .tick_duration(Duration::from_millis(u64::MAX / 4))
            .ticks_per_wheel(8)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::RoundDurationOverflow { .. }));
    }

    #[test]
    fn defaults_build() {
        let timer = TimerBuilder::new().build().unwrap();
        let _ = timer; // never started; nothing to join
    }
}
