//! Monitoring hooks for timer accuracy and throughput.
//!
//! Both observers are optional, dependency-injected collaborators: the
//! timer functions identically with none installed.  [`TimerStats`]
//! implements both with plain atomic counters for callers who just want
//! numbers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts fired timeouts, one event per expiration.
pub trait RateObserver: Send + Sync + 'static {
    fn event(&self);
}

/// Records the expiration deviation `fire_time − deadline` for each
/// fired timeout, in milliseconds.
///
/// The value is never negative in practice (the wheel never fires
/// early), but the signed type matches the arithmetic.
pub trait DeviationObserver: Send + Sync + 'static {
    fn update(&self, deviation_ms: i64);
}

// ---------------------------------------------------------------------------
// TimerStats
// ---------------------------------------------------------------------------

/// Atomic counters implementing both observer traits.
///
/// Share one instance with the builder via `Arc` and keep a clone to read
/// snapshots:
///
/// ```
/// use std::sync::Arc;
/// use tourbillon::{TimerBuilder, TimerStats};
///
/// let stats = Arc::new(TimerStats::new());
/// let timer = TimerBuilder::new()
///     .rate_observer(Arc::clone(&stats) as _)
///     .deviation_observer(Arc::clone(&stats) as _)
///     .build()
///     .unwrap();
/// # drop(timer);
/// assert_eq!(stats.snapshot().fired, 0);
/// ```
pub struct TimerStats {
    fired: AtomicU64,
    deviation_total_ms: AtomicU64,
    deviation_max_ms: AtomicU64,
}

impl TimerStats {
    pub fn new() -> Self {
        TimerStats {
            fired: AtomicU64::new(0),
            deviation_total_ms: AtomicU64::new(0),
            deviation_max_ms: AtomicU64::new(0),
        }
    }

    /// Returns a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TimerMetrics {
        let fired = self.fired.load(Ordering::Relaxed);
        let total = self.deviation_total_ms.load(Ordering::Relaxed);
        let max = self.deviation_max_ms.load(Ordering::Relaxed);
        let mean = if fired == 0 {
            0.0_f64
        } else {
            total as f64 / fired as f64
        };
        TimerMetrics {
            fired,
            mean_deviation_ms: mean,
            max_deviation_ms: max,
        }
    }
}

impl Default for TimerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RateObserver for TimerStats {
    #[inline]
    fn event(&self) {
        self.fired.fetch_add(1, Ordering::Relaxed);
    }
}

impl DeviationObserver for TimerStats {
    #[inline]
    fn update(&self, deviation_ms: i64) {
        let deviation = deviation_ms.max(0) as u64;
        self.deviation_total_ms
            .fetch_add(deviation, Ordering::Relaxed);
        self.deviation_max_ms
            .fetch_max(deviation, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of [`TimerStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct TimerMetrics {
    /// Number of timeouts whose task was dispatched.
    pub fired: u64,
    /// Mean `fire_time − deadline`, or `0.0` before the first firing.
    pub mean_deviation_ms: f64,
    /// Largest observed `fire_time − deadline`.
    pub max_deviation_ms: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
