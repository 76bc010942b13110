use thiserror::Error;

/// Errors reported by [`TimerBuilder::build`](crate::TimerBuilder::build).
#[derive(Debug, Error)]
pub enum BuildError {
    /// The tick duration is zero after conversion to whole milliseconds.
    #[error("tick duration must be at least one millisecond")]
    ZeroTickDuration,

    /// `ticks_per_wheel` was zero.
    #[error("ticks_per_wheel must be greater than 0")]
    ZeroTicksPerWheel,

    /// `ticks_per_wheel` exceeded the 2^30 cap.
    #[error("ticks_per_wheel may not be greater than 2^30: {0}")]
    TicksPerWheelTooLarge(usize),

    /// `tick_duration × wheel_size` would overflow the millisecond domain.
    #[error("tick duration of {tick_ms} ms is too long for a wheel of {wheel_size} slots")]
    RoundDurationOverflow { tick_ms: u64, wheel_size: usize },
}

/// Errors reported by the [`WheelTimer`](crate::WheelTimer) lifecycle
/// operations.
#[derive(Debug, Error)]
pub enum TimerError {
    /// `start` (explicit or implicit via `schedule`) was called after `stop`.
    #[error("timer cannot be restarted once stopped")]
    Stopped,

    /// `stop` was called from inside a running timer task.
    #[error("stop() may not be called from a timer task")]
    StopFromTask,

    /// The worker thread could not be spawned.
    #[error("failed to spawn timer worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_are_stable() {
        assert_eq!(
            BuildError::TicksPerWheelTooLarge(1 << 31).to_string(),
            "ticks_per_wheel may not be greater than 2^30: 2147483648"
        );
        assert_eq!(
            TimerError::Stopped.to_string(),
            "timer cannot be restarted once stopped"
        );
    }
}
