//! The handle representing one scheduled task.
//!
//! A timeout's lifecycle is a three-state machine driven exclusively by
//! compare-and-swap: `INIT → CANCELLED` (any thread, via [`Timeout::cancel`])
//! and `INIT → EXPIRED` (worker thread only).  Exactly one transition wins;
//! the loser observes the CAS failure and backs off.  Once the state has
//! left `INIT` the task can never run (again).

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::task::TimerTask;
use crate::timer::WheelTimer;

pub(crate) const ST_INIT: u8 = 0;
pub(crate) const ST_CANCELLED: u8 = 1;
pub(crate) const ST_EXPIRED: u8 = 2;

// ---------------------------------------------------------------------------
// TimeoutInner
// ---------------------------------------------------------------------------

/// Shared interior of a [`Timeout`].
///
/// Buckets hold `Arc<TimeoutInner>` directly (no back-reference to the
/// timer), so a pending timeout never keeps the timer interior alive.
pub(crate) struct TimeoutInner {
    /// Identity within bucket sets.  Unique per timer instance.
    pub(crate) id: u64,
    pub(crate) task: Box<dyn TimerTask>,
    /// Absolute expiry in the clock's millisecond domain.  Immutable.
    pub(crate) deadline_ms: u64,
    /// Wheel slot currently holding this entry.  Written on insertion and
    /// when the worker reschedules a slipped entry.
    pub(crate) bucket_index: AtomicUsize,
    /// Full revolutions left before the entry may fire.  Decremented only
    /// by the worker under the exclusive lock.
    pub(crate) remaining_rounds: AtomicU64,
    state: AtomicU8,
}

impl TimeoutInner {
    pub(crate) fn new(id: u64, task: Box<dyn TimerTask>, deadline_ms: u64) -> Self {
        TimeoutInner {
            id,
            task,
            deadline_ms,
            bucket_index: AtomicUsize::new(0),
            remaining_rounds: AtomicU64::new(0),
            state: AtomicU8::new(ST_INIT),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_init(&self) -> bool {
        self.state() == ST_INIT
    }

    /// Attempts the `INIT → to` transition.  Returns `true` if this call won.
    #[inline]
    pub(crate) fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(ST_INIT, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Timeout
// ---------------------------------------------------------------------------

/// A handle to a scheduled task, returned by
/// [`WheelTimer::schedule`](crate::WheelTimer::schedule).
///
/// Cloning is cheap; all clones observe the same state.
pub struct Timeout {
    pub(crate) inner: Arc<TimeoutInner>,
    pub(crate) timer: WheelTimer,
}

impl Clone for Timeout {
    fn clone(&self) -> Self {
        Timeout {
            inner: Arc::clone(&self.inner),
            timer: self.timer.clone(),
        }
    }
}

impl Timeout {
    /// Cancels this timeout.
    ///
    /// Returns `true` if the cancel won the race against expiration — the
    /// task is then guaranteed never to run.  Returns `false` if the task
    /// has already fired (or is about to), or if the timeout was cancelled
    /// before.
    pub fn cancel(&self) -> bool {
        if !self.inner.transition(ST_CANCELLED) {
            return false;
        }

        // Best-effort removal: a no-op when the worker already drained the
        // entry out of its bucket.
        self.timer.remove_from_bucket(&self.inner);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state() == ST_CANCELLED
    }

    pub fn is_expired(&self) -> bool {
        self.inner.state() == ST_EXPIRED
    }

    /// The task this timeout was scheduled with.
    pub fn task(&self) -> &dyn TimerTask {
        &*self.inner.task
    }

    /// The timer that owns this timeout.
    pub fn timer(&self) -> &WheelTimer {
        &self.timer
    }

    /// Worker-side firing.  Loses silently to a concurrent [`cancel`].
    ///
    /// [`cancel`]: Timeout::cancel
    pub(crate) fn expire(&self) {
        if !self.inner.transition(ST_EXPIRED) {
            return;
        }

        let timer = self.timer.interior();
        if let Some(rate) = &timer.rate_observer {
            rate.event();
        }
        if let Some(deviation) = &timer.deviation_observer {
            let now = timer.clock.now_millis();
            deviation.update(now as i64 - self.inner.deadline_ms as i64);
        }

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.inner.task.run(self))) {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            tracing::warn!(panic = msg, "timer task panicked");
        }
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = self.timer.interior().clock.now_millis();
        let deadline = self.inner.deadline_ms;

        write!(f, "Timeout(deadline: ")?;
        if deadline > now {
            write!(f, "{} ms later", deadline - now)?;
        } else if deadline < now {
            write!(f, "{} ms ago", now - deadline)?;
        } else {
            write!(f, "now")?;
        }
        if self.is_cancelled() {
            write!(f, ", cancelled")?;
        }
        write!(f, ")")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
