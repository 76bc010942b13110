//! The scheduler: public API, insertion math, and the worker tick loop.
//!
//! ## Concurrency discipline
//!
//! One readers–writer lock pairs arbitrarily many schedulers against the
//! single worker, with the roles deliberately inverted: `schedule` and
//! `cancel` take the **shared** side (each bucket is its own thread-safe
//! set, so peers never conflict), while the worker takes the **exclusive**
//! side for the cursor advance and bucket drain.  Task dispatch happens
//! after the exclusive lock is released, so a slow task never blocks
//! insertion.
//!
//! Timeout and scheduler lifecycles are plain atomics driven by CAS; see
//! the `timeout` module for the cancel-versus-expire race.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::builder::TimerBuilder;
use crate::clock::Clock;
use crate::error::TimerError;
use crate::stats::{DeviationObserver, RateObserver};
use crate::task::{FnTask, TimerTask};
use crate::timeout::{Timeout, TimeoutInner};
use crate::wheel::Wheel;

// Scheduler lifecycle.  Monotone: INIT → STARTED → STOPPED.
const ST_INIT: u8 = 0;
const ST_STARTED: u8 = 1;
const ST_STOPPED: u8 = 2;

// ---------------------------------------------------------------------------
// Timer interior
// ---------------------------------------------------------------------------

/// Shared interior of a [`WheelTimer`].
pub(crate) struct Inner {
    wheel: Wheel,
    /// The scheduler/worker pairing lock described in the module docs.
    sync: RwLock<()>,
    state: AtomicU8,
    tick_ms: u64,
    round_ms: u64,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) rate_observer: Option<Arc<dyn RateObserver>>,
    pub(crate) deviation_observer: Option<Arc<dyn DeviationObserver>>,
    thread_name: String,
    /// Source of bucket-set identities for new timeouts.
    next_id: AtomicU64,
    alarm: TickAlarm,
    /// Identity of the worker thread, for the stop-from-task guard.
    worker_id: Mutex<Option<ThreadId>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    #[inline]
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Places `timeout` into the bucket `delay_ms` from the current
    /// cursor, under the shared lock.  Also the re-entry point for
    /// slipped entries.
    fn schedule_timeout(&self, timeout: &Arc<TimeoutInner>, delay_ms: u64) {
        let (relative_index, remaining_rounds) =
            insertion_coordinates(delay_ms, self.tick_ms, self.round_ms);

        let _guard = self.sync.read();
        let stop_index = (self.wheel.cursor() + relative_index as usize) & self.wheel.mask();
        timeout.bucket_index.store(stop_index, Ordering::Relaxed);
        timeout
            .remaining_rounds
            .store(remaining_rounds, Ordering::Relaxed);
        self.wheel.bucket(stop_index).add(Arc::clone(timeout));
    }

    /// One tick: advance the cursor and drain the entered bucket under
    /// the exclusive lock, then reschedule slipped entries outside it.
    ///
    /// Expired entries are appended to `expired` for the caller to fire
    /// without any lock held.
    fn advance_and_drain(&self, worker_deadline: u64, expired: &mut Vec<Arc<TimeoutInner>>) {
        let mut slipped: Vec<Arc<TimeoutInner>> = Vec::new();
        {
            let _guard = self.sync.write();
            let cursor = self.wheel.advance();
            self.wheel
                .bucket(cursor)
                .drain(worker_deadline, expired, &mut slipped);
        }

        // A slipped entry sits at zero rounds with its deadline still
        // ahead (the insertion math rounds up by one tick).  Re-enter the
        // normal insertion path for the remainder of its delay; the
        // exclusive lock is already released, so taking the shared side
        // here cannot deadlock.
        for timeout in slipped {
            let delay_ms = timeout.deadline_ms - worker_deadline;
            self.schedule_timeout(&timeout, delay_ms);
        }
    }
}

/// Computes `(relative_index, remaining_rounds)` for a delay.
///
/// The delay is floored to one tick so the worker can never visit the
/// slot before the timeout is eligible.  The `+1` rounds a non-aligned
/// delay up to the next whole tick; the `-1` compensates a tick-aligned
/// delay of exactly N rounds for the cursor having already moved past
/// the current slot.
fn insertion_coordinates(delay_ms: u64, tick_ms: u64, round_ms: u64) -> (u64, u64) {
    let delay = delay_ms.max(tick_ms);
    let last_round_delay = delay % round_ms;
    let last_tick_delay = delay % tick_ms;
    let relative_index = last_round_delay / tick_ms + u64::from(last_tick_delay != 0);
    let remaining_rounds = delay / round_ms - u64::from(last_round_delay == 0);
    (relative_index, remaining_rounds)
}

// ---------------------------------------------------------------------------
// WheelTimer
// ---------------------------------------------------------------------------

/// A hashed wheel timer for approximate, high-volume timeout scheduling.
///
/// Insertion and cancellation are O(1); in exchange a timeout may fire up
/// to one tick late (plus OS sleep overshoot), and never fires early.
/// The canonical use is per-connection I/O deadlines: create **one**
/// timer and share it — each instance owns a dedicated worker thread.
///
/// # Example
/// ```
/// use tourbillon::{TimerBuilder, Timeout};
/// use std::time::Duration;
///
/// let timer = TimerBuilder::new()
///     .tick_duration(Duration::from_millis(10))
///     .build()
///     .unwrap();
///
/// let timeout = timer
///     .schedule_fn(|_t: &Timeout| println!("deadline hit"), Duration::from_millis(30))
///     .unwrap();
///
/// // Changed our mind: cancellation wins if the task has not fired yet.
/// if timeout.cancel() {
///     assert!(timeout.is_cancelled());
/// }
/// # let _ = timer.stop();
/// ```
pub struct WheelTimer {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for WheelTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WheelTimer").finish()
    }
}

impl Clone for WheelTimer {
    fn clone(&self) -> Self {
        WheelTimer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl WheelTimer {
    pub(crate) fn new(
        tick_ms: u64,
        ticks_per_wheel: usize,
        thread_name: String,
        clock: Arc<dyn Clock>,
        rate_observer: Option<Arc<dyn RateObserver>>,
        deviation_observer: Option<Arc<dyn DeviationObserver>>,
    ) -> Self {
        let wheel = Wheel::new(ticks_per_wheel);
        let round_ms = tick_ms * wheel.size() as u64;
        WheelTimer {
            inner: Arc::new(Inner {
                wheel,
                sync: RwLock::new(()),
                state: AtomicU8::new(ST_INIT),
                tick_ms,
                round_ms,
                clock,
                rate_observer,
                deviation_observer,
                thread_name,
                next_id: AtomicU64::new(0),
                alarm: TickAlarm::new(),
                worker_id: Mutex::new(None),
                join_handle: Mutex::new(None),
            }),
        }
    }

    /// Returns a [`TimerBuilder`] for constructing a new timer.
    pub fn builder() -> TimerBuilder {
        TimerBuilder::new()
    }

    /// Starts the worker thread explicitly.
    ///
    /// `schedule` starts the worker on demand, so calling this is only
    /// useful to front-load the thread spawn.  Idempotent while running.
    ///
    /// # Errors
    ///
    /// [`TimerError::Stopped`] once the timer has been stopped — a timer
    /// cannot be restarted.
    pub fn start(&self) -> Result<(), TimerError> {
        match self.inner.state() {
            ST_INIT => {
                // The state CAS and the handle store happen under the
                // join-handle lock, so a concurrent `stop` that observes
                // STARTED is guaranteed to find the handle.
                let mut slot = self.inner.join_handle.lock();
                if self
                    .inner
                    .state
                    .compare_exchange(ST_INIT, ST_STARTED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    *slot = Some(self.spawn_worker()?);
                }
                Ok(())
            }
            ST_STARTED => Ok(()),
            _ => Err(TimerError::Stopped),
        }
    }

    fn spawn_worker(&self) -> Result<JoinHandle<()>, TimerError> {
        let timer = self.clone();
        let spawn = thread::Builder::new()
            .name(self.inner.thread_name.clone())
            .spawn(move || Worker::run(timer));
        spawn.map_err(|e| {
            // No worker will ever drain the wheel; refuse further use.
            self.inner.state.store(ST_STOPPED, Ordering::Release);
            TimerError::Spawn(e)
        })
    }

    /// Schedules `task` to run once `delay` from now.
    ///
    /// Delays shorter than one tick are floored to one tick; all firings
    /// land on tick boundaries.  The returned [`Timeout`] can be used to
    /// cancel the task or query its state.
    ///
    /// # Errors
    ///
    /// [`TimerError::Stopped`] when the timer has been stopped.
    pub fn schedule(
        &self,
        task: impl TimerTask,
        delay: Duration,
    ) -> Result<Timeout, TimerError> {
        let now = self.inner.clock.now_millis();

        self.start()?;

        let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(TimeoutInner::new(
            id,
            Box::new(task),
            now.saturating_add(delay_ms),
        ));
        self.inner.schedule_timeout(&inner, delay_ms);

        Ok(Timeout {
            inner,
            timer: self.clone(),
        })
    }

    /// Closure-flavoured [`schedule`](WheelTimer::schedule).
    pub fn schedule_fn<F>(&self, f: F, delay: Duration) -> Result<Timeout, TimerError>
    where
        F: Fn(&Timeout) + Send + Sync + 'static,
    {
        self.schedule(FnTask(f), delay)
    }

    /// Stops the timer, returning every timeout that had not yet fired or
    /// been cancelled.  The returned timeouts never run; re-scheduling
    /// them (on another timer) is the caller's decision.
    ///
    /// Stopping a timer that never started is a no-op yielding an empty
    /// vec, and pins the state so it can never start afterwards.
    ///
    /// # Errors
    ///
    /// [`TimerError::StopFromTask`] when called from inside a running
    /// timer task: the worker cannot join itself.
    pub fn stop(&self) -> Result<Vec<Timeout>, TimerError> {
        if Some(thread::current().id()) == *self.inner.worker_id.lock() {
            return Err(TimerError::StopFromTask);
        }

        let handle = {
            let mut slot = self.inner.join_handle.lock();
            if self
                .inner
                .state
                .compare_exchange(ST_STARTED, ST_STOPPED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Never started, or stopped twice — pin the state either way.
                self.inner.state.store(ST_STOPPED, Ordering::Release);
                return Ok(Vec::new());
            }
            slot.take()
        };

        // Wake the worker out of its inter-tick sleep and wait for it to
        // observe the state change.  Any expired list it already drained
        // finishes firing before the join returns.
        self.inner.alarm.interrupt();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        let mut pending: Vec<Arc<TimeoutInner>> = Vec::new();
        {
            let _guard = self.inner.sync.write();
            for bucket in self.inner.wheel.buckets() {
                bucket.drain_all(&mut pending);
            }
        }

        // Cancelled stragglers may linger in buckets when `cancel` lost
        // the bucket-removal race; only live timeouts go back to the
        // caller.
        Ok(pending
            .into_iter()
            .filter(|t| t.is_init())
            .map(|inner| Timeout {
                inner,
                timer: self.clone(),
            })
            .collect())
    }

    /// Best-effort bucket removal on behalf of [`Timeout::cancel`].
    pub(crate) fn remove_from_bucket(&self, timeout: &TimeoutInner) {
        let _guard = self.inner.sync.read();
        let index = timeout.bucket_index.load(Ordering::Relaxed);
        self.inner.wheel.bucket(index).remove(timeout.id);
    }

    pub(crate) fn interior(&self) -> &Inner {
        &self.inner
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// The single background thread advancing the wheel.
struct Worker {
    timer: WheelTimer,
    /// Clock reading captured once when the worker starts; every tick
    /// deadline is derived from it, so oversleeping one tick shortens the
    /// next sleep instead of shifting the whole schedule.
    start_ms: u64,
    tick: u64,
}

impl Worker {
    fn run(timer: WheelTimer) {
        let inner = Arc::clone(&timer.inner);
        *inner.worker_id.lock() = Some(thread::current().id());

        let mut worker = Worker {
            start_ms: inner.clock.now_millis(),
            tick: 1,
            timer,
        };

        let mut expired: Vec<Arc<TimeoutInner>> = Vec::new();
        while inner.state() == ST_STARTED {
            if let Some(deadline) = worker.wait_for_next_tick(&inner) {
                inner.advance_and_drain(deadline, &mut expired);
                worker.fire(&mut expired);
            }
        }
    }

    /// Sleeps until the next tick boundary.  Returns the tick's absolute
    /// deadline, or `None` when the timer stopped while waiting.
    fn wait_for_next_tick(&mut self, inner: &Inner) -> Option<u64> {
        let target = inner.tick_ms.saturating_mul(self.tick);
        let deadline = self.start_ms.saturating_add(target);

        loop {
            let elapsed = inner.clock.now_millis().saturating_sub(self.start_ms);
            let mut sleep_ms = target.saturating_sub(elapsed);

            // Sleep on Windows is quantized near 10-16 ms; rounding down
            // to a 10 ms multiple keeps the final short wait from turning
            // into a sequence of overshooting sleeps.
            if cfg!(windows) {
                sleep_ms = sleep_ms / 10 * 10;
            }

            if sleep_ms == 0 {
                break;
            }

            inner.alarm.wait_for(Duration::from_millis(sleep_ms));
            if inner.state() != ST_STARTED {
                return None;
            }
        }

        self.tick += 1;
        Some(deadline)
    }

    /// Dispatches the drained entries, newest-first, with no lock held.
    fn fire(&self, expired: &mut Vec<Arc<TimeoutInner>>) {
        for entry in expired.drain(..).rev() {
            let handle = Timeout {
                inner: entry,
                timer: self.timer.clone(),
            };
            handle.expire();
        }
    }
}

// ---------------------------------------------------------------------------
// TickAlarm
// ---------------------------------------------------------------------------

/// Interruptible sleep between ticks.
///
/// The flag is latched under the mutex, so an interrupt arriving between
/// the worker's state check and its wait cannot be lost.
struct TickAlarm {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl TickAlarm {
    fn new() -> Self {
        TickAlarm {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn wait_for(&self, timeout: Duration) {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            let _ = self.wake.wait_for(&mut stopped, timeout);
        }
    }

    fn interrupt(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.wake.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    // -----------------------------------------------------------------------
    // Insertion math
    // -----------------------------------------------------------------------

    #[test]
    fn below_tick_delay_lands_one_slot_ahead() {
        assert_eq!(insertion_coordinates(30, 100, 800), (1, 0));
    }

    #[test]
    fn tick_aligned_delay_needs_no_rounding() {
        assert_eq!(insertion_coordinates(100, 100, 800), (1, 0));
        assert_eq!(insertion_coordinates(400, 100, 800), (4, 0));
    }

    #[test]
    fn exact_round_delay_stays_in_current_slot() {
        // Lands in the slot the cursor just left, to be visited after one
        // full revolution — hence zero extra rounds.
        assert_eq!(insertion_coordinates(800, 100, 800), (0, 0));
        assert_eq!(insertion_coordinates(1600, 100, 800), (0, 1));
    }

    #[test]
    fn multi_round_delay_splits_rounds_and_index() {
        // 2050 ms = 2 rounds + 450 ms; 450 ms is not tick-aligned, so the
        // index rounds up to 5.
        assert_eq!(insertion_coordinates(2050, 100, 800), (5, 2));
    }

    #[test]
    fn tiny_wheel_delay_can_wrap_past_a_revolution() {
        // Two-slot wheel: 150 ms maps to relative index 2, i.e. a full
        // lap — the worker will find it one tick early and reschedule.
        assert_eq!(insertion_coordinates(150, 100, 200), (2, 0));
    }

    // -----------------------------------------------------------------------
    // Drain/fire plumbing (this test plays the worker's role directly)
    // -----------------------------------------------------------------------

    fn manual_timer(tick_ms: u64, ticks: usize) -> (WheelTimer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let timer = TimerBuilder::new()
            .tick_duration(Duration::from_millis(tick_ms))
            .ticks_per_wheel(ticks)
            .clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .build()
            .unwrap();
        // Pretend to be started so `schedule` does not spawn a real
        // worker; the test drives the wheel by hand.
        timer.inner.state.store(ST_STARTED, Ordering::Release);
        (timer, clock)
    }

    fn counting_task() -> (Arc<AtomicUsize>, FnTask<impl Fn(&Timeout) + Send + Sync + 'static>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let task = FnTask(move |_t: &Timeout| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        (count, task)
    }

    #[test]
    fn cancel_between_drain_and_fire_suppresses_task() {
        let (timer, _clock) = manual_timer(100, 8);
        let (count, task) = counting_task();

        let timeout = timer.schedule(task, Duration::from_millis(100)).unwrap();

        // Tick once: the entry moves into the local expired list.
        let mut expired = Vec::new();
        timer.inner.advance_and_drain(1_000, &mut expired);
        assert_eq!(expired.len(), 1, "entry should be drained as expired");

        // Cancellation still wins while the entry is in flight.
        assert!(timeout.cancel());

        for entry in expired.drain(..).rev() {
            Timeout {
                inner: entry,
                timer: timer.clone(),
            }
            .expire();
        }

        assert_eq!(count.load(Ordering::SeqCst), 0, "cancelled task must not run");
        assert!(timeout.is_cancelled());
    }

    #[test]
    fn slipped_entry_is_rescheduled_for_the_remainder() {
        // Scheduling mid-tick puts the entry one tick early: a 60 ms
        // delay requested at t=50 lands in the bucket drained at t=100,
        // but its deadline is 110.
        let (timer, clock) = manual_timer(100, 8);
        clock.advance(50);
        let (count, task) = counting_task();

        let timeout = timer.schedule(task, Duration::from_millis(60)).unwrap();
        assert_eq!(timeout.inner.deadline_ms, 110);
        assert_eq!(timeout.inner.bucket_index.load(Ordering::Relaxed), 1);

        // First tick (deadline 100): zero rounds but the deadline is still
        // ahead → slipped, rescheduled for the remaining 10 ms (floored to
        // one tick, landing one slot further).
        let mut expired = Vec::new();
        timer.inner.advance_and_drain(100, &mut expired);
        assert!(expired.is_empty(), "must not fire 10 ms early");
        assert_eq!(
            timeout.inner.bucket_index.load(Ordering::Relaxed),
            2,
            "reschedule must re-run the insertion math"
        );

        // Second tick (deadline 200): now due.
        timer.inner.advance_and_drain(200, &mut expired);
        assert_eq!(expired.len(), 1);

        for entry in expired.drain(..).rev() {
            Timeout {
                inner: entry,
                timer: timer.clone(),
            }
            .expire();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn entry_with_rounds_survives_a_full_revolution() {
        // 8-slot wheel, 1 s delay at 100 ms ticks = one round + 2 ticks.
        let (timer, _clock) = manual_timer(100, 8);
        let (count, task) = counting_task();

        let _timeout = timer.schedule(task, Duration::from_millis(1_000)).unwrap();

        let mut expired = Vec::new();
        // Visit every slot once: the entry must sit out the first pass.
        for tick in 1..=8u64 {
            timer.inner.advance_and_drain(tick * 100, &mut expired);
            assert!(expired.is_empty(), "fired during round 0 at tick {tick}");
        }
        // Second revolution reaches the slot at t=1000.
        for tick in 9..=10u64 {
            timer.inner.advance_and_drain(tick * 100, &mut expired);
        }
        assert_eq!(expired.len(), 1, "entry should fire on its second visit");
        let _ = count;
    }

    // -----------------------------------------------------------------------
    // Lifecycle states
    // -----------------------------------------------------------------------

    #[test]
    fn stop_before_start_pins_the_state() {
        let timer = TimerBuilder::new().build().unwrap();
        assert!(timer.stop().unwrap().is_empty());
        assert!(matches!(timer.start().unwrap_err(), TimerError::Stopped));
        assert!(matches!(
            timer
                .schedule_fn(|_t| {}, Duration::from_millis(10))
                .unwrap_err(),
            TimerError::Stopped
        ));
    }

    #[test]
    fn second_stop_returns_nothing() {
        let (timer, _clock) = manual_timer(100, 8);
        let (_count, task) = counting_task();
        let _timeout = timer.schedule(task, Duration::from_secs(60)).unwrap();

        let first = timer.stop().unwrap();
        assert_eq!(first.len(), 1);
        assert!(timer.stop().unwrap().is_empty());
    }

    #[test]
    fn stop_returns_only_live_timeouts() {
        let (timer, _clock) = manual_timer(100, 8);

        let (_c1, t1) = counting_task();
        let (_c2, t2) = counting_task();
        let keep = timer.schedule(t1, Duration::from_secs(30)).unwrap();
        let gone = timer.schedule(t2, Duration::from_secs(30)).unwrap();
        assert!(gone.cancel());

        let pending = timer.stop().unwrap();
        assert_eq!(pending.len(), 1, "only the live timeout comes back");
        assert_eq!(pending[0].inner.id, keep.inner.id);
    }
}
