//! Timer task — the callback invoked when a timeout expires.
//!
//! # Example
//! ```
//! use tourbillon::{TimerBuilder, Timeout};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let fired = Arc::new(AtomicUsize::new(0));
//! let fired2 = Arc::clone(&fired);
//!
//! let timer = TimerBuilder::new()
//!     .tick_duration(Duration::from_millis(10))
//!     .build()
//!     .unwrap();
//!
//! timer.schedule_fn(
//!     move |_timeout: &Timeout| {
//!         fired2.fetch_add(1, Ordering::SeqCst);
//!     },
//!     Duration::from_millis(20),
//! ).unwrap();
//!
//! std::thread::sleep(Duration::from_millis(200));
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! # let _ = timer.stop();
//! ```

use crate::timeout::Timeout;

/// A task executed by the worker thread when its timeout expires.
///
/// Implementations must be `Send + Sync + 'static`: the task is handed to
/// the worker thread and the [`Timeout`] handle holding it may be cloned
/// across threads.
///
/// The task receives the handle that owns it, so it can inspect its own
/// state or schedule a follow-up through
/// [`Timeout::timer`](crate::Timeout::timer).  Calling
/// [`WheelTimer::stop`](crate::WheelTimer::stop) from inside `run` is
/// rejected — the worker cannot join itself.
///
/// A panic escaping `run` is caught and logged at WARN; the worker keeps
/// ticking.
pub trait TimerTask: Send + Sync + 'static {
    fn run(&self, timeout: &Timeout);
}

/// A [`TimerTask`] backed by a closure.
///
/// Created implicitly via [`WheelTimer::schedule_fn`](crate::WheelTimer::schedule_fn).
pub struct FnTask<F>(pub F);

impl<F> TimerTask for FnTask<F>
where
    F: Fn(&Timeout) + Send + Sync + 'static,
{
    fn run(&self, timeout: &Timeout) {
        (self.0)(timeout)
    }
}
