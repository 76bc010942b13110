//! The wheel: a power-of-two ring of buckets plus the worker's cursor.
//!
//! ## Algorithm
//!
//! A timeout scheduled `delay` ms out hashes to the slot
//! `(cursor + delay / tick_duration) & mask`, carrying a
//! `remaining_rounds` counter for every full revolution the delay spans.
//! The worker advances the cursor one slot per tick and drains that
//! bucket: entries with rounds left sit out another revolution, entries
//! whose deadline has passed expire, and entries that landed a tick
//! early (the `+1` rounding in the insertion math) are pulled out and
//! rescheduled for the remainder of their delay.
//!
//! The per-slot sets are individually locked, so concurrent schedulers
//! can insert while holding only the shared side of the wheel's
//! readers–writer lock; the worker's drain runs under the exclusive side
//! and therefore sees each bucket at rest.
//!
//! ## References
//! - Varghese & Lauck (1987). *Hashed and Hierarchical Timing Wheels.*

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::timeout::TimeoutInner;

/// Hard cap on the configured wheel size, before power-of-two rounding.
pub(crate) const MAX_TICKS_PER_WHEEL: usize = 1 << 30;

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// One wheel slot: a thread-safe set of timeouts keyed by identity.
///
/// Padded to a cache line to prevent false sharing between neighbouring
/// slots under concurrent insertion.
#[repr(align(64))]
pub(crate) struct Bucket {
    entries: Mutex<AHashMap<u64, Arc<TimeoutInner>>>,
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            entries: Mutex::new(AHashMap::new()),
        }
    }

    pub(crate) fn add(&self, timeout: Arc<TimeoutInner>) {
        self.entries.lock().insert(timeout.id, timeout);
    }

    /// Removes the entry with `id`.  Removing an absent entry is a no-op
    /// returning `false`.
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Destructive visit of every entry at tick time.
    ///
    /// Entries with rounds remaining are decremented and kept.  Entries at
    /// zero rounds are removed and classified: past-deadline into
    /// `expired`, still-ahead (slipped a tick early) into `slipped`.
    ///
    /// Caller must hold the wheel's exclusive lock.
    pub(crate) fn drain(
        &self,
        deadline_ms: u64,
        expired: &mut Vec<Arc<TimeoutInner>>,
        slipped: &mut Vec<Arc<TimeoutInner>>,
    ) {
        self.entries.lock().retain(|_, timeout| {
            let rounds = timeout.remaining_rounds.load(Ordering::Relaxed);
            if rounds > 0 {
                timeout.remaining_rounds.store(rounds - 1, Ordering::Relaxed);
                return true;
            }
            if timeout.deadline_ms <= deadline_ms {
                expired.push(Arc::clone(timeout));
            } else {
                slipped.push(Arc::clone(timeout));
            }
            false
        });
    }

    /// Empties the bucket, appending every entry to `out`.  Used by `stop`.
    pub(crate) fn drain_all(&self, out: &mut Vec<Arc<TimeoutInner>>) {
        out.extend(self.entries.lock().drain().map(|(_, t)| t));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Wheel
// ---------------------------------------------------------------------------

pub(crate) struct Wheel {
    buckets: Box<[Bucket]>,
    /// Always `buckets.len() - 1`; buckets.len() is a power of two.
    mask: usize,
    /// Slot drained on the most recent tick.  Written only by the worker
    /// (under the exclusive lock), read by schedulers with acquire
    /// semantics.
    cursor: AtomicUsize,
}

impl Wheel {
    /// Builds a wheel of `ticks_per_wheel` slots, rounded up to the next
    /// power of two.  The caller validates range; see `TimerBuilder`.
    pub(crate) fn new(ticks_per_wheel: usize) -> Self {
        let size = normalize_ticks_per_wheel(ticks_per_wheel);
        let buckets = (0..size).map(|_| Bucket::new()).collect::<Vec<_>>();
        Wheel {
            buckets: buckets.into_boxed_slice(),
            mask: size - 1,
            cursor: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub(crate) fn mask(&self) -> usize {
        self.mask
    }

    #[inline]
    pub(crate) fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Moves the cursor one slot forward and returns the new position.
    /// Worker-only, under the exclusive lock.
    pub(crate) fn advance(&self) -> usize {
        let next = (self.cursor.load(Ordering::Relaxed) + 1) & self.mask;
        self.cursor.store(next, Ordering::Release);
        next
    }

    #[inline]
    pub(crate) fn bucket(&self, index: usize) -> &Bucket {
        &self.buckets[index & self.mask]
    }

    pub(crate) fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }
}

/// Rounds up to the next power of two, matching the hash-mask layout.
fn normalize_ticks_per_wheel(ticks_per_wheel: usize) -> usize {
    ticks_per_wheel.next_power_of_two()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
