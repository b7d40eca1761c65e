//! The I/O clock: a millisecond min-heap of timers keyed on absolute
//! expiry.
//!
//! Cancellation is lazy: removed timers are recorded in a set and skipped
//! when they surface at the top of the heap, which keeps removal O(1)
//! amortized. The cancelled set is cleared whenever the heap drains.
//!
//! `now` is advanced from the monotonic source inside
//! [`IoClock::remove_expired_timers`] (and on the poller's EINTR retry
//! path); a timer added between polls is measured from the last advance.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;

use weft_core::{FiberId, TimerId};

struct TimerEntry {
    /// Absolute expiry in ms since the clock's origin. `u64::MAX` means
    /// the timer never fires (negative duration at `add_timer`).
    expiry: u64,
    id: TimerId,
    waiter: FiberId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; tie-break on id for deterministic order.
        match other.expiry.cmp(&self.expiry) {
            Ordering::Equal => other.id.serial().cmp(&self.id.serial()),
            ord => ord,
        }
    }
}

/// Deadline-ordered timer store driving the poller's wait timeout.
pub struct IoClock {
    heap: BinaryHeap<TimerEntry>,
    cancelled: HashSet<TimerId>,
    next_serial: u64,
    origin: Instant,
    /// Milliseconds since `origin` at the last advance.
    now: u64,
}

impl IoClock {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::with_capacity(64),
            cancelled: HashSet::new(),
            next_serial: 0,
            origin: Instant::now(),
            now: 0,
        }
    }

    /// Arm a timer that resumes `waiter` after `duration_ms`. A negative
    /// duration arms a timer that never fires.
    pub fn add_timer(&mut self, waiter: FiberId, duration_ms: i64) -> TimerId {
        let id = TimerId::new(self.next_serial);
        self.next_serial += 1;

        let expiry = if duration_ms < 0 {
            u64::MAX
        } else {
            self.now.saturating_add(duration_ms as u64)
        };

        self.heap.push(TimerEntry {
            expiry,
            id,
            waiter,
        });
        id
    }

    /// Cancel a timer that has not fired. Calling this for a timer that
    /// already expired out of the heap is a caller bug; the suspension
    /// sites gate on their timed-out flag to never do so.
    pub fn remove_timer(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Milliseconds until the earliest live timer is due: -1 when no timer
    /// is armed, 0 when one is already due.
    pub fn due_time(&mut self) -> i64 {
        self.prune_cancelled_top();
        match self.heap.peek() {
            None => -1,
            Some(top) if top.expiry == u64::MAX => -1,
            Some(top) => top.expiry.saturating_sub(self.now).min(i64::MAX as u64) as i64,
        }
    }

    /// Advance `now`, then pop every timer whose expiry has passed,
    /// calling `emit` once per pop.
    pub fn remove_expired_timers(&mut self, mut emit: impl FnMut(FiberId)) {
        self.advance();

        loop {
            self.prune_cancelled_top();
            match self.heap.peek() {
                Some(top) if top.expiry <= self.now => {
                    let entry = self.heap.pop().expect("peeked entry vanished");
                    emit(entry.waiter);
                }
                _ => break,
            }
        }

        if self.heap.is_empty() {
            self.cancelled.clear();
        }
    }

    /// Re-read the monotonic source. Called internally before expiry
    /// processing and by the poller when `epoll_wait` is interrupted.
    pub(crate) fn advance(&mut self) {
        self.now = self.origin.elapsed().as_millis() as u64;
    }

    /// Number of live (non-cancelled) timers.
    pub fn len(&self) -> usize {
        self.heap.len().saturating_sub(self.cancelled.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune_cancelled_top(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.cancelled.contains(&top.id) {
                let entry = self.heap.pop().expect("peeked entry vanished");
                self.cancelled.remove(&entry.id);
            } else {
                break;
            }
        }
    }
}

impl Default for IoClock {
    fn default() -> Self {
        Self::new()
    }
}
