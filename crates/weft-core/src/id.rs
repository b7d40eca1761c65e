//! Handle types for arena-allocated runtime objects.
//!
//! Fibers, watchers and timers are stored in arenas owned by their
//! respective components; the rest of the runtime refers to them through
//! these small copyable handles instead of pointers.

use core::fmt;

/// Identifies a fiber inside the scheduler's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u32);

impl FiberId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// Identifies a watcher inside the poller's arena.
///
/// Valid from `add_watcher` until the matching `remove_watcher`; the
/// suspension site that armed the watcher is responsible for removing it
/// on every exit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(pub(crate) usize);

impl WatcherId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Identifies a timer inside the clock's heap.
///
/// Timer ids are never reused; cancellation is recorded against the id so
/// that a stale entry still sitting in the heap can be skipped when it
/// surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

impl TimerId {
    pub fn new(serial: u64) -> Self {
        Self(serial)
    }

    #[inline]
    pub fn serial(self) -> u64 {
        self.0
    }
}
