//! Fiber lifecycle states.

use core::fmt;

/// State of a fiber as tracked by the scheduler.
///
/// Transitions:
///
/// ```text
/// Runnable -> Running      (scheduler switches in)
/// Running  -> Runnable     (yield)
/// Running  -> Suspended    (I/O wait, timer, event wait, pool submission)
/// Suspended -> Runnable    (resume)
/// Running  -> Terminated   (entry procedure returned or panicked)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Queued on a runqueue, waiting for the scheduler.
    Runnable,
    /// Currently executing on the loop thread.
    Running,
    /// Parked on a watcher, timer, event or pool completion.
    Suspended,
    /// Entry procedure finished; stack reclaim is pending.
    Terminated,
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Runnable => "runnable",
            FiberState::Running => "running",
            FiberState::Suspended => "suspended",
            FiberState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", FiberState::Runnable), "runnable");
        assert_eq!(format!("{}", FiberState::Terminated), "terminated");
    }
}
