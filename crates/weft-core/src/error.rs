//! Error types for runtime construction and fiber management.
//!
//! I/O operations that mirror POSIX report failure the way the kernel
//! does (`-1` plus `errno`); the errors here cover the runtime's own
//! fallible paths: allocating stacks, creating kernel objects, spawning
//! worker threads.

use core::fmt;

/// Result type for runtime operations.
pub type RtResult<T> = Result<T, RtError>;

/// Errors that can occur while building or operating the runtime.
#[derive(Debug)]
pub enum RtError {
    /// mmap/mprotect for a fiber stack failed (errno).
    StackAllocation(i32),

    /// epoll_create1 or epoll_ctl failed (errno).
    Epoll(i32),

    /// eventfd creation failed (errno).
    EventFd(i32),

    /// A kernel query while adopting an external fd failed (errno).
    RegisterFd(i32),

    /// Spawning a pool worker thread failed.
    ThreadSpawn(std::io::Error),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::StackAllocation(e) => write!(f, "fiber stack allocation failed (errno {})", e),
            RtError::Epoll(e) => write!(f, "epoll operation failed (errno {})", e),
            RtError::EventFd(e) => write!(f, "eventfd creation failed (errno {})", e),
            RtError::RegisterFd(e) => write!(f, "adopting external fd failed (errno {})", e),
            RtError::ThreadSpawn(e) => write!(f, "failed to spawn pool worker: {}", e),
        }
    }
}

impl std::error::Error for RtError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RtError::StackAllocation(12);
        assert_eq!(format!("{}", e), "fiber stack allocation failed (errno 12)");

        let e = RtError::EventFd(24);
        assert!(format!("{}", e).contains("eventfd"));
    }
}
