//! # weft
//!
//! A single-threaded, cooperative fiber I/O runtime for Linux.
//!
//! Fibers write ordinary-looking blocking I/O; the runtime keeps every
//! kernel fd non-blocking and multiplexes readiness over epoll, timers
//! over a millisecond clock, and blocking-only calls (DNS, regular-file
//! I/O) over a worker thread pool.
//!
//! ```no_run
//! use weft::{EventLoop, LoopConfig, LoopHandle};
//!
//! let mut lp = EventLoop::new(LoopConfig::from_env()).unwrap();
//! lp.spawn(|| {
//!     let h = LoopHandle;
//!     let mut fds = [0; 2];
//!     assert_eq!(h.pipe(&mut fds), 0);
//!     h.spawn(move || {
//!         let h = LoopHandle;
//!         h.write(fds[1], b"hi");
//!         h.close(fds[1]);
//!     })
//!     .unwrap();
//!     let mut buf = [0u8; 2];
//!     assert_eq!(h.read(fds[0], &mut buf), 2);
//!     h.close(fds[0]);
//! })
//! .unwrap();
//! lp.run(); // returns once every foreground fiber is done
//! ```

pub use weft_core::{FiberId, FiberState, RtError, RtResult, TimerId, WatcherId};

pub use weft_runtime::event_loop::FileOptions;
pub use weft_runtime::scheduler::{current_fiber, suspend_current, yield_now};
pub use weft_runtime::{
    AddrInfo, Event, EventLoop, IoClock, IoCondition, IoPoller, LoopConfig, LoopHandle, Offload,
    ThreadPool,
};

/// Re-exported for callers passing raw sockaddr/iovec/timeval arguments
/// through the POSIX-mirroring API.
pub use libc;
