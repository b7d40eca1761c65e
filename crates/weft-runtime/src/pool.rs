//! Fixed-size worker thread pool with eventfd completion signalling.
//!
//! This is the only component shared across threads. Submissions go into
//! a FIFO guarded by the pending mutex; workers block on the paired
//! condvar. Finished tasks land in a list guarded by a second mutex so
//! that harvesting never contends with submission. After publishing a
//! completion (release store) the worker writes 1 to the pool's eventfd,
//! which the event loop watches; eventfd counter semantics coalesce
//! multiple completions into one wakeup.
//!
//! Tasks are not cancellable: a submitted task runs to completion or the
//! pool shuts down.

use std::any::Any;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use weft_core::{FiberId, RtError, RtResult};

use crate::poller::{errno, fatal};

/// Queued, not yet picked up by a worker.
pub const TASK_PENDING: u8 = 0;
/// Procedure ran; completion is published but not yet harvested.
pub const TASK_COMPLETED: u8 = 1;
/// Harvested by the loop side; the submitter may inspect it.
pub const TASK_PICKED: u8 = 2;

/// One unit of work submitted to the pool.
///
/// The submitter owns the task (an `Arc` it keeps across its suspension);
/// the pool holds clones while the task traverses the queues.
pub struct PoolTask {
    state: AtomicU8,
    procedure: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
    /// Raw id of the fiber parked on this task; read back on the loop
    /// thread by the completion trigger.
    waiter: AtomicU32,
}

impl PoolTask {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TASK_PENDING),
            procedure: Mutex::new(None),
            panic: Mutex::new(None),
            waiter: AtomicU32::new(u32::MAX),
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn set_waiter(&self, id: FiberId) {
        self.waiter.store(id.as_u32(), Ordering::Relaxed);
    }

    pub fn waiter(&self) -> Option<FiberId> {
        match self.waiter.load(Ordering::Relaxed) {
            u32::MAX => None,
            raw => Some(FiberId::new(raw)),
        }
    }

    /// Re-raise the panic captured from the task's procedure, if any.
    /// Call after the task was harvested.
    pub fn check(&self) {
        debug_assert_ne!(self.state(), TASK_PENDING);
        if let Some(payload) = self.panic.lock().unwrap().take() {
            resume_unwind(payload);
        }
    }
}

impl Default for PoolTask {
    fn default() -> Self {
        Self::new()
    }
}

struct Pending {
    queue: VecDeque<Arc<PoolTask>>,
    shutdown: bool,
}

struct PoolShared {
    pending: Mutex<Pending>,
    available: Condvar,
    completed: Mutex<Vec<Arc<PoolTask>>>,
    event_fd: RawFd,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let ret = unsafe { libc::close(self.event_fd) };
        if ret < 0 && errno() != libc::EINTR {
            fatal("close(pool eventfd) failed");
        }
    }
}

/// Fixed set of worker threads executing submitted tasks.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Start `num_threads` workers; 0 selects the hardware parallelism.
    pub fn new(num_threads: usize) -> RtResult<Self> {
        let event_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if event_fd < 0 {
            return Err(RtError::EventFd(errno()));
        }

        let shared = Arc::new(PoolShared {
            pending: Mutex::new(Pending {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            completed: Mutex::new(Vec::new()),
            event_fd,
        });

        let num_threads = if num_threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            num_threads
        };

        let mut threads = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("weft-pool-{}", i))
                .spawn(move || worker(shared))
                .map_err(RtError::ThreadSpawn)?;
            threads.push(handle);
        }
        log::debug!("thread pool started with {} workers", num_threads);

        Ok(Self { shared, threads })
    }

    /// The eventfd workers signal completions on. The event loop watches
    /// it for readability.
    pub fn event_fd(&self) -> RawFd {
        self.shared.event_fd
    }

    /// Queue a task. The caller keeps its `Arc` and parks on the task
    /// until the completion trigger resumes it.
    pub fn submit(&self, task: &Arc<PoolTask>, procedure: Box<dyn FnOnce() + Send>) {
        task.state.store(TASK_PENDING, Ordering::Relaxed);
        *task.procedure.lock().unwrap() = Some(procedure);

        let mut pending = self.shared.pending.lock().unwrap();
        debug_assert!(!pending.shutdown, "submit after shutdown");
        pending.queue.push_back(task.clone());
        self.shared.available.notify_one();
    }

    /// Move every published completion out of the pool, marking each
    /// task picked and handing it to `callback` in completion order.
    pub fn remove_completed_tasks(&self, mut callback: impl FnMut(&Arc<PoolTask>)) {
        let completed = std::mem::take(&mut *self.shared.completed.lock().unwrap());
        for task in &completed {
            task.state.store(TASK_PICKED, Ordering::Relaxed);
            callback(task);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.shutdown = true;
            self.shared.available.notify_all();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut pending = shared.pending.lock().unwrap();
            loop {
                if let Some(task) = pending.queue.pop_front() {
                    break task;
                }
                if pending.shutdown {
                    return;
                }
                pending = shared.available.wait(pending).unwrap();
            }
        };

        let procedure = task
            .procedure
            .lock()
            .unwrap()
            .take()
            .expect("queued task without a procedure");
        if let Err(payload) = catch_unwind(AssertUnwindSafe(procedure)) {
            *task.panic.lock().unwrap() = Some(payload);
        }

        shared.completed.lock().unwrap().push(task.clone());
        task.state.store(TASK_COMPLETED, Ordering::Release);

        // Losing a completion wakeup would park the submitter forever, so
        // any write failure other than EINTR is fatal.
        loop {
            let value: u64 = 1;
            let ret = unsafe {
                libc::write(
                    shared.event_fd,
                    &value as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret >= 0 {
                break;
            }
            if errno() != libc::EINTR {
                fatal("write(pool eventfd) failed");
            }
        }
    }
}
