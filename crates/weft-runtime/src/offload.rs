//! The offload bridge: blocking calls routed through the thread pool.
//!
//! DNS resolution and I/O on regular files have no non-blocking
//! equivalent, so they run on pool workers while the submitting fiber
//! parks. A permanently parked background fiber (the trigger) waits
//! readable on the pool's eventfd through the event loop; each wakeup it
//! drains the counter, harvests completed tasks, and resumes their
//! submitters. The submitter observes a captured worker panic the same
//! way it would its own.
//!
//! Submissions are not cancellable and take no timeout: a task completes
//! or the pool shuts down.

use std::cell::Cell;
use std::ffi::CStr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use libc::{c_char, c_int, c_void, socklen_t};

use weft_core::RtResult;

use crate::event_loop::{EventLoop, LoopHandle};
use crate::poller::{errno, fatal, set_errno};
use crate::pool::{PoolTask, ThreadPool, TASK_PICKED};
use crate::scheduler;

/// Bridge between fibers and the worker thread pool.
pub struct Offload {
    pool: Rc<ThreadPool>,
    /// Submissions in flight; drops back to zero once every submitter
    /// has been resumed.
    task_count: Rc<Cell<usize>>,
}

impl Offload {
    /// Build the bridge on `lp`: starts the pool, registers its eventfd
    /// with the loop, and parks the background trigger fiber on it.
    pub fn new(lp: &mut EventLoop, num_threads: usize) -> RtResult<Self> {
        let pool = Rc::new(ThreadPool::new(num_threads)?);
        lp.register_fd(pool.event_fd())?;

        let task_count = Rc::new(Cell::new(0));
        let trigger_pool = pool.clone();
        let trigger_count = task_count.clone();
        if let Err(e) = lp.spawn_background(move || event_trigger(trigger_pool, trigger_count)) {
            lp.unregister_fd(pool.event_fd());
            return Err(e);
        }

        Ok(Self { pool, task_count })
    }

    /// Submissions currently in flight.
    pub fn task_count(&self) -> usize {
        self.task_count.get()
    }

    /// Run `f` on a pool worker, parking the current fiber until the
    /// result is back. A panic inside `f` resurfaces here.
    ///
    /// The closure may borrow from the caller's frame: the fiber stays
    /// parked until the completion is harvested, so those borrows outlive
    /// the worker's use of them.
    pub fn execute<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let waiter = scheduler::current_fiber().expect("offload outside a fiber");
        let result: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let task = Arc::new(PoolTask::new());
        task.set_waiter(waiter);

        let slot = result.clone();
        let procedure: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
            *slot.lock().unwrap() = Some(f());
        });
        // Lifetime erasure is sound because the submitter cannot touch its
        // frame again before the harvest resumes it.
        let procedure: Box<dyn FnOnce() + Send + 'static> =
            unsafe { std::mem::transmute(procedure) };

        self.task_count.set(self.task_count.get() + 1);
        self.pool.submit(&task, procedure);
        scheduler::suspend_current();

        debug_assert_eq!(task.state(), TASK_PICKED);
        task.check();
        let value = result
            .lock()
            .unwrap()
            .take()
            .expect("completed task produced no result");
        value
    }

    /// Resolve a host/service pair on a worker thread. Returns the gai
    /// error code on failure.
    pub fn getaddrinfo(
        &self,
        node: Option<&CStr>,
        service: Option<&CStr>,
        hints: Option<&libc::addrinfo>,
    ) -> Result<AddrInfo, c_int> {
        let node_ptr = node.map_or(std::ptr::null(), CStr::as_ptr) as usize;
        let service_ptr = service.map_or(std::ptr::null(), CStr::as_ptr) as usize;
        let hints_ptr = hints.map_or(0, |h| h as *const libc::addrinfo as usize);

        let (status, head) = self.execute(move || {
            let mut head: *mut libc::addrinfo = std::ptr::null_mut();
            let status = unsafe {
                libc::getaddrinfo(
                    node_ptr as *const c_char,
                    service_ptr as *const c_char,
                    hints_ptr as *const libc::addrinfo,
                    &mut head,
                )
            };
            (status, head as usize)
        });

        if status == 0 {
            Ok(AddrInfo {
                head: head as *mut libc::addrinfo,
            })
        } else {
            Err(status)
        }
    }

    /// Reverse-resolve an address on a worker thread. Returns the gai
    /// error code on failure.
    ///
    /// # Safety
    ///
    /// `address` must be valid for `address_len` bytes.
    pub unsafe fn getnameinfo(
        &self,
        address: *const libc::sockaddr,
        address_len: socklen_t,
        host: &mut [u8],
        service: &mut [u8],
        flags: c_int,
    ) -> Result<(), c_int> {
        let address = address as usize;
        let host_ptr = host.as_mut_ptr() as usize;
        let host_len = host.len() as socklen_t;
        let service_ptr = service.as_mut_ptr() as usize;
        let service_len = service.len() as socklen_t;

        let status = self.execute(move || unsafe {
            libc::getnameinfo(
                address as *const libc::sockaddr,
                address_len,
                host_ptr as *mut c_char,
                host_len,
                service_ptr as *mut c_char,
                service_len,
                flags,
            )
        });
        if status == 0 {
            Ok(())
        } else {
            Err(status)
        }
    }

    /// Blocking `open(2)` on a worker thread. The fd is plain: it is not
    /// registered with the event loop.
    pub fn open(&self, path: &CStr, flags: c_int, mode: libc::mode_t) -> c_int {
        let path = path.as_ptr() as usize;
        let (fd, e) = self.execute(move || {
            let fd = unsafe { libc::open(path as *const c_char, flags, mode as c_int) };
            (fd, errno())
        });
        if fd < 0 {
            set_errno(e);
        }
        fd
    }

    /// Blocking `read(2)` on a worker thread.
    pub fn read(&self, fd: RawFd, buffer: &mut [u8]) -> isize {
        let ptr = buffer.as_mut_ptr() as usize;
        let len = buffer.len();
        let (n, e) = self.execute(move || {
            let n = unsafe { libc::read(fd, ptr as *mut c_void, len) };
            (n, errno())
        });
        if n < 0 {
            set_errno(e);
        }
        n
    }

    /// Blocking `write(2)` on a worker thread.
    pub fn write(&self, fd: RawFd, data: &[u8]) -> isize {
        let ptr = data.as_ptr() as usize;
        let len = data.len();
        let (n, e) = self.execute(move || {
            let n = unsafe { libc::write(fd, ptr as *const c_void, len) };
            (n, errno())
        });
        if n < 0 {
            set_errno(e);
        }
        n
    }

    /// Blocking `readv(2)` on a worker thread.
    ///
    /// # Safety
    ///
    /// `iov` must point to `iovcnt` valid entries.
    pub unsafe fn readv(&self, fd: RawFd, iov: *const libc::iovec, iovcnt: c_int) -> isize {
        let iov = iov as usize;
        let (n, e) = self.execute(move || {
            let n = unsafe { libc::readv(fd, iov as *const libc::iovec, iovcnt) };
            (n, errno())
        });
        if n < 0 {
            set_errno(e);
        }
        n
    }

    /// Blocking `writev(2)` on a worker thread.
    ///
    /// # Safety
    ///
    /// `iov` must point to `iovcnt` valid entries.
    pub unsafe fn writev(&self, fd: RawFd, iov: *const libc::iovec, iovcnt: c_int) -> isize {
        let iov = iov as usize;
        let (n, e) = self.execute(move || {
            let n = unsafe { libc::writev(fd, iov as *const libc::iovec, iovcnt) };
            (n, errno())
        });
        if n < 0 {
            set_errno(e);
        }
        n
    }

    /// Blocking `close(2)` on a worker thread.
    pub fn close(&self, fd: RawFd) -> c_int {
        let (ret, e) = self.execute(move || {
            let ret = unsafe { libc::close(fd) };
            (ret, errno())
        });
        if ret < 0 {
            set_errno(e);
        }
        ret
    }
}

impl Drop for Offload {
    fn drop(&mut self) {
        // Tearing down with submissions in flight would free fiber stacks
        // a worker may still be writing through.
        debug_assert_eq!(self.task_count.get(), 0, "offload dropped with tasks in flight");
        if self.task_count.get() != 0 {
            log::warn!(
                "offload dropped with {} tasks in flight",
                self.task_count.get()
            );
        }
    }
}

/// The trigger fiber: parked on the pool's eventfd, resuming submitters
/// as completions arrive. Background, so it never keeps the loop alive.
fn event_trigger(pool: Rc<ThreadPool>, task_count: Rc<Cell<usize>>) {
    let h = LoopHandle;
    let event_fd = pool.event_fd();
    let mut counter = [0u8; 8];

    loop {
        if h.read(event_fd, &mut counter) < 0 {
            fatal("reading pool eventfd failed");
        }
        pool.remove_completed_tasks(|task| {
            task_count.set(task_count.get() - 1);
            if let Some(waiter) = task.waiter() {
                scheduler::resume(waiter);
            }
        });
    }
}

/// An owned `getaddrinfo` result list.
pub struct AddrInfo {
    head: *mut libc::addrinfo,
}

impl AddrInfo {
    /// Iterate the resolved entries.
    pub fn iter(&self) -> AddrInfoIter<'_> {
        AddrInfoIter {
            next: self.head,
            _list: std::marker::PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

impl Drop for AddrInfo {
    fn drop(&mut self) {
        if !self.head.is_null() {
            unsafe { libc::freeaddrinfo(self.head) };
        }
    }
}

pub struct AddrInfoIter<'a> {
    next: *mut libc::addrinfo,
    _list: std::marker::PhantomData<&'a AddrInfo>,
}

impl<'a> Iterator for AddrInfoIter<'a> {
    type Item = &'a libc::addrinfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        let current = unsafe { &*self.next };
        self.next = current.ai_next;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn with_offload(f: impl FnOnce(Rc<Offload>) + 'static) -> Rc<Offload> {
        let config = LoopConfig::from_env();
        let pool_threads = config.pool_threads;
        let mut lp = EventLoop::new(config).unwrap();
        let offload = Rc::new(Offload::new(&mut lp, pool_threads).unwrap());
        let inner = offload.clone();
        lp.spawn(move || f(inner)).unwrap();
        lp.run();
        offload
    }

    #[test]
    fn test_execute_returns_value() {
        let offload = with_offload(|off| {
            let doubled = off.execute(|| 21 * 2);
            assert_eq!(doubled, 42);
        });
        assert_eq!(offload.task_count(), 0);
    }

    #[test]
    fn test_execute_borrows_from_fiber_frame() {
        with_offload(|off| {
            let input = vec![1u64, 2, 3, 4];
            let sum = off.execute(|| input.iter().sum::<u64>());
            assert_eq!(sum, 10);
            // Still usable: the worker only borrowed it.
            assert_eq!(input.len(), 4);
        });
    }

    #[test]
    fn test_getaddrinfo_localhost() {
        // Scenario: DNS off-load; the fiber suspends, a worker resolves,
        // the trigger resumes it with a non-empty list.
        let offload = with_offload(|off| {
            let node = std::ffi::CString::new("localhost").unwrap();
            let service = std::ffi::CString::new("80").unwrap();
            let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
            hints.ai_family = libc::AF_UNSPEC;
            hints.ai_socktype = libc::SOCK_STREAM;

            let list = off
                .getaddrinfo(Some(&node), Some(&service), Some(&hints))
                .expect("localhost did not resolve");
            assert!(!list.is_empty());
            assert!(list.iter().count() >= 1);
            for entry in list.iter() {
                assert_eq!(entry.ai_socktype, libc::SOCK_STREAM);
            }
        });
        assert_eq!(offload.task_count(), 0);
    }

    #[test]
    fn test_file_roundtrip_through_pool() {
        with_offload(|off| {
            let path = std::env::temp_dir().join(format!("weft-offload-{}", std::process::id()));
            let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();

            let fd = off.open(
                &cpath,
                libc::O_CREAT | libc::O_TRUNC | libc::O_RDWR,
                0o600,
            );
            assert!(fd >= 0);
            assert_eq!(off.write(fd, b"woven"), 5);
            assert_eq!(off.close(fd), 0);

            let fd = off.open(&cpath, libc::O_RDONLY, 0);
            assert!(fd >= 0);
            let mut buf = [0u8; 16];
            assert_eq!(off.read(fd, &mut buf), 5);
            assert_eq!(&buf[..5], b"woven");
            assert_eq!(off.close(fd), 0);

            std::fs::remove_file(path).unwrap();
        });
    }

    #[test]
    fn test_open_failure_carries_errno() {
        with_offload(|off| {
            let path = std::ffi::CString::new("/definitely/not/a/real/path").unwrap();
            let fd = off.open(&path, libc::O_RDONLY, 0);
            assert_eq!(fd, -1);
            assert_eq!(errno(), libc::ENOENT);
        });
    }

    #[test]
    fn test_worker_panic_resurfaces_in_submitter() {
        let mut lp = EventLoop::new(LoopConfig::from_env()).unwrap();
        let offload = Rc::new(Offload::new(&mut lp, 1).unwrap());
        let inner = offload.clone();
        lp.spawn(move || {
            inner.execute(|| panic!("offloaded failure"));
        })
        .unwrap();

        let err = catch_unwind(AssertUnwindSafe(|| lp.run())).unwrap_err();
        assert_eq!(
            err.downcast_ref::<&str>().copied(),
            Some("offloaded failure")
        );
        assert_eq!(offload.task_count(), 0);
    }

    #[test]
    fn test_concurrent_submitters() {
        let offload = with_offload(|off| {
            let h = LoopHandle;
            let off2 = off.clone();
            h.spawn(move || {
                let n = off2.execute(|| {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    7
                });
                assert_eq!(n, 7);
            })
            .unwrap();

            let n = off.execute(|| {
                std::thread::sleep(std::time::Duration::from_millis(5));
                3
            });
            assert_eq!(n, 3);
        });
        assert_eq!(offload.task_count(), 0);
    }
}
