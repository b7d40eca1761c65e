//! The event loop: a POSIX-mirroring I/O façade over the scheduler,
//! poller and clock.
//!
//! Every fd the loop creates or adopts is O_NONBLOCK at the kernel level;
//! the blocking mode the application sees is a *virtual* flag kept in the
//! per-fd [`FileOptions`], together with the stored read/write timeouts.
//! `fcntl(F_GETFL)` projects the virtual flag and `F_SETFL` updates it
//! while the kernel flag stays non-blocking.
//!
//! Operations issue the non-blocking syscall, retry on EINTR, and on
//! EAGAIN suspend the calling fiber in [`wait_for_file`] until readiness
//! or timeout. The effective timeout reconciles the virtual blocking flag
//! with the stored per-fd timeout: a virtually non-blocking fd always
//! uses 0.
//!
//! [`EventLoop::run`] drives everything: run all runnable fibers, return
//! once no foreground fiber is left, otherwise block in the poller for up
//! to the clock's due time, dispatch ready watchers, then expired timers,
//! and go again.

use std::cell::Cell;
use std::ffi::CStr;
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, socklen_t, timeval};

use weft_core::{FiberId, RtError, RtResult};

use crate::clock::IoClock;
use crate::config::LoopConfig;
use crate::event::Event;
use crate::poller::{errno, fatal, set_errno, IoCondition, IoPoller};
use crate::scheduler::{self, Scheduler};

thread_local! {
    static CURRENT_LOOP: Cell<*mut EventLoop> = const { Cell::new(std::ptr::null_mut()) };
}

/// Per-fd options stored in the poller context tag.
#[derive(Debug, Clone, Copy)]
pub struct FileOptions {
    pub is_socket: bool,
    /// The blocking mode the application sees. The kernel fd is always
    /// non-blocking.
    pub blocking: bool,
    /// Stored read timeout in ms; -1 means infinite.
    pub read_timeout: i64,
    /// Stored write timeout in ms; -1 means infinite.
    pub write_timeout: i64,
}

/// The runtime: scheduler, poller and clock under one roof.
pub struct EventLoop {
    scheduler: Scheduler,
    poller: IoPoller<FileOptions>,
    clock: IoClock,
}

impl EventLoop {
    pub fn new(config: LoopConfig) -> RtResult<Self> {
        Ok(Self {
            scheduler: Scheduler::new(config.default_stack_size),
            poller: IoPoller::new()?,
            clock: IoClock::new(),
        })
    }

    /// Spawn a foreground fiber with the default stack size.
    pub fn spawn<F>(&mut self, f: F) -> RtResult<FiberId>
    where
        F: FnOnce() + 'static,
    {
        self.scheduler.spawn(f, 0, false)
    }

    /// Spawn a background fiber: it runs like any other but does not keep
    /// [`run`](Self::run) from returning.
    pub fn spawn_background<F>(&mut self, f: F) -> RtResult<FiberId>
    where
        F: FnOnce() + 'static,
    {
        self.scheduler.spawn(f, 0, true)
    }

    /// Spawn with an explicit stack size hint (0 = default).
    pub fn spawn_with<F>(&mut self, f: F, stack_size: usize, background: bool) -> RtResult<FiberId>
    where
        F: FnOnce() + 'static,
    {
        self.scheduler.spawn(f, stack_size, background)
    }

    /// Drive fibers and I/O until no foreground fiber remains.
    ///
    /// Panics raised by fiber entry procedures propagate out of here.
    pub fn run(&mut self) {
        let _tls = LoopTlsGuard::install(self as *mut EventLoop);

        loop {
            self.scheduler.run();
            if self.scheduler.foreground_count() == 0 {
                return;
            }

            let EventLoop {
                scheduler,
                poller,
                clock,
            } = self;

            poller.get_ready_watchers(clock, |waiter, ready| {
                scheduler.merge_ready(waiter, ready);
                scheduler.resume(waiter);
            });

            // Timers dispatch after watchers; `resume` returning false
            // means readiness won this cycle, so the timeout flag stays
            // clear and the waiter never observes both.
            clock.remove_expired_timers(|waiter| {
                if scheduler.resume(waiter) {
                    scheduler.set_timed_out(waiter);
                }
            });
        }
    }

    /// Whether `fd` currently has an I/O context.
    pub fn fd_is_managed(&self, fd: RawFd) -> bool {
        self.poller.context_exists(fd)
    }

    /// Adopt an externally created fd: record whether it was blocking,
    /// switch the kernel to non-blocking, and (for sockets) capture
    /// SO_RCVTIMEO/SO_SNDTIMEO into the stored options.
    pub fn register_fd(&mut self, fd: RawFd) -> RtResult<()> {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
            return Err(RtError::RegisterFd(errno()));
        }
        let is_socket = unsafe { stat.assume_init() }.st_mode & libc::S_IFMT == libc::S_IFSOCK;

        let was_blocking = set_blocking(fd, false).map_err(RtError::RegisterFd)?;

        let options = if is_socket {
            let read_timeout = match read_socket_timeout(fd, libc::SO_RCVTIMEO) {
                Ok(t) => t,
                Err(e) => {
                    self.rollback_blocking(fd, was_blocking);
                    return Err(RtError::RegisterFd(e));
                }
            };
            let write_timeout = match read_socket_timeout(fd, libc::SO_SNDTIMEO) {
                Ok(t) => t,
                Err(e) => {
                    self.rollback_blocking(fd, was_blocking);
                    return Err(RtError::RegisterFd(e));
                }
            };
            FileOptions {
                is_socket: true,
                blocking: was_blocking,
                read_timeout,
                write_timeout,
            }
        } else {
            FileOptions {
                is_socket: false,
                blocking: was_blocking,
                read_timeout: -1,
                write_timeout: -1,
            }
        };

        self.poller.create_context(fd, options);
        Ok(())
    }

    /// Hand a registered fd back: restore the kernel blocking flag and,
    /// for sockets, the SO_RCVTIMEO/SO_SNDTIMEO values from the stored
    /// options. Restore failures abort, per the documented contract.
    pub fn unregister_fd(&mut self, fd: RawFd) {
        let options = match self.poller.tag(fd) {
            Some(options) => *options,
            None => {
                debug_assert!(false, "unregistering unknown fd {}", fd);
                return;
            }
        };

        if options.blocking && set_blocking(fd, true).is_err() {
            fatal("restoring blocking mode at unregister failed");
        }

        if options.is_socket {
            let read = timeout_to_timeval(options.read_timeout);
            let write = timeout_to_timeval(options.write_timeout);
            unsafe {
                if libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &read as *const timeval as *const c_void,
                    std::mem::size_of::<timeval>() as socklen_t,
                ) < 0
                {
                    fatal("restoring SO_RCVTIMEO at unregister failed");
                }
                if libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_SNDTIMEO,
                    &write as *const timeval as *const c_void,
                    std::mem::size_of::<timeval>() as socklen_t,
                ) < 0
                {
                    fatal("restoring SO_SNDTIMEO at unregister failed");
                }
            }
        }

        self.poller.destroy_context(fd);
    }

    fn rollback_blocking(&self, fd: RawFd, was_blocking: bool) {
        if was_blocking {
            let _ = set_blocking(fd, true);
        }
    }
}

/// Zero-sized handle to the event loop running on this thread. Valid
/// inside fibers (and anywhere on the loop thread while
/// [`EventLoop::run`] is active).
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopHandle;

macro_rules! check_fd {
    ($lp:expr, $fd:expr) => {
        if !$lp.poller.context_exists($fd) {
            debug_assert!(false, "operation on unregistered fd {}", $fd);
            set_errno(libc::EBADF);
            return -1;
        }
    };
}

impl LoopHandle {
    /// Spawn a foreground fiber.
    pub fn spawn<F>(&self, f: F) -> RtResult<FiberId>
    where
        F: FnOnce() + 'static,
    {
        current_loop().scheduler.spawn(f, 0, false)
    }

    /// Spawn a background fiber.
    pub fn spawn_background<F>(&self, f: F) -> RtResult<FiberId>
    where
        F: FnOnce() + 'static,
    {
        current_loop().scheduler.spawn(f, 0, true)
    }

    /// Give other runnable fibers the CPU.
    pub fn yield_now(&self) {
        scheduler::yield_now();
    }

    pub fn current_fiber(&self) -> Option<FiberId> {
        scheduler::current_fiber()
    }

    pub fn make_event(&self) -> Event {
        Event::new()
    }

    pub fn fd_is_managed(&self, fd: RawFd) -> bool {
        current_loop().fd_is_managed(fd)
    }

    pub fn register_fd(&self, fd: RawFd) -> RtResult<()> {
        current_loop().register_fd(fd)
    }

    pub fn unregister_fd(&self, fd: RawFd) {
        current_loop().unregister_fd(fd)
    }

    /// Open a file, retrying on EINTR, and register it. The kernel fd is
    /// opened O_NONBLOCK; the virtual blocking flag mirrors `flags`.
    pub fn open(&self, path: &CStr, flags: c_int, mode: libc::mode_t) -> c_int {
        let lp = current_loop();
        loop {
            let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_NONBLOCK, mode as c_int) };
            if fd < 0 {
                if errno() != libc::EINTR {
                    return -1;
                }
            } else {
                lp.poller.create_context(
                    fd,
                    FileOptions {
                        is_socket: false,
                        blocking: flags & libc::O_NONBLOCK == 0,
                        read_timeout: -1,
                        write_timeout: -1,
                    },
                );
                return fd;
            }
        }
    }

    /// Create a pipe; both ends are registered with the blocking flag
    /// mirrored from `flags`.
    pub fn pipe2(&self, fds: &mut [RawFd; 2], flags: c_int) -> c_int {
        let lp = current_loop();
        if unsafe { libc::pipe2(fds.as_mut_ptr(), flags | libc::O_NONBLOCK) } < 0 {
            return -1;
        }
        let blocking = flags & libc::O_NONBLOCK == 0;
        for &fd in fds.iter() {
            lp.poller.create_context(
                fd,
                FileOptions {
                    is_socket: false,
                    blocking,
                    read_timeout: -1,
                    write_timeout: -1,
                },
            );
        }
        0
    }

    pub fn pipe(&self, fds: &mut [RawFd; 2]) -> c_int {
        self.pipe2(fds, 0)
    }

    /// Create a socket (SOCK_NONBLOCK forced in the kernel) and register
    /// it with infinite stored timeouts.
    pub fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> c_int {
        let lp = current_loop();
        let fd = unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK, protocol) };
        if fd < 0 {
            return -1;
        }
        lp.poller.create_context(
            fd,
            FileOptions {
                is_socket: true,
                blocking: ty & libc::SOCK_NONBLOCK == 0,
                read_timeout: -1,
                write_timeout: -1,
            },
        );
        fd
    }

    pub fn read(&self, fd: RawFd, buffer: &mut [u8]) -> isize {
        let lp = current_loop();
        check_fd!(lp, fd);
        let timeout = effective_read_timeout(lp, fd);
        let ptr = buffer.as_mut_ptr();
        let len = buffer.len();
        retry_io(fd, IoCondition::IN, timeout, move || unsafe {
            libc::read(fd, ptr as *mut c_void, len)
        })
    }

    pub fn write(&self, fd: RawFd, data: &[u8]) -> isize {
        let lp = current_loop();
        check_fd!(lp, fd);
        let timeout = effective_write_timeout(lp, fd);
        let ptr = data.as_ptr();
        let len = data.len();
        retry_io(fd, IoCondition::OUT, timeout, move || unsafe {
            libc::write(fd, ptr as *const c_void, len)
        })
    }

    /// # Safety
    ///
    /// `iov` must point to `iovcnt` valid iovec entries whose buffers
    /// stay live across the call.
    pub unsafe fn readv(&self, fd: RawFd, iov: *const libc::iovec, iovcnt: c_int) -> isize {
        let lp = current_loop();
        check_fd!(lp, fd);
        let timeout = effective_read_timeout(lp, fd);
        let iov = iov as usize;
        retry_io(fd, IoCondition::IN, timeout, move || unsafe {
            libc::readv(fd, iov as *const libc::iovec, iovcnt)
        })
    }

    /// # Safety
    ///
    /// See [`readv`](Self::readv).
    pub unsafe fn writev(&self, fd: RawFd, iov: *const libc::iovec, iovcnt: c_int) -> isize {
        let lp = current_loop();
        check_fd!(lp, fd);
        let timeout = effective_write_timeout(lp, fd);
        let iov = iov as usize;
        retry_io(fd, IoCondition::OUT, timeout, move || unsafe {
            libc::writev(fd, iov as *const libc::iovec, iovcnt)
        })
    }

    /// Receive from a socket. MSG_DONTWAIT forces an effective timeout of
    /// 0; MSG_WAITALL loops until the buffer fills, the peer shuts down,
    /// or an error occurs (returning the bytes already collected if any).
    pub fn recv(&self, fd: RawFd, buffer: &mut [u8], mut flags: c_int) -> isize {
        let lp = current_loop();
        check_fd!(lp, fd);
        let timeout = if flags & libc::MSG_DONTWAIT != 0 {
            flags &= !libc::MSG_DONTWAIT;
            0
        } else {
            effective_read_timeout(lp, fd)
        };

        if flags & libc::MSG_WAITALL != 0 {
            flags &= !libc::MSG_WAITALL;
            let mut filled = 0usize;
            loop {
                let ptr = unsafe { buffer.as_mut_ptr().add(filled) };
                let len = buffer.len() - filled;
                let n = retry_io(fd, IoCondition::IN, timeout, move || unsafe {
                    libc::recv(fd, ptr as *mut c_void, len, flags)
                });
                if n < 0 {
                    return if filled == 0 { -1 } else { filled as isize };
                }
                if n == 0 {
                    return filled as isize;
                }
                filled += n as usize;
                if filled == buffer.len() {
                    return filled as isize;
                }
            }
        } else {
            let ptr = buffer.as_mut_ptr();
            let len = buffer.len();
            retry_io(fd, IoCondition::IN, timeout, move || unsafe {
                libc::recv(fd, ptr as *mut c_void, len, flags)
            })
        }
    }

    pub fn send(&self, fd: RawFd, data: &[u8], mut flags: c_int) -> isize {
        let lp = current_loop();
        check_fd!(lp, fd);
        let timeout = if flags & libc::MSG_DONTWAIT != 0 {
            flags &= !libc::MSG_DONTWAIT;
            0
        } else {
            effective_write_timeout(lp, fd)
        };
        let ptr = data.as_ptr();
        let len = data.len();
        retry_io(fd, IoCondition::OUT, timeout, move || unsafe {
            libc::send(fd, ptr as *const c_void, len, flags)
        })
    }

    /// # Safety
    ///
    /// `address`/`address_len`, when non-null, must be valid for the
    /// duration of the call.
    pub unsafe fn recvfrom(
        &self,
        fd: RawFd,
        buffer: &mut [u8],
        mut flags: c_int,
        address: *mut libc::sockaddr,
        address_len: *mut socklen_t,
    ) -> isize {
        let lp = current_loop();
        check_fd!(lp, fd);
        let timeout = if flags & libc::MSG_DONTWAIT != 0 {
            flags &= !libc::MSG_DONTWAIT;
            0
        } else {
            effective_read_timeout(lp, fd)
        };

        let address = address as usize;
        let address_len = address_len as usize;

        if flags & libc::MSG_WAITALL != 0 {
            flags &= !libc::MSG_WAITALL;
            let mut filled = 0usize;
            loop {
                let ptr = buffer.as_mut_ptr().add(filled) as usize;
                let len = buffer.len() - filled;
                let n = retry_io(fd, IoCondition::IN, timeout, move || unsafe {
                    libc::recvfrom(
                        fd,
                        ptr as *mut c_void,
                        len,
                        flags,
                        address as *mut libc::sockaddr,
                        address_len as *mut socklen_t,
                    )
                });
                if n < 0 {
                    return if filled == 0 { -1 } else { filled as isize };
                }
                if n == 0 {
                    return filled as isize;
                }
                filled += n as usize;
                if filled == buffer.len() {
                    return filled as isize;
                }
            }
        } else {
            let ptr = buffer.as_mut_ptr() as usize;
            let len = buffer.len();
            retry_io(fd, IoCondition::IN, timeout, move || unsafe {
                libc::recvfrom(
                    fd,
                    ptr as *mut c_void,
                    len,
                    flags,
                    address as *mut libc::sockaddr,
                    address_len as *mut socklen_t,
                )
            })
        }
    }

    /// # Safety
    ///
    /// `address`, when non-null, must be valid for `address_len` bytes.
    pub unsafe fn sendto(
        &self,
        fd: RawFd,
        data: &[u8],
        mut flags: c_int,
        address: *const libc::sockaddr,
        address_len: socklen_t,
    ) -> isize {
        let lp = current_loop();
        check_fd!(lp, fd);
        let timeout = if flags & libc::MSG_DONTWAIT != 0 {
            flags &= !libc::MSG_DONTWAIT;
            0
        } else {
            effective_write_timeout(lp, fd)
        };
        let ptr = data.as_ptr() as usize;
        let len = data.len();
        let address = address as usize;
        retry_io(fd, IoCondition::OUT, timeout, move || unsafe {
            libc::sendto(
                fd,
                ptr as *const c_void,
                len,
                flags,
                address as *const libc::sockaddr,
                address_len,
            )
        })
    }

    /// Accept a connection, waiting for readability under the listener's
    /// read timeout. The accepted fd is registered and inherits the
    /// listener's stored timeouts.
    ///
    /// # Safety
    ///
    /// `address`/`address_len`, when non-null, must be valid.
    pub unsafe fn accept4(
        &self,
        fd: RawFd,
        address: *mut libc::sockaddr,
        address_len: *mut socklen_t,
        flags: c_int,
    ) -> c_int {
        let lp = current_loop();
        check_fd!(lp, fd);

        loop {
            let sub = libc::accept4(fd, address, address_len, flags | libc::SOCK_NONBLOCK);
            if sub < 0 {
                match errno() {
                    libc::EAGAIN => {
                        let timeout = effective_read_timeout(lp, fd);
                        let (ready, _) = wait_for_file(fd, IoCondition::IN, timeout);
                        if !ready {
                            set_errno(libc::EAGAIN);
                            return -1;
                        }
                    }
                    libc::EINTR => {}
                    _ => return -1,
                }
            } else {
                let parent = *lp.poller.tag(fd).expect("listener context vanished");
                lp.poller.create_context(
                    sub,
                    FileOptions {
                        is_socket: true,
                        blocking: flags & libc::SOCK_NONBLOCK == 0,
                        read_timeout: parent.read_timeout,
                        write_timeout: parent.write_timeout,
                    },
                );
                return sub;
            }
        }
    }

    /// # Safety
    ///
    /// See [`accept4`](Self::accept4).
    pub unsafe fn accept(
        &self,
        fd: RawFd,
        address: *mut libc::sockaddr,
        address_len: *mut socklen_t,
    ) -> c_int {
        self.accept4(fd, address, address_len, 0)
    }

    /// Connect, waiting for writability under the write timeout when the
    /// kernel reports EINPROGRESS, then surfacing SO_ERROR. A timed-out
    /// wait yields EAGAIN.
    ///
    /// # Safety
    ///
    /// `address` must be valid for `address_len` bytes.
    pub unsafe fn connect(
        &self,
        fd: RawFd,
        address: *const libc::sockaddr,
        address_len: socklen_t,
    ) -> c_int {
        let lp = current_loop();
        check_fd!(lp, fd);

        if libc::connect(fd, address, address_len) == 0 {
            return 0;
        }
        match errno() {
            libc::EINTR | libc::EINPROGRESS => {
                let timeout = effective_write_timeout(lp, fd);
                let (ready, _) = wait_for_file(fd, IoCondition::OUT, timeout);
                if !ready {
                    set_errno(libc::EAGAIN);
                    return -1;
                }

                let mut error: c_int = 0;
                let mut error_len = std::mem::size_of::<c_int>() as socklen_t;
                if libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut error as *mut c_int as *mut c_void,
                    &mut error_len,
                ) < 0
                {
                    panic!("getsockopt(SO_ERROR) failed (errno {})", errno());
                }
                if error == 0 {
                    0
                } else {
                    set_errno(error);
                    -1
                }
            }
            _ => -1,
        }
    }

    /// Destroy the fd's context, then close it.
    pub fn close(&self, fd: RawFd) -> c_int {
        let lp = current_loop();
        check_fd!(lp, fd);
        lp.poller.destroy_context(fd);
        unsafe { libc::close(fd) }
    }

    /// F_GETFL/F_SETFL are intercepted to project and update the virtual
    /// blocking flag; everything else passes through.
    pub fn fcntl(&self, fd: RawFd, command: c_int, argument: c_int) -> c_int {
        let lp = current_loop();
        check_fd!(lp, fd);

        if command == libc::F_GETFL {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags < 0 {
                return -1;
            }
            let blocking = lp.poller.tag(fd).expect("context vanished").blocking;
            (flags & !libc::O_NONBLOCK) | if blocking { 0 } else { libc::O_NONBLOCK }
        } else if command == libc::F_SETFL {
            if unsafe { libc::fcntl(fd, libc::F_SETFL, argument | libc::O_NONBLOCK) } < 0 {
                return -1;
            }
            lp.poller.tag_mut(fd).expect("context vanished").blocking =
                argument & libc::O_NONBLOCK == 0;
            0
        } else {
            unsafe { libc::fcntl(fd, command, argument) }
        }
    }

    /// SO_RCVTIMEO/SO_SNDTIMEO read the stored per-fd timeouts (a zero
    /// timeval meaning infinite); everything else passes through.
    ///
    /// # Safety
    ///
    /// `option_value`/`option_len` must be valid.
    pub unsafe fn getsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        option: c_int,
        option_value: *mut c_void,
        option_len: *mut socklen_t,
    ) -> c_int {
        let lp = current_loop();
        check_fd!(lp, fd);

        if level == libc::SOL_SOCKET && (option == libc::SO_RCVTIMEO || option == libc::SO_SNDTIMEO)
        {
            let options = lp.poller.tag(fd).expect("context vanished");
            if !options.is_socket {
                debug_assert!(false, "socket timeout option on non-socket fd {}", fd);
                set_errno(libc::ENOTSOCK);
                return -1;
            }
            if option_len.is_null() || *option_len < std::mem::size_of::<timeval>() as socklen_t {
                set_errno(libc::EINVAL);
                return -1;
            }
            let stored = if option == libc::SO_RCVTIMEO {
                options.read_timeout
            } else {
                options.write_timeout
            };
            *(option_value as *mut timeval) = timeout_to_timeval(stored);
            *option_len = std::mem::size_of::<timeval>() as socklen_t;
            0
        } else {
            libc::getsockopt(fd, level, option, option_value, option_len)
        }
    }

    /// # Safety
    ///
    /// `option_value` must be valid for `option_len` bytes.
    pub unsafe fn setsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        option: c_int,
        option_value: *const c_void,
        option_len: socklen_t,
    ) -> c_int {
        let lp = current_loop();
        check_fd!(lp, fd);

        if level == libc::SOL_SOCKET && (option == libc::SO_RCVTIMEO || option == libc::SO_SNDTIMEO)
        {
            let options = lp.poller.tag_mut(fd).expect("context vanished");
            if !options.is_socket {
                debug_assert!(false, "socket timeout option on non-socket fd {}", fd);
                set_errno(libc::ENOTSOCK);
                return -1;
            }
            if option_len < std::mem::size_of::<timeval>() as socklen_t {
                set_errno(libc::EINVAL);
                return -1;
            }
            let time = *(option_value as *const timeval);
            if option == libc::SO_RCVTIMEO {
                options.read_timeout = timeval_to_timeout(time);
            } else {
                options.write_timeout = timeval_to_timeout(time);
            }
            0
        } else {
            libc::setsockopt(fd, level, option, option_value, option_len)
        }
    }

    /// Restricted poll: an empty slice sleeps for `timeout` ms, a single
    /// entry waits for that fd, anything larger is ENOSYS.
    pub fn poll(&self, fds: &mut [libc::pollfd], timeout: c_int) -> c_int {
        match fds.len() {
            0 => {
                set_delay(timeout as i64);
                0
            }
            1 => {
                let lp = current_loop();
                let pollfd = &mut fds[0];
                if !lp.poller.context_exists(pollfd.fd) {
                    debug_assert!(false, "poll on unregistered fd {}", pollfd.fd);
                    pollfd.revents = libc::POLLNVAL;
                    return 1;
                }

                let mut conditions = IoCondition::empty();
                for (bit, condition) in [
                    (libc::POLLIN, IoCondition::IN),
                    (libc::POLLOUT, IoCondition::OUT),
                    (libc::POLLRDHUP, IoCondition::RDHUP),
                    (libc::POLLPRI, IoCondition::PRI),
                ] {
                    if pollfd.events & bit != 0 {
                        conditions |= condition;
                    }
                }

                let (ready, ready_conditions) =
                    wait_for_file(pollfd.fd, conditions, timeout as i64);
                if !ready {
                    return 0;
                }

                pollfd.revents = 0;
                for (condition, bit) in [
                    (IoCondition::IN, libc::POLLIN),
                    (IoCondition::OUT, libc::POLLOUT),
                    (IoCondition::RDHUP, libc::POLLRDHUP),
                    (IoCondition::PRI, libc::POLLPRI),
                    (IoCondition::ERR, libc::POLLERR),
                    (IoCondition::HUP, libc::POLLHUP),
                ] {
                    if ready_conditions.contains(condition) {
                        pollfd.revents |= bit;
                    }
                }
                1
            }
            _ => {
                set_errno(libc::ENOSYS);
                -1
            }
        }
    }

    /// Sleep the current fiber for at least `microseconds`.
    pub fn usleep(&self, microseconds: libc::useconds_t) -> c_int {
        set_delay((microseconds / 1000) as i64);
        0
    }

    /// Park the current fiber: forever when `ms` is negative, else until
    /// a timer fires after `ms` milliseconds.
    pub fn set_delay(&self, ms: i64) {
        set_delay(ms)
    }
}

/// Suspend the current fiber until `fd` satisfies one of `conditions` or
/// `timeout_ms` elapses. Returns `(true, ready)` on readiness and
/// `(false, empty)` on timeout; a zero timeout never suspends. The
/// watcher (and the timer, unless it fired) are removed before control
/// returns to the caller.
fn wait_for_file(fd: RawFd, conditions: IoCondition, timeout_ms: i64) -> (bool, IoCondition) {
    if timeout_ms == 0 {
        return (false, IoCondition::empty());
    }

    let lp = current_loop();
    let waiter = scheduler::current_fiber().expect("I/O wait outside a fiber");
    lp.scheduler.clear_wait(waiter);
    let watcher = lp.poller.add_watcher(fd, conditions, waiter);

    if timeout_ms < 0 {
        scheduler::suspend_current();

        let lp = current_loop();
        let cell = lp.scheduler.wait_cell(waiter);
        lp.poller.remove_watcher(watcher);
        (true, cell.ready)
    } else {
        let timer = lp.clock.add_timer(waiter, timeout_ms);
        scheduler::suspend_current();

        let lp = current_loop();
        let cell = lp.scheduler.wait_cell(waiter);
        lp.poller.remove_watcher(watcher);
        if !cell.timed_out {
            lp.clock.remove_timer(timer);
        }
        (!cell.timed_out, cell.ready)
    }
}

/// Park the current fiber; negative means until something else resumes
/// it, otherwise until a timer fires after `ms` milliseconds.
fn set_delay(ms: i64) {
    if ms < 0 {
        scheduler::suspend_current();
        return;
    }

    let lp = current_loop();
    let waiter = scheduler::current_fiber().expect("delay outside a fiber");
    lp.scheduler.clear_wait(waiter);
    let timer = lp.clock.add_timer(waiter, ms);
    scheduler::suspend_current();

    let lp = current_loop();
    if !lp.scheduler.wait_cell(waiter).timed_out {
        lp.clock.remove_timer(timer);
    }
}

/// Issue a non-blocking syscall, retrying on EINTR and waiting for
/// readiness on EAGAIN. A timed-out or virtually non-blocking wait
/// surfaces EAGAIN.
fn retry_io(
    fd: RawFd,
    conditions: IoCondition,
    timeout_ms: i64,
    mut op: impl FnMut() -> isize,
) -> isize {
    loop {
        let n = op();
        if n >= 0 {
            return n;
        }
        match errno() {
            libc::EAGAIN => {
                let (ready, _) = wait_for_file(fd, conditions, timeout_ms);
                if !ready {
                    set_errno(libc::EAGAIN);
                    return -1;
                }
            }
            libc::EINTR => {}
            _ => return -1,
        }
    }
}

fn effective_read_timeout(lp: &EventLoop, fd: RawFd) -> i64 {
    let options = lp.poller.tag(fd).expect("context vanished");
    if options.blocking {
        options.read_timeout
    } else {
        0
    }
}

fn effective_write_timeout(lp: &EventLoop, fd: RawFd) -> i64 {
    let options = lp.poller.tag(fd).expect("context vanished");
    if options.blocking {
        options.write_timeout
    } else {
        0
    }
}

/// The event loop running on this thread.
///
/// The returned reference is only used between suspension points on the
/// loop thread; the loop outlives every fiber, which is what makes the
/// lifetime claim sound in practice.
fn current_loop() -> &'static mut EventLoop {
    let ptr = CURRENT_LOOP.with(|cell| cell.get());
    assert!(!ptr.is_null(), "no event loop running on this thread");
    unsafe { &mut *ptr }
}

/// Flip the kernel blocking flag, returning the previous blocking state.
fn set_blocking(fd: RawFd, blocking: bool) -> Result<bool, i32> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(errno());
    }
    let was_blocking = flags & libc::O_NONBLOCK == 0;
    if was_blocking == blocking {
        return Ok(was_blocking);
    }
    let new_flags = if blocking {
        flags & !libc::O_NONBLOCK
    } else {
        flags | libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) } < 0 {
        return Err(errno());
    }
    Ok(was_blocking)
}

fn read_socket_timeout(fd: RawFd, option: c_int) -> Result<i64, i32> {
    let mut time = timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let mut len = std::mem::size_of::<timeval>() as socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &mut time as *mut timeval as *mut c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(errno());
    }
    Ok(timeval_to_timeout(time))
}

/// A zero timeval stores as -1 (infinite).
fn timeval_to_timeout(time: timeval) -> i64 {
    if time.tv_sec == 0 && time.tv_usec == 0 {
        -1
    } else {
        time.tv_sec as i64 * 1000 + time.tv_usec as i64 / 1000
    }
}

fn timeout_to_timeval(ms: i64) -> timeval {
    if ms < 0 {
        timeval {
            tv_sec: 0,
            tv_usec: 0,
        }
    } else {
        timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        }
    }
}

struct LoopTlsGuard {
    prev: *mut EventLoop,
}

impl LoopTlsGuard {
    fn install(ptr: *mut EventLoop) -> Self {
        let prev = CURRENT_LOOP.with(|cell| cell.replace(ptr));
        debug_assert!(prev.is_null(), "nested EventLoop::run on one thread");
        Self { prev }
    }
}

impl Drop for LoopTlsGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        CURRENT_LOOP.with(|cell| cell.set(prev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    fn run_in_fiber(f: impl FnOnce() + 'static) {
        let mut lp = EventLoop::new(LoopConfig::from_env()).unwrap();
        lp.spawn(f).unwrap();
        lp.run();
    }

    /// Unregistered AF_UNIX stream pair, kernel-blocking.
    fn raw_socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn kernel_nonblocking(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(flags >= 0);
        flags & libc::O_NONBLOCK != 0
    }

    fn timeval_ms(ms: i64) -> timeval {
        timeout_to_timeval(ms)
    }

    #[test]
    fn test_echo_roundtrip_over_tcp() {
        // Scenario: listener fiber accepts, echoes until EOF; client
        // fiber connects, sends, half-closes, reads the echo back.
        let done = Rc::new(Cell::new(0u32));
        let done_outer = done.clone();

        run_in_fiber(move || {
            let h = LoopHandle;
            let listener = h.socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(listener >= 0);

            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_addr.s_addr = u32::from_be_bytes([127, 0, 0, 1]).to_be();
            addr.sin_port = 0;
            let ret = unsafe {
                libc::bind(
                    listener,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                )
            };
            assert_eq!(ret, 0);
            assert_eq!(unsafe { libc::listen(listener, 4) }, 0);

            let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut bound_len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
            let ret = unsafe {
                libc::getsockname(
                    listener,
                    &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut bound_len,
                )
            };
            assert_eq!(ret, 0);

            let done_client = done.clone();
            h.spawn(move || {
                let h = LoopHandle;
                let fd = h.socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                assert!(fd >= 0);
                let ret = unsafe {
                    h.connect(
                        fd,
                        &bound as *const libc::sockaddr_in as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                    )
                };
                assert_eq!(ret, 0, "connect failed (errno {})", errno());

                assert_eq!(h.send(fd, b"hello", 0), 5);
                unsafe { libc::shutdown(fd, libc::SHUT_WR) };

                let mut echo = [0u8; 16];
                let mut got = 0usize;
                loop {
                    let n = h.recv(fd, &mut echo[got..], 0);
                    assert!(n >= 0);
                    if n == 0 {
                        break;
                    }
                    got += n as usize;
                }
                assert_eq!(&echo[..got], b"hello");
                assert_eq!(h.close(fd), 0);
                done_client.set(done_client.get() | 1);
            })
            .unwrap();

            let conn = unsafe { h.accept4(listener, std::ptr::null_mut(), std::ptr::null_mut(), 0) };
            assert!(conn >= 0, "accept failed (errno {})", errno());

            let mut buf = [0u8; 16];
            let mut received = Vec::new();
            loop {
                let n = h.read(conn, &mut buf);
                assert!(n >= 0);
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n as usize]);
            }
            assert_eq!(h.write(conn, &received), received.len() as isize);
            assert_eq!(h.close(conn), 0);
            assert_eq!(h.close(listener), 0);
            done.set(done.get() | 2);
        });

        assert_eq!(done_outer.get(), 3);
    }

    #[test]
    fn test_timed_recv_returns_eagain() {
        // Scenario: recv on an idle socket with SO_RCVTIMEO=50ms.
        run_in_fiber(|| {
            let h = LoopHandle;
            let (a, b) = raw_socketpair();
            h.register_fd(a).unwrap();

            let time = timeval_ms(50);
            let ret = unsafe {
                h.setsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &time as *const timeval as *const c_void,
                    std::mem::size_of::<timeval>() as socklen_t,
                )
            };
            assert_eq!(ret, 0);

            let started = Instant::now();
            let mut buf = [0u8; 8];
            let n = h.recv(a, &mut buf, 0);
            let elapsed = started.elapsed();

            assert_eq!(n, -1);
            assert_eq!(errno(), libc::EAGAIN);
            assert!(elapsed.as_millis() >= 45, "woke after {:?}", elapsed);
            assert!(elapsed.as_millis() < 2_000, "woke after {:?}", elapsed);

            h.unregister_fd(a);
            unsafe { libc::close(a) };
            unsafe { libc::close(b) };
        });
    }

    #[test]
    fn test_recv_waitall_partial_then_eof() {
        // Scenario: producer writes 3 bytes and closes; MSG_WAITALL for 4
        // returns 3, the next recv returns 0.
        run_in_fiber(|| {
            let h = LoopHandle;
            let (a, b) = raw_socketpair();
            h.register_fd(a).unwrap();

            let ret = unsafe { libc::write(b, b"abc".as_ptr() as *const c_void, 3) };
            assert_eq!(ret, 3);
            unsafe { libc::close(b) };

            let mut buf = [0u8; 4];
            let n = h.recv(a, &mut buf, libc::MSG_WAITALL);
            assert_eq!(n, 3);
            assert_eq!(&buf[..3], b"abc");

            let n = h.recv(a, &mut buf, libc::MSG_WAITALL);
            assert_eq!(n, 0);

            h.unregister_fd(a);
            unsafe { libc::close(a) };
        });
    }

    #[test]
    fn test_recv_dontwait_never_suspends() {
        run_in_fiber(|| {
            let h = LoopHandle;
            let (a, b) = raw_socketpair();
            h.register_fd(a).unwrap();

            let mut buf = [0u8; 8];
            let n = h.recv(a, &mut buf, libc::MSG_DONTWAIT);
            assert_eq!(n, -1);
            assert_eq!(errno(), libc::EAGAIN);

            h.unregister_fd(a);
            unsafe { libc::close(a) };
            unsafe { libc::close(b) };
        });
    }

    #[test]
    fn test_pipe_read_blocks_until_write() {
        let result = Rc::new(RefCell::new(Vec::new()));
        let result_outer = result.clone();

        run_in_fiber(move || {
            let h = LoopHandle;
            let mut fds = [0 as RawFd; 2];
            assert_eq!(h.pipe2(&mut fds, 0), 0);
            let (r, w) = (fds[0], fds[1]);

            let result2 = result.clone();
            h.spawn(move || {
                let h = LoopHandle;
                let mut buf = [0u8; 8];
                let n = h.read(r, &mut buf);
                assert_eq!(n, 4);
                result2.borrow_mut().extend_from_slice(&buf[..4]);
                assert_eq!(h.close(r), 0);
            })
            .unwrap();

            h.spawn(move || {
                let h = LoopHandle;
                // Let the reader park first.
                h.set_delay(10);
                assert_eq!(h.write(w, b"ping"), 4);
                assert_eq!(h.close(w), 0);
            })
            .unwrap();
        });

        assert_eq!(&*result_outer.borrow(), b"ping");
    }

    #[test]
    fn test_fcntl_projects_virtual_flag() {
        run_in_fiber(|| {
            let h = LoopHandle;
            let (a, b) = raw_socketpair();
            h.register_fd(a).unwrap();

            // Was blocking; the projection hides the kernel O_NONBLOCK.
            let flags = h.fcntl(a, libc::F_GETFL, 0);
            assert!(flags >= 0);
            assert_eq!(flags & libc::O_NONBLOCK, 0);
            assert!(kernel_nonblocking(a));

            // Virtually non-blocking: projection shows it, kernel unchanged.
            assert_eq!(h.fcntl(a, libc::F_SETFL, flags | libc::O_NONBLOCK), 0);
            let flags = h.fcntl(a, libc::F_GETFL, 0);
            assert_ne!(flags & libc::O_NONBLOCK, 0);
            assert!(kernel_nonblocking(a));

            // And a virtually non-blocking fd fails fast.
            let mut buf = [0u8; 4];
            assert_eq!(h.recv(a, &mut buf, 0), -1);
            assert_eq!(errno(), libc::EAGAIN);

            // Back to virtually blocking.
            assert_eq!(h.fcntl(a, libc::F_SETFL, flags & !libc::O_NONBLOCK), 0);
            let flags = h.fcntl(a, libc::F_GETFL, 0);
            assert_eq!(flags & libc::O_NONBLOCK, 0);

            h.unregister_fd(a);
            unsafe { libc::close(a) };
            unsafe { libc::close(b) };
        });
    }

    #[test]
    fn test_sockopt_timeout_roundtrip() {
        run_in_fiber(|| {
            let h = LoopHandle;
            let (a, b) = raw_socketpair();
            h.register_fd(a).unwrap();

            let time = timeval {
                tv_sec: 1,
                tv_usec: 500_000,
            };
            let ret = unsafe {
                h.setsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_SNDTIMEO,
                    &time as *const timeval as *const c_void,
                    std::mem::size_of::<timeval>() as socklen_t,
                )
            };
            assert_eq!(ret, 0);

            let mut out = timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let mut out_len = std::mem::size_of::<timeval>() as socklen_t;
            let ret = unsafe {
                h.getsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_SNDTIMEO,
                    &mut out as *mut timeval as *mut c_void,
                    &mut out_len,
                )
            };
            assert_eq!(ret, 0);
            assert_eq!(out.tv_sec, 1);
            assert_eq!(out.tv_usec, 500_000);

            // Zero timeval means infinite and reads back as zero.
            let zero = timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let ret = unsafe {
                h.setsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_SNDTIMEO,
                    &zero as *const timeval as *const c_void,
                    std::mem::size_of::<timeval>() as socklen_t,
                )
            };
            assert_eq!(ret, 0);
            let ret = unsafe {
                h.getsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_SNDTIMEO,
                    &mut out as *mut timeval as *mut c_void,
                    &mut out_len,
                )
            };
            assert_eq!(ret, 0);
            assert_eq!((out.tv_sec, out.tv_usec), (0, 0));

            h.unregister_fd(a);
            unsafe { libc::close(a) };
            unsafe { libc::close(b) };
        });
    }

    #[test]
    fn test_unregister_restores_kernel_state() {
        run_in_fiber(|| {
            let h = LoopHandle;
            let (a, b) = raw_socketpair();

            let time = timeval_ms(1_000);
            let ret = unsafe {
                libc::setsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &time as *const timeval as *const c_void,
                    std::mem::size_of::<timeval>() as socklen_t,
                )
            };
            assert_eq!(ret, 0);
            assert!(!kernel_nonblocking(a));

            h.register_fd(a).unwrap();
            assert!(kernel_nonblocking(a));
            assert!(h.fd_is_managed(a));

            h.unregister_fd(a);
            assert!(!h.fd_is_managed(a));
            assert!(!kernel_nonblocking(a));

            let mut out = timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let mut out_len = std::mem::size_of::<timeval>() as socklen_t;
            let ret = unsafe {
                libc::getsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &mut out as *mut timeval as *mut c_void,
                    &mut out_len,
                )
            };
            assert_eq!(ret, 0);
            assert_eq!(out.tv_sec, 1);

            unsafe { libc::close(a) };
            unsafe { libc::close(b) };
        });
    }

    #[test]
    fn test_connect_refused_surfaces_errno() {
        run_in_fiber(|| {
            let h = LoopHandle;

            // Learn a port that is certainly closed: bind, note, close.
            let probe = h.socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_addr.s_addr = u32::from_be_bytes([127, 0, 0, 1]).to_be();
            let ret = unsafe {
                libc::bind(
                    probe,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                )
            };
            assert_eq!(ret, 0);
            let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut bound_len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
            unsafe {
                libc::getsockname(
                    probe,
                    &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut bound_len,
                )
            };
            assert_eq!(h.close(probe), 0);

            let fd = h.socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            let ret = unsafe {
                h.connect(
                    fd,
                    &bound as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                )
            };
            assert_eq!(ret, -1);
            assert_eq!(errno(), libc::ECONNREFUSED);
            assert_eq!(h.close(fd), 0);
        });
    }

    #[test]
    fn test_poll_sleep_and_single_fd() {
        run_in_fiber(|| {
            let h = LoopHandle;

            // nfds = 0 sleeps.
            let started = Instant::now();
            assert_eq!(h.poll(&mut [], 30), 0);
            assert!(started.elapsed().as_millis() >= 25);

            // nfds = 1 maps conditions both ways.
            let mut fds = [0 as RawFd; 2];
            assert_eq!(h.pipe2(&mut fds, 0), 0);
            let (r, w) = (fds[0], fds[1]);
            assert_eq!(h.write(w, b"z"), 1);

            let mut entries = [libc::pollfd {
                fd: r,
                events: libc::POLLIN,
                revents: 0,
            }];
            assert_eq!(h.poll(&mut entries, 1_000), 1);
            assert_ne!(entries[0].revents & libc::POLLIN, 0);

            // nfds > 1 is not supported.
            let mut two = [
                libc::pollfd {
                    fd: r,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: w,
                    events: libc::POLLOUT,
                    revents: 0,
                },
            ];
            assert_eq!(h.poll(&mut two, 0), -1);
            assert_eq!(errno(), libc::ENOSYS);

            assert_eq!(h.close(r), 0);
            assert_eq!(h.close(w), 0);
        });
    }

    #[test]
    fn test_usleep_delays_fiber() {
        run_in_fiber(|| {
            let h = LoopHandle;
            let started = Instant::now();
            assert_eq!(h.usleep(40_000), 0);
            assert!(started.elapsed().as_millis() >= 35);
        });
    }

    #[test]
    fn test_close_drops_context() {
        run_in_fiber(|| {
            let h = LoopHandle;
            let fd = h.socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            assert!(fd >= 0);
            assert!(h.fd_is_managed(fd));
            assert_eq!(h.close(fd), 0);
            assert!(!h.fd_is_managed(fd));
        });
    }

    #[test]
    fn test_loop_returns_with_background_fiber_parked() {
        let mut lp = EventLoop::new(LoopConfig::from_env()).unwrap();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();

        lp.spawn_background(|| {
            // Parks forever; must not keep the loop alive.
            LoopHandle.set_delay(-1);
            unreachable!("background fiber resumed");
        })
        .unwrap();
        lp.spawn(move || ran2.set(true)).unwrap();

        lp.run();
        assert!(ran.get());
    }

    #[test]
    fn test_open_registers_file() {
        run_in_fiber(|| {
            let h = LoopHandle;
            let path = std::ffi::CString::new("/dev/null").unwrap();
            let fd = h.open(&path, libc::O_RDONLY, 0);
            assert!(fd >= 0);
            assert!(h.fd_is_managed(fd));

            let mut buf = [0u8; 4];
            assert_eq!(h.read(fd, &mut buf), 0);
            assert_eq!(h.close(fd), 0);
        });
    }
}
