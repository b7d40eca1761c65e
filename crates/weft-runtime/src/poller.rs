//! The readiness poller: edge-triggered epoll with per-fd contexts.
//!
//! Every registered fd owns one context carrying a caller-supplied tag
//! (the event loop stores its per-fd file options there) and a list of
//! armed watchers. The kernel interest mask is derived from per-condition
//! watcher counts and synchronized lazily: contexts whose desired mask
//! changed sit on a dirty list, and `epoll_ctl` runs once per poll cycle
//! right before `epoll_wait`.
//!
//! Watchers are armed for exactly one suspension. The suspension site
//! removes its watcher on every exit path, so a watcher that was handed
//! to `emit` in the current dispatch is gone before the poller runs
//! again; a removed watcher is never re-emitted.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use slab::Slab;

use weft_core::{FiberId, RtError, RtResult, WatcherId};

bitflags! {
    /// I/O readiness conditions, bit-identical to the epoll event mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoCondition: u32 {
        const IN = libc::EPOLLIN as u32;
        const OUT = libc::EPOLLOUT as u32;
        const RDHUP = libc::EPOLLRDHUP as u32;
        const PRI = libc::EPOLLPRI as u32;
        const ERR = libc::EPOLLERR as u32;
        const HUP = libc::EPOLLHUP as u32;
    }
}

/// The conditions a watcher can subscribe to. ERR and HUP are delivered
/// unconditionally and have no subscription count.
const WATCHABLE: [IoCondition; 4] = [
    IoCondition::IN,
    IoCondition::OUT,
    IoCondition::RDHUP,
    IoCondition::PRI,
];

struct IoWatcher {
    fd: RawFd,
    conditions: IoCondition,
    waiter: FiberId,
}

struct IoContext<T> {
    /// Interest mask currently installed in the kernel.
    registered: IoCondition,
    /// Interest mask derived from the watcher counts.
    pending: IoCondition,
    dirty: bool,
    watchers: Vec<WatcherId>,
    /// Subscription counts, one per WATCHABLE condition.
    counts: [usize; 4],
    tag: T,
}

/// Readiness poller over epoll, generic over the per-fd tag the caller
/// stores alongside each context.
pub struct IoPoller<T> {
    epoll_fd: RawFd,
    contexts: HashMap<RawFd, IoContext<T>>,
    watchers: Slab<IoWatcher>,
    dirty: Vec<RawFd>,
    events: Vec<libc::epoll_event>,
}

impl<T> IoPoller<T> {
    pub fn new() -> RtResult<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(RtError::Epoll(errno()));
        }
        Ok(Self {
            epoll_fd,
            contexts: HashMap::new(),
            watchers: Slab::with_capacity(64),
            dirty: Vec::new(),
            events: vec![empty_event(); 64],
        })
    }

    pub fn context_exists(&self, fd: RawFd) -> bool {
        self.contexts.contains_key(&fd)
    }

    /// Register `fd` with the poller, storing `tag` in its context.
    /// The fd must not already have a context.
    pub fn create_context(&mut self, fd: RawFd, tag: T) {
        debug_assert!(fd >= 0);
        let previous = self.contexts.insert(
            fd,
            IoContext {
                registered: IoCondition::empty(),
                pending: IoCondition::empty(),
                dirty: false,
                watchers: Vec::new(),
                counts: [0; 4],
                tag,
            },
        );
        debug_assert!(previous.is_none(), "duplicate context for fd {}", fd);
    }

    /// Drop the context for `fd`, detaching it from the kernel.
    pub fn destroy_context(&mut self, fd: RawFd) {
        let ctx = match self.contexts.remove(&fd) {
            Some(ctx) => ctx,
            None => {
                debug_assert!(false, "destroying unknown context for fd {}", fd);
                return;
            }
        };

        if !ctx.registered.is_empty() {
            let ret = unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret < 0 {
                fatal("epoll_ctl(EPOLL_CTL_DEL) failed");
            }
        }

        if ctx.dirty {
            self.dirty.retain(|&d| d != fd);
        }

        // A context should only be destroyed once its waiters are gone.
        debug_assert!(ctx.watchers.is_empty(), "destroying context with live watchers");
        for wid in ctx.watchers {
            self.watchers.try_remove(wid.index());
        }
    }

    /// The caller-owned tag for a registered fd.
    pub fn tag(&self, fd: RawFd) -> Option<&T> {
        self.contexts.get(&fd).map(|ctx| &ctx.tag)
    }

    pub fn tag_mut(&mut self, fd: RawFd) -> Option<&mut T> {
        self.contexts.get_mut(&fd).map(|ctx| &mut ctx.tag)
    }

    /// Arm a watcher for one suspension of `waiter` on `fd`. ERR and HUP
    /// are always added to the subscription.
    pub fn add_watcher(&mut self, fd: RawFd, conditions: IoCondition, waiter: FiberId) -> WatcherId {
        let ctx = self
            .contexts
            .get_mut(&fd)
            .unwrap_or_else(|| panic!("no I/O context for fd {}", fd));

        let id = WatcherId::new(self.watchers.insert(IoWatcher {
            fd,
            conditions: conditions | IoCondition::ERR | IoCondition::HUP,
            waiter,
        }));
        ctx.watchers.push(id);

        let mut modified = false;
        for (slot, cond) in WATCHABLE.iter().enumerate() {
            if conditions.contains(*cond) {
                ctx.counts[slot] += 1;
                if ctx.counts[slot] == 1 {
                    ctx.pending.insert(*cond);
                    modified = true;
                }
            }
        }

        if modified && !ctx.dirty {
            ctx.dirty = true;
            self.dirty.push(fd);
        }
        id
    }

    /// Disarm a watcher. Safe to call for a watcher whose fd context has
    /// already been destroyed.
    pub fn remove_watcher(&mut self, id: WatcherId) {
        let watcher = match self.watchers.try_remove(id.index()) {
            Some(w) => w,
            None => return,
        };
        let ctx = match self.contexts.get_mut(&watcher.fd) {
            Some(ctx) => ctx,
            None => return,
        };
        ctx.watchers.retain(|&w| w != id);

        let mut modified = false;
        for (slot, cond) in WATCHABLE.iter().enumerate() {
            if watcher.conditions.contains(*cond) {
                ctx.counts[slot] -= 1;
                if ctx.counts[slot] == 0 {
                    ctx.pending.remove(*cond);
                    modified = true;
                }
            }
        }

        if modified && !ctx.dirty {
            ctx.dirty = true;
            self.dirty.push(watcher.fd);
        }
    }

    /// Synchronize interest masks, block until readiness or the clock's
    /// due time, then call `emit` once per (watcher, ready conditions)
    /// intersection.
    pub fn get_ready_watchers(
        &mut self,
        clock: &mut crate::clock::IoClock,
        mut emit: impl FnMut(FiberId, IoCondition),
    ) {
        self.flush_contexts();
        let count = self.poll_events(clock);

        for i in 0..count {
            let event = self.events[i];
            let bits = event.events;
            let fd = event.u64 as RawFd;

            let ctx = match self.contexts.get(&fd) {
                Some(ctx) => ctx,
                None => continue,
            };
            for &wid in &ctx.watchers {
                let watcher = &self.watchers[wid.index()];
                let ready = bits & watcher.conditions.bits();
                if ready != 0 {
                    emit(watcher.waiter, IoCondition::from_bits_truncate(ready));
                }
            }
        }
    }

    /// Apply deferred interest-mask changes with one epoll_ctl per fd.
    fn flush_contexts(&mut self) {
        for fd in std::mem::take(&mut self.dirty) {
            let ctx = match self.contexts.get_mut(&fd) {
                Some(ctx) => ctx,
                None => continue,
            };

            if ctx.registered != ctx.pending {
                let op = if ctx.registered.is_empty() {
                    libc::EPOLL_CTL_ADD
                } else if ctx.pending.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };

                let mut event = libc::epoll_event {
                    events: ctx.pending.bits() | libc::EPOLLET as u32,
                    u64: fd as u64,
                };
                let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
                if ret < 0 {
                    if op == libc::EPOLL_CTL_DEL {
                        fatal("epoll_ctl(EPOLL_CTL_DEL) failed");
                    }
                    panic!(
                        "epoll_ctl({}) failed for fd {} (errno {})",
                        if op == libc::EPOLL_CTL_ADD { "ADD" } else { "MOD" },
                        fd,
                        errno()
                    );
                }
                ctx.registered = ctx.pending;
            }
            ctx.dirty = false;
        }
    }

    /// Block in epoll_wait for up to the clock's due time, retrying on
    /// EINTR with a re-advanced clock. Grows the event buffer and drains
    /// without blocking when a poll fills it.
    fn poll_events(&mut self, clock: &mut crate::clock::IoClock) -> usize {
        let mut timeout = clamp_timeout(clock.due_time());
        let mut count = 0usize;

        loop {
            let spare = self.events.len() - count;
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    self.events.as_mut_ptr().add(count),
                    spare as libc::c_int,
                    timeout,
                )
            };

            if n < 0 {
                if errno() != libc::EINTR {
                    panic!("epoll_wait failed (errno {})", errno());
                }
                clock.advance();
                timeout = clamp_timeout(clock.due_time());
                continue;
            }

            count += n as usize;
            if count < self.events.len() {
                break;
            }
            self.events.resize(self.events.len() * 2, empty_event());
            timeout = 0;
        }
        count
    }
}

impl<T> Drop for IoPoller<T> {
    fn drop(&mut self) {
        let ret = unsafe { libc::close(self.epoll_fd) };
        if ret < 0 && errno() != libc::EINTR {
            fatal("close(epoll fd) failed");
        }
    }
}

fn empty_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

fn clamp_timeout(ms: i64) -> libc::c_int {
    if ms < 0 {
        -1
    } else {
        ms.min(libc::c_int::MAX as i64) as libc::c_int
    }
}

pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub(crate) fn set_errno(e: i32) {
    unsafe { *libc::__errno_location() = e };
}

pub(crate) fn fatal(msg: &str) -> ! {
    log::error!("{} (errno {}); aborting", msg, errno());
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::IoClock;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_context_lifecycle() {
        let mut poller: IoPoller<u32> = IoPoller::new().unwrap();
        let (r, w) = pipe();

        assert!(!poller.context_exists(r));
        poller.create_context(r, 7);
        assert!(poller.context_exists(r));
        assert_eq!(poller.tag(r), Some(&7));

        *poller.tag_mut(r).unwrap() = 9;
        assert_eq!(poller.tag(r), Some(&9));

        poller.destroy_context(r);
        assert!(!poller.context_exists(r));
        assert_eq!(poller.tag(r), None);

        close(r);
        close(w);
    }

    #[test]
    fn test_ready_watcher_emitted_once() {
        let mut poller: IoPoller<()> = IoPoller::new().unwrap();
        let mut clock = IoClock::new();
        let (r, w) = pipe();
        poller.create_context(r, ());

        let wid = poller.add_watcher(r, IoCondition::IN, FiberId::new(1));
        let ret = unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };
        assert_eq!(ret, 1);

        let mut hits = Vec::new();
        poller.get_ready_watchers(&mut clock, |waiter, ready| hits.push((waiter, ready)));

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, FiberId::new(1));
        assert!(hits[0].1.contains(IoCondition::IN));

        poller.remove_watcher(wid);
        poller.destroy_context(r);
        close(r);
        close(w);
    }

    #[test]
    fn test_removed_watcher_not_emitted() {
        let mut poller: IoPoller<()> = IoPoller::new().unwrap();
        let mut clock = IoClock::new();
        let (r, w) = pipe();
        poller.create_context(r, ());

        let wid = poller.add_watcher(r, IoCondition::IN, FiberId::new(1));
        poller.remove_watcher(wid);

        let ret = unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };
        assert_eq!(ret, 1);

        // Bound the wait so an (incorrect) empty poll cannot hang the test.
        clock.add_timer(FiberId::new(9), 20);
        let mut hits = 0;
        poller.get_ready_watchers(&mut clock, |_, _| hits += 1);
        assert_eq!(hits, 0);

        poller.destroy_context(r);
        close(r);
        close(w);
    }

    #[test]
    fn test_hup_reported_without_subscription() {
        let mut poller: IoPoller<()> = IoPoller::new().unwrap();
        let mut clock = IoClock::new();
        let (r, w) = pipe();
        poller.create_context(r, ());

        let wid = poller.add_watcher(r, IoCondition::IN, FiberId::new(2));
        close(w);

        let mut hits = Vec::new();
        poller.get_ready_watchers(&mut clock, |waiter, ready| hits.push((waiter, ready)));

        assert_eq!(hits.len(), 1);
        assert!(hits[0].1.contains(IoCondition::HUP));

        poller.remove_watcher(wid);
        poller.destroy_context(r);
        close(r);
    }

    #[test]
    fn test_concurrent_read_and_write_watchers() {
        let mut poller: IoPoller<()> = IoPoller::new().unwrap();
        let mut clock = IoClock::new();
        let (r, w) = pipe();
        poller.create_context(r, ());
        poller.create_context(w, ());

        let wr = poller.add_watcher(r, IoCondition::IN, FiberId::new(1));
        let ww = poller.add_watcher(w, IoCondition::OUT, FiberId::new(2));

        let ret = unsafe { libc::write(w, b"y".as_ptr() as *const _, 1) };
        assert_eq!(ret, 1);

        let mut hits = Vec::new();
        poller.get_ready_watchers(&mut clock, |waiter, ready| hits.push((waiter, ready)));

        // An empty pipe is writable and now also readable.
        assert!(hits.iter().any(|(f, c)| *f == FiberId::new(1) && c.contains(IoCondition::IN)));
        assert!(hits.iter().any(|(f, c)| *f == FiberId::new(2) && c.contains(IoCondition::OUT)));

        poller.remove_watcher(wr);
        poller.remove_watcher(ww);
        poller.destroy_context(r);
        poller.destroy_context(w);
        close(r);
        close(w);
    }
}
