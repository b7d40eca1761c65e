//! The cooperative fiber scheduler.
//!
//! Fibers live in a slab arena keyed by [`FiberId`]; nothing in the
//! runtime holds a pointer to a fiber. Two FIFO runqueues (foreground,
//! background) feed [`Scheduler::run`], which context-switches into each
//! runnable fiber in turn and returns once both queues are empty.
//!
//! A fiber gives up the CPU only through [`yield_now`] or
//! [`suspend_current`]; there is no preemption. The scheduler installs a
//! thread-local pointer to itself for the duration of `run()`, which is
//! how code executing on a fiber stack reaches back into it.
//!
//! Fiber panics are caught at the fiber boundary, stashed, and re-raised
//! out of `run()` on the scheduler frame, so an unhandled panic is never
//! swallowed and never unwinds across the context-switch assembly.

use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use slab::Slab;

use weft_core::{FiberId, FiberState, RtResult};

use crate::arch;
use crate::poller::IoCondition;
use crate::stack::FiberStack;

thread_local! {
    static CURRENT_SCHED: Cell<*mut Scheduler> = const { Cell::new(std::ptr::null_mut()) };
}

type EntryClosure = Box<dyn FnOnce()>;

/// Outcome slot for one suspension: the dispatcher records either the
/// ready conditions or the timeout flag here before resuming the waiter,
/// and the suspension site reads it back. Exactly one of the two is set
/// per suspension.
#[derive(Debug, Clone, Copy)]
pub struct WaitCell {
    pub ready: IoCondition,
    pub timed_out: bool,
}

impl Default for WaitCell {
    fn default() -> Self {
        Self {
            ready: IoCondition::empty(),
            timed_out: false,
        }
    }
}

struct FiberRecord {
    ctx: arch::Context,
    stack: FiberStack,
    state: FiberState,
    background: bool,
    wait: WaitCell,
    /// Entry closure not yet consumed by the trampoline; reclaimed if the
    /// fiber is dropped before it ever ran.
    pending_entry: Option<*mut EntryClosure>,
}

/// Owns all fibers and decides which one runs next.
pub struct Scheduler {
    fibers: Slab<FiberRecord>,
    fg_queue: VecDeque<FiberId>,
    bg_queue: VecDeque<FiberId>,
    current: Option<FiberId>,
    foreground_count: usize,
    default_stack_size: usize,
    /// The scheduler frame's own saved context; fibers switch back into
    /// this to return control to `run()`.
    sched_ctx: arch::Context,
    pending_panic: Option<Box<dyn Any + Send>>,
    /// Terminated fiber whose stack is reclaimed once `run()` is back on
    /// the scheduler frame (a fiber cannot free the stack it runs on).
    dead: Option<FiberId>,
}

impl Scheduler {
    pub fn new(default_stack_size: usize) -> Self {
        Self {
            fibers: Slab::with_capacity(16),
            fg_queue: VecDeque::new(),
            bg_queue: VecDeque::new(),
            current: None,
            foreground_count: 0,
            default_stack_size,
            sched_ctx: arch::Context::zeroed(),
            pending_panic: None,
            dead: None,
        }
    }

    /// Create a fiber from an entry procedure and make it runnable.
    /// `stack_size` of 0 selects the configured default. Foreground
    /// fibers keep the event loop alive until they terminate.
    pub fn spawn<F>(&mut self, f: F, stack_size: usize, background: bool) -> RtResult<FiberId>
    where
        F: FnOnce() + 'static,
    {
        let size = if stack_size == 0 {
            self.default_stack_size
        } else {
            stack_size
        };
        let stack = FiberStack::new(size)?;

        let raw = Box::into_raw(Box::new(Box::new(f) as EntryClosure));
        let mut ctx = arch::Context::zeroed();
        unsafe {
            arch::init_context(&mut ctx, stack.top(), fiber_entry as usize, raw as usize);
        }

        let index = self.fibers.insert(FiberRecord {
            ctx,
            stack,
            state: FiberState::Runnable,
            background,
            wait: WaitCell::default(),
            pending_entry: Some(raw),
        });
        let id = FiberId::new(index as u32);

        if background {
            self.bg_queue.push_back(id);
        } else {
            self.foreground_count += 1;
            self.fg_queue.push_back(id);
        }
        log::trace!("spawned {} (background={})", id, background);
        Ok(id)
    }

    /// Run every runnable fiber until both queues drain. Panics raised by
    /// fiber entry procedures re-surface here.
    pub fn run(&mut self) {
        let _tls = TlsGuard::install(self as *mut Scheduler);

        loop {
            let id = match self.fg_queue.pop_front().or_else(|| self.bg_queue.pop_front()) {
                Some(id) => id,
                None => break,
            };
            debug_assert_eq!(self.fibers[id.index()].state, FiberState::Runnable);

            self.fibers[id.index()].state = FiberState::Running;
            self.current = Some(id);
            let fiber_ctx = &mut self.fibers[id.index()].ctx as *mut arch::Context;
            let sched_ctx = &mut self.sched_ctx as *mut arch::Context;

            // The fiber runs until it yields, suspends or terminates, then
            // switches back here.
            unsafe { arch::switch_context(sched_ctx, fiber_ctx) };

            self.current = None;
            if let Some(dead) = self.dead.take() {
                self.destroy(dead);
            }
            if let Some(payload) = self.pending_panic.take() {
                resume_unwind(payload);
            }
        }
    }

    /// Make a suspended fiber runnable again. Returns true iff the fiber
    /// transitioned; the dispatcher uses this to guarantee that ready
    /// conditions and the timeout flag are never both recorded for one
    /// suspension.
    pub fn resume(&mut self, id: FiberId) -> bool {
        match self.fibers.get_mut(id.index()) {
            Some(fiber) if fiber.state == FiberState::Suspended => {
                fiber.state = FiberState::Runnable;
                if fiber.background {
                    self.bg_queue.push_back(id);
                } else {
                    self.fg_queue.push_back(id);
                }
                true
            }
            _ => false,
        }
    }

    /// Number of live foreground fibers (running, runnable or suspended).
    pub fn foreground_count(&self) -> usize {
        self.foreground_count
    }

    /// Number of live fibers of either kind.
    pub fn fiber_count(&self) -> usize {
        self.fibers.len()
    }

    pub fn clear_wait(&mut self, id: FiberId) {
        if let Some(fiber) = self.fibers.get_mut(id.index()) {
            fiber.wait = WaitCell::default();
        }
    }

    pub fn merge_ready(&mut self, id: FiberId, conditions: IoCondition) {
        if let Some(fiber) = self.fibers.get_mut(id.index()) {
            fiber.wait.ready |= conditions;
        }
    }

    pub fn set_timed_out(&mut self, id: FiberId) {
        if let Some(fiber) = self.fibers.get_mut(id.index()) {
            fiber.wait.timed_out = true;
        }
    }

    pub fn wait_cell(&self, id: FiberId) -> WaitCell {
        self.fibers
            .get(id.index())
            .map(|fiber| fiber.wait)
            .unwrap_or_default()
    }

    fn destroy(&mut self, id: FiberId) {
        let fiber = self.fibers.remove(id.index());
        debug_assert_eq!(fiber.state, FiberState::Terminated);
        if !fiber.background {
            self.foreground_count -= 1;
        }
        log::trace!("destroyed {}", id);
        // FiberRecord drop releases the stack mapping.
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut live = 0;
        for (_, fiber) in self.fibers.iter_mut() {
            if fiber.state != FiberState::Terminated {
                live += 1;
            }
            if let Some(raw) = fiber.pending_entry.take() {
                drop(unsafe { Box::from_raw(raw) });
            }
        }
        if live > 0 {
            log::warn!(
                "scheduler dropped with {} live fibers; stacks reclaimed without unwinding",
                live
            );
        }
    }
}

/// The fiber currently executing, if the calling code runs on one.
pub fn current_fiber() -> Option<FiberId> {
    let ptr = CURRENT_SCHED.with(|cell| cell.get());
    if ptr.is_null() {
        return None;
    }
    unsafe { (*ptr).current }
}

/// Re-enqueue the current fiber at the tail of its queue and give the
/// CPU to the next runnable fiber. Outside a fiber this is an OS-level
/// yield.
pub fn yield_now() {
    let ptr = CURRENT_SCHED.with(|cell| cell.get());
    if ptr.is_null() {
        std::thread::yield_now();
        return;
    }
    let sched = unsafe { &mut *ptr };
    let id = match sched.current {
        Some(id) => id,
        None => {
            std::thread::yield_now();
            return;
        }
    };

    {
        let fiber = &mut sched.fibers[id.index()];
        fiber.state = FiberState::Runnable;
        let background = fiber.background;
        if background {
            sched.bg_queue.push_back(id);
        } else {
            sched.fg_queue.push_back(id);
        }
    }

    switch_to_scheduler(sched, id);
}

/// Park the current fiber until something calls [`resume`] for it.
///
/// # Panics
///
/// Panics when called outside fiber context.
pub fn suspend_current() {
    let ptr = CURRENT_SCHED.with(|cell| cell.get());
    assert!(!ptr.is_null(), "suspend_current outside the scheduler");
    let sched = unsafe { &mut *ptr };
    let id = sched.current.expect("suspend_current outside a fiber");

    sched.fibers[id.index()].state = FiberState::Suspended;
    switch_to_scheduler(sched, id);
}

/// Resume a suspended fiber from fiber context (e.g. an event trigger).
/// Returns true iff the fiber transitioned to runnable.
pub fn resume(id: FiberId) -> bool {
    let ptr = CURRENT_SCHED.with(|cell| cell.get());
    assert!(!ptr.is_null(), "resume outside the scheduler");
    unsafe { (*ptr).resume(id) }
}

fn switch_to_scheduler(sched: &mut Scheduler, id: FiberId) {
    let fiber_ctx = &mut sched.fibers[id.index()].ctx as *mut arch::Context;
    let sched_ctx = &mut sched.sched_ctx as *mut arch::Context;
    unsafe { arch::switch_context(fiber_ctx, sched_ctx) };
    // Back on this fiber: `run()` has already marked it Running.
}

/// Entry point executed on the fresh fiber stack by the trampoline.
extern "C" fn fiber_entry(arg: usize) {
    {
        let ptr = CURRENT_SCHED.with(|cell| cell.get());
        let sched = unsafe { &mut *ptr };
        if let Some(id) = sched.current {
            sched.fibers[id.index()].pending_entry = None;
        }
    }

    let closure = unsafe { Box::from_raw(arg as *mut EntryClosure) };
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || (*closure)())) {
        let ptr = CURRENT_SCHED.with(|cell| cell.get());
        let sched = unsafe { &mut *ptr };
        sched.pending_panic = Some(payload);
    }
}

/// Called by the trampoline when the entry procedure has returned. Marks
/// the fiber terminated and leaves its stack for the scheduler frame to
/// reclaim. Never returns.
pub(crate) extern "C" fn fiber_finished() {
    let ptr = CURRENT_SCHED.with(|cell| cell.get());
    let sched = unsafe { &mut *ptr };
    let id = sched.current.expect("fiber_finished outside a fiber");

    sched.fibers[id.index()].state = FiberState::Terminated;
    sched.dead = Some(id);

    let fiber_ctx = &mut sched.fibers[id.index()].ctx as *mut arch::Context;
    let sched_ctx = &mut sched.sched_ctx as *mut arch::Context;
    unsafe { arch::switch_context(fiber_ctx, sched_ctx) };
    unreachable!("terminated fiber was resumed");
}

struct TlsGuard {
    prev: *mut Scheduler,
}

impl TlsGuard {
    fn install(ptr: *mut Scheduler) -> Self {
        let prev = CURRENT_SCHED.with(|cell| cell.replace(ptr));
        Self { prev }
    }
}

impl Drop for TlsGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        CURRENT_SCHED.with(|cell| cell.set(prev));
    }
}
