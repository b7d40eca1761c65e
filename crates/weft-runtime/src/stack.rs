//! Fiber stack allocation.
//!
//! Each fiber gets its own mmap'd region with a PROT_NONE guard page at
//! the low end, so running off the stack faults instead of corrupting a
//! neighbour.

use weft_core::{RtError, RtResult};

/// System page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Round `size` up to a whole number of pages.
pub fn align_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// An owned, guard-paged stack region. Stacks grow down; the guard page
/// sits at the low end of the mapping.
#[derive(Debug)]
pub struct FiberStack {
    base: *mut u8,
    total_size: usize,
}

impl FiberStack {
    /// Map a stack of at least `size` usable bytes (rounded up to whole
    /// pages), plus one guard page.
    pub fn new(size: usize) -> RtResult<Self> {
        let usable = align_to_page(size.max(page_size()));
        let total_size = usable + page_size();

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RtError::StackAllocation(errno()));
        }
        let base = base as *mut u8;

        // Guard page at the low end stays unmapped for access.
        if unsafe { libc::mprotect(base as *mut libc::c_void, page_size(), libc::PROT_NONE) } != 0 {
            let e = errno();
            unsafe { libc::munmap(base as *mut libc::c_void, total_size) };
            return Err(RtError::StackAllocation(e));
        }

        Ok(Self { base, total_size })
    }

    /// Highest address of the stack; the initial stack pointer.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total_size) }
    }

    /// Usable bytes between top and the guard page.
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.total_size - page_size()
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total_size) };
        if ret != 0 {
            // Leaking a mapping is survivable; corrupting state is not.
            log::error!("munmap of fiber stack failed (errno {})", errno());
        }
    }
}

// Stacks never move between threads in this runtime, but the raw pointer
// makes the type !Send by default, which is what we want.

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
