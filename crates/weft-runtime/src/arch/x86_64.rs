//! x86_64 context switching.
//!
//! Voluntary switches only: a fiber gives up the CPU by calling into the
//! scheduler, so saving the System V callee-saved set (plus rsp/rip) is
//! sufficient. Uses `naked_asm`, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register set of a suspended execution.
///
/// Field order is fixed: the assembly below addresses these by byte
/// offset (0x00..0x38).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare `ctx` so that switching into it enters the fiber trampoline,
/// which calls `entry_fn(entry_arg)` on the new stack.
///
/// # Safety
///
/// `stack_top` must be the top of a live, writable stack region.
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry_fn: usize, entry_arg: usize) {
    // 16-byte alignment per the System V AMD64 ABI, minus 8 to mimic the
    // push a `call` would have done.
    let sp = (stack_top as usize & !0xF) - 8;

    ctx.rsp = sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First code a fiber executes: calls the entry function with its argument,
/// then hands the terminated fiber back to the scheduler.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {finished}",
        "ud2",
        finished = sym crate::scheduler::fiber_finished,
    );
}

/// Save the callee-saved set into `save`, load from `load`, and jump.
///
/// Returns (into the `save` context) when something later switches back.
///
/// # Safety
///
/// Both pointers must reference valid `Context` storage; `load` must hold
/// either a context previously saved here or one built by `init_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save into *rdi.
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from *rsi.
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context.
        "2:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_layout() {
        // The asm depends on these offsets.
        assert_eq!(std::mem::size_of::<Context>(), 64);
        assert_eq!(std::mem::offset_of!(Context, rsp), 0x00);
        assert_eq!(std::mem::offset_of!(Context, rip), 0x08);
        assert_eq!(std::mem::offset_of!(Context, r15), 0x38);
    }

    #[test]
    fn test_init_context_aligns_stack() {
        let mut ctx = Context::zeroed();
        let mut fake_stack = [0u8; 64];
        let top = unsafe { fake_stack.as_mut_ptr().add(61) }; // deliberately misaligned
        unsafe { init_context(&mut ctx, top, 0x1000, 0x2000) };

        assert_eq!(ctx.rsp % 16, 8);
        assert_eq!(ctx.r12, 0x1000);
        assert_eq!(ctx.r13, 0x2000);
    }
}
