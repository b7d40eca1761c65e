//! aarch64 context switching.
//!
//! TODO: port the x86_64 voluntary switch (save x19-x28, fp, lr, sp,
//! d8-d15) once there is an arm64 CI target to validate it on.

/// Callee-saved register set of a suspended execution.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub sp: u64,
    pub pc: u64,
    pub x19_x28: [u64; 10],
    pub fp: u64,
    pub lr: u64,
    pub d8_d15: [u64; 8],
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            sp: 0,
            pc: 0,
            x19_x28: [0; 10],
            fp: 0,
            lr: 0,
            d8_d15: [0; 8],
        }
    }
}

/// Prepare `ctx` to enter the fiber trampoline.
pub unsafe fn init_context(_ctx: &mut Context, _stack_top: *mut u8, _entry_fn: usize, _entry_arg: usize) {
    todo!("aarch64 init_context not yet implemented")
}

/// Save into `save`, load from `load`.
pub unsafe extern "C" fn switch_context(_save: *mut Context, _load: *const Context) {
    todo!("aarch64 switch_context not yet implemented")
}
