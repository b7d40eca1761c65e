//! Architecture-specific context switching.
//!
//! Each architecture module provides:
//! - `Context`: the callee-saved register set of a suspended execution
//! - `init_context`: prepare a fresh context to enter the fiber trampoline
//! - `switch_context`: save into one context, load from another

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{Context, init_context, switch_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{Context, init_context, switch_context};
    } else {
        compile_error!("Unsupported architecture");
    }
}
