//! Architecture-specific context switching
//!
//! Each architecture module provides the same three entry points:
//!
//! - `SavedRegs` - callee-saved register set, `repr(C)` with stable offsets
//! - `init_context` - prime a fresh stack so the first switch enters the
//!   coroutine entry function through the trampoline
//! - `context_switch` - save the current callee-saved state into one
//!   register set and restore another

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{context_switch, init_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{context_switch, init_context, SavedRegs};
    } else {
        compile_error!("Unsupported architecture");
    }
}
