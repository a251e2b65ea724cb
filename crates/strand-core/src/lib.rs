//! # strand-core
//!
//! Core types for the strand coroutine runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Everything that touches the kernel lives in `strand-runtime`.
//!
//! ## Modules
//!
//! - `id` - Coroutine identifier type
//! - `state` - Coroutine state machine
//! - `task` - Named callable submitted to a Processor
//! - `error` - Error types
//! - `klog` - Leveled stderr logging macros

pub mod error;
pub mod id;
pub mod klog;
pub mod state;
pub mod task;

// Re-exports for convenience
pub use error::{SchedError, SchedResult};
pub use id::CoId;
pub use state::CoState;
pub use task::Task;

/// Runtime-wide constants.
pub mod constants {
    /// Default coroutine stack size (128 KiB).
    pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

    /// Guard page size at the low end of each stack (4 KiB).
    pub const GUARD_SIZE: usize = 4096;

    /// Default poller timeout in milliseconds.
    pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 10_000;

    /// Smallest accepted repeating-timer interval, in microseconds.
    pub const MIN_TIMER_INTERVAL_US: u64 = 1;
}
