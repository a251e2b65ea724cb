//! # strand-runtime
//!
//! The coroutine scheduler core: stackful coroutines, per-thread
//! Processors, an epoll-backed readiness poller, per-Processor timer
//! queues, the hooked syscall layer, and the supervising Scheduler.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Scheduler                          │
//! │     round-robin placement, start / stop / wait           │
//! └──────────────────────────────────────────────────────────┘
//!        │                    │                    │
//!        ▼                    ▼                    ▼
//!  ┌───────────┐        ┌───────────┐        ┌───────────┐
//!  │ Processor │        │ Processor │        │ Processor │
//!  │  (main)   │        │ (worker)  │        │ (worker)  │
//!  └───────────┘        └───────────┘        └───────────┘
//!   runnable queue ── epoll coroutine ── timer queue ── hook
//! ```
//!
//! Each Processor owns one OS thread. User coroutines issue ordinary
//! blocking-looking reads and writes through the hook; a would-block
//! result suspends the coroutine against the poller, and the OS thread
//! parks in `epoll_wait` inside the distinguished epoll coroutine until
//! a descriptor is ready or a timer fires.

pub mod arch;
pub mod config;
pub mod coroutine;
pub mod hook;
pub mod poller;
pub mod processor;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::RuntimeConfig;
pub use coroutine::{yield_now, CoHandle, Coroutine};
pub use hook::{co_sleep, co_sleep_ms, co_sleep_us};
pub use poller::{Interest, WaitOutcome};
pub use processor::Processor;
pub use scheduler::Scheduler;
pub use timer::{mono_now_us, TimerId};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
