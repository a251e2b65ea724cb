//! # strand - coroutine-scheduled TCP networking runtime
//!
//! Applications register work as stackful coroutines that issue
//! ordinary-looking blocking reads and writes. The runtime suspends a
//! coroutine when its descriptor would block, parks the OS thread in
//! the kernel readiness call when nothing is runnable, and resumes the
//! coroutine when the descriptor becomes ready or a timer fires.
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand::{RuntimeConfig, Scheduler, CoTcpListener};
//!
//! fn main() {
//!     let sched = Scheduler::new(RuntimeConfig::default().thread_count(4));
//!     sched.start_async().unwrap();
//!
//!     sched.post(move || {
//!         let listener = CoTcpListener::bind("0.0.0.0:8888".parse().unwrap()).unwrap();
//!         loop {
//!             let conn = listener.accept().unwrap();
//!             strand::post_local(move || {
//!                 let mut buf = [0u8; 4096];
//!                 while let Ok(n) = conn.recv(&mut buf) {
//!                     if n == 0 { break; }
//!                     let _ = conn.send(&buf[..n]);
//!                 }
//!             }, "echo-conn");
//!         }
//!     }, "acceptor");
//!
//!     sched.wait();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      User Code                         │
//! │        post(), co_sleep(), recv()/send(), timers       │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                      Scheduler                         │
//! │        round-robin placement, lifecycle, timers        │
//! └────────────────────────────────────────────────────────┘
//!          │                  │                  │
//!          ▼                  ▼                  ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Processor │      │ Processor │      │ Processor │
//!    └───────────┘      └───────────┘      └───────────┘
//!     runnable queue · epoll coroutine · timer queue · hook
//! ```

// Re-export core types
pub use strand_core::{klog, CoId, CoState, SchedError, SchedResult, Task};

// Re-export log macros
pub use strand_core::{kdebug, kerror, kinfo, ktrace, kwarn};

// Re-export runtime types
pub use strand_runtime::{
    co_sleep, co_sleep_ms, co_sleep_us, mono_now_us, yield_now, CoHandle, Coroutine, Interest,
    Processor, RuntimeConfig, Scheduler, TimerId,
};

/// Hooked syscall wrappers for code that works with raw descriptors.
pub use strand_runtime::hook;

// Re-export the TCP layer
pub use strand_net::{CoTcpConnection, CoTcpListener, CoTcpServer, ConnHandle};

/// Place a callable on the Processor owning the current thread.
///
/// Inside the runtime this keeps related coroutines on one Processor
/// (connection affinity); outside a Processor thread it returns false
/// and does nothing.
pub fn post_local<F>(f: F, name: impl Into<String>) -> bool
where
    F: FnOnce() + 'static,
{
    Processor::with_current(|p| p.add_task(f, name)).is_some()
}
