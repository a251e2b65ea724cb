//! Error types for the strand runtime

use core::fmt;

use crate::state::CoState;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in runtime operations.
///
/// I/O errors from hooked syscalls are NOT represented here; they surface
/// as `std::io::Error` with the raw OS code so the caller sees exactly
/// what the kernel reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Scheduler started twice
    AlreadyStarted,

    /// Operation requires a started scheduler
    NotStarted,

    /// A worker thread failed to come up
    WorkerSpawnFailed,

    /// Coroutine stack allocation failed (mmap/mprotect errno)
    StackAllocation(i32),

    /// OS resource setup failed (epoll/eventfd/timerfd errno)
    OsSetup(i32),

    /// Operation illegal in the coroutine's current state
    InvalidState(CoState),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::NotStarted => write!(f, "scheduler not started"),
            SchedError::WorkerSpawnFailed => write!(f, "worker thread failed to start"),
            SchedError::StackAllocation(errno) => {
                write!(f, "coroutine stack allocation failed (errno {})", errno)
            }
            SchedError::OsSetup(errno) => {
                write!(f, "os resource setup failed (errno {})", errno)
            }
            SchedError::InvalidState(s) => write!(f, "invalid coroutine state {}", s),
        }
    }
}

impl std::error::Error for SchedError {}
