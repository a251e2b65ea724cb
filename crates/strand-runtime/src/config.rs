//! Runtime configuration

use strand_core::constants::{DEFAULT_POLL_TIMEOUT_MS, DEFAULT_STACK_SIZE};

/// Smallest stack we will hand a coroutine (one usable page is not
/// enough for formatting machinery).
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Configuration for the Scheduler and its Processors.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Total Processor count: one main plus N-1 workers
    pub thread_count: usize,

    /// Stack size per coroutine
    pub stack_size: usize,

    /// Upper bound for one trip through `epoll_wait`, in milliseconds
    pub poll_timeout_ms: i32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            thread_count: num_cpus,
            stack_size: DEFAULT_STACK_SIZE,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Processor count (main + workers).
    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    /// Set the per-coroutine stack size.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set the poller timeout.
    pub fn poll_timeout_ms(mut self, ms: i32) -> Self {
        self.poll_timeout_ms = ms;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.thread_count == 0 {
            return Err("thread_count must be at least 1");
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err("stack_size below minimum (16 KiB)");
        }
        if self.poll_timeout_ms <= 0 {
            return Err("poll_timeout_ms must be positive");
        }
        Ok(())
    }
}
