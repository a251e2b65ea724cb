//! Coroutine stack allocation
//!
//! Each coroutine owns one mmap'd region with a PROT_NONE guard page at
//! the low end, so a stack overflow faults instead of corrupting the
//! neighbouring allocation.

use strand_core::constants::GUARD_SIZE;
use strand_core::{SchedError, SchedResult};

const PAGE_SIZE: usize = 4096;

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// An owned, page-aligned coroutine stack.
///
/// Layout (addresses grow upward, the stack grows downward):
///
/// ```text
/// base                      base + GUARD_SIZE                 top
///  │  guard page (PROT_NONE) │  usable stack (RW)              │
/// ```
pub struct Stack {
    base: *mut u8,
    total: usize,
}

impl Stack {
    /// Map a new stack with `size` usable bytes (rounded up to pages).
    pub fn new(size: usize) -> SchedResult<Self> {
        let usable = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let total = usable + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SchedError::StackAllocation(errno()));
        }

        // Guard page at the low end; the stack grows down toward it
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let e = errno();
            unsafe { libc::munmap(base, total) };
            return Err(SchedError::StackAllocation(e));
        }

        Ok(Self {
            base: base as *mut u8,
            total,
        })
    }

    /// High end of the stack; the first frame starts here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (excluding the guard page).
    #[inline]
    pub fn size(&self) -> usize {
        self.total - GUARD_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}
