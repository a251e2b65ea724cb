//! Thread-local slots for the runtime
//!
//! One Processor may be bound per OS thread; one coroutine may be
//! current per OS thread. The scheduling context ("main context") each
//! coroutine yields back to also lives here so a coroutine can be driven
//! from a plain thread without a Processor.

use std::cell::{Cell, RefCell, UnsafeCell};

use crate::arch::SavedRegs;
use crate::coroutine::CoHandle;
use crate::processor::Processor;

thread_local! {
    /// The Processor bound to this thread, null outside `Processor::run`
    static PROCESSOR: Cell<*const Processor> = const { Cell::new(std::ptr::null()) };

    /// The coroutine currently executing on this thread
    static CURRENT_CO: RefCell<Option<CoHandle>> = const { RefCell::new(None) };

    /// Whether hooked syscalls may suspend on this thread
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };

    /// The scheduling context every coroutine on this thread yields to
    static MAIN_CTX: UnsafeCell<SavedRegs> = const { UnsafeCell::new(SavedRegs::zeroed()) };
}

/// Bind a Processor to this thread for the duration of its `run()`.
#[inline]
pub(crate) fn bind_processor(p: *const Processor) {
    PROCESSOR.with(|cell| cell.set(p));
}

/// Clear the Processor binding.
#[inline]
pub(crate) fn clear_processor() {
    PROCESSOR.with(|cell| cell.set(std::ptr::null()));
}

/// Raw pointer to the Processor bound to this thread (null if none).
#[inline]
pub(crate) fn processor_ptr() -> *const Processor {
    PROCESSOR.with(|cell| cell.get())
}

/// Check whether this thread is driven by a Processor.
#[inline]
pub fn is_processor_thread() -> bool {
    !processor_ptr().is_null()
}

#[inline]
pub(crate) fn set_current(co: CoHandle) {
    CURRENT_CO.with(|cell| *cell.borrow_mut() = Some(co));
}

#[inline]
pub(crate) fn clear_current() {
    CURRENT_CO.with(|cell| *cell.borrow_mut() = None);
}

/// Clone of the currently executing coroutine's handle, if any.
#[inline]
pub(crate) fn current() -> Option<CoHandle> {
    CURRENT_CO.with(|cell| cell.borrow().clone())
}

#[inline]
pub(crate) fn in_coroutine() -> bool {
    CURRENT_CO.with(|cell| cell.borrow().is_some())
}

#[inline]
pub(crate) fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}

#[inline]
pub(crate) fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|cell| cell.set(on));
}

/// Pointer to this thread's scheduling context save area.
///
/// Stable for the lifetime of the thread.
#[inline]
pub(crate) fn main_ctx_ptr() -> *mut SavedRegs {
    MAIN_CTX.with(|cell| cell.get())
}
