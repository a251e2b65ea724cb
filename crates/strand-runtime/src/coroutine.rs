//! Stackful coroutine primitive
//!
//! A `Coroutine` owns its stack and saved machine context. `resume` is
//! called from the scheduling context (a Processor's dispatch loop, or a
//! plain thread when driving coroutines by hand); `yield_now` is called
//! from inside a running coroutine. Handles are `Rc` because a coroutine
//! may be referenced from the runnable queue, a descriptor wait record,
//! and a timer entry at the same time; they never leave their thread.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use strand_core::constants::DEFAULT_STACK_SIZE;
use strand_core::{kerror, CoId, CoState, SchedResult};

use crate::arch::{self, SavedRegs};
use crate::stack::Stack;
use crate::tls;

/// Shared handle to a coroutine.
pub type CoHandle = Rc<Coroutine>;

type Callable = Box<dyn FnOnce() + 'static>;

/// A stackful user-space context with cooperative yield.
pub struct Coroutine {
    id: CoId,
    name: RefCell<String>,
    state: Cell<CoState>,
    ctx: UnsafeCell<SavedRegs>,
    stack: Stack,
    callable: RefCell<Option<Callable>>,
}

impl Coroutine {
    /// Create a coroutine with the default stack size (128 KiB).
    ///
    /// The coroutine starts in `Init` and does not run until resumed.
    pub fn new<F>(f: F, name: impl Into<String>) -> SchedResult<CoHandle>
    where
        F: FnOnce() + 'static,
    {
        Self::with_stack_size(f, name, DEFAULT_STACK_SIZE)
    }

    /// Create a coroutine with an explicit stack size.
    pub fn with_stack_size<F>(
        f: F,
        name: impl Into<String>,
        stack_size: usize,
    ) -> SchedResult<CoHandle>
    where
        F: FnOnce() + 'static,
    {
        let stack = Stack::new(stack_size)?;
        let co = Rc::new(Coroutine {
            id: CoId::next(),
            name: RefCell::new(name.into()),
            state: Cell::new(CoState::Init),
            ctx: UnsafeCell::new(SavedRegs::zeroed()),
            stack,
            callable: RefCell::new(Some(Box::new(f))),
        });
        co.prime();
        Ok(co)
    }

    /// The coroutine currently running on this thread, if any.
    #[inline]
    pub fn current() -> Option<CoHandle> {
        tls::current()
    }

    #[inline]
    pub fn id(&self) -> CoId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    #[inline]
    pub fn state(&self) -> CoState {
        self.state.get()
    }

    #[inline]
    pub(crate) fn set_state(&self, s: CoState) {
        self.state.set(s);
    }

    #[inline]
    pub(crate) fn ctx_ptr(&self) -> *mut SavedRegs {
        self.ctx.get()
    }

    /// Switch from the scheduling context into this coroutine.
    ///
    /// Must not be called from inside another coroutine. Returns when the
    /// coroutine yields or terminates; inspect `state()` afterwards.
    ///
    /// # Panics
    ///
    /// Panics (programming error) when called from within a coroutine or
    /// when the coroutine is in `Exec` or `Term`.
    pub fn resume(self: &Rc<Self>) {
        assert!(
            !tls::in_coroutine(),
            "resume called from inside a coroutine"
        );
        let st = self.state.get();
        assert!(
            st.is_resumable(),
            "resume on coroutine '{}' in state {}",
            self.name(),
            st
        );

        self.state.set(CoState::Exec);
        tls::set_current(self.clone());
        unsafe {
            arch::context_switch(tls::main_ctx_ptr(), self.ctx.get());
        }
        tls::clear_current();
    }

    /// Recycle a terminated coroutine for a fresh callable.
    ///
    /// Rewinds the stack and primes it so the next resume enters
    /// `f`. Legal only in `Term`.
    pub fn reset<F>(&self, f: F, name: impl Into<String>)
    where
        F: FnOnce() + 'static,
    {
        let st = self.state.get();
        assert!(
            st.is_term(),
            "reset on coroutine '{}' in state {}",
            self.name(),
            st
        );
        *self.callable.borrow_mut() = Some(Box::new(f));
        *self.name.borrow_mut() = name.into();
        self.prime();
    }

    /// Prime the context so the next resume enters the callable.
    fn prime(&self) {
        unsafe {
            arch::init_context(self.ctx.get(), self.stack.top(), coroutine_main as usize, 0);
        }
        self.state.set(CoState::Init);
    }

    fn take_callable(&self) -> Callable {
        self.callable
            .borrow_mut()
            .take()
            .expect("coroutine resumed with no callable")
    }
}

/// Suspend the current coroutine and return to the scheduling context.
///
/// State becomes `Hold` unless the caller pre-set `Term`. Outside a
/// coroutine this degrades to an OS thread yield.
pub fn yield_now() {
    let Some(co) = tls::current() else {
        std::thread::yield_now();
        return;
    };

    if co.state.get() != CoState::Term {
        co.state.set(CoState::Hold);
    }
    let ctx = co.ctx.get();
    drop(co); // TLS keeps the coroutine alive across the switch

    unsafe {
        arch::context_switch(ctx, tls::main_ctx_ptr());
    }
}

/// First frame of every coroutine, entered through the arch trampoline.
///
/// Runs the callable, traps panics so they terminate only this
/// coroutine, marks `Term`, and switches back to the scheduling context
/// for good. The frame is abandoned until `reset` re-primes the stack.
extern "C" fn coroutine_main(_arg: usize) -> ! {
    let ctx;
    {
        let co = tls::current().expect("coroutine entry with no current coroutine");
        ctx = co.ctx_ptr();
        let call = co.take_callable();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .map(String::from)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".into());
            kerror!("coroutine '{}' ({}) panicked: {}", co.name(), co.id(), msg);
        }
        co.set_state(CoState::Term);
        // All locals drop here; nothing lives past the final switch
    }
    unsafe {
        arch::context_switch(ctx, tls::main_ctx_ptr());
    }
    unreachable!("terminated coroutine resumed without reset");
}
