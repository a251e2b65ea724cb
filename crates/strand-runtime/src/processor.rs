//! Per-thread coroutine dispatcher
//!
//! A Processor owns one OS thread, a runnable queue of coroutines, an
//! epoll poller co-run as a distinguished coroutine, a timer queue, and
//! a wakeup eventfd. Cross-thread submissions land on a pending list
//! under a mutex and are spliced into the runnable queue once per
//! dispatch iteration; everything else is touched only by the owning
//! thread.

use std::cell::{Cell, UnsafeCell};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use strand_core::constants::MIN_TIMER_INTERVAL_US;
use strand_core::{kdebug, kerror, ktrace, kwarn, CoState, SchedResult, Task};

use crate::config::RuntimeConfig;
use crate::coroutine::{yield_now, CoHandle, Coroutine};
use crate::hook;
use crate::poller::{Direction, Interest, Poller, WaitOutcome};
use crate::timer::{mono_now_us, TimerId, TimerQueue, TimerTarget};
use crate::tls;

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// State only the owning thread may touch.
struct Local {
    runnable: VecDeque<CoHandle>,
    poller: Poller,
    timers: TimerQueue,
    /// Terminated coroutines kept for reuse; fresh stacks are the
    /// dominant per-request cost in a high-connection server
    idle: Vec<CoHandle>,
}

/// A coroutine dispatcher bound to one OS thread.
///
/// # Safety
///
/// `Send`/`Sync` are implemented by hand: `local` is only ever accessed
/// on the thread recorded at construction (asserted on every entry
/// point), while the shared fields are atomics, a mutex, and an eventfd
/// that any thread may write.
pub struct Processor {
    thread: ThreadId,
    stop: AtomicBool,
    /// Count of non-terminal coroutines placed here
    load: AtomicUsize,
    /// True while the epoll coroutine is the one being dispatched
    epolling: AtomicBool,
    wakeup_fd: RawFd,
    pending: Mutex<Vec<Task>>,
    poll_timeout_ms: i32,
    stack_size: usize,
    local: UnsafeCell<Local>,
}

unsafe impl Send for Processor {}
unsafe impl Sync for Processor {}

impl Processor {
    /// Create a Processor bound to the calling thread, with defaults.
    pub fn new() -> SchedResult<Arc<Self>> {
        Self::with_config(&RuntimeConfig::default())
    }

    /// Create a Processor bound to the calling thread.
    ///
    /// Registers the two service coroutines every Processor runs: the
    /// wakeup-eventfd drainer and the timer drainer.
    pub fn with_config(cfg: &RuntimeConfig) -> SchedResult<Arc<Self>> {
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(strand_core::SchedError::OsSetup(errno()));
        }

        let this = Arc::new(Processor {
            thread: std::thread::current().id(),
            stop: AtomicBool::new(false),
            load: AtomicUsize::new(0),
            epolling: AtomicBool::new(false),
            wakeup_fd,
            pending: Mutex::new(Vec::new()),
            poll_timeout_ms: cfg.poll_timeout_ms,
            stack_size: cfg.stack_size,
            local: UnsafeCell::new(Local {
                runnable: VecDeque::new(),
                poller: Poller::new()?,
                timers: TimerQueue::new()?,
                idle: Vec::new(),
            }),
        });
        ktrace!("processor {:p} created", Arc::as_ptr(&this));

        let weak = Arc::downgrade(&this);
        let wfd = this.wakeup_fd;
        this.add_task(move || wakeup_drain_loop(weak, wfd), "wakeup");

        let weak = Arc::downgrade(&this);
        this.add_task(move || timer_drain_loop(weak), "timers");

        Ok(this)
    }

    /// The Processor bound to the current thread, if any.
    pub fn with_current<R>(f: impl FnOnce(&Processor) -> R) -> Option<R> {
        let p = tls::processor_ptr();
        if p.is_null() {
            None
        } else {
            // Safety: the pointer is set by run() on this thread and the
            // Processor outlives its run loop
            Some(f(unsafe { &*p }))
        }
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    #[inline]
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_owner_thread(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    fn assert_in_owner(&self) {
        assert!(
            self.is_owner_thread(),
            "processor state touched from a foreign thread"
        );
    }

    /// Short-lived access to the thread-local half.
    ///
    /// # Safety
    ///
    /// Caller must be on the owning thread and must not hold the
    /// returned reference across a context switch.
    #[allow(clippy::mut_from_ref)]
    unsafe fn local(&self) -> &mut Local {
        &mut *self.local.get()
    }

    // ── Task submission ──────────────────────────────────────────────

    /// Enqueue a callable as a coroutine, reusing the idle freelist.
    ///
    /// Owning thread only; foreign threads go through
    /// `add_pending_task` or `submit`.
    pub fn add_task<F>(&self, f: F, name: impl Into<String>)
    where
        F: FnOnce() + 'static,
    {
        self.assert_in_owner();
        let co = {
            let local = unsafe { self.local() };
            match local.idle.pop() {
                Some(co) => {
                    co.reset(f, name);
                    co
                }
                None => match Coroutine::with_stack_size(f, name, self.stack_size) {
                    Ok(co) => co,
                    Err(e) => {
                        kerror!("task dropped, coroutine allocation failed: {}", e);
                        return;
                    }
                },
            }
        };
        self.load.fetch_add(1, Ordering::Relaxed);
        kdebug!("add task <{}>, load = {}", co.name(), self.load());
        self.enqueue(co);
        if self.epolling.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Enqueue an existing coroutine. Owning thread only.
    pub fn add_coroutine(&self, co: CoHandle) {
        self.assert_in_owner();
        self.load.fetch_add(1, Ordering::Relaxed);
        self.enqueue(co);
        if self.epolling.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Submit a task from any thread: pending list plus wakeup byte.
    ///
    /// Silently discarded once the Processor is stopping.
    pub fn add_pending_task(&self, task: Task) {
        if self.stopped() {
            kdebug!("pending task <{}> discarded after stop", task.name());
            return;
        }
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.push(task);
        }
        self.wakeup();
    }

    /// Route a task by caller thread: direct enqueue on the owning
    /// thread, pending list otherwise.
    pub fn submit(&self, task: Task) {
        if self.is_owner_thread() && tls::processor_ptr() == self as *const _ {
            let (f, name) = task.into_parts();
            self.add_task(f, name);
        } else {
            self.add_pending_task(task);
        }
    }

    /// Move a woken coroutine onto the runnable queue.
    ///
    /// `Ready` means already queued (a waiter can be woken by both its
    /// timer and readiness in the same pass); `Term` means the handle
    /// went stale, which only repeating resume-timers can produce.
    fn enqueue(&self, co: CoHandle) {
        match co.state() {
            CoState::Ready => {}
            CoState::Term => {
                kwarn!("dropping wake of terminated coroutine '{}'", co.name());
            }
            _ => {
                co.set_state(CoState::Ready);
                let local = unsafe { self.local() };
                local.runnable.push_back(co);
            }
        }
    }

    // ── Dispatch loop ────────────────────────────────────────────────

    /// The dispatch loop. Binds the Processor to the thread-local slot,
    /// enables syscall hooking, and runs until stopped and drained.
    ///
    /// # Panics
    ///
    /// Panics (programming error) when invoked off the construction
    /// thread or when another Processor is already bound to it.
    pub fn run(&self) {
        self.assert_in_owner();
        assert!(
            tls::processor_ptr().is_null(),
            "another Processor is already bound to this thread"
        );
        tls::bind_processor(self as *const _);
        hook::set_hook_enabled(true);
        ktrace!("processor {:p} running", self);

        let raw = self as *const Processor as usize;
        let epoll_co = match Coroutine::with_stack_size(
            move || {
                // Safety: the Processor outlives run(), and this
                // coroutine is only resumed from inside run()
                let p = unsafe { &*(raw as *const Processor) };
                epoll_loop(p);
            },
            "epoll",
            self.stack_size,
        ) {
            Ok(co) => co,
            Err(e) => {
                // Without a poller coroutine the dispatch loop cannot
                // park; nothing sensible to do but bail out
                kerror!("epoll coroutine allocation failed: {}", e);
                hook::set_hook_enabled(false);
                tls::clear_processor();
                return;
            }
        };

        loop {
            // (1) splice cross-thread submissions
            self.splice_pending();

            // (2) dispatch one runnable coroutine, or park in the poller
            let next = {
                let local = unsafe { self.local() };
                local.runnable.pop_front()
            };
            match next {
                Some(co) => {
                    self.epolling.store(false, Ordering::Release);
                    co.resume();
                    // (3) recycle terminated coroutines
                    if co.state() == CoState::Term {
                        self.load.fetch_sub(1, Ordering::Relaxed);
                        let local = unsafe { self.local() };
                        local.idle.push(co);
                    }
                }
                None => {
                    // (4) exit once stopped with nothing left to run
                    if self.stopped() && !self.timers_pending() {
                        break;
                    }
                    self.epolling.store(true, Ordering::Release);
                    epoll_co.resume();
                    self.epolling.store(false, Ordering::Release);
                    if epoll_co.state() == CoState::Term {
                        break;
                    }
                }
            }
        }

        // Let the epoll coroutine observe the stop flag and finish
        if epoll_co.state() != CoState::Term {
            epoll_co.resume();
        }

        ktrace!("processor {:p} stopped", self);
        hook::set_hook_enabled(false);
        tls::clear_processor();
    }

    /// Request the dispatch loop to exit.
    ///
    /// Cooperative: coroutines already suspended stay suspended, but
    /// nothing new is scheduled once the drain completes. The wakeup
    /// byte forces the poller out of its blocking call.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wakeup();
    }

    fn splice_pending(&self) {
        let tasks = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            let (f, name) = task.into_parts();
            self.add_task(f, name);
        }
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let e = errno();
            // EAGAIN means the counter is saturated, so a wakeup is
            // already pending
            if e != libc::EAGAIN {
                kerror!("write wakeup eventfd: errno {}", e);
            }
        } else if n != 8 {
            kerror!("wakeup wrote {} bytes instead of 8", n);
        }
    }

    // ── Poller forwards ──────────────────────────────────────────────

    /// Register a coroutine for readiness events. Owning thread only.
    pub fn update_event(&self, fd: RawFd, interest: Interest, co: CoHandle) {
        self.assert_in_owner();
        let local = unsafe { self.local() };
        if interest.read {
            local.poller.register(
                fd,
                Direction::Read,
                co.clone(),
                Rc::new(Cell::new(WaitOutcome::Pending)),
            );
        }
        if interest.write {
            local
                .poller
                .register(fd, Direction::Write, co, Rc::new(Cell::new(WaitOutcome::Pending)));
        }
    }

    /// Drop a descriptor from the interest set, waking any waiters with
    /// a cancellation signal. Owning thread only.
    pub fn remove_event(&self, fd: RawFd) {
        self.assert_in_owner();
        let cancelled = {
            let local = unsafe { self.local() };
            local.poller.remove(fd)
        };
        for w in cancelled {
            self.enqueue(w.co);
        }
    }

    /// Park the current coroutine until `fd` is readable.
    ///
    /// Returns `Ready` on readiness or `Cancelled` if the registration
    /// was withdrawn by `remove_event`.
    pub fn wait_readable(&self, fd: RawFd) -> WaitOutcome {
        self.suspend_on(fd, Direction::Read, None)
    }

    /// Park the current coroutine until `fd` is writable.
    pub fn wait_writable(&self, fd: RawFd) -> WaitOutcome {
        self.suspend_on(fd, Direction::Write, None)
    }

    /// Park the current coroutine until `fd` is ready in `dir`.
    ///
    /// With a timeout, a resume-timer is armed on this Processor; if it
    /// fires first the registration is withdrawn and `TimedOut` is
    /// returned.
    pub(crate) fn suspend_on(
        &self,
        fd: RawFd,
        dir: Direction,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        self.assert_in_owner();
        let co = Coroutine::current().expect("io wait outside a coroutine");
        let outcome = Rc::new(Cell::new(WaitOutcome::Pending));
        {
            let local = unsafe { self.local() };
            local.poller.register(fd, dir, co.clone(), outcome.clone());
        }
        let guard = timeout.map(|t| self.run_after_co(t, co));

        yield_now();

        if let Some(id) = &guard {
            id.cancel();
        }
        let got = outcome.get();
        if got == WaitOutcome::Pending {
            // The guard timer resumed us while still registered
            let local = unsafe { self.local() };
            local.poller.deregister(fd, dir);
            return WaitOutcome::TimedOut;
        }
        got
    }

    // ── Timer operations (coroutine-resume flavor) ───────────────────

    /// Resume `co` here at an absolute monotonic deadline (µs).
    pub fn run_at_co(&self, deadline_us: u64, co: CoHandle) -> TimerId {
        self.assert_in_owner();
        let local = unsafe { self.local() };
        let id = local.timers.add(deadline_us, 0, TimerTarget::Resume(co));
        local.timers.rearm();
        id
    }

    /// Resume `co` here after `delay`.
    pub fn run_after_co(&self, delay: Duration, co: CoHandle) -> TimerId {
        self.run_at_co(mono_now_us() + delay.as_micros() as u64, co)
    }

    /// Resume `co` here every `interval`, first fire one interval from
    /// now. Fires against a terminated handle are dropped with a
    /// warning.
    ///
    /// # Panics
    ///
    /// Panics (programming error) on an interval below one microsecond.
    pub fn run_every_co(&self, interval: Duration, co: CoHandle) -> TimerId {
        self.assert_in_owner();
        let interval_us = interval.as_micros() as u64;
        assert!(
            interval_us >= MIN_TIMER_INTERVAL_US,
            "repeating timer interval below one microsecond"
        );
        let local = unsafe { self.local() };
        let id = local
            .timers
            .add(mono_now_us() + interval_us, interval_us, TimerTarget::Resume(co));
        local.timers.rearm();
        id
    }

    /// Insert a callback timer with a pre-made token. Owning thread
    /// only; the Scheduler routes here through the pending path.
    pub(crate) fn add_callback_timer(
        &self,
        deadline_us: u64,
        interval_us: u64,
        cb: Rc<dyn Fn()>,
        name: String,
        token: std::sync::Arc<AtomicBool>,
    ) {
        self.assert_in_owner();
        let local = unsafe { self.local() };
        local
            .timers
            .add_with_token(deadline_us, interval_us, TimerTarget::Spawn { cb, name }, token);
        local.timers.rearm();
    }

    fn timers_pending(&self) -> bool {
        self.assert_in_owner();
        let local = unsafe { self.local() };
        local.timers.pending()
    }

    /// Drain due timers, dispatch their targets, re-arm the timerfd.
    fn drain_timers_once(&self) -> RawFd {
        let due = {
            let local = unsafe { self.local() };
            local.timers.drain_expired(mono_now_us())
        };
        for target in due {
            match target {
                TimerTarget::Resume(co) => self.enqueue(co),
                TimerTarget::Spawn { cb, name } => self.add_task(move || cb(), name),
            }
        }
        let local = unsafe { self.local() };
        local.timers.rearm();
        local.timers.fd()
    }

    fn poll_once(&self) {
        let woken = {
            let local = unsafe { self.local() };
            local.poller.poll(self.poll_timeout_ms)
        };
        for w in woken {
            self.enqueue(w.co);
        }
    }

    fn runnable_empty(&self) -> bool {
        let local = unsafe { self.local() };
        local.runnable.is_empty()
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
        }
    }
}

/// Body of the distinguished epoll coroutine.
///
/// Scheduled only when no user coroutine is runnable; blocks the OS
/// thread in the kernel readiness call and requeues waiters, then
/// yields back to the dispatch loop.
fn epoll_loop(p: &Processor) {
    loop {
        if p.stopped() && p.runnable_empty() && !p.timers_pending() {
            break;
        }
        p.poll_once();
        yield_now();
    }
}

/// Body of the wakeup-drain service coroutine.
///
/// Loops on a hooked read of the eventfd, so it cooperatively parks
/// until some thread writes the wakeup byte.
fn wakeup_drain_loop(owner: Weak<Processor>, wakeup_fd: RawFd) {
    let mut buf = [0u8; 8];
    loop {
        match hook::read(wakeup_fd, &mut buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => break,
            Err(e) => {
                kerror!("read wakeup eventfd: {}", e);
                break;
            }
        }
        match owner.upgrade() {
            Some(p) if !p.stopped() => {}
            _ => break,
        }
    }
}

/// Body of the timer-drain service coroutine.
///
/// Drains expired entries, then sleeps in a hooked read on the armed
/// timerfd until the next deadline instead of spinning.
fn timer_drain_loop(owner: Weak<Processor>) {
    let mut buf = [0u8; 8];
    loop {
        let tfd = {
            let Some(p) = owner.upgrade() else { break };
            let tfd = p.drain_timers_once();
            if p.stopped() && !p.timers_pending() {
                break;
            }
            tfd
        };
        match hook::read(tfd, &mut buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => break,
            Err(e) => {
                kerror!("read timerfd: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a Processor on a fresh thread, hand the test a handle, stop
    /// it, and join.
    fn with_processor(test: impl FnOnce(&Arc<Processor>) + Send + 'static) {
        let t = std::thread::spawn(move || {
            let p = Processor::new().unwrap();
            test(&p);
            let runner = p.clone();
            runner.run();
        });
        t.join().unwrap();
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        with_processor(move |p| {
            for i in 0..5 {
                let o = o.clone();
                p.add_task(
                    move || o.lock().unwrap().push(i),
                    format!("task-{}", i),
                );
            }
            let p2 = p.clone();
            p.add_task(move || p2.stop(), "stopper");
        });
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cross_thread_pending_task() {
        let hits = Arc::new(AtomicUsize::new(0));

        let t = std::thread::spawn({
            let hits = hits.clone();
            move || {
                let p = Processor::new().unwrap();
                // Publish the Arc for the foreign submitter
                let (tx, rx) = std::sync::mpsc::channel();
                tx.send(p.clone()).unwrap();
                let submitter = std::thread::spawn(move || {
                    let p: Arc<Processor> = rx.recv().unwrap();
                    for _ in 0..10 {
                        let hits = hits.clone();
                        let stop = p.clone();
                        p.add_pending_task(Task::new(
                            move || {
                                if hits.fetch_add(1, Ordering::Relaxed) == 9 {
                                    stop.stop();
                                }
                            },
                            "incr",
                        ));
                    }
                });
                p.run();
                submitter.join().unwrap();
            }
        });
        t.join().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_terminated_coroutines_are_recycled() {
        let ids = Arc::new(Mutex::new(Vec::new()));
        let o = ids.clone();
        with_processor(move |p| {
            let o1 = o.clone();
            p.add_task(
                move || {
                    o1.lock()
                        .unwrap()
                        .push(Coroutine::current().unwrap().id());
                },
                "first",
            );
            // The driver parks until "first" has terminated, then adds
            // another task, which must come from the idle freelist
            let p1 = p.clone();
            let o2 = o.clone();
            p.add_task(
                move || {
                    let me = Coroutine::current().unwrap();
                    p1.run_after_co(Duration::from_millis(5), me);
                    yield_now();
                    let o3 = o2.clone();
                    let p2 = p1.clone();
                    p1.add_task(
                        move || {
                            o3.lock()
                                .unwrap()
                                .push(Coroutine::current().unwrap().id());
                            p2.stop();
                        },
                        "second",
                    );
                },
                "driver",
            );
        });
        // Identity is stable across reset, so a recycled coroutine
        // reports the same id
        let ids = ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }

    #[test]
    fn test_timer_resume_flavor() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let o = log.clone();
        with_processor(move |p| {
            let p1 = p.clone();
            p.add_task(
                move || {
                    let started = mono_now_us();
                    let co = Coroutine::current().unwrap();
                    p1.run_after_co(Duration::from_millis(20), co);
                    yield_now();
                    o.lock().unwrap().push(mono_now_us() - started);
                    p1.stop();
                },
                "sleeper",
            );
        });
        let waited = log.lock().unwrap()[0];
        assert!(waited >= 20_000, "resumed after {}us", waited);
        assert!(waited < 500_000, "resumed after {}us", waited);
    }

    #[test]
    fn test_remove_event_cancels_wait() {
        let outcome = Arc::new(Mutex::new(None));
        let o = outcome.clone();
        with_processor(move |p| {
            let mut fds = [0; 2];
            let rc =
                unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            assert_eq!(rc, 0);
            let (r, _w) = (fds[0], fds[1]);

            let p1 = p.clone();
            let o1 = o.clone();
            p.add_task(
                move || {
                    let got = p1.suspend_on(r, Direction::Read, None);
                    *o1.lock().unwrap() = Some(got);
                    p1.stop();
                },
                "waiter",
            );
            let p2 = p.clone();
            p.add_task(move || p2.remove_event(r), "canceller");
        });
        assert_eq!(*outcome.lock().unwrap(), Some(WaitOutcome::Cancelled));
    }

    #[test]
    fn test_io_wait_timeout() {
        let outcome = Arc::new(Mutex::new(None));
        let o = outcome.clone();
        with_processor(move |p| {
            let mut fds = [0; 2];
            let rc =
                unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            assert_eq!(rc, 0);
            let (r, _w) = (fds[0], fds[1]);

            let p1 = p.clone();
            p.add_task(
                move || {
                    let got =
                        p1.suspend_on(r, Direction::Read, Some(Duration::from_millis(30)));
                    *o.lock().unwrap() = Some(got);
                    p1.stop();
                },
                "timed-waiter",
            );
        });
        assert_eq!(*outcome.lock().unwrap(), Some(WaitOutcome::TimedOut));
    }

    #[test]
    fn test_user_panic_keeps_dispatching() {
        strand_core::klog::set_log_level(strand_core::klog::LogLevel::Off);
        let survived = Arc::new(AtomicBool::new(false));
        let s = survived.clone();
        with_processor(move |p| {
            p.add_task(|| panic!("user bug"), "buggy");
            let p1 = p.clone();
            p.add_task(
                move || {
                    s.store(true, Ordering::Relaxed);
                    p1.stop();
                },
                "healthy",
            );
        });
        assert!(survived.load(Ordering::Relaxed));
    }

    #[test]
    fn test_stop_liveness_when_idle() {
        // A stopped idle Processor must come out of the poller promptly
        let t = std::thread::spawn(|| {
            let p = Processor::new().unwrap();
            let stopper = p.clone();
            let h = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                stopper.stop();
            });
            let start = std::time::Instant::now();
            p.run();
            h.join().unwrap();
            start.elapsed()
        });
        let elapsed = t.join().unwrap();
        assert!(elapsed < Duration::from_millis(500), "run held for {:?}", elapsed);
    }

    #[test]
    #[should_panic(expected = "foreign thread")]
    fn test_foreign_thread_add_task_aborts() {
        let (tx, rx) = std::sync::mpsc::channel();
        let t = std::thread::spawn(move || {
            let p = Processor::new().unwrap();
            tx.send(p.clone()).unwrap();
            // Hold the thread alive while the test thread pokes at it
            std::thread::sleep(Duration::from_millis(100));
        });
        let p = rx.recv().unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            p.add_task(|| {}, "bad");
        }));
        t.join().unwrap();
        // Re-raise for should_panic
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    #[test]
    fn test_load_counts_placed_coroutines() {
        let seen = Arc::new(Mutex::new(0usize));
        let o = seen.clone();
        with_processor(move |p| {
            let p1 = p.clone();
            p.add_task(
                move || {
                    // Two service coroutines plus this one
                    *o.lock().unwrap() = p1.load();
                    p1.stop();
                },
                "probe",
            );
        });
        assert_eq!(*seen.lock().unwrap(), 3);
    }
}
