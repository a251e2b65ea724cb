//! Scheduler: supervisor of one main Processor plus N-1 workers
//!
//! The Scheduler owns Processor lifecycle (start / start_async / stop /
//! wait) and places new work by round robin over the workers, falling
//! back to the main Processor when there are none. Placement is sticky:
//! once a coroutine lands on a Processor it never migrates.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Once, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use strand_core::constants::MIN_TIMER_INTERVAL_US;
use strand_core::{kdebug, kerror, ktrace, kwarn, SchedError, SchedResult, Task};

use crate::config::RuntimeConfig;
use crate::hook;
use crate::processor::Processor;
use crate::timer::{mono_now_us, TimerId};

/// Ignore SIGPIPE process-wide: a closed peer should surface as a write
/// error, not kill the process.
fn ignore_sigpipe() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        ktrace!("ignoring SIGPIPE");
    });
}

struct Life {
    running: bool,
    failed: bool,
    quit: bool,
}

struct Core {
    config: RuntimeConfig,
    thread_count: AtomicUsize,
    life: Mutex<Life>,
    started_cv: Condvar,
    quit_cv: Condvar,
    main_proc: OnceLock<Arc<Processor>>,
    workers: OnceLock<Vec<Arc<Processor>>>,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
    helper_thread: Mutex<Option<JoinHandle<()>>>,
    rr: AtomicUsize,
    stopping: AtomicBool,
}

/// Supervisor handle; cheap to clone, shareable across threads.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Core>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        config.validate().expect("invalid runtime configuration");
        ignore_sigpipe();
        let thread_count = config.thread_count;
        Self {
            core: Arc::new(Core {
                config,
                thread_count: AtomicUsize::new(thread_count),
                life: Mutex::new(Life {
                    running: false,
                    failed: false,
                    quit: false,
                }),
                started_cv: Condvar::new(),
                quit_cv: Condvar::new(),
                main_proc: OnceLock::new(),
                workers: OnceLock::new(),
                worker_threads: Mutex::new(Vec::new()),
                helper_thread: Mutex::new(None),
                rr: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Override the Processor count.
    ///
    /// # Panics
    ///
    /// Panics (programming error) when called after `start`.
    pub fn set_thread_count(&self, n: usize) {
        let life = self.core.life.lock().expect("life lock poisoned");
        assert!(!life.running, "set_thread_count after start");
        assert!(n >= 1, "thread count must be at least 1");
        self.core.thread_count.store(n, Ordering::Relaxed);
    }

    /// Build all Processors and run the main one on the calling thread.
    ///
    /// Blocks until the main Processor's dispatch loop exits (i.e. until
    /// `stop`). Worker threads are up and polling before this thread
    /// starts dispatching.
    pub fn start(&self) -> SchedResult<()> {
        {
            let life = self.core.life.lock().expect("life lock poisoned");
            if life.running {
                return Err(SchedError::AlreadyStarted);
            }
        }

        let n = self.core.thread_count.load(Ordering::Relaxed).max(1);
        let main = Processor::with_config(&self.core.config)?;
        if self.core.main_proc.set(main.clone()).is_err() {
            return Err(SchedError::AlreadyStarted);
        }

        // Workers: one fresh thread per Processor, each constructing its
        // own Processor so ownership sits with the running thread
        let (tx, rx) = mpsc::channel::<SchedResult<Arc<Processor>>>();
        let mut handles = Vec::with_capacity(n - 1);
        for i in 1..n {
            let cfg = self.core.config.clone();
            let tx = tx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("strand-proc-{}", i))
                .spawn(move || match Processor::with_config(&cfg) {
                    Ok(p) => {
                        let _ = tx.send(Ok(p.clone()));
                        p.run();
                    }
                    Err(e) => {
                        kerror!("worker processor setup failed: {}", e);
                        let _ = tx.send(Err(e));
                    }
                });
            match spawned {
                Ok(h) => handles.push(h),
                Err(_) => {
                    self.fail_startup(handles);
                    return Err(SchedError::WorkerSpawnFailed);
                }
            }
        }
        drop(tx);

        // Every worker thread reports exactly once before dispatching,
        // so collect all results before deciding the startup outcome
        let mut workers = Vec::with_capacity(n - 1);
        let mut setup_failed = false;
        for _ in 1..n {
            match rx.recv() {
                Ok(Ok(p)) => workers.push(p),
                _ => setup_failed = true,
            }
        }
        if setup_failed {
            for p in &workers {
                p.stop();
            }
            self.fail_startup(handles);
            return Err(SchedError::WorkerSpawnFailed);
        }
        let _ = self.core.workers.set(workers);
        self.core
            .worker_threads
            .lock()
            .expect("threads lock poisoned")
            .extend(handles);

        {
            let mut life = self.core.life.lock().expect("life lock poisoned");
            life.running = true;
            self.core.started_cv.notify_all();
        }
        kdebug!("scheduler started with {} processor(s)", n);

        main.run();
        Ok(())
    }

    /// Run `start` on a helper thread; return once workers have
    /// signalled running.
    pub fn start_async(&self) -> SchedResult<()> {
        {
            let life = self.core.life.lock().expect("life lock poisoned");
            if life.running {
                return Err(SchedError::AlreadyStarted);
            }
        }
        let me = self.clone();
        let h = std::thread::Builder::new()
            .name("strand-sched".into())
            .spawn(move || {
                if let Err(e) = me.start() {
                    kerror!("scheduler start failed: {}", e);
                    let mut life = me.core.life.lock().expect("life lock poisoned");
                    life.failed = true;
                    me.core.started_cv.notify_all();
                }
            })
            .map_err(|_| SchedError::WorkerSpawnFailed)?;
        *self.core.helper_thread.lock().expect("helper lock poisoned") = Some(h);

        let mut life = self.core.life.lock().expect("life lock poisoned");
        while !life.running && !life.failed {
            life = self
                .core
                .started_cv
                .wait(life)
                .expect("life lock poisoned");
        }
        if life.failed {
            return Err(SchedError::WorkerSpawnFailed);
        }
        Ok(())
    }

    /// Block until `stop` has finished tearing the runtime down.
    pub fn wait(&self) {
        let mut life = self.core.life.lock().expect("life lock poisoned");
        while !life.quit {
            life = self.core.quit_cv.wait(life).expect("life lock poisoned");
        }
    }

    /// Stop every Processor and join the threads.
    ///
    /// When called from a Processor thread the join step is deferred to
    /// a detached thread, since joining would deadlock on ourselves.
    pub fn stop(&self) {
        {
            let mut life = self.core.life.lock().expect("life lock poisoned");
            if !life.running {
                return;
            }
            life.running = false;
        }
        if self.core.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(main) = self.core.main_proc.get() {
            main.stop();
        }
        if let Some(workers) = self.core.workers.get() {
            for p in workers {
                p.stop();
            }
        }

        if hook::hook_enabled() {
            // Called from inside the runtime: a worker cannot join itself
            let me = self.clone();
            match std::thread::Builder::new()
                .name("strand-join".into())
                .spawn(move || me.join_threads())
            {
                Ok(h) => drop(h), // detached
                Err(_) => kerror!("failed to spawn join thread"),
            }
        } else {
            self.join_threads();
        }
    }

    fn join_threads(&self) {
        if let Some(h) = self
            .core
            .helper_thread
            .lock()
            .expect("helper lock poisoned")
            .take()
        {
            let _ = h.join();
        }
        let handles = std::mem::take(
            &mut *self
                .core
                .worker_threads
                .lock()
                .expect("threads lock poisoned"),
        );
        for h in handles {
            let _ = h.join();
        }
        let mut life = self.core.life.lock().expect("life lock poisoned");
        life.quit = true;
        self.core.quit_cv.notify_all();
        kdebug!("scheduler threads joined");
    }

    fn fail_startup(&self, handles: Vec<JoinHandle<()>>) {
        for h in handles {
            let _ = h.join();
        }
        let mut life = self.core.life.lock().expect("life lock poisoned");
        life.failed = true;
        self.core.started_cv.notify_all();
    }

    /// Round-robin over workers, falling back to main.
    fn pick(&self) -> Option<Arc<Processor>> {
        if let Some(workers) = self.core.workers.get() {
            if !workers.is_empty() {
                let i = self.core.rr.fetch_add(1, Ordering::Relaxed) % workers.len();
                return Some(workers[i].clone());
            }
        }
        self.core.main_proc.get().cloned()
    }

    /// Place a callable on some Processor.
    ///
    /// Silently discarded after `stop`; a warning before `start`.
    pub fn post<F>(&self, f: F, name: impl Into<String>)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.core.stopping.load(Ordering::SeqCst) {
            return;
        }
        match self.pick() {
            Some(p) => p.submit(Task::new(f, name)),
            None => kwarn!("post before start, task discarded"),
        }
    }

    // ── Timer operations (callback flavor) ───────────────────────────

    /// Run `cb` at an absolute monotonic deadline (µs, see
    /// [`mono_now_us`]) as a freshly-scheduled coroutine.
    pub fn run_at<F>(&self, deadline_us: u64, cb: F, name: impl Into<String>) -> TimerId
    where
        F: Fn() + Send + 'static,
    {
        self.schedule_timer(deadline_us, 0, cb, name.into())
    }

    /// Run `cb` after `delay`.
    pub fn run_after<F>(&self, delay: Duration, cb: F, name: impl Into<String>) -> TimerId
    where
        F: Fn() + Send + 'static,
    {
        self.schedule_timer(mono_now_us() + delay.as_micros() as u64, 0, cb, name.into())
    }

    /// Run `cb` every `interval`, first fire one interval from now.
    ///
    /// # Panics
    ///
    /// Panics (programming error) on an interval below one microsecond.
    pub fn run_every<F>(&self, interval: Duration, cb: F, name: impl Into<String>) -> TimerId
    where
        F: Fn() + Send + 'static,
    {
        let interval_us = interval.as_micros() as u64;
        assert!(
            interval_us >= MIN_TIMER_INTERVAL_US,
            "repeating timer interval below one microsecond"
        );
        self.schedule_timer(mono_now_us() + interval_us, interval_us, cb, name.into())
    }

    /// Cancel a timer by id; removal is lazy on the owning Processor.
    pub fn cancel(&self, id: &TimerId) {
        id.cancel();
    }

    /// Route the insert through the pending path so the timer heap is
    /// only ever touched by its owning thread.
    fn schedule_timer<F>(&self, deadline_us: u64, interval_us: u64, cb: F, name: String) -> TimerId
    where
        F: Fn() + Send + 'static,
    {
        let id = TimerId::new();
        if self.core.stopping.load(Ordering::SeqCst) {
            return id;
        }
        let Some(target) = self.pick() else {
            kwarn!("timer <{}> scheduled before start, discarded", name);
            return id;
        };
        let token = id.token();
        let install = move || {
            let installed = Processor::with_current(|p| {
                p.add_callback_timer(deadline_us, interval_us, Rc::new(cb), name, token);
            });
            if installed.is_none() {
                kerror!("timer install ran outside a processor");
            }
        };
        target.submit(Task::new(install, "timer-install"));
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn single_thread_sched() -> Scheduler {
        let s = Scheduler::new(RuntimeConfig::default().thread_count(1));
        s.start_async().unwrap();
        s
    }

    fn await_count(counter: &AtomicU32, expect: u32, timeout: Duration) {
        let start = Instant::now();
        while counter.load(Ordering::Relaxed) < expect {
            assert!(
                start.elapsed() < timeout,
                "only {} of {} after {:?}",
                counter.load(Ordering::Relaxed),
                expect,
                timeout
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_post_runs_tasks() {
        let s = single_thread_sched();
        let counter = Arc::new(AtomicU32::new(0));
        for i in 0..10 {
            let c = counter.clone();
            s.post(
                move || {
                    c.fetch_add(1, Ordering::Relaxed);
                },
                format!("task-{}", i),
            );
        }
        await_count(&counter, 10, Duration::from_secs(2));
        s.stop();
        s.wait();
    }

    #[test]
    fn test_timer_firing_order() {
        let s = single_thread_sched();
        let order = Arc::new(Mutex::new(Vec::new()));
        let fired = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        for (delay, tag) in [(50u64, "X"), (10, "Y"), (30, "Z")] {
            let order = order.clone();
            let fired = fired.clone();
            s.run_after(
                Duration::from_millis(delay),
                move || {
                    order.lock().unwrap().push(tag);
                    fired.fetch_add(1, Ordering::Relaxed);
                },
                tag,
            );
        }

        await_count(&fired, 3, Duration::from_secs(2));
        let elapsed = started.elapsed();
        assert_eq!(*order.lock().unwrap(), vec!["Y", "Z", "X"]);
        assert!(elapsed >= Duration::from_millis(50), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
        s.stop();
        s.wait();
    }

    #[test]
    fn test_run_every_repeats_until_cancel() {
        let s = single_thread_sched();
        let ticks = Arc::new(AtomicU32::new(0));
        let t = ticks.clone();
        let id = s.run_every(
            Duration::from_millis(10),
            move || {
                t.fetch_add(1, Ordering::Relaxed);
            },
            "ticker",
        );

        await_count(&ticks, 3, Duration::from_secs(2));
        s.cancel(&id);
        let at_cancel = ticks.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(60));
        let after = ticks.load(Ordering::Relaxed);
        // One fire may already have been in flight when we cancelled
        assert!(after <= at_cancel + 1, "kept firing after cancel");
        s.stop();
        s.wait();
    }

    #[test]
    fn test_stop_unblocks_wait_promptly() {
        let s = Scheduler::new(RuntimeConfig::default().thread_count(4));
        s.start_async().unwrap();

        let started = Instant::now();
        s.stop();
        s.wait();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(500), "stop took {:?}", elapsed);
    }

    #[test]
    fn test_post_after_stop_discarded() {
        let s = single_thread_sched();
        s.stop();
        s.wait();

        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        s.post(
            move || {
                c.fetch_add(1, Ordering::Relaxed);
            },
            "late",
        );
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_set_thread_count_before_start() {
        let s = Scheduler::new(RuntimeConfig::default().thread_count(2));
        s.set_thread_count(3);
        s.start_async().unwrap();
        s.stop();
        s.wait();
    }

    #[test]
    fn test_double_start_rejected() {
        let s = single_thread_sched();
        assert!(matches!(s.start_async(), Err(SchedError::AlreadyStarted)));
        s.stop();
        s.wait();
    }
}
