//! Per-Processor timer queue
//!
//! A min-heap of deadlines in monotonic microseconds. Cancellation is
//! lazy: the `TimerId` handed back to the caller shares an atomic flag
//! with the heap entry, and flagged entries are skipped at pop time.
//!
//! The queue owns a kernel timerfd. The Processor's timer-drain
//! coroutine arms it for the next deadline and parks in a hooked `read`
//! on it, so expiry wakes the Processor through the ordinary poller
//! path instead of spinning.

use std::collections::BinaryHeap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strand_core::{SchedError, SchedResult};

use crate::coroutine::CoHandle;

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Current monotonic time in microseconds (CLOCK_MONOTONIC).
///
/// All timer deadlines are expressed on this clock.
pub fn mono_now_us() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Cancellation handle for a scheduled timer.
///
/// Cloneable and sendable; cancelling from any thread is safe because
/// the flag is only read at pop time on the owning Processor.
#[derive(Clone)]
pub struct TimerId {
    token: Arc<AtomicBool>,
}

impl TimerId {
    pub(crate) fn new() -> Self {
        Self {
            token: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the timer cancelled; removal is lazy.
    pub fn cancel(&self) {
        self.token.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.load(Ordering::Acquire)
    }

    pub(crate) fn token(&self) -> Arc<AtomicBool> {
        self.token.clone()
    }
}

/// What to do when an entry fires.
pub(crate) enum TimerTarget {
    /// Requeue a parked coroutine on the owning Processor
    Resume(CoHandle),
    /// Run a callback as a freshly-scheduled coroutine
    Spawn { cb: Rc<dyn Fn()>, name: String },
}

struct TimerEntry {
    deadline_us: u64,
    /// Insertion sequence; breaks deadline ties in submission order
    seq: u64,
    /// 0 = one-shot; otherwise reinsert at deadline + interval
    interval_us: u64,
    target: TimerTarget,
    token: Arc<AtomicBool>,
}

impl TimerEntry {
    fn cancelled(&self) -> bool {
        self.token.load(Ordering::Acquire)
    }

    /// Clone the target for redispatch of a repeating timer.
    fn target_again(&self) -> TimerTarget {
        match &self.target {
            TimerTarget::Resume(co) => TimerTarget::Resume(co.clone()),
            TimerTarget::Spawn { cb, name } => TimerTarget::Spawn {
                cb: cb.clone(),
                name: name.clone(),
            },
        }
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_us == other.deadline_us && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed for a min-heap: earliest deadline first, ties in
        // insertion order
        match other.deadline_us.cmp(&self.deadline_us) {
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

pub(crate) struct TimerQueue {
    timerfd: RawFd,
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> SchedResult<Self> {
        let timerfd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if timerfd < 0 {
            return Err(SchedError::OsSetup(errno()));
        }
        Ok(Self {
            timerfd,
            heap: BinaryHeap::new(),
            next_seq: 0,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.timerfd
    }

    /// Insert an entry; the caller re-arms the timerfd afterwards.
    pub fn add(&mut self, deadline_us: u64, interval_us: u64, target: TimerTarget) -> TimerId {
        let id = TimerId::new();
        self.add_with_token(deadline_us, interval_us, target, id.token());
        id
    }

    /// Insert with a caller-provided token (cross-thread adds create the
    /// `TimerId` before the entry reaches the owning thread).
    pub fn add_with_token(
        &mut self,
        deadline_us: u64,
        interval_us: u64,
        target: TimerTarget,
        token: Arc<AtomicBool>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline_us,
            seq,
            interval_us,
            target,
            token,
        });
    }

    /// Pop every entry due at `now_us`, skipping cancelled ones and
    /// reinserting repeats at `deadline + interval`.
    pub fn drain_expired(&mut self, now_us: u64) -> Vec<TimerTarget> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.deadline_us > now_us {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry vanished");
            if entry.cancelled() {
                continue;
            }
            if entry.interval_us > 0 {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.heap.push(TimerEntry {
                    deadline_us: entry.deadline_us + entry.interval_us,
                    seq,
                    interval_us: entry.interval_us,
                    target: entry.target_again(),
                    token: entry.token.clone(),
                });
            }
            due.push(entry.target);
        }
        due
    }

    /// Earliest non-cancelled deadline, pruning cancelled heads.
    pub fn next_deadline(&mut self) -> Option<u64> {
        while let Some(head) = self.heap.peek() {
            if head.cancelled() {
                self.heap.pop();
                continue;
            }
            return Some(head.deadline_us);
        }
        None
    }

    /// Whether any live (non-cancelled) entry remains.
    pub fn pending(&self) -> bool {
        self.heap.iter().any(|e| !e.cancelled())
    }

    /// Arm the timerfd for the next deadline, or disarm it.
    ///
    /// A deadline already in the past is clamped to one nanosecond:
    /// it_value of zero would disarm instead of firing immediately.
    pub fn rearm(&mut self) {
        const ZERO: libc::timespec = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Disarmed unless a live deadline exists
        let mut spec = libc::itimerspec {
            it_interval: ZERO,
            it_value: ZERO,
        };
        let mut flags = 0;

        if let Some(deadline_us) = self.next_deadline() {
            if deadline_us <= mono_now_us() {
                // Already due: it_value of zero would disarm, so fire
                // one nanosecond from now instead
                spec.it_value.tv_nsec = 1;
            } else {
                spec.it_value.tv_sec = (deadline_us / 1_000_000) as libc::time_t;
                spec.it_value.tv_nsec = ((deadline_us % 1_000_000) * 1_000) as libc::c_long;
                flags = libc::TFD_TIMER_ABSTIME;
            }
        }

        let rc = unsafe { libc::timerfd_settime(self.timerfd, flags, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            strand_core::kerror!("timerfd_settime: errno {}", errno());
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timerfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn spawn_target(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> TimerTarget {
        let log = log.clone();
        TimerTarget::Spawn {
            cb: Rc::new(move || log.borrow_mut().push(tag)),
            name: tag.to_string(),
        }
    }

    fn run(targets: Vec<TimerTarget>) {
        for t in targets {
            match t {
                TimerTarget::Spawn { cb, .. } => cb(),
                TimerTarget::Resume(_) => unreachable!(),
            }
        }
    }

    #[test]
    fn test_deadline_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = TimerQueue::new().unwrap();
        q.add(50_000, 0, spawn_target(&log, "X"));
        q.add(10_000, 0, spawn_target(&log, "Y"));
        q.add(30_000, 0, spawn_target(&log, "Z"));

        run(q.drain_expired(60_000));
        assert_eq!(*log.borrow(), vec!["Y", "Z", "X"]);
        assert!(!q.pending());
    }

    #[test]
    fn test_tie_broken_by_insertion() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = TimerQueue::new().unwrap();
        q.add(1_000, 0, spawn_target(&log, "first"));
        q.add(1_000, 0, spawn_target(&log, "second"));
        q.add(1_000, 0, spawn_target(&log, "third"));

        run(q.drain_expired(1_000));
        assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_partial_drain() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = TimerQueue::new().unwrap();
        q.add(10, 0, spawn_target(&log, "due"));
        q.add(1_000_000, 0, spawn_target(&log, "later"));

        run(q.drain_expired(500));
        assert_eq!(*log.borrow(), vec!["due"]);
        assert!(q.pending());
        assert_eq!(q.next_deadline(), Some(1_000_000));
    }

    #[test]
    fn test_lazy_cancel() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = TimerQueue::new().unwrap();
        let id = q.add(100, 0, spawn_target(&log, "never"));
        q.add(200, 0, spawn_target(&log, "fires"));

        id.cancel();
        assert!(id.is_cancelled());

        run(q.drain_expired(1_000));
        assert_eq!(*log.borrow(), vec!["fires"]);
    }

    #[test]
    fn test_repeat_reinserts() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = TimerQueue::new().unwrap();
        let id = q.add(100, 100, spawn_target(&log, "tick"));

        run(q.drain_expired(100));
        run(q.drain_expired(200));
        run(q.drain_expired(300));
        assert_eq!(*log.borrow(), vec!["tick", "tick", "tick"]);

        // Deadline advances by the interval, not by observation time
        assert_eq!(q.next_deadline(), Some(400));

        id.cancel();
        run(q.drain_expired(10_000));
        assert_eq!(log.borrow().len(), 3);
        assert!(!q.pending());
    }

    #[test]
    fn test_cancelled_head_pruned_from_next_deadline() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = TimerQueue::new().unwrap();
        let early = q.add(100, 0, spawn_target(&log, "early"));
        q.add(900, 0, spawn_target(&log, "late"));

        early.cancel();
        assert_eq!(q.next_deadline(), Some(900));
    }
}
