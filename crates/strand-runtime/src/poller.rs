//! epoll-backed readiness poller
//!
//! One poller per Processor, touched only by the owning thread. Each
//! descriptor may have at most one read-waiter and one write-waiter; a
//! second registration on an occupied direction is a programming error.
//!
//! The poller does not resume anything itself: `poll` and `remove`
//! return the woken waiters and the Processor pushes them onto its
//! runnable queue.

use std::cell::Cell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use strand_core::{kerror, SchedError, SchedResult};

use crate::coroutine::CoHandle;

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Why a suspended wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Not signalled yet (only observable while still registered)
    Pending,
    /// The descriptor became ready
    Ready,
    /// The registration was cancelled (`remove` on the descriptor)
    Cancelled,
    /// A timeout timer resumed the waiter before readiness
    TimedOut,
}

/// Interest flags for `Processor::update_event`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
}

/// Direction of a single wait registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// A parked coroutine plus the cell its waker reports through.
pub(crate) struct Waiter {
    pub co: CoHandle,
    pub outcome: Rc<Cell<WaitOutcome>>,
}

/// Per-descriptor wait record: current epoll mask plus one optional
/// waiter per direction.
struct WaitRecord {
    mask: u32,
    reader: Option<Waiter>,
    writer: Option<Waiter>,
}

impl WaitRecord {
    fn empty() -> Self {
        Self {
            mask: 0,
            reader: None,
            writer: None,
        }
    }
}

pub(crate) struct Poller {
    epfd: RawFd,
    records: HashMap<RawFd, WaitRecord>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> SchedResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SchedError::OsSetup(errno()));
        }
        Ok(Self {
            epfd,
            records: HashMap::new(),
            events: Vec::with_capacity(64),
        })
    }

    /// Register `co` as the waiter for one direction on `fd`.
    ///
    /// # Panics
    ///
    /// Panics (programming error) when the direction already has a
    /// waiter.
    pub fn register(
        &mut self,
        fd: RawFd,
        dir: Direction,
        co: CoHandle,
        outcome: Rc<Cell<WaitOutcome>>,
    ) {
        let rec = self.records.entry(fd).or_insert_with(WaitRecord::empty);
        let slot = match dir {
            Direction::Read => &mut rec.reader,
            Direction::Write => &mut rec.writer,
        };
        assert!(
            slot.is_none(),
            "double wait on fd {} direction {:?}",
            fd,
            dir
        );
        *slot = Some(Waiter { co, outcome });

        let flag = match dir {
            Direction::Read => libc::EPOLLIN as u32,
            Direction::Write => libc::EPOLLOUT as u32,
        };
        let old_mask = rec.mask;
        let new_mask = old_mask | flag;
        rec.mask = new_mask;
        self.ctl(fd, old_mask, new_mask);
    }

    /// Drop the waiter for one direction, shrinking the interest mask.
    ///
    /// Returns the waiter if one was registered. Used by the timed-out
    /// path, so a missing record is not an error.
    pub fn deregister(&mut self, fd: RawFd, dir: Direction) -> Option<Waiter> {
        let rec = self.records.get_mut(&fd)?;
        let (slot, flag) = match dir {
            Direction::Read => (&mut rec.reader, libc::EPOLLIN as u32),
            Direction::Write => (&mut rec.writer, libc::EPOLLOUT as u32),
        };
        let waiter = slot.take()?;

        let old_mask = rec.mask;
        let new_mask = old_mask & !flag;
        rec.mask = new_mask;
        self.ctl(fd, old_mask, new_mask);
        if new_mask == 0 {
            self.records.remove(&fd);
        }
        Some(waiter)
    }

    /// Drop the descriptor entirely, cancelling any waiters.
    ///
    /// Returned waiters have their outcome set to `Cancelled` and must
    /// be pushed back onto the runnable queue by the caller.
    pub fn remove(&mut self, fd: RawFd) -> Vec<Waiter> {
        let Some(rec) = self.records.remove(&fd) else {
            return Vec::new();
        };
        if rec.mask != 0 {
            self.ctl(fd, rec.mask, 0);
        }
        let mut out = Vec::new();
        for w in [rec.reader, rec.writer].into_iter().flatten() {
            w.outcome.set(WaitOutcome::Cancelled);
            out.push(w);
        }
        out
    }

    /// Block in `epoll_wait` for up to `timeout_ms`.
    ///
    /// Every waiter whose direction became ready is deregistered, gets
    /// outcome `Ready`, and is returned for requeueing. EPOLLERR and
    /// EPOLLHUP wake both directions so the waiter can observe the error
    /// from the retried syscall.
    pub fn poll(&mut self, timeout_ms: i32) -> Vec<Waiter> {
        unsafe {
            self.events.set_len(0);
        }
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let e = errno();
            if e != libc::EINTR {
                kerror!("epoll_wait: errno {}", e);
            }
            return Vec::new();
        }
        unsafe {
            self.events.set_len(n as usize);
        }

        let mut woken = Vec::new();
        for i in 0..n as usize {
            let ev = self.events[i];
            let fd = ev.u64 as RawFd;
            let err = ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            let readable = err || ev.events & libc::EPOLLIN as u32 != 0;
            let writable = err || ev.events & libc::EPOLLOUT as u32 != 0;

            if readable {
                if let Some(w) = self.deregister(fd, Direction::Read) {
                    w.outcome.set(WaitOutcome::Ready);
                    woken.push(w);
                }
            }
            if writable {
                if let Some(w) = self.deregister(fd, Direction::Write) {
                    w.outcome.set(WaitOutcome::Ready);
                    woken.push(w);
                }
            }
        }
        woken
    }

    /// Number of descriptors with at least one waiter.
    #[cfg(test)]
    pub fn waiting_fds(&self) -> usize {
        self.records.len()
    }

    fn ctl(&self, fd: RawFd, old_mask: u32, new_mask: u32) {
        let op = if old_mask == 0 {
            libc::EPOLL_CTL_ADD
        } else if new_mask == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut event = libc::epoll_event {
            events: new_mask,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc != 0 {
            kerror!("epoll_ctl(op {}, fd {}): errno {}", op, fd, errno());
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
