//! Hooked syscall layer
//!
//! Blocking-looking wrappers around the I/O primitives. Each wrapper
//! tries the native call once; a would-block result suspends the
//! calling coroutine against the Processor's poller and retries after
//! resumption. From the coroutine's perspective these are ordinary
//! blocking calls; the OS thread underneath is free to run others.
//!
//! The hook only engages when all of these hold, otherwise the native
//! call is performed unchanged:
//!
//! 1. hooking is enabled on this thread (set by `Processor::run`),
//! 2. the caller is inside a coroutine,
//! 3. the descriptor is in non-blocking mode.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::coroutine::{yield_now, Coroutine};
use crate::poller::{Direction, WaitOutcome};
use crate::processor::Processor;
use crate::tls;

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn os_err(e: i32) -> io::Error {
    io::Error::from_raw_os_error(e)
}

/// Whether hooked syscalls may suspend on this thread.
#[inline]
pub fn hook_enabled() -> bool {
    tls::hook_enabled()
}

#[inline]
pub(crate) fn set_hook_enabled(on: bool) {
    tls::set_hook_enabled(on);
}

fn fd_nonblocking(fd: RawFd) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    flags >= 0 && flags & libc::O_NONBLOCK != 0
}

fn can_suspend(fd: RawFd) -> bool {
    tls::hook_enabled() && tls::in_coroutine() && fd_nonblocking(fd)
}

fn wait_io(fd: RawFd, dir: Direction, timeout: Option<Duration>) -> WaitOutcome {
    Processor::with_current(|p| p.suspend_on(fd, dir, timeout))
        .expect("hooked io wait with no processor bound")
}

/// Core try-once-then-suspend discipline shared by the typed wrappers.
fn do_io<F>(fd: RawFd, dir: Direction, timeout: Option<Duration>, mut op: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    if !can_suspend(fd) {
        // Native call unchanged (modulo EINTR)
        loop {
            let n = op();
            if n >= 0 {
                return Ok(n as usize);
            }
            let e = errno();
            if e == libc::EINTR {
                continue;
            }
            return Err(os_err(e));
        }
    }

    loop {
        let n = op();
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            libc::EINTR => continue,
            libc::EAGAIN => match wait_io(fd, dir, timeout) {
                WaitOutcome::Ready => continue,
                WaitOutcome::TimedOut => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("io timed out on fd {}", fd),
                    ));
                }
                WaitOutcome::Cancelled => {
                    return Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "io wait cancelled",
                    ));
                }
                WaitOutcome::Pending => unreachable!("io wait returned pending"),
            },
            e => return Err(os_err(e)),
        }
    }
}

// ── Read-class wrappers ──────────────────────────────────────────────

/// Read from a descriptor, suspending the coroutine on would-block.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    read_timeout(fd, buf, None)
}

pub fn read_timeout(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
    do_io(fd, Direction::Read, timeout, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

/// Receive from a socket. Returns 0 when the peer closed.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    recv_timeout(fd, buf, flags, None)
}

pub fn recv_timeout(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    do_io(fd, Direction::Read, timeout, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

/// Receive with source address (raw sockaddr out-parameters).
///
/// # Safety
///
/// `addr`/`addrlen` must be valid or null, per recvfrom(2).
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> io::Result<usize> {
    do_io(fd, Direction::Read, None, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            addr,
            addrlen,
        )
    })
}

/// Accept a connection, suspending until one arrives.
///
/// `flags` is passed to accept4(2), typically
/// `SOCK_NONBLOCK | SOCK_CLOEXEC`.
///
/// # Safety
///
/// `addr`/`addrlen` must be valid or null, per accept4(2).
pub unsafe fn accept(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
    flags: i32,
) -> io::Result<RawFd> {
    let n = do_io(fd, Direction::Read, None, || unsafe {
        libc::accept4(fd, addr, addrlen, flags) as libc::ssize_t
    })?;
    Ok(n as RawFd)
}

// ── Write-class wrappers ─────────────────────────────────────────────

/// Write to a descriptor, suspending the coroutine on would-block.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    write_timeout(fd, buf, None)
}

pub fn write_timeout(fd: RawFd, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
    do_io(fd, Direction::Write, timeout, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

/// Send to a socket.
pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    send_timeout(fd, buf, flags, None)
}

pub fn send_timeout(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    do_io(fd, Direction::Write, timeout, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

/// Send with an explicit destination address.
///
/// # Safety
///
/// `addr` must be valid for `addrlen` bytes, per sendto(2).
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> io::Result<usize> {
    do_io(fd, Direction::Write, None, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
            addr,
            addrlen,
        )
    })
}

/// Connect a socket, suspending through the in-progress phase.
///
/// The connect outcome is read back through SO_ERROR once the socket
/// reports writable.
///
/// # Safety
///
/// `addr` must be valid for `addrlen` bytes, per connect(2).
pub unsafe fn connect(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let e = loop {
        let n = libc::connect(fd, addr, addrlen);
        if n == 0 {
            return Ok(());
        }
        let e = errno();
        if e != libc::EINTR {
            break e;
        }
    };

    match e {
        libc::EINPROGRESS | libc::EAGAIN if can_suspend(fd) => {
            match wait_io(fd, Direction::Write, timeout) {
                WaitOutcome::Ready => {
                    let mut err: libc::c_int = 0;
                    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                    let rc = libc::getsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut err as *mut libc::c_int as *mut libc::c_void,
                        &mut len,
                    );
                    if rc != 0 {
                        return Err(os_err(errno()));
                    }
                    if err != 0 {
                        return Err(os_err(err));
                    }
                    Ok(())
                }
                WaitOutcome::TimedOut => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out on fd {}", fd),
                )),
                WaitOutcome::Cancelled => Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "connect wait cancelled",
                )),
                WaitOutcome::Pending => unreachable!("io wait returned pending"),
            }
        }
        e => Err(os_err(e)),
    }
}

// ── Sleep ────────────────────────────────────────────────────────────

/// Sleep the current coroutine without blocking its OS thread.
///
/// Arms a timer on the owning Processor and yields; there is no native
/// call involved. Outside a hooked coroutine this degrades to an OS
/// thread sleep.
pub fn co_sleep(d: Duration) {
    let parked = Processor::with_current(|p| match Coroutine::current() {
        Some(co) if tls::hook_enabled() => {
            p.run_after_co(d, co);
            true
        }
        _ => false,
    })
    .unwrap_or(false);

    if parked {
        yield_now();
    } else {
        std::thread::sleep(d);
    }
}

pub fn co_sleep_ms(ms: u64) {
    co_sleep(Duration::from_millis(ms));
}

pub fn co_sleep_us(us: u64) {
    co_sleep(Duration::from_micros(us));
}
