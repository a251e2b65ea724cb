//! Coroutine-style TCP connection
//!
//! `recv` and `send` read as blocking calls but suspend only the
//! calling coroutine through the hook layer. A connection lives on the
//! Processor that created it and never migrates.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use strand_core::{kerror, ktrace};
use strand_runtime::hook;
use strand_runtime::processor::Processor;

use crate::socket;

/// Shared handle to a connection.
///
/// `Rc`, not `Arc`: a connection is referenced from the user's code and
/// from callback dispatch on one Processor only.
pub type ConnHandle = Rc<CoTcpConnection>;

type ConnCallback = Rc<dyn Fn(&ConnHandle)>;
type HighWaterCallback = Rc<dyn Fn(&ConnHandle, usize)>;

/// A TCP connection with coroutine-blocking `recv`/`send`.
pub struct CoTcpConnection {
    fd: Cell<RawFd>,
    name: String,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    connected: Cell<bool>,
    read_timeout: Cell<Option<Duration>>,
    write_timeout: Cell<Option<Duration>>,
    /// Non-owning tie back to our own handle, promoted to a strong
    /// reference only for the duration of callback dispatch
    tie: RefCell<Weak<CoTcpConnection>>,
    write_complete_cb: RefCell<Option<ConnCallback>>,
    high_water: RefCell<Option<(HighWaterCallback, usize)>>,
}

impl CoTcpConnection {
    /// Wrap an already-connected non-blocking socket.
    pub fn from_fd(fd: RawFd, name: impl Into<String>) -> io::Result<ConnHandle> {
        let local_addr = socket::local_addr(fd)?;
        let peer_addr = socket::peer_addr(fd)?;
        let conn = Rc::new(CoTcpConnection {
            fd: Cell::new(fd),
            name: name.into(),
            local_addr,
            peer_addr,
            connected: Cell::new(true),
            read_timeout: Cell::new(None),
            write_timeout: Cell::new(None),
            tie: RefCell::new(Weak::new()),
            write_complete_cb: RefCell::new(None),
            high_water: RefCell::new(None),
        });
        *conn.tie.borrow_mut() = Rc::downgrade(&conn);
        let _ = socket::set_keepalive(fd, true);
        ktrace!("connection '{}' {} -> {}", conn.name, local_addr, peer_addr);
        Ok(conn)
    }

    /// Connect to a remote address, suspending through the handshake.
    pub fn connect(addr: &SocketAddr, name: impl Into<String>) -> io::Result<ConnHandle> {
        let fd = socket::new_stream_socket(addr)?;
        let (storage, len) = socket::sockaddr_from(addr);
        let rc = unsafe {
            hook::connect(
                fd,
                &storage as *const _ as *const libc::sockaddr,
                len,
                None,
            )
        };
        if let Err(e) = rc {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Self::from_fd(fd, name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        socket::set_tcp_nodelay(self.fd.get(), on)
    }

    pub fn set_read_timeout(&self, t: Option<Duration>) {
        self.read_timeout.set(t);
    }

    pub fn set_write_timeout(&self, t: Option<Duration>) {
        self.write_timeout.set(t);
    }

    /// Invoked after a `send` call has pushed every byte to the kernel.
    pub fn set_write_complete_callback(&self, cb: impl Fn(&ConnHandle) + 'static) {
        *self.write_complete_cb.borrow_mut() = Some(Rc::new(cb));
    }

    /// Invoked once per `send` call whose unsent remainder reaches
    /// `mark` bytes.
    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&ConnHandle, usize) + 'static,
        mark: usize,
    ) {
        *self.high_water.borrow_mut() = Some((Rc::new(cb), mark));
    }

    /// Receive into `buf`, suspending until data, timeout, or close.
    ///
    /// Returns 0 at end-of-stream; the connection is marked
    /// disconnected exactly once.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.fd.get();
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }
        let n = hook::recv_timeout(fd, buf, 0, self.read_timeout.get())?;
        if n == 0 && self.connected.replace(false) {
            ktrace!("connection '{}' closed by peer", self.name);
        }
        Ok(n)
    }

    /// Send all of `data`, suspending on would-block until every byte
    /// has been handed to the kernel.
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        let fd = self.fd.get();
        if fd < 0 || !self.connected.get() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }

        let mut remaining = data;
        let mut hw_fired = false;
        while !remaining.is_empty() {
            match hook::send_timeout(fd, remaining, 0, self.write_timeout.get()) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "send returned zero",
                    ));
                }
                Ok(n) => {
                    remaining = &remaining[n..];
                    if !remaining.is_empty() && !hw_fired {
                        hw_fired = self.maybe_fire_high_water(remaining.len());
                    }
                }
                Err(e) => {
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        self.connected.set(false);
                    }
                    kerror!("connection '{}' send: {}", self.name, e);
                    return Err(e);
                }
            }
        }

        let cb = self.write_complete_cb.borrow().clone();
        if let (Some(cb), Some(me)) = (cb, self.tie.borrow().upgrade()) {
            cb(&me);
        }
        Ok(())
    }

    fn maybe_fire_high_water(&self, pending: usize) -> bool {
        let hw = self.high_water.borrow().clone();
        if let Some((cb, mark)) = hw {
            if pending >= mark {
                if let Some(me) = self.tie.borrow().upgrade() {
                    cb(&me, pending);
                }
                return true;
            }
        }
        false
    }

    /// Half-close the write side; the peer observes end-of-stream.
    pub fn shutdown(&self) -> io::Result<()> {
        let fd = self.fd.get();
        if fd < 0 {
            return Ok(());
        }
        socket::shutdown_write(fd)
    }

    /// Close the socket, withdrawing any poller registrations first.
    pub fn close(&self) {
        let fd = self.fd.replace(-1);
        if fd < 0 {
            return;
        }
        self.connected.set(false);
        // Waiters on this descriptor get a cancellation signal
        Processor::with_current(|p| p.remove_event(fd));
        unsafe {
            libc::close(fd);
        }
        ktrace!("connection '{}' closed", self.name);
    }
}

impl Drop for CoTcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}
