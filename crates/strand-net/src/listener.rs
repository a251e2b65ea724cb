//! Coroutine-style TCP acceptor

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use strand_core::ktrace;
use strand_runtime::hook;

use crate::connection::{CoTcpConnection, ConnHandle};
use crate::socket;

const BACKLOG: i32 = 1024;

/// A listening TCP socket whose `accept` suspends the calling
/// coroutine until a client connects.
pub struct CoTcpListener {
    fd: RawFd,
    local: SocketAddr,
    next_id: Cell<u64>,
}

impl CoTcpListener {
    /// Bind and listen. Port 0 binds an ephemeral port; read it back
    /// with `local_addr`.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let fd = socket::bind_listen(&addr, BACKLOG)?;
        let local = socket::local_addr(fd)?;
        ktrace!("listening on {}", local);
        Ok(Self {
            fd,
            local,
            next_id: Cell::new(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accept one connection, suspending until a client arrives.
    ///
    /// The accepted socket is non-blocking and close-on-exec.
    pub fn accept(&self) -> io::Result<ConnHandle> {
        let (fd, _peer) = self.accept_raw()?;
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        CoTcpConnection::from_fd(fd, format!("conn-{}", id))
    }

    /// Accept one connection as a raw fd plus peer address.
    ///
    /// Used when the connection object must be built on a different
    /// Processor than the acceptor (the fd crosses threads, the
    /// connection never does).
    pub fn accept_raw(&self) -> io::Result<(RawFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            hook::accept(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )?
        };
        let peer = socket::sockaddr_to_addr(&storage)?;
        Ok((fd, peer))
    }
}

impl Drop for CoTcpListener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use strand_runtime::Processor;

    /// Server and client coroutines interleave on one Processor purely
    /// through hooked-syscall suspension.
    #[test]
    fn test_loopback_round_trip_one_processor() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let o = log.clone();
        let t = std::thread::spawn(move || {
            let p = Processor::new().unwrap();
            let listener = CoTcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr();

            let o1 = o.clone();
            p.add_task(
                move || {
                    let conn = listener.accept().unwrap();
                    let mut buf = [0u8; 32];
                    let n = conn.recv(&mut buf).unwrap();
                    conn.send(&buf[..n]).unwrap();
                    o1.lock().unwrap().push("served".into());
                },
                "acceptor",
            );

            let p1 = p.clone();
            let o2 = o.clone();
            p.add_task(
                move || {
                    let conn = CoTcpConnection::connect(&addr, "client").unwrap();
                    conn.send(b"hello strand").unwrap();
                    let mut buf = [0u8; 32];
                    let mut got = Vec::new();
                    while got.len() < 12 {
                        let n = conn.recv(&mut buf).unwrap();
                        assert_ne!(n, 0, "peer closed early");
                        got.extend_from_slice(&buf[..n]);
                    }
                    o2.lock()
                        .unwrap()
                        .push(String::from_utf8(got).unwrap());
                    p1.stop();
                },
                "client",
            );

            p.run();
        });
        t.join().unwrap();

        let log = log.lock().unwrap();
        assert!(log.contains(&"served".to_string()));
        assert!(log.contains(&"hello strand".to_string()));
    }
}
