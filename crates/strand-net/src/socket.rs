//! Low-level socket plumbing
//!
//! Thin libc wrappers shared by the listener and connection types. All
//! sockets created here are non-blocking and close-on-exec, which is
//! what lets the hook layer suspend instead of blocking the thread.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn os_err() -> io::Error {
    io::Error::from_raw_os_error(errno())
}

/// Create a non-blocking TCP socket for the address family of `addr`.
pub fn new_stream_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(os_err());
    }
    Ok(fd)
}

/// Encode a `SocketAddr` into sockaddr storage.
pub fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                // octets are already network order; keep the bytes as-is
                (*sin).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Decode sockaddr storage back into a `SocketAddr`.
pub fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {}", other),
        )),
    }
}

/// Create, configure, bind and listen. Returns the listening fd.
pub fn bind_listen(addr: &SocketAddr, backlog: i32) -> io::Result<RawFd> {
    let fd = new_stream_socket(addr)?;

    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let (storage, len) = sockaddr_from(addr);
    let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc != 0 {
        let e = os_err();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let rc = unsafe { libc::listen(fd, backlog) };
    if rc != 0 {
        let e = os_err();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

pub fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    let v: libc::c_int = on as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &v as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(os_err());
    }
    Ok(())
}

pub fn set_keepalive(fd: RawFd, on: bool) -> io::Result<()> {
    let v: libc::c_int = on as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &v as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(os_err());
    }
    Ok(())
}

/// Half-close the write side (SHUT_WR), letting in-flight reads finish.
pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    if rc != 0 {
        return Err(os_err());
    }
    Ok(())
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(os_err());
    }
    sockaddr_to_addr(&storage)
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(os_err());
    }
    sockaddr_to_addr(&storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_v4_round_trip() {
        let addr: SocketAddr = "192.168.1.7:8080".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to_addr(&storage).unwrap(), addr);
    }

    #[test]
    fn test_sockaddr_v6_round_trip() {
        let addr: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to_addr(&storage).unwrap(), addr);
    }

    #[test]
    fn test_bind_listen_ephemeral() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = bind_listen(&addr, 16).unwrap();
        let bound = local_addr(fd).unwrap();
        assert_ne!(bound.port(), 0);
        unsafe { libc::close(fd) };
    }
}
