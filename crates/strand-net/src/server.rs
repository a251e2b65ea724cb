//! Callback-style TCP server
//!
//! Keeps the classic reactor-facing surface — connection, message,
//! write-complete, and high-water-mark callbacks plus `start()` — while
//! the machinery underneath is the coroutine runtime: one acceptor
//! coroutine, and one coroutine per connection placed round-robin by
//! the Scheduler so a connection keeps Processor affinity for life.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use strand_core::{kerror, kinfo, ktrace};
use strand_runtime::Scheduler;

use crate::connection::{CoTcpConnection, ConnHandle};
use crate::listener::CoTcpListener;

/// Invoked on connection establish and again on disconnect; check
/// `is_connected` to tell them apart.
pub type ConnectionCallback = Arc<dyn Fn(&ConnHandle) + Send + Sync>;

/// Invoked whenever bytes arrive. The buffer accumulates until the
/// callback consumes (drains) it.
pub type MessageCallback = Arc<dyn Fn(&ConnHandle, &mut Vec<u8>) + Send + Sync>;

pub type WriteCompleteCallback = Arc<dyn Fn(&ConnHandle) + Send + Sync>;

/// Second argument is the pending unsent byte count that crossed the
/// mark.
pub type HighWaterMarkCallback = Arc<dyn Fn(&ConnHandle, usize) + Send + Sync>;

fn default_connection_callback(conn: &ConnHandle) {
    ktrace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.is_connected() { "UP" } else { "DOWN" }
    );
}

fn default_message_callback(_conn: &ConnHandle, buf: &mut Vec<u8>) {
    buf.clear();
}

/// A TCP server with the callback surface of a classic event loop.
pub struct CoTcpServer {
    sched: Scheduler,
    addr: SocketAddr,
    name: String,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_cb: Option<(HighWaterMarkCallback, usize)>,
    started: AtomicBool,
    active: Arc<AtomicUsize>,
    next_conn_id: Arc<AtomicU64>,
}

impl CoTcpServer {
    pub fn new(sched: &Scheduler, addr: SocketAddr, name: impl Into<String>) -> Self {
        Self {
            sched: sched.clone(),
            addr,
            name: name.into(),
            connection_cb: Arc::new(default_connection_callback),
            message_cb: Arc::new(default_message_callback),
            write_complete_cb: None,
            high_water_cb: None,
            started: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn set_connection_callback(
        &mut self,
        cb: impl Fn(&ConnHandle) + Send + Sync + 'static,
    ) {
        self.connection_cb = Arc::new(cb);
    }

    pub fn set_message_callback(
        &mut self,
        cb: impl Fn(&ConnHandle, &mut Vec<u8>) + Send + Sync + 'static,
    ) {
        self.message_cb = Arc::new(cb);
    }

    pub fn set_write_complete_callback(
        &mut self,
        cb: impl Fn(&ConnHandle) + Send + Sync + 'static,
    ) {
        self.write_complete_cb = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &mut self,
        cb: impl Fn(&ConnHandle, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.high_water_cb = Some((Arc::new(cb), mark));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connections currently established.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Bind the listening socket and post the acceptor coroutine.
    ///
    /// Callbacks must be set before this; the Scheduler must already be
    /// started. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = CoTcpListener::bind(self.addr)?;
        kinfo!("server '{}' listening on {}", self.name, listener.local_addr());

        let ctx = AcceptContext {
            sched: self.sched.clone(),
            name: self.name.clone(),
            connection_cb: self.connection_cb.clone(),
            message_cb: self.message_cb.clone(),
            write_complete_cb: self.write_complete_cb.clone(),
            high_water_cb: self.high_water_cb.clone(),
            active: self.active.clone(),
            next_conn_id: self.next_conn_id.clone(),
        };
        let acceptor_name = format!("{}-acceptor", self.name);
        self.sched
            .post(move || accept_loop(listener, ctx), acceptor_name);
        Ok(())
    }
}

/// Everything a connection handler needs, cloned per connection.
#[derive(Clone)]
struct AcceptContext {
    sched: Scheduler,
    name: String,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_cb: Option<(HighWaterMarkCallback, usize)>,
    active: Arc<AtomicUsize>,
    next_conn_id: Arc<AtomicU64>,
}

fn accept_loop(listener: CoTcpListener, ctx: AcceptContext) {
    loop {
        match listener.accept_raw() {
            Ok((fd, peer)) => {
                let id = ctx.next_conn_id.fetch_add(1, Ordering::Relaxed);
                let conn_name = format!("{}#{}", ctx.name, id);
                ktrace!("accepted {} from {}", conn_name, peer);
                ctx.active.fetch_add(1, Ordering::Relaxed);
                let handler_ctx = ctx.clone();
                let task_name = conn_name.clone();
                // The raw fd crosses threads; the connection object is
                // built on the Processor that will own it
                ctx.sched.post(
                    move || handle_connection(fd, conn_name, handler_ctx),
                    task_name,
                );
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                ktrace!("acceptor '{}' cancelled", ctx.name);
                break;
            }
            Err(e) => {
                kerror!("accept on '{}': {}", ctx.name, e);
                break;
            }
        }
    }
}

fn handle_connection(fd: RawFd, conn_name: String, ctx: AcceptContext) {
    let conn = match CoTcpConnection::from_fd(fd, conn_name) {
        Ok(c) => c,
        Err(e) => {
            kerror!("connection setup: {}", e);
            unsafe { libc::close(fd) };
            ctx.active.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };

    if let Some(cb) = &ctx.write_complete_cb {
        let cb = cb.clone();
        conn.set_write_complete_callback(move |c| cb(c));
    }
    if let Some((cb, mark)) = &ctx.high_water_cb {
        let cb = cb.clone();
        conn.set_high_water_mark_callback(move |c, n| cb(c, n), *mark);
    }

    (ctx.connection_cb)(&conn);

    let mut chunk = vec![0u8; 4096];
    let mut inbox: Vec<u8> = Vec::new();
    loop {
        match conn.recv(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                inbox.extend_from_slice(&chunk[..n]);
                (ctx.message_cb)(&conn, &mut inbox);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => break,
            Err(e) => {
                kerror!("recv on '{}': {}", conn.name(), e);
                break;
            }
        }
    }

    conn.close();
    (ctx.connection_cb)(&conn); // DOWN notification, exactly once
    ctx.active.fetch_sub(1, Ordering::Relaxed);
}
