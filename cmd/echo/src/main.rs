//! Strand Echo Server
//!
//! Multi-threaded TCP echo server driven entirely by coroutines: one
//! acceptor coroutine plus one coroutine per connection, spread
//! round-robin over the worker Processors.
//!
//! Usage:
//!     cargo run --release -p strand-echo [port] [threads]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!
//!     # A hundred concurrent clients:
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done

use std::net::SocketAddr;

use anyhow::{Context, Result};
use strand::{CoTcpServer, RuntimeConfig, Scheduler};

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let port: u16 = args
        .next()
        .unwrap_or_else(|| "9999".into())
        .parse()
        .context("invalid port")?;
    let threads: usize = args
        .next()
        .unwrap_or_else(|| "4".into())
        .parse()
        .context("invalid thread count")?;

    let sched = Scheduler::new(RuntimeConfig::default().thread_count(threads));
    sched.start_async()?;

    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let mut server = CoTcpServer::new(&sched, addr, "echo");
    server.set_connection_callback(|conn| {
        eprintln!(
            "{} {} ({})",
            if conn.is_connected() { "+" } else { "-" },
            conn.name(),
            conn.peer_addr()
        );
    });
    server.set_message_callback(|conn, buf| {
        if !buf.is_empty() {
            if let Err(e) = conn.send(buf) {
                eprintln!("echo to {}: {}", conn.name(), e);
            }
            buf.clear();
        }
    });
    server
        .start()
        .with_context(|| format!("binding {}", addr))?;

    eprintln!("echo server on {} with {} thread(s)", addr, threads);
    sched.wait();
    Ok(())
}
