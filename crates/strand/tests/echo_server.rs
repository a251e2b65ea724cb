//! End-to-end TCP scenarios over loopback.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strand::{CoTcpConnection, CoTcpServer, RuntimeConfig, Scheduler};

fn await_cond(probe: impl Fn() -> bool, what: &str, timeout: Duration) {
    let start = Instant::now();
    while !probe() {
        assert!(start.elapsed() < timeout, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Echo server scenario: many clients, each sends a distinct payload,
/// reads it back verbatim, and closes; all connections drain.
#[test]
fn echo_server_many_clients() {
    let sched = Scheduler::new(RuntimeConfig::default().thread_count(4));
    sched.start_async().unwrap();

    // Reserve an ephemeral port so clients know where to connect
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let mut server = CoTcpServer::new(&sched, addr, "echo");
    server.set_message_callback(|conn, buf| {
        if !buf.is_empty() {
            conn.send(buf).unwrap();
            buf.clear();
        }
    });
    server.start().unwrap();

    for i in 0..100 {
        let msg = format!("hello{}", i);
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(msg.as_bytes()).unwrap();

        let mut got = vec![0u8; msg.len()];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(got, msg.as_bytes());
        drop(stream);
    }

    // Every connection reaches the disconnected state
    await_cond(
        || server.active_connections() == 0,
        "connections to drain",
        Duration::from_secs(5),
    );

    sched.stop();
    sched.wait();
}

/// Connection callback fires once UP and once DOWN per connection.
#[test]
fn connection_callbacks_up_and_down() {
    let sched = Scheduler::new(RuntimeConfig::default().thread_count(2));
    sched.start_async().unwrap();

    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let ups = Arc::new(AtomicU32::new(0));
    let downs = Arc::new(AtomicU32::new(0));
    let mut server = CoTcpServer::new(&sched, addr, "watched");
    {
        let ups = ups.clone();
        let downs = downs.clone();
        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                ups.fetch_add(1, Ordering::Relaxed);
            } else {
                downs.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    server.start().unwrap();

    for _ in 0..5 {
        let stream = TcpStream::connect(addr).unwrap();
        drop(stream);
    }

    await_cond(
        || downs.load(Ordering::Relaxed) == 5,
        "disconnect callbacks",
        Duration::from_secs(5),
    );
    assert_eq!(ups.load(Ordering::Relaxed), 5);

    sched.stop();
    sched.wait();
}

/// Would-block suspend scenario: a coroutine recv on an idle socket
/// suspends (other coroutines keep running) and resumes exactly when
/// the peer sends one byte.
#[test]
fn recv_suspends_until_peer_sends() {
    let sched = Scheduler::new(RuntimeConfig::default().thread_count(1));
    sched.start_async().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicU32::new(0));

    {
        let events = events.clone();
        let done = done.clone();
        sched.post(
            move || {
                let conn = CoTcpConnection::connect(&addr, "probe").unwrap();
                events.lock().unwrap().push("recv-start".into());
                let mut buf = [0u8; 1];
                let n = conn.recv(&mut buf).unwrap();
                assert_eq!(n, 1);
                assert_eq!(buf[0], b'!');
                events.lock().unwrap().push("recv-done".into());
                done.fetch_add(1, Ordering::Relaxed);
            },
            "receiver",
        );
    }
    {
        // Proof the thread is not blocked while the receiver waits
        let events = events.clone();
        sched.post(
            move || {
                events.lock().unwrap().push("bystander".into());
            },
            "bystander",
        );
    }

    let (mut peer, _) = listener.accept().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    {
        let ev = events.lock().unwrap();
        assert!(ev.contains(&"recv-start".to_string()));
        assert!(ev.contains(&"bystander".to_string()));
        assert!(
            !ev.contains(&"recv-done".to_string()),
            "recv returned before any byte was sent"
        );
    }

    peer.write_all(b"!").unwrap();
    await_cond(
        || done.load(Ordering::Relaxed) == 1,
        "receiver to resume",
        Duration::from_secs(2),
    );

    sched.stop();
    sched.wait();
}

/// Round-trip ordering: bytes written via coroutine send come back in
/// order through coroutine recv.
#[test]
fn round_trip_order_preserved() {
    let sched = Scheduler::new(RuntimeConfig::default().thread_count(2));
    sched.start_async().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let done = Arc::new(AtomicU32::new(0));

    {
        let done = done.clone();
        sched.post(
            move || {
                let conn = CoTcpConnection::connect(&addr, "writer").unwrap();
                for i in 0..50u8 {
                    conn.send(&[i]).unwrap();
                }
                conn.shutdown().unwrap();
                done.fetch_add(1, Ordering::Relaxed);
            },
            "writer",
        );
    }

    let (mut peer, _) = listener.accept().unwrap();
    let mut got = Vec::new();
    peer.read_to_end(&mut got).unwrap();
    assert_eq!(got, (0..50u8).collect::<Vec<_>>());

    await_cond(
        || done.load(Ordering::Relaxed) == 1,
        "writer to finish",
        Duration::from_secs(2),
    );
    sched.stop();
    sched.wait();
}
