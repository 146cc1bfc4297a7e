//! End-to-end reactor scenarios (`spec.md` §8).

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use corewire::broker::{BrokerId, TimeoutPolicy};
use corewire::config::CoreConfig;
use corewire::core::Core;
use corewire::scheme::SchemeConfig;

fn run_until<F: FnMut() -> bool>(core: &mut Core, timeout: Duration, mut done: F) {
    let deadline = Instant::now() + timeout;
    loop {
        core.tick().expect("reactor tick");
        if done() || Instant::now() > deadline {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn new_core() -> Core {
    Core::new(CoreConfig::builder().signal_interception(false).dispatcher_frequency_ms(0).build())
        .expect("core init")
}

/// S1: server listens on an ephemeral port, a client connects, sends
/// "hello" (5 bytes), server's `read` receives it and writes it back,
/// client's `read` receives `"hello"`. Exactly one `connect` per side is
/// observed here on the server side (the client is a bare `std::net`
/// socket acting as the peer under test).
#[test]
fn s1_tcp_echo_round_trip() {
    let mut core = new_core();
    let sid = core.add(SchemeConfig::default());

    let received: Rc<RefCell<HashMap<BrokerId, Vec<u8>>>> = Rc::new(RefCell::new(HashMap::new()));
    let connects: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));

    {
        let sink = Rc::clone(&received);
        let connect_count = Rc::clone(&connects);
        let callbacks = core.scheme_callbacks(sid).expect("scheme callbacks");
        callbacks.on_read(Box::new(move |bid, bytes| {
            sink.borrow_mut().entry(bid).or_default().extend_from_slice(bytes);
        }));
        callbacks.on_connect(Box::new(move |_bid| {
            *connect_count.borrow_mut() += 1;
        }));
    }

    let server_bid = core.open_server(sid, "127.0.0.1:0".parse().unwrap()).expect("listen");
    let addr = core.local_addr(server_bid).expect("local_addr");

    core.start();

    let mut client = TcpStream::connect(addr).expect("client connect");
    client.set_nonblocking(true).expect("nonblocking");

    run_until(&mut core, Duration::from_secs(2), || *connects.borrow() >= 1);
    assert_eq!(*connects.borrow(), 1, "exactly one connect on the server side");

    client.write_all(b"hello").expect("client write");

    let server_bid_echo = run_until_bid_has_data(&mut core, &received, Duration::from_secs(2));

    assert_eq!(received.borrow().get(&server_bid_echo).unwrap(), b"hello");

    core.write(server_bid_echo, b"hello").expect("echo write");
    run_until(&mut core, Duration::from_secs(2), || false);

    let mut buf = [0u8; 16];
    let mut total = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while total.len() < 5 && Instant::now() < deadline {
        core.tick().expect("tick");
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => total.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("client read failed: {e}"),
        }
    }
    assert_eq!(total, b"hello");

    core.close(server_bid_echo);
    core.stop();
}

fn run_until_bid_has_data(
    core: &mut Core,
    received: &Rc<RefCell<HashMap<BrokerId, Vec<u8>>>>,
    timeout: Duration,
) -> BrokerId {
    let deadline = Instant::now() + timeout;
    loop {
        core.tick().expect("tick");
        if let Some((&bid, _)) = received.borrow().iter().next() {
            return bid;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for server read");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Connecting to a closed local port either fails fast or is reported
/// pending; either way the broker is immediately trackable and `close`
/// tears it down exactly once.
#[test]
fn connect_to_closed_port_is_trackable_and_closes_cleanly() {
    let mut core = new_core();
    let sid = core.add(SchemeConfig::default());

    let bid = core
        .open_client(sid, "127.0.0.1:1".parse().unwrap())
        .expect("connect call returns immediately");
    assert!(core.is_live(bid));
    core.close(bid);
    assert!(!core.is_live(bid));
}

/// Closing the same broker id twice is a no-op the second time.
#[test]
fn close_is_idempotent() {
    let mut core = new_core();
    let sid = core.add(SchemeConfig::default());
    let bid = core.open_client(sid, "127.0.0.1:1".parse().unwrap()).expect("connect call");
    core.close(bid);
    core.close(bid);
}

/// An idle reactor with a bound listener and no connections never panics
/// across repeated turns.
#[test]
fn idle_listener_survives_repeated_ticks() {
    let mut core = new_core();
    let sid = core.add(SchemeConfig::default());
    let _bid = core.open_server(sid, "127.0.0.1:0".parse().unwrap()).expect("listen");

    core.start();
    run_until(&mut core, Duration::from_millis(30), || false);
    core.stop();
}

/// S3: connecting to a black-holed address with a short connect watchdog
/// fires exactly one `timeout(bid, CONNECT)` followed by one `disconnect`,
/// and no `connect` callback ever fires for that broker. `10.255.255.1` is
/// the conventional non-routable test address several client libraries use
/// for exercising connect timeouts without depending on a cooperating peer.
#[test]
fn s3_connect_timeout_fires_once_then_disconnects() {
    let mut core = new_core();
    let sid = core.add(SchemeConfig {
        default_timeouts: TimeoutPolicy { connect_secs: Some(1), ..TimeoutPolicy::default() },
        ..SchemeConfig::default()
    });

    let timeouts: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    let disconnects: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    let connects: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    {
        let t = Rc::clone(&timeouts);
        let d = Rc::clone(&disconnects);
        let c = Rc::clone(&connects);
        let callbacks = core.scheme_callbacks(sid).expect("scheme callbacks");
        callbacks.on_timeout(Box::new(move |_bid, _tid| *t.borrow_mut() += 1));
        callbacks.on_disconnect(Box::new(move |_bid| *d.borrow_mut() += 1));
        callbacks.on_connect(Box::new(move |_bid| *c.borrow_mut() += 1));
    }

    let bid = core
        .open_client(sid, "10.255.255.1:1".parse().unwrap())
        .expect("connect call returns immediately, non-blocking");

    core.start();
    run_until(&mut core, Duration::from_secs(5), || *disconnects.borrow() >= 1);
    core.stop();

    assert_eq!(*timeouts.borrow(), 1, "exactly one connect timeout fired");
    assert_eq!(*disconnects.borrow(), 1, "exactly one disconnect followed the timeout");
    assert_eq!(*connects.borrow(), 0, "connect never completed for a black-holed peer");
    assert!(!core.is_live(bid));
}

/// `rebase()` between `stop()` and `start()` doesn't break subsequent use.
#[test]
fn rebase_then_restart_accepts_connections_again() {
    let mut core = new_core();
    let sid = core.add(SchemeConfig::default());
    let server_bid = core.open_server(sid, "127.0.0.1:0".parse().unwrap()).expect("listen");
    let addr = core.local_addr(server_bid).expect("local_addr");

    core.start();
    run_until(&mut core, Duration::from_millis(10), || false);
    core.stop();
    core.rebase().expect("rebase");

    let sid2 = core.add(SchemeConfig::default());
    let server_bid2 = core.open_server(sid2, "127.0.0.1:0".parse().unwrap()).expect("listen again");
    let addr2 = core.local_addr(server_bid2).expect("local_addr 2");
    assert_ne!(addr, addr2, "fresh ephemeral port after rebase + reopen");

    core.start();
    run_until(&mut core, Duration::from_millis(10), || false);
    core.stop();
}
