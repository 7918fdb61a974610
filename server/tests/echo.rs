//! End-to-end tests: the echo server over real TCP, including graceful
//! shutdown.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a test server and return its shutdown flag.
fn start_test_server(port: u16, threads: usize) -> (thread::JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    let handle = thread::spawn(move || {
        let config_str = format!(
            r#"
            [workers]
            threads = {threads}

            [listener]
            address = "127.0.0.1:{port}"
            backlog = 128
            "#
        );
        let config: server::Config = toml::from_str(&config_str).unwrap();
        server::run(&config, shutdown_clone).unwrap();
    });

    (handle, shutdown)
}

fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("server never came up: {e}"),
        }
    }
}

fn echo_round_trip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).unwrap();
    stream.flush().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let mut received = vec![0u8; payload.len()];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(received, payload);
}

fn wait_for_exit(handle: thread::JoinHandle<()>) {
    let start = Instant::now();
    while !handle.is_finished() && start.elapsed() < Duration::from_secs(3) {
        thread::sleep(Duration::from_millis(50));
    }
    assert!(handle.is_finished(), "server did not shut down in time");
    handle.join().unwrap();
}

#[test]
fn echoes_bytes_through_worker_reactors() {
    let port = get_available_port();
    let (handle, shutdown) = start_test_server(port, 2);
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut streams: Vec<TcpStream> = (0..4).map(|_| connect_with_retry(addr)).collect();
    for (i, stream) in streams.iter_mut().enumerate() {
        stream.set_nodelay(true).unwrap();
        echo_round_trip(stream, format!("hello from client {i}\n").as_bytes());
    }

    // A second round on the same connections exercises persistent echo
    // state on the workers.
    for stream in streams.iter_mut() {
        echo_round_trip(stream, b"second round\n");
    }

    drop(streams);
    shutdown.store(true, Ordering::SeqCst);
    wait_for_exit(handle);
}

#[test]
fn echoes_on_the_listener_reactor_with_zero_workers() {
    let port = get_available_port();
    let (handle, shutdown) = start_test_server(port, 0);
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut stream = connect_with_retry(addr);
    echo_round_trip(&mut stream, b"in-thread fast path\n");

    drop(stream);
    shutdown.store(true, Ordering::SeqCst);
    wait_for_exit(handle);
}

#[test]
fn stops_accepting_after_shutdown() {
    let port = get_available_port();
    let (handle, shutdown) = start_test_server(port, 1);
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut stream = connect_with_retry(addr);
    echo_round_trip(&mut stream, b"ping\n");
    drop(stream);

    shutdown.store(true, Ordering::SeqCst);
    wait_for_exit(handle);

    // The listening socket is gone; new connections must fail.
    assert!(TcpStream::connect(addr).is_err());
}
