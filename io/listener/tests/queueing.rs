//! Integration tests for the notification-queue path: saturation drops,
//! deadline expiry, consumer removal with queued messages, and
//! shutdown-set hand-off.

use std::net::{SocketAddr, TcpStream};
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use listener::{
    AcceptCallback, AcceptInfo, ConnectionEventCallback, ServerSocket, ShutdownSocketSet,
};
use reactor::{Handle, LocalHandle, Reactor};
use socket2::SockAddr;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Clone)]
enum Event {
    Started,
    Stopped,
    Conn(u16),
    Enqueued,
    Dequeued,
    Dropped(String),
}

/// Consumer that reports lifecycle events and can block inside
/// `connection_accepted` until the test releases it.
struct GatedCallback {
    events: Sender<Event>,
    gate: Option<Arc<Gate>>,
}

struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }
}

impl AcceptCallback for GatedCallback {
    fn accept_started(&self) {
        self.events.send(Event::Started).unwrap();
    }

    fn accept_stopped(&self) {
        self.events.send(Event::Stopped).unwrap();
    }

    fn connection_accepted(&self, conn: OwnedFd, peer: SockAddr, _info: AcceptInfo) {
        let port = peer.as_socket().map(|a| a.port()).unwrap_or(0);
        self.events.send(Event::Conn(port)).unwrap();
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        drop(conn);
    }

    fn accept_error(&self, error: std::io::Error) {
        panic!("unexpected accept error: {error}");
    }
}

/// Observer that forwards queue-path events to the test.
struct QueueObserver {
    events: Sender<Event>,
}

impl ConnectionEventCallback for QueueObserver {
    fn on_connection_enqueued_for_acceptor_callback(
        &self,
        _fd: std::os::fd::RawFd,
        _peer: &SockAddr,
    ) {
        self.events.send(Event::Enqueued).unwrap();
    }

    fn on_connection_dequeued_by_acceptor_callback(
        &self,
        _fd: std::os::fd::RawFd,
        _peer: &SockAddr,
    ) {
        self.events.send(Event::Dequeued).unwrap();
    }

    fn on_connection_dropped(&self, _fd: std::os::fd::RawFd, _peer: &SockAddr, reason: &str) {
        self.events.send(Event::Dropped(reason.to_string())).unwrap();
    }
}

type Control = Box<dyn FnOnce(&Rc<ServerSocket>) + Send>;

/// Poll the control channel on the listener's reactor so tests can run
/// listener operations on the correct thread.
fn pump_controls(local: LocalHandle, controls: Receiver<Control>, socket: Rc<ServerSocket>) {
    let next = local.clone();
    local.schedule_timer(Duration::from_millis(5), move || {
        while let Ok(op) = controls.try_recv() {
            op(&socket);
        }
        pump_controls(next, controls, socket);
    });
}

struct ListenerFixture {
    handle: Handle,
    addr: SocketAddr,
    controls: Sender<Control>,
    join: thread::JoinHandle<()>,
}

impl ListenerFixture {
    fn start<F>(configure: F) -> Self
    where
        F: FnOnce(&Rc<ServerSocket>) + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let (controls_tx, controls_rx) = unbounded();
        let join = thread::Builder::new()
            .name("listener".to_string())
            .spawn(move || {
                let reactor = Reactor::new().unwrap();
                let socket = ServerSocket::new(reactor.local());
                socket
                    .bind(&SockAddr::from(
                        "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
                    ))
                    .unwrap();
                socket.listen(128).unwrap();
                configure(&socket);
                socket.start_accepting().unwrap();
                let addr = socket.local_addr().unwrap().as_socket().unwrap();
                pump_controls(reactor.local(), controls_rx, socket.clone());
                tx.send((reactor.handle(), addr)).unwrap();
                reactor.run().unwrap();
                socket.destroy();
            })
            .unwrap();
        let (handle, addr) = rx.recv().unwrap();
        Self {
            handle,
            addr,
            controls: controls_tx,
            join,
        }
    }

    /// Run an operation on the listener thread and wait for its result.
    fn with_socket<R, F>(&self, op: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&Rc<ServerSocket>) -> R + Send + 'static,
    {
        let (tx, rx) = unbounded();
        self.controls
            .send(Box::new(move |socket| {
                tx.send(op(socket)).unwrap();
            }))
            .unwrap();
        rx.recv_timeout(RECV_TIMEOUT).unwrap()
    }

    fn stop(self) {
        self.handle.shutdown();
        self.join.join().unwrap();
    }
}

fn spawn_reactor(name: &'static str) -> (Handle, thread::JoinHandle<()>) {
    let (tx, rx) = unbounded();
    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let reactor = Reactor::new().unwrap();
            tx.send(reactor.handle()).unwrap();
            reactor.run().unwrap();
        })
        .unwrap();
    (rx.recv().unwrap(), join)
}

fn expect(events: &Receiver<Event>, expected: &Event) {
    let got = events.recv_timeout(RECV_TIMEOUT).expect("no event");
    assert_eq!(&got, expected);
}

fn expect_conn(events: &Receiver<Event>) -> u16 {
    match events.recv_timeout(RECV_TIMEOUT).expect("no event") {
        Event::Conn(port) => port,
        other => panic!("expected a connection, got {other:?}"),
    }
}

#[test]
fn saturated_queues_drop_with_full_rotation() {
    let (worker, worker_join) = spawn_reactor("worker");
    let (events_tx, events) = unbounded();
    let gate = Gate::new();

    let fixture = {
        let events_tx = events_tx.clone();
        let gate = gate.clone();
        let worker = worker.clone();
        ListenerFixture::start(move |socket| {
            socket.set_max_messages_in_queue(1);
            socket.set_connection_event_callback(Some(Arc::new(QueueObserver {
                events: events_tx.clone(),
            })));
            socket
                .add_accept_callback(
                    Arc::new(GatedCallback {
                        events: events_tx,
                        gate: Some(gate),
                    }),
                    Some(worker),
                    5,
                )
                .unwrap();
        })
    };
    expect(&events, &Event::Started);

    // First connection crosses the queue and blocks inside the consumer.
    let c1 = TcpStream::connect(fixture.addr).unwrap();
    expect(&events, &Event::Enqueued);
    expect(&events, &Event::Dequeued);
    let p1 = expect_conn(&events);
    assert_eq!(p1, c1.local_addr().unwrap().port());

    // Second connection parks in the queue, filling it.
    let _c2 = TcpStream::connect(fixture.addr).unwrap();
    expect(&events, &Event::Enqueued);

    // Third connection finds every queue full after a whole rotation.
    let _c3 = TcpStream::connect(fixture.addr).unwrap();
    match events.recv_timeout(RECV_TIMEOUT).expect("no event") {
        Event::Dropped(reason) => assert!(reason.contains("queues are full"), "{reason}"),
        other => panic!("expected a drop, got {other:?}"),
    }
    assert_eq!(fixture.with_socket(|s| s.num_dropped_connections()), 1);

    // Releasing the consumer drains the parked connection.
    gate.release();
    expect(&events, &Event::Dequeued);
    expect_conn(&events);

    fixture.stop();
    worker.shutdown();
    worker_join.join().unwrap();
}

#[test]
fn queued_connection_past_deadline_is_dropped_on_dequeue() {
    let (worker, worker_join) = spawn_reactor("worker");
    let (events_tx, events) = unbounded();

    let fixture = {
        let events_tx = events_tx.clone();
        let worker = worker.clone();
        ListenerFixture::start(move |socket| {
            socket.set_queue_timeout(Duration::from_millis(10));
            socket.set_connection_event_callback(Some(Arc::new(QueueObserver {
                events: events_tx.clone(),
            })));
            socket
                .add_accept_callback(
                    Arc::new(GatedCallback {
                        events: events_tx,
                        gate: None,
                    }),
                    Some(worker),
                    5,
                )
                .unwrap();
        })
    };
    expect(&events, &Event::Started);

    // Stall the consumer reactor well past the deadline before connecting.
    let (stalled_tx, stalled_rx) = unbounded();
    worker.post(move || {
        stalled_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(300));
    });
    stalled_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    let _c1 = TcpStream::connect(fixture.addr).unwrap();
    expect(&events, &Event::Enqueued);
    match events.recv_timeout(RECV_TIMEOUT).expect("no event") {
        Event::Dropped(reason) => {
            assert!(reason.contains("deadline"), "{reason}");
        }
        other => panic!("expected a deadline drop, got {other:?}"),
    }

    fixture.stop();
    worker.shutdown();
    worker_join.join().unwrap();
}

#[test]
fn removal_with_queued_message_delivers_before_stopping() {
    let (worker, worker_join) = spawn_reactor("worker");
    let (events_tx, events) = unbounded();
    let callback: Arc<GatedCallback> = Arc::new(GatedCallback {
        events: events_tx.clone(),
        gate: None,
    });

    let fixture = {
        let callback = callback.clone();
        let events_tx = events_tx.clone();
        let worker = worker.clone();
        ListenerFixture::start(move |socket| {
            socket.set_connection_event_callback(Some(Arc::new(QueueObserver {
                events: events_tx,
            })));
            socket
                .add_accept_callback(callback, Some(worker), 5)
                .unwrap();
        })
    };
    expect(&events, &Event::Started);

    // Stall the consumer so the connection stays queued across removal.
    let (stalled_tx, stalled_rx) = unbounded();
    worker.post(move || {
        stalled_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(300));
    });
    stalled_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    let c1 = TcpStream::connect(fixture.addr).unwrap();
    expect(&events, &Event::Enqueued);

    let removed: Arc<dyn AcceptCallback> = callback;
    fixture.with_socket(move |socket| {
        socket.remove_accept_callback(&removed, None).unwrap();
    });

    // The queued connection drains on the consumer's reactor first, then
    // accept_stopped runs there.
    expect(&events, &Event::Dequeued);
    assert_eq!(expect_conn(&events), c1.local_addr().unwrap().port());
    expect(&events, &Event::Stopped);

    fixture.stop();
    worker.shutdown();
    worker_join.join().unwrap();
}

#[test]
fn shutdown_socket_set_closes_each_socket_exactly_once() {
    let set = Arc::new(ShutdownSocketSet::new());
    let (tx, rx) = unbounded();
    let set_for_thread = set.clone();
    let join = thread::spawn(move || {
        let reactor = Reactor::new().unwrap();
        let socket = ServerSocket::new(reactor.local());
        socket.set_shutdown_socket_set(Arc::downgrade(&set_for_thread));
        socket
            .bind(&SockAddr::from(
                "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            ))
            .unwrap();
        socket.listen(16).unwrap();
        assert_eq!(set_for_thread.len(), 1);
        socket.stop_accepting(None).unwrap();
        tx.send(set_for_thread.len()).unwrap();
    });
    let remaining = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    join.join().unwrap();
    assert_eq!(remaining, 0);
    assert!(set.is_empty());
}

#[test]
fn adopted_sockets_accept_connections() {
    let pre_bound = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = pre_bound.local_addr().unwrap();
    let fd: OwnedFd = pre_bound.into();

    let (events_tx, events) = unbounded();
    let (tx, rx) = unbounded();
    let join = thread::spawn(move || {
        let reactor = Reactor::new().unwrap();
        let socket = ServerSocket::new(reactor.local());
        socket.use_existing_sockets(vec![fd]).unwrap();
        socket
            .add_accept_callback(
                Arc::new(GatedCallback {
                    events: events_tx,
                    gate: None,
                }),
                None,
                5,
            )
            .unwrap();
        socket.start_accepting().unwrap();
        assert_eq!(
            socket.local_addr().unwrap().as_socket().unwrap().port(),
            addr.port()
        );
        tx.send(reactor.handle()).unwrap();
        reactor.run().unwrap();
        socket.destroy();
    });
    let handle = rx.recv_timeout(RECV_TIMEOUT).unwrap();

    expect(&events, &Event::Started);
    let c1 = TcpStream::connect(addr).unwrap();
    assert_eq!(expect_conn(&events), c1.local_addr().unwrap().port());

    handle.shutdown();
    join.join().unwrap();
}
