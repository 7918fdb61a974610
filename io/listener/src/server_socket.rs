//! The listening socket: bind/listen, the accept loop, consumer dispatch,
//! rate limiting, backoff, and teardown.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::Weak as ArcWeak;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use reactor::{Handle, IoHandler, LocalHandle, TimerId};
use socket2::{Domain, SockAddr, SockRef};

use crate::acceptor::RemoteAcceptor;
use crate::callback::{AcceptCallback, AcceptInfo, ConnectionEventCallback, accept_error};
use crate::error::{Error, Result};
use crate::handle::SocketHandle;
use crate::queue::{AcceptErrorMessage, Message, NewConn, channel};
use crate::rate::{AcceptRateLimiter, RateDecision};
use crate::shutdown::ShutdownSocketSet;
use crate::socket::{self, SocketOptions};

/// Cap on accepts per readable callback, so one busy listen socket cannot
/// starve the rest of the reactor.
pub const DEFAULT_MAX_ACCEPT_AT_ONCE: u32 = 30;
/// Cap on queue messages a remote consumer drains per task.
pub const DEFAULT_CALLBACK_ACCEPT_AT_ONCE: u32 = 5;
/// Default bound on each consumer's notification queue.
pub const DEFAULT_MAX_MESSAGES_IN_QUEUE: u32 = 1024;

/// Attempts to land the kernel-chosen IPv6 port on IPv4 as well when
/// binding the dual-stack wildcard with port 0.
const BIND_PORT_RETRIES: u32 = 25;

/// How long accepts stay paused after descriptor exhaustion.
const BACKOFF_TIMEOUT: Duration = Duration::from_millis(1000);

/// Minimum spacing of queue-saturation error logs.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// One registered consumer.
#[derive(Clone)]
struct CallbackEntry {
    callback: Arc<dyn AcceptCallback>,
    /// Target reactor. `None` means the listener's own reactor (fast path).
    target: Option<Handle>,
    /// Present iff `target` is set.
    acceptor: Option<RemoteAcceptor>,
}

impl CallbackEntry {
    fn matches(&self, callback: &Arc<dyn AcceptCallback>, target: Option<&Handle>) -> bool {
        Arc::ptr_eq(&self.callback, callback)
            && match target {
                None => true,
                Some(t) => self.target.as_ref() == Some(t),
            }
    }
}

/// One-shot timer disabling readability during resource-exhaustion backoff.
struct BackoffTimer {
    reactor: LocalHandle,
    scheduled: Cell<Option<TimerId>>,
}

impl BackoffTimer {
    fn new(reactor: LocalHandle) -> Self {
        Self {
            reactor,
            scheduled: Cell::new(None),
        }
    }

    fn schedule(&self, socket: Weak<ServerSocket>) {
        self.cancel();
        let id = self.reactor.schedule_timer(BACKOFF_TIMEOUT, move || {
            if let Some(socket) = socket.upgrade() {
                socket.scheduled_backoff_expired();
                socket.backoff_timeout_expired();
            }
        });
        self.scheduled.set(Some(id));
    }

    fn cancel(&self) {
        if let Some(id) = self.scheduled.take() {
            self.reactor.cancel_timer(id);
        }
    }
}

/// An asynchronous TCP/Unix-domain listening socket.
///
/// Owns one or more bound descriptors and dispatches accepted connections
/// to registered consumers, round-robin, either synchronously (consumer on
/// the listener's reactor) or through a bounded per-consumer queue drained
/// on the consumer's reactor.
///
/// All public mutators must run on the listener's reactor thread. Consumer
/// callbacks may re-enter the listener, including calling [`destroy`];
/// teardown is deferred until the accept loop unwinds.
///
/// [`destroy`]: ServerSocket::destroy
pub struct ServerSocket {
    reactor: RefCell<Option<LocalHandle>>,
    self_ref: RefCell<Weak<ServerSocket>>,

    sockets: RefCell<Vec<SocketHandle>>,
    pending_close: RefCell<Vec<OwnedFd>>,

    callbacks: RefCell<Vec<CallbackEntry>>,
    napi_map: RefCell<AHashMap<u32, CallbackEntry>>,
    callback_index: Cell<usize>,
    local_callback_index: Cell<Option<usize>>,

    accepting: Cell<bool>,
    destroy_pending: Cell<bool>,
    guards: Cell<usize>,

    max_accept_at_once: Cell<u32>,
    max_messages_in_queue: Cell<u32>,
    queue_timeout: Cell<Duration>,
    options: RefCell<SocketOptions>,
    listener_tos: Cell<u32>,

    limiter: RefCell<AcceptRateLimiter>,
    backoff_timer: RefCell<Option<BackoffTimer>>,
    num_dropped_connections: Cell<u64>,
    last_drop_log: Cell<Option<Instant>>,

    shutdown_set: RefCell<ArcWeak<ShutdownSocketSet>>,
    observer: RefCell<Option<Arc<dyn ConnectionEventCallback>>>,
}

struct DestructorGuard<'a> {
    socket: &'a ServerSocket,
}

impl<'a> DestructorGuard<'a> {
    fn new(socket: &'a ServerSocket) -> Self {
        socket.guards.set(socket.guards.get() + 1);
        Self { socket }
    }
}

impl Drop for DestructorGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.socket.guards.get() - 1;
        self.socket.guards.set(remaining);
        if remaining == 0 && self.socket.destroy_pending.get() {
            self.socket.destroy_pending.set(false);
            self.socket.finish_destroy();
        }
    }
}

impl ServerSocket {
    /// Create a listener attached to a reactor.
    pub fn new(reactor: LocalHandle) -> Rc<Self> {
        let socket = Self::detached();
        *socket.reactor.borrow_mut() = Some(reactor);
        socket
    }

    /// Create a listener with no reactor. It can bind and listen, but must
    /// be attached before accepting.
    pub fn detached() -> Rc<Self> {
        let socket = Rc::new(Self {
            reactor: RefCell::new(None),
            self_ref: RefCell::new(Weak::new()),
            sockets: RefCell::new(Vec::new()),
            pending_close: RefCell::new(Vec::new()),
            callbacks: RefCell::new(Vec::new()),
            napi_map: RefCell::new(AHashMap::new()),
            callback_index: Cell::new(0),
            local_callback_index: Cell::new(None),
            accepting: Cell::new(false),
            destroy_pending: Cell::new(false),
            guards: Cell::new(0),
            max_accept_at_once: Cell::new(DEFAULT_MAX_ACCEPT_AT_ONCE),
            max_messages_in_queue: Cell::new(DEFAULT_MAX_MESSAGES_IN_QUEUE),
            queue_timeout: Cell::new(Duration::ZERO),
            options: RefCell::new(SocketOptions::default()),
            listener_tos: Cell::new(0),
            limiter: RefCell::new(AcceptRateLimiter::new()),
            backoff_timer: RefCell::new(None),
            num_dropped_connections: Cell::new(0),
            last_drop_log: Cell::new(None),
            shutdown_set: RefCell::new(ArcWeak::new()),
            observer: RefCell::new(None),
        });
        *socket.self_ref.borrow_mut() = Rc::downgrade(&socket);
        socket
    }

    /// Attach a detached listener to a reactor.
    pub fn attach_reactor(&self, reactor: LocalHandle) -> Result<()> {
        if self.reactor.borrow().is_some() {
            return Err(Error::InvalidArgument("listener already has a reactor"));
        }
        *self.reactor.borrow_mut() = Some(reactor);
        Ok(())
    }

    /// Detach from the current reactor. The listener must not be accepting.
    pub fn detach_reactor(&self) -> Result<()> {
        self.check_reactor_thread();
        if self.accepting.get() {
            return Err(Error::InvalidArgument(
                "cannot detach a listener while accepting",
            ));
        }
        self.reactor.borrow_mut().take();
        Ok(())
    }

    /// Replace the shutdown-socket-set registration, transferring every
    /// currently bound descriptor from the old set to the new one.
    pub fn set_shutdown_socket_set(&self, new_set: ArcWeak<ShutdownSocketSet>) {
        let old = self.shutdown_set.borrow().upgrade();
        let new = new_set.upgrade();
        if match (&old, &new) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        } {
            return;
        }
        if let Some(old) = old {
            for handle in self.sockets.borrow().iter() {
                old.remove(handle.raw());
            }
        }
        if let Some(new) = new {
            for handle in self.sockets.borrow().iter() {
                new.add(handle.raw());
            }
        }
        *self.shutdown_set.borrow_mut() = new_set;
    }

    /// Observer for connection-level events. Must be installed before
    /// consumers are added; remote acceptors capture it at registration.
    pub fn set_connection_event_callback(&self, observer: Option<Arc<dyn ConnectionEventCallback>>) {
        self.check_reactor_thread();
        *self.observer.borrow_mut() = observer;
    }

    // === Binding =========================================================

    /// Adopt pre-created (possibly pre-bound) descriptors. Fails if the
    /// listener already has sockets.
    pub fn use_existing_sockets(&self, fds: Vec<OwnedFd>) -> Result<()> {
        self.check_reactor_thread();
        if !self.sockets.borrow().is_empty() {
            return Err(Error::InvalidArgument(
                "cannot adopt sockets on a listener that already has a socket",
            ));
        }
        let opts = self.options.borrow().clone();
        for fd in fds {
            let domain = SockRef::from(&fd)
                .local_addr()
                .map(|a| a.domain())
                .map_err(|e| Error::system("failed to read address family of socket", e))?;
            socket::setup_socket(fd.as_raw_fd(), domain, &opts)?;
            self.add_to_shutdown_set(fd.as_raw_fd());
            self.sockets.borrow_mut().push(SocketHandle::new(fd, domain));
        }
        Ok(())
    }

    pub fn use_existing_socket(&self, fd: OwnedFd) -> Result<()> {
        self.use_existing_sockets(vec![fd])
    }

    /// Bind to one address, creating a socket or reusing a single
    /// pre-installed one.
    pub fn bind(&self, addr: &SockAddr) -> Result<()> {
        self.bind_internal(addr, None)
    }

    /// Bind to one address on a specific network interface
    /// (`SO_BINDTODEVICE`).
    pub fn bind_to_device(&self, addr: &SockAddr, if_name: &str) -> Result<()> {
        self.bind_internal(addr, Some(if_name))
    }

    /// Bind one socket per IP address, all on the same port.
    pub fn bind_addresses(&self, ips: &[IpAddr], port: u16) -> Result<()> {
        self.check_reactor_thread();
        if ips.is_empty() {
            return Err(Error::InvalidArgument("no ip addresses were provided"));
        }
        for ip in ips {
            let addr = SockAddr::from(SocketAddr::new(*ip, port));
            self.bind_new_socket(&addr, None)?;
        }
        Ok(())
    }

    /// Bind one socket per (IP, interface) pair, all on the same port.
    pub fn bind_addresses_with_interfaces(
        &self,
        pairs: &[(IpAddr, String)],
        port: u16,
    ) -> Result<()> {
        self.check_reactor_thread();
        if pairs.is_empty() {
            return Err(Error::InvalidArgument("no ip addresses were provided"));
        }
        for (ip, if_name) in pairs {
            let addr = SockAddr::from(SocketAddr::new(*ip, port));
            self.bind_new_socket(&addr, Some(if_name))?;
        }
        Ok(())
    }

    /// Bind the dual-stack wildcard: IPv6 first, then IPv4 on the same
    /// port. With `port == 0` the ephemeral port the kernel assigned to
    /// IPv6 is reused for IPv4; if that port is unavailable on IPv4 the
    /// whole bind restarts, up to 25 times.
    pub fn bind_port(&self, port: u16) -> Result<()> {
        self.check_reactor_thread();
        let mut tries = 1u32;
        loop {
            let mut chosen_port = port;

            match self.bind_wildcard(Domain::IPV6, chosen_port) {
                Ok(()) | Err(BindWildcardError::Unsupported) => {}
                Err(BindWildcardError::Failed(e)) => return Err(e),
            }

            if port == 0
                && let Some(handle) = self.sockets.borrow().last()
                && let Ok(addr) = handle.local_addr()
                && let Some(inet) = addr.as_socket()
            {
                chosen_port = inet.port();
            }

            match self.bind_wildcard(Domain::IPV4, chosen_port) {
                Ok(()) | Err(BindWildcardError::Unsupported) => break,
                Err(BindWildcardError::Failed(e)) => {
                    let have_sockets = !self.sockets.borrow().is_empty();
                    if port == 0 && have_sockets && tries != BIND_PORT_RETRIES {
                        // The kernel handed us an IPv6 port that something
                        // else already holds on IPv4. Start over.
                        for handle in self.sockets.borrow_mut().drain(..) {
                            self.discard_socket(handle.into_fd());
                        }
                        tries += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        if self.sockets.borrow().is_empty() {
            return Err(Error::NoBoundSockets);
        }
        Ok(())
    }

    fn bind_wildcard(
        &self,
        domain: Domain,
        port: u16,
    ) -> std::result::Result<(), BindWildcardError> {
        let addr: SocketAddr = if domain == Domain::IPV6 {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        };
        let opts = self.options.borrow().clone();
        let fd = match socket::create_socket(domain, &opts) {
            Ok(fd) => fd,
            Err(Error::System { source, .. })
                if source.raw_os_error() == Some(libc::EAFNOSUPPORT) =>
            {
                return Err(BindWildcardError::Unsupported);
            }
            Err(e) => return Err(BindWildcardError::Failed(e)),
        };

        if domain == Domain::IPV6
            && let Err(e) = SockRef::from(&fd).set_only_v6(true)
        {
            return Err(BindWildcardError::Failed(Error::system(
                "failed to set IPV6_V6ONLY on server socket",
                e,
            )));
        }

        if let Err(e) = SockRef::from(&fd).bind(&SockAddr::from(addr)) {
            return Err(BindWildcardError::Failed(Error::system(
                format!("failed to bind to server socket for port {port}"),
                e,
            )));
        }

        self.add_to_shutdown_set(fd.as_raw_fd());
        self.sockets.borrow_mut().push(SocketHandle::new(fd, domain));
        Ok(())
    }

    fn bind_internal(&self, addr: &SockAddr, if_name: Option<&str>) -> Result<()> {
        self.check_reactor_thread();
        let count = self.sockets.borrow().len();
        match count {
            0 => self.bind_new_socket(addr, if_name),
            1 => {
                // A pre-installed socket (use_existing_socket); bind it in
                // place and keep it on failure, since we do not own its
                // creation.
                let sockets = self.sockets.borrow();
                let handle = &sockets[0];
                if handle.domain() != addr.domain() {
                    return Err(Error::InvalidArgument(
                        "attempted to bind address to socket with a different address family",
                    ));
                }
                self.bind_fd(handle.raw(), addr, if_name)
            }
            _ => Err(Error::InvalidArgument("attempted to bind to multiple fds")),
        }
    }

    fn bind_new_socket(&self, addr: &SockAddr, if_name: Option<&str>) -> Result<()> {
        let opts = self.options.borrow().clone();
        let fd = socket::create_socket(addr.domain(), &opts)?;
        self.add_to_shutdown_set(fd.as_raw_fd());
        if let Err(e) = self.bind_fd(fd.as_raw_fd(), addr, if_name) {
            self.discard_socket(fd);
            return Err(e);
        }
        self.sockets
            .borrow_mut()
            .push(SocketHandle::new(fd, addr.domain()));
        Ok(())
    }

    fn bind_fd(&self, fd: RawFd, addr: &SockAddr, if_name: Option<&str>) -> Result<()> {
        if let Some(if_name) = if_name
            && let Err(e) = socket::bind_to_device(fd, if_name)
        {
            return Err(Error::system(format!("failed to bind to device: {if_name}"), e));
        }
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        if let Err(e) = SockRef::from(&borrowed).bind(addr)
            // Some socket types report EINPROGRESS for a bind that has in
            // fact been accepted.
            && e.raw_os_error() != Some(libc::EINPROGRESS)
        {
            return Err(Error::system(
                format!("failed to bind to server socket: {addr:?}"),
                e,
            ));
        }
        Ok(())
    }

    /// Start listening on every bound socket.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.check_reactor_thread();
        for handle in self.sockets.borrow().iter() {
            handle
                .listen(backlog)
                .map_err(|e| Error::system("failed to listen on server socket", e))?;
        }
        Ok(())
    }

    /// Local address of the first bound socket.
    pub fn local_addr(&self) -> Result<SockAddr> {
        let sockets = self.sockets.borrow();
        if sockets.is_empty() {
            return Err(Error::NoBoundSockets);
        }
        if sockets.len() > 1 {
            tracing::warn!(
                "local_addr() called with {} addresses available; returning the first",
                sockets.len()
            );
        }
        sockets[0]
            .local_addr()
            .map_err(|e| Error::system("failed to get local address", e))
    }

    /// Local addresses of every bound socket, in bind order.
    pub fn local_addrs(&self) -> Result<Vec<SockAddr>> {
        let sockets = self.sockets.borrow();
        if sockets.is_empty() {
            return Err(Error::NoBoundSockets);
        }
        sockets
            .iter()
            .map(|s| {
                s.local_addr()
                    .map_err(|e| Error::system("failed to get local address", e))
            })
            .collect()
    }

    // === Consumer registration ===========================================

    /// Register a consumer. With `target == None` the callback runs
    /// synchronously on the listener's reactor; otherwise a remote acceptor
    /// is started on `target` and connections cross a bounded queue,
    /// draining at most `max_at_once` per wakeup.
    ///
    /// If this is the first consumer and the listener is already accepting,
    /// accepting resumes immediately.
    pub fn add_accept_callback(
        self: &Rc<Self>,
        callback: Arc<dyn AcceptCallback>,
        target: Option<Handle>,
        max_at_once: u32,
    ) -> Result<()> {
        self.check_reactor_thread();
        let run_start_accepting = self.accepting.get() && self.callbacks.borrow().is_empty();

        let entry = match &target {
            None => CallbackEntry {
                callback: callback.clone(),
                target: None,
                acceptor: None,
            },
            Some(handle) => {
                let (queue, rx) = channel();
                let acceptor = RemoteAcceptor::new(
                    callback.clone(),
                    self.observer.borrow().clone(),
                    handle.clone(),
                    queue,
                    rx,
                );
                acceptor.start(max_at_once);
                CallbackEntry {
                    callback: callback.clone(),
                    target: Some(handle.clone()),
                    acceptor: Some(acceptor),
                }
            }
        };

        if let Some(napi_id) = target.as_ref().and_then(|h| h.napi_id()) {
            self.napi_map.borrow_mut().insert(napi_id, entry.clone());
        }

        {
            let mut callbacks = self.callbacks.borrow_mut();
            callbacks.push(entry);
            if self.local_callback_index.get().is_none()
                && let (Some(reactor), Some(target)) = (self.reactor.borrow().as_ref(), &target)
                && reactor.id() == target.id()
            {
                self.local_callback_index.set(Some(callbacks.len() - 1));
            }
        }

        if target.is_none() {
            // Runs on the listener's reactor; no queue round-trip needed.
            callback.accept_started();
        }

        if run_start_accepting {
            self.start_accepting()?;
        }
        Ok(())
    }

    /// Remove the first consumer matching `callback` (and `target`, when
    /// given). The consumer's `accept_stopped` runs on its own reactor
    /// after its queue drains. Removing the last consumer unsubscribes
    /// readable events but leaves the accepting intent in place.
    pub fn remove_accept_callback(
        &self,
        callback: &Arc<dyn AcceptCallback>,
        target: Option<&Handle>,
    ) -> Result<()> {
        self.check_reactor_thread();

        let removed = {
            let mut callbacks = self.callbacks.borrow_mut();
            let pos = callbacks
                .iter()
                .position(|e| e.matches(callback, target))
                .ok_or(Error::CallbackNotFound)?;

            self.napi_map
                .borrow_mut()
                .retain(|_, entry| !entry.matches(callback, target));

            let removed = callbacks.remove(pos);

            // Keep the round-robin cursor stable relative to the entries
            // that shifted down, and in range.
            let cursor = self.callback_index.get();
            if pos < cursor {
                self.callback_index.set(cursor - 1);
            } else if self.callback_index.get() >= callbacks.len() {
                self.callback_index.set(0);
            }
            match self.local_callback_index.get() {
                Some(local) if local == pos => self.local_callback_index.set(None),
                Some(local) if local > pos => self.local_callback_index.set(Some(local - 1)),
                _ => {}
            }
            removed
        };

        match removed.acceptor {
            Some(acceptor) => acceptor.stop(),
            None => removed.callback.accept_stopped(),
        }

        if self.accepting.get() && self.callbacks.borrow().is_empty() {
            self.unregister_all();
        }
        Ok(())
    }

    // === Accept state machine ============================================

    /// Begin accepting. If no consumers are registered yet, readable
    /// subscription is deferred until the first `add_accept_callback`.
    pub fn start_accepting(self: &Rc<Self>) -> Result<()> {
        self.check_reactor_thread();
        self.accepting.set(true);
        if self.callbacks.borrow().is_empty() {
            return Ok(());
        }
        self.register_all()
            .map_err(|e| Error::system("failed to register for accept events", e))
    }

    /// Stop accepting without tearing anything down. Cancels a pending
    /// backoff timer.
    pub fn pause_accepting(&self) {
        self.check_reactor_thread();
        self.accepting.set(false);
        self.unregister_all();
        if let Some(timer) = self.backoff_timer.borrow().as_ref() {
            timer.cancel();
        }
    }

    /// Tear down: unsubscribe and release every socket in reverse bind
    /// order, then stop every consumer. With `shutdown_how` set
    /// (`libc::SHUT_*`), descriptors are shut down and parked in a pending
    /// list that [`destroy`] closes; otherwise they are closed immediately
    /// (or handed to the shutdown socket set when one is registered).
    ///
    /// [`destroy`]: ServerSocket::destroy
    pub fn stop_accepting(&self, shutdown_how: Option<i32>) -> Result<()> {
        self.check_reactor_thread();
        self.accepting.set(false);

        let mut result = Ok(());
        let set = self.shutdown_set.borrow().upgrade();
        let reactor = self.reactor.borrow().clone();
        // Reverse bind order, so a concurrent process re-binding the same
        // addresses cannot catch a half-released pair.
        while let Some(handle) = self.sockets.borrow_mut().pop() {
            if let Some(reactor) = &reactor {
                handle.unregister(reactor);
            }
            if let Some(set) = &set {
                set.close(handle.into_fd().into_raw_fd());
            } else if let Some(how) = shutdown_how {
                if let Err(e) = handle.shutdown_raw(how) {
                    tracing::warn!("failed to shut down listen socket: {e}");
                    result = Err(Error::system("failed to shut down listen socket", e));
                }
                self.pending_close.borrow_mut().push(handle.into_fd());
            } else {
                drop(handle.into_fd());
            }
        }

        if let Some(timer) = self.backoff_timer.borrow_mut().take() {
            timer.cancel();
        }

        // Swap the registry out before notifying, so a consumer that calls
        // back into the listener sees it empty.
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        self.napi_map.borrow_mut().clear();
        self.local_callback_index.set(None);
        self.callback_index.set(0);
        for entry in callbacks {
            match entry.acceptor {
                Some(acceptor) => acceptor.stop(),
                None => entry.callback.accept_stopped(),
            }
        }
        result
    }

    /// Stop accepting and release everything. Safe to call from inside a
    /// consumer callback: teardown is deferred until the accept loop
    /// unwinds.
    pub fn destroy(&self) {
        if self.guards.get() > 0 {
            // Stop the in-flight accept batch now; the rest of the
            // teardown waits until the stack unwinds.
            self.accepting.set(false);
            self.destroy_pending.set(true);
            return;
        }
        self.finish_destroy();
    }

    fn finish_destroy(&self) {
        if let Err(e) = self.stop_accepting(None) {
            tracing::warn!("error during listener teardown: {e}");
        }
        self.pending_close.borrow_mut().clear();
    }

    // === Tuning ==========================================================

    pub fn set_max_accept_at_once(&self, n: u32) {
        self.max_accept_at_once.set(n.max(1));
    }

    pub fn max_accept_at_once(&self) -> u32 {
        self.max_accept_at_once.get()
    }

    pub fn set_max_messages_in_queue(&self, n: u32) {
        self.max_messages_in_queue.set(n);
    }

    pub fn max_messages_in_queue(&self) -> u32 {
        self.max_messages_in_queue.get()
    }

    /// Deadline for queued connections; zero disables expiry.
    pub fn set_queue_timeout(&self, timeout: Duration) {
        self.queue_timeout.set(timeout);
    }

    pub fn queue_timeout(&self) -> Duration {
        self.queue_timeout.get()
    }

    pub fn set_accept_rate_adjust_speed(&self, speed: f64) {
        self.limiter.borrow_mut().set_adjust_speed(speed);
    }

    /// Fraction of accepted connections to keep, in (0, 1].
    pub fn set_accept_rate(&self, rate: f64) {
        self.limiter.borrow_mut().set_rate(rate);
    }

    pub fn accept_rate(&self) -> f64 {
        self.limiter.borrow().rate()
    }

    /// Connections dropped by rate limiting or queue saturation.
    pub fn num_dropped_connections(&self) -> u64 {
        self.num_dropped_connections.get()
    }

    pub fn accepting(&self) -> bool {
        self.accepting.get()
    }

    /// Apply `SO_REUSEADDR` to current sockets and to every socket created
    /// later.
    pub fn set_reuse_address(&self, enable: bool) -> Result<()> {
        self.options.borrow_mut().reuse_addr = enable;
        for handle in self.sockets.borrow().iter() {
            if let Err(e) = SockRef::from(handle).set_reuse_address(enable) {
                tracing::error!("failed to set SO_REUSEADDR on server socket: {e}");
                return Err(Error::system(
                    "failed to set SO_REUSEADDR on server socket",
                    e,
                ));
            }
        }
        Ok(())
    }

    /// Pre-bind only.
    pub fn set_reuse_port(&self, enable: bool) {
        self.options.borrow_mut().reuse_port = enable;
    }

    /// Pre-bind only.
    pub fn set_keep_alive(&self, enable: bool) {
        self.options.borrow_mut().keep_alive = enable;
    }

    /// Pre-bind only.
    pub fn set_close_on_exec(&self, enable: bool) {
        self.options.borrow_mut().close_on_exec = enable;
    }

    /// Enable TCP fast open with the given pending-SYN queue length.
    /// Pre-bind only.
    pub fn set_tcp_fast_open(&self, max_queue: u32) {
        self.options.borrow_mut().fast_open_queue = Some(max_queue);
    }

    /// Request `SO_ZEROCOPY` on current and future sockets. Returns true
    /// if any currently bound socket accepted the option.
    pub fn set_zero_copy(&self, enable: bool) -> bool {
        self.options.borrow_mut().zero_copy = enable;
        #[cfg(not(target_os = "linux"))]
        {
            return false;
        }
        #[cfg(target_os = "linux")]
        {
            let mut applied = 0usize;
            for handle in self.sockets.borrow().iter() {
                if socket::set_opt_raw(
                    handle.raw(),
                    libc::SOL_SOCKET,
                    libc::SO_ZEROCOPY,
                    enable as libc::c_int,
                )
                .is_ok()
                {
                    applied += 1;
                }
            }
            applied != 0
        }
    }

    /// Pre-bind only.
    pub fn set_ip_freebind(&self, enable: bool) {
        self.options.borrow_mut().ip_freebind = enable;
    }

    /// Reflect the DSCP bits of each client's SYN onto its accepted
    /// socket. Enables SYN saving on currently bound sockets.
    pub fn set_tos_reflect(&self, enable: bool) -> Result<()> {
        if !cfg!(target_os = "linux") || !enable {
            self.options.borrow_mut().tos_reflect = false;
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        for handle in self.sockets.borrow().iter() {
            socket::set_opt_raw(handle.raw(), libc::IPPROTO_TCP, socket::TCP_SAVE_SYN, 1)
                .map_err(|e| Error::system("failed to enable TOS reflection", e))?;
        }
        self.options.borrow_mut().tos_reflect = true;
        Ok(())
    }

    /// Set the traffic class of the listening sockets themselves.
    pub fn set_listener_tos(&self, tos: u32) -> Result<()> {
        if !cfg!(target_os = "linux") || tos == 0 {
            self.listener_tos.set(0);
            return Ok(());
        }
        for handle in self.sockets.borrow().iter() {
            let (level, opt) = if handle.domain() == Domain::IPV4 {
                (libc::IPPROTO_IP, libc::IP_TOS)
            } else {
                (libc::IPPROTO_IPV6, libc::IPV6_TCLASS)
            };
            socket::set_opt_raw(handle.raw(), level, opt, tos as libc::c_int)
                .map_err(|e| Error::system("failed to set TOS for socket", e))?;
        }
        self.listener_tos.set(tos);
        Ok(())
    }

    pub fn listener_tos(&self) -> u32 {
        self.listener_tos.get()
    }

    // === Accept loop =====================================================

    fn accept_batch(self: &Rc<Self>, fd: RawFd) {
        let _guard = DestructorGuard::new(self);

        let domain = {
            let sockets = self.sockets.borrow();
            match sockets.iter().find(|h| h.raw() == fd) {
                Some(handle) => handle.domain(),
                // Stale readiness for a socket that has been torn down.
                None => return,
            }
        };

        let tos_reflect = self.options.borrow().tos_reflect;
        let observer = self.observer.borrow().clone();
        let max = self.max_accept_at_once.get();
        let mut batch_exhausted = true;
        for _ in 0..max {
            match socket::accept(fd, domain) {
                Ok((conn, peer)) => {
                    if let Some(observer) = &observer {
                        observer.on_connection_accepted(conn.as_raw_fd(), &peer);
                    }
                    if tos_reflect {
                        socket::reflect_tos(conn.as_raw_fd(), domain);
                    }

                    if let RateDecision::Drop = self.limiter.borrow_mut().on_accept(Instant::now())
                    {
                        self.num_dropped_connections
                            .set(self.num_dropped_connections.get() + 1);
                        if let Some(observer) = &observer {
                            let reason = format!(
                                "server is rate limiting new connections; \
                                 current accept rate is {}",
                                self.limiter.borrow().rate()
                            );
                            observer.on_connection_dropped(conn.as_raw_fd(), &peer, &reason);
                        }
                        continue;
                    }

                    self.dispatch_connection(conn, peer);

                    if !self.accepting.get() || self.callbacks.borrow().is_empty() {
                        batch_exhausted = false;
                        break;
                    }
                }
                Err(e) => {
                    let errno = e.raw_os_error().unwrap_or(0);
                    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                        // Fully drained; the most common exit.
                        return;
                    }
                    if errno == libc::EMFILE || errno == libc::ENFILE {
                        tracing::error!(
                            "accept failed: out of file descriptors; \
                             entering accept back-off state"
                        );
                        self.enter_backoff();
                    }
                    self.dispatch_error("accept() failed", errno);
                    if let Some(observer) = &observer {
                        observer.on_connection_accept_error(errno);
                    }
                    return;
                }
            }
        }

        // Readiness is edge-triggered; if the batch cap cut the drain
        // short, reschedule so the remaining backlog is not stranded.
        if batch_exhausted && self.accepting.get() && !self.callbacks.borrow().is_empty() {
            let weak = self.self_ref.borrow().clone();
            if let Some(reactor) = self.reactor.borrow().as_ref() {
                reactor.post(move || {
                    if let Some(socket) = weak.upgrade() {
                        socket.accept_batch(fd);
                    }
                });
            }
        }
    }

    // === Dispatch ========================================================

    /// Select the consumer for an accepted socket: the one pinned to the
    /// socket's NIC queue when known, else round-robin.
    fn next_callback(&self, conn: Option<RawFd>) -> Option<CallbackEntry> {
        if let Some(fd) = conn {
            let map = self.napi_map.borrow();
            if !map.is_empty()
                && let Some(napi_id) = socket::incoming_napi_id(fd)
                && let Some(entry) = map.get(&napi_id)
            {
                return Some(entry.clone());
            }
        }
        let callbacks = self.callbacks.borrow();
        if callbacks.is_empty() {
            return None;
        }
        let index = self.callback_index.get().min(callbacks.len() - 1);
        self.callback_index.set((index + 1) % callbacks.len());
        Some(callbacks[index].clone())
    }

    fn is_fast_path(&self, entry: &CallbackEntry) -> bool {
        match &entry.target {
            None => true,
            Some(target) => self
                .reactor
                .borrow()
                .as_ref()
                .is_some_and(|r| r.id() == target.id()),
        }
    }

    fn dispatch_connection(&self, conn: OwnedFd, peer: SockAddr) {
        let starting_index = self.callback_index.get();
        let accept_time = Instant::now();

        let Some(mut entry) = self.next_callback(Some(conn.as_raw_fd())) else {
            // All consumers vanished mid-batch; nothing can take this one.
            self.drop_connection(conn, &peer, "no accept callbacks registered");
            return;
        };

        let queue_timeout = self.queue_timeout.get();
        let deadline = (!queue_timeout.is_zero()).then(|| accept_time + queue_timeout);
        let raw_fd = conn.as_raw_fd();
        let peer_for_events = peer.clone();
        let mut msg = NewConn {
            fd: conn,
            peer,
            enqueued_at: accept_time,
            deadline,
        };

        loop {
            if self.is_fast_path(&entry) {
                entry.callback.connection_accepted(
                    msg.fd,
                    msg.peer,
                    AcceptInfo {
                        accept_time: msg.enqueued_at,
                    },
                );
                return;
            }

            let acceptor = entry
                .acceptor
                .as_ref()
                .expect("remote consumer without an acceptor");
            match acceptor.try_put(
                Message::NewConn(msg),
                self.max_messages_in_queue.get() as usize,
            ) {
                Ok(()) => {
                    let observer = self.observer.borrow().clone();
                    if let Some(observer) = observer {
                        observer
                            .on_connection_enqueued_for_acceptor_callback(raw_fd, &peer_for_events);
                    }
                    return;
                }
                Err(Message::NewConn(back)) => {
                    msg = back;
                    // Queue full: lean on the rate limiter, then try the
                    // next consumer.
                    self.limiter.borrow_mut().on_queue_saturated();
                    if self.callback_index.get() == starting_index {
                        // Full rotation with every queue saturated.
                        let NewConn { fd, peer, .. } = msg;
                        self.drop_connection(
                            fd,
                            &peer,
                            "failed to dispatch newly accepted socket: \
                             all accept callback queues are full",
                        );
                        return;
                    }
                    let Some(next) = self.next_callback(None) else {
                        let NewConn { fd, peer, .. } = msg;
                        self.drop_connection(fd, &peer, "no accept callbacks registered");
                        return;
                    };
                    entry = next;
                }
                Err(_) => unreachable!("queue returned a different message"),
            }
        }
    }

    fn drop_connection(&self, conn: OwnedFd, peer: &SockAddr, reason: &str) {
        self.num_dropped_connections
            .set(self.num_dropped_connections.get() + 1);
        let now = Instant::now();
        let log_due = self
            .last_drop_log
            .get()
            .is_none_or(|last| now.duration_since(last) >= DROP_LOG_INTERVAL);
        if log_due {
            self.last_drop_log.set(Some(now));
            tracing::error!("{reason}");
        }
        let observer = self.observer.borrow().clone();
        if let Some(observer) = observer {
            observer.on_connection_dropped(conn.as_raw_fd(), peer, reason);
        }
        drop(conn);
    }

    fn dispatch_error(&self, msg: &'static str, errno: i32) {
        let starting_index = self.callback_index.get();
        let Some(mut entry) = self.next_callback(None) else {
            return;
        };
        loop {
            if self.is_fast_path(&entry) {
                entry.callback.accept_error(accept_error(msg, errno));
                return;
            }
            let acceptor = entry
                .acceptor
                .as_ref()
                .expect("remote consumer without an acceptor");
            if acceptor
                .try_put(
                    Message::Error(AcceptErrorMessage { msg, errno }),
                    self.max_messages_in_queue.get() as usize,
                )
                .is_ok()
            {
                return;
            }
            if self.callback_index.get() == starting_index {
                let now = Instant::now();
                let log_due = self
                    .last_drop_log
                    .get()
                    .is_none_or(|last| now.duration_since(last) >= DROP_LOG_INTERVAL);
                if log_due {
                    self.last_drop_log.set(Some(now));
                    tracing::error!(
                        "failed to dispatch accept error: all accept callback \
                         queues are full: {msg}: {errno}"
                    );
                }
                return;
            }
            match self.next_callback(None) {
                Some(next) => entry = next,
                None => return,
            }
        }
    }

    // === Backoff =========================================================

    fn enter_backoff(self: &Rc<Self>) {
        if self.backoff_timer.borrow().is_none() {
            let Some(reactor) = self.reactor.borrow().clone() else {
                // No reactor to run the recovery timer on; pausing now
                // would leave accepts disabled forever.
                tracing::error!(
                    "no reactor available for accept back-off timer; \
                     unable to temporarily pause accepting"
                );
                let observer = self.observer.borrow().clone();
                if let Some(observer) = observer {
                    observer.on_backoff_error();
                }
                return;
            };
            *self.backoff_timer.borrow_mut() = Some(BackoffTimer::new(reactor));
        }

        self.backoff_timer
            .borrow()
            .as_ref()
            .expect("backoff timer allocated above")
            .schedule(self.self_ref.borrow().clone());

        // Accepting intent stays true; only readability is disabled until
        // the timer re-enables it.
        self.unregister_all();
        let observer = self.observer.borrow().clone();
        if let Some(observer) = observer {
            observer.on_backoff_started();
        }
    }

    fn scheduled_backoff_expired(&self) {
        if let Some(timer) = self.backoff_timer.borrow().as_ref() {
            timer.scheduled.set(None);
        }
    }

    fn backoff_timeout_expired(self: &Rc<Self>) {
        // pause_accepting cancels the timer, so accepting is still wanted.
        debug_assert!(self.accepting.get());

        let observer = self.observer.borrow().clone();
        if self.callbacks.borrow().is_empty() {
            if let Some(observer) = observer {
                observer.on_backoff_ended();
            }
            return;
        }

        if let Err(e) = self.register_all() {
            // No recovery path: the listener would silently never accept
            // again. Restarting the process is the only sane remedy.
            tracing::error!("failed to re-enable accepts after back-off; aborting: {e}");
            std::process::abort();
        }
        if let Some(observer) = observer {
            observer.on_backoff_ended();
        }
    }

    // === Registration plumbing ===========================================

    fn register_all(self: &Rc<Self>) -> io::Result<()> {
        let reactor = self
            .reactor
            .borrow()
            .clone()
            .ok_or_else(|| io::Error::other("listener is not attached to a reactor"))?;
        let weak: Weak<dyn IoHandler> = self.self_ref.borrow().clone();
        for handle in self.sockets.borrow().iter() {
            handle.register(&reactor, weak.clone())?;
        }
        Ok(())
    }

    fn unregister_all(&self) {
        let Some(reactor) = self.reactor.borrow().clone() else {
            return;
        };
        for handle in self.sockets.borrow().iter() {
            handle.unregister(&reactor);
        }
    }

    fn add_to_shutdown_set(&self, fd: RawFd) {
        if let Some(set) = self.shutdown_set.borrow().upgrade() {
            set.add(fd);
        }
    }

    /// Close a descriptor this call created, keeping the shutdown set
    /// consistent.
    fn discard_socket(&self, fd: OwnedFd) {
        if let Some(set) = self.shutdown_set.borrow().upgrade() {
            set.remove(fd.as_raw_fd());
        }
        drop(fd);
    }

    fn check_reactor_thread(&self) {
        #[cfg(debug_assertions)]
        if let Some(reactor) = self.reactor.borrow().as_ref() {
            debug_assert!(
                reactor.is_current(),
                "listener APIs must run on the listener's reactor thread"
            );
        }
    }
}

impl IoHandler for ServerSocket {
    fn on_readable(&self, fd: RawFd) {
        if let Some(this) = self.self_ref.borrow().upgrade() {
            this.accept_batch(fd);
        }
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        // Deliberate leak-freedom: remaining sockets unregister and close
        // through their owned descriptors.
        let reactor = self.reactor.borrow().clone();
        for handle in self.sockets.borrow_mut().drain(..) {
            if let Some(reactor) = &reactor {
                handle.unregister(reactor);
            }
        }
    }
}

enum BindWildcardError {
    /// The kernel does not support this address family.
    Unsupported,
    Failed(Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use reactor::Reactor;

    struct NullCallback;

    impl AcceptCallback for NullCallback {
        fn connection_accepted(&self, _conn: OwnedFd, _peer: SockAddr, _info: AcceptInfo) {}
        fn accept_error(&self, _error: io::Error) {}
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<&'static str>>,
    }

    impl ConnectionEventCallback for RecordingObserver {
        fn on_backoff_started(&self) {
            self.events.lock().push("backoff_started");
        }
        fn on_backoff_ended(&self) {
            self.events.lock().push("backoff_ended");
        }
        fn on_backoff_error(&self) {
            self.events.lock().push("backoff_error");
        }
    }

    fn callbacks() -> Vec<Arc<dyn AcceptCallback>> {
        (0..3)
            .map(|_| Arc::new(NullCallback) as Arc<dyn AcceptCallback>)
            .collect()
    }

    #[test]
    fn remove_adjusts_round_robin_cursor() {
        let reactor = Reactor::new().unwrap();
        let socket = ServerSocket::new(reactor.local());
        let cbs = callbacks();
        for cb in &cbs {
            socket.add_accept_callback(cb.clone(), None, 1).unwrap();
        }

        // Removing an entry below the cursor shifts the cursor down.
        socket.callback_index.set(2);
        socket.remove_accept_callback(&cbs[0], None).unwrap();
        assert_eq!(socket.callback_index.get(), 1);

        // Removing at or after the cursor leaves it alone unless it falls
        // out of range, in which case it wraps to zero.
        socket.remove_accept_callback(&cbs[2], None).unwrap();
        assert_eq!(socket.callback_index.get(), 0);

        assert!(matches!(
            socket.remove_accept_callback(&cbs[0], None),
            Err(Error::CallbackNotFound)
        ));
    }

    #[test]
    fn removing_last_callback_keeps_accepting_intent() {
        let reactor = Reactor::new().unwrap();
        let socket = ServerSocket::new(reactor.local());
        socket.bind_port(0).unwrap();
        socket.listen(16).unwrap();

        let cb: Arc<dyn AcceptCallback> = Arc::new(NullCallback);
        socket.add_accept_callback(cb.clone(), None, 1).unwrap();
        socket.start_accepting().unwrap();
        assert!(socket.sockets.borrow().iter().all(|h| h.is_registered()));

        socket.remove_accept_callback(&cb, None).unwrap();
        assert!(socket.accepting());
        assert!(socket.sockets.borrow().iter().all(|h| !h.is_registered()));

        // A new consumer resubscribes automatically.
        let cb2: Arc<dyn AcceptCallback> = Arc::new(NullCallback);
        socket.add_accept_callback(cb2, None, 1).unwrap();
        assert!(socket.sockets.borrow().iter().all(|h| h.is_registered()));

        socket.destroy();
    }

    #[test]
    fn backoff_pauses_and_resumes_accepts() {
        let reactor = Reactor::new().unwrap();
        let socket = ServerSocket::new(reactor.local());
        let observer = Arc::new(RecordingObserver::default());
        socket.set_connection_event_callback(Some(observer.clone()));
        socket.bind_port(0).unwrap();
        socket.listen(16).unwrap();
        socket
            .add_accept_callback(Arc::new(NullCallback), None, 1)
            .unwrap();
        socket.start_accepting().unwrap();

        socket.enter_backoff();
        assert!(socket.accepting());
        assert!(socket.sockets.borrow().iter().all(|h| !h.is_registered()));
        assert_eq!(*observer.events.lock(), vec!["backoff_started"]);

        // Let the 1s backoff timer fire, then stop the loop.
        let handle = reactor.handle();
        reactor
            .local()
            .schedule_timer(BACKOFF_TIMEOUT + Duration::from_millis(200), move || {
                handle.shutdown()
            });
        reactor.run().unwrap();

        assert_eq!(
            *observer.events.lock(),
            vec!["backoff_started", "backoff_ended"]
        );
        assert!(socket.sockets.borrow().iter().all(|h| h.is_registered()));
        socket.destroy();
    }

    #[test]
    fn pause_during_backoff_cancels_the_timer() {
        let reactor = Reactor::new().unwrap();
        let socket = ServerSocket::new(reactor.local());
        let observer = Arc::new(RecordingObserver::default());
        socket.set_connection_event_callback(Some(observer.clone()));
        socket.bind_port(0).unwrap();
        socket.listen(16).unwrap();
        socket
            .add_accept_callback(Arc::new(NullCallback), None, 1)
            .unwrap();
        socket.start_accepting().unwrap();

        socket.enter_backoff();
        socket.pause_accepting();
        assert!(
            socket
                .backoff_timer
                .borrow()
                .as_ref()
                .is_some_and(|t| t.scheduled.get().is_none())
        );

        let handle = reactor.handle();
        reactor
            .local()
            .schedule_timer(BACKOFF_TIMEOUT + Duration::from_millis(200), move || {
                handle.shutdown()
            });
        reactor.run().unwrap();

        // The timer never fired: no backoff_ended, still unsubscribed.
        assert_eq!(*observer.events.lock(), vec!["backoff_started"]);
        assert!(!socket.accepting());
        assert!(socket.sockets.borrow().iter().all(|h| !h.is_registered()));
        socket.destroy();
    }
}
