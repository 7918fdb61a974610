//! Consumer-facing callback interfaces.

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::time::Instant;

use socket2::SockAddr;

/// Timing metadata delivered with each accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct AcceptInfo {
    /// When the connection was pulled off the listen queue. For connections
    /// that crossed a notification queue this is the enqueue time, so the
    /// consumer can measure queueing delay.
    pub accept_time: Instant,
}

/// Receives accepted connections and accept errors.
///
/// Methods run on the consumer's reactor thread, or on the listener's
/// reactor thread for consumers registered without a target reactor.
/// Implementations needing mutable state use interior mutability; the
/// listener never invokes a single callback concurrently with itself.
pub trait AcceptCallback: Send + Sync {
    /// The listener has begun delivering connections to this callback.
    fn accept_started(&self) {}

    /// No further connections will be delivered. Always the last call.
    fn accept_stopped(&self) {}

    /// A connection was accepted. Ownership of the descriptor transfers to
    /// the callback; dropping it closes the connection.
    fn connection_accepted(&self, conn: OwnedFd, peer: SockAddr, info: AcceptInfo);

    /// An accept attempt failed in a way that did not produce a connection.
    fn accept_error(&self, error: io::Error);
}

/// Optional observer of connection-level events on a listener.
///
/// Accept-path hooks run on the listener's reactor thread; dequeue and
/// queue-expiry hooks run on the consuming reactor's thread.
pub trait ConnectionEventCallback: Send + Sync {
    fn on_connection_accepted(&self, _fd: RawFd, _peer: &SockAddr) {}
    fn on_connection_enqueued_for_acceptor_callback(&self, _fd: RawFd, _peer: &SockAddr) {}
    fn on_connection_dequeued_by_acceptor_callback(&self, _fd: RawFd, _peer: &SockAddr) {}
    fn on_connection_dropped(&self, _fd: RawFd, _peer: &SockAddr, _reason: &str) {}
    fn on_connection_accept_error(&self, _errno: i32) {}
    fn on_backoff_started(&self) {}
    fn on_backoff_ended(&self) {}
    fn on_backoff_error(&self) {}
}

/// Build the error delivered to [`AcceptCallback::accept_error`] from an
/// accept-path failure.
pub(crate) fn accept_error(msg: &str, errno: i32) -> io::Error {
    let os = io::Error::from_raw_os_error(errno);
    io::Error::new(os.kind(), format!("{msg}: {os}"))
}
