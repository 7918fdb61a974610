//! Asynchronous TCP/Unix-domain listening socket.
//!
//! A [`ServerSocket`] accepts inbound connections on one or more bound
//! descriptors and hands each accepted descriptor, with its peer address,
//! to one of the registered consumers. Consumers on the listener's own
//! reactor are invoked synchronously in accept order; consumers on other
//! reactors receive connections through a bounded notification queue with
//! optional per-message deadlines, drained on their own thread.
//!
//! The accept path is protected by a probabilistic rate limiter with
//! adaptive recovery, and descriptor exhaustion (`EMFILE`/`ENFILE`) pauses
//! accepts for a fixed back-off period instead of spinning.
//!
//! ```no_run
//! use std::sync::Arc;
//! use listener::{AcceptCallback, AcceptInfo, ServerSocket};
//!
//! struct Printer;
//!
//! impl AcceptCallback for Printer {
//!     fn connection_accepted(
//!         &self,
//!         conn: std::os::fd::OwnedFd,
//!         peer: socket2::SockAddr,
//!         _info: AcceptInfo,
//!     ) {
//!         println!("connection from {:?}", peer.as_socket());
//!         drop(conn);
//!     }
//!     fn accept_error(&self, error: std::io::Error) {
//!         eprintln!("accept error: {error}");
//!     }
//! }
//!
//! let reactor = reactor::Reactor::new().unwrap();
//! let socket = ServerSocket::new(reactor.local());
//! socket.bind_port(0).unwrap();
//! socket.listen(128).unwrap();
//! socket.add_accept_callback(Arc::new(Printer), None, 5).unwrap();
//! socket.start_accepting().unwrap();
//! reactor.run().unwrap();
//! ```

mod acceptor;
mod callback;
mod error;
mod handle;
mod queue;
mod rate;
mod server_socket;
mod shutdown;
mod socket;

pub use callback::{AcceptCallback, AcceptInfo, ConnectionEventCallback};
pub use error::{Error, Result};
pub use rate::ACCEPT_RATE_DECREASE_STEP;
pub use server_socket::{
    DEFAULT_CALLBACK_ACCEPT_AT_ONCE, DEFAULT_MAX_ACCEPT_AT_ONCE, DEFAULT_MAX_MESSAGES_IN_QUEUE,
    ServerSocket,
};
pub use shutdown::ShutdownSocketSet;
