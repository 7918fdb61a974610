//! Single-threaded event loop for readiness-driven I/O.
//!
//! A [`Reactor`] multiplexes three event sources on one thread: readable
//! events on raw file descriptors (epoll on Linux, kqueue on macOS, via mio),
//! tasks posted from other threads, and one-shot timers. Components that own
//! descriptors register them through a [`LocalHandle`] and receive callbacks
//! on the loop thread; other threads communicate exclusively through the
//! cloneable, sendable [`Handle`].

pub mod handle;
pub mod reactor;
pub mod timer;

pub use handle::Handle;
pub use reactor::{IoHandler, LocalHandle, Reactor, SourceKey, current};
pub use timer::TimerId;
