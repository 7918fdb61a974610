//! Process-wide registry of listening sockets for coordinated teardown.

use std::os::fd::RawFd;

use ahash::AHashSet;
use parking_lot::Mutex;

/// Tracks every listening descriptor a process wants closed during
/// shutdown. Listeners hold the set weakly and register each socket they
/// create; a socket leaves the set exactly once, through [`remove`] or
/// [`close`].
///
/// [`remove`]: ShutdownSocketSet::remove
/// [`close`]: ShutdownSocketSet::close
#[derive(Default)]
pub struct ShutdownSocketSet {
    sockets: Mutex<AHashSet<RawFd>>,
}

impl ShutdownSocketSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, fd: RawFd) {
        self.sockets.lock().insert(fd);
    }

    /// Forget a descriptor without closing it. The caller keeps ownership.
    pub fn remove(&self, fd: RawFd) {
        self.sockets.lock().remove(&fd);
    }

    /// Remove and close a descriptor. Ownership transfers to the set; the
    /// caller must not close it again.
    pub fn close(&self, fd: RawFd) {
        self.sockets.lock().remove(&fd);
        unsafe {
            libc::close(fd);
        }
    }

    /// Shut down every registered descriptor for reading and writing,
    /// without closing. Used to kick a process out of `accept` during
    /// coordinated shutdown; descriptors stay registered so their owners
    /// still close them.
    pub fn shutdown_all(&self) {
        for &fd in self.sockets.lock().iter() {
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.lock().is_empty()
    }
}
