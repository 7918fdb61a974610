//! One bound descriptor and its readiness registration.

use std::cell::Cell;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::rc::Weak;

use reactor::{IoHandler, LocalHandle, SourceKey};
use socket2::{Domain, SockAddr, SockRef};

/// A bound listening descriptor owned by the server socket.
///
/// The descriptor is registered for readable events only while the listener
/// is accepting and not backing off; the registration is dropped before the
/// descriptor can be closed or handed away.
pub(crate) struct SocketHandle {
    fd: OwnedFd,
    domain: Domain,
    registration: Cell<Option<SourceKey>>,
}

impl SocketHandle {
    pub(crate) fn new(fd: OwnedFd, domain: Domain) -> Self {
        Self {
            fd,
            domain,
            registration: Cell::new(None),
        }
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn domain(&self) -> Domain {
        self.domain
    }

    pub(crate) fn local_addr(&self) -> io::Result<SockAddr> {
        SockRef::from(&self.fd).local_addr()
    }

    pub(crate) fn listen(&self, backlog: i32) -> io::Result<()> {
        SockRef::from(&self.fd).listen(backlog)
    }

    pub(crate) fn shutdown_raw(&self, how: i32) -> io::Result<()> {
        let ret = unsafe { libc::shutdown(self.fd.as_raw_fd(), how) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registration.get().is_some()
    }

    /// Subscribe for readable-persistent events. Idempotent.
    pub(crate) fn register(
        &self,
        reactor: &LocalHandle,
        handler: Weak<dyn IoHandler>,
    ) -> io::Result<()> {
        if self.registration.get().is_some() {
            return Ok(());
        }
        let key = reactor.register_readable(self.fd.as_raw_fd(), handler)?;
        self.registration.set(Some(key));
        Ok(())
    }

    /// Drop the readable subscription. Idempotent.
    pub(crate) fn unregister(&self, reactor: &LocalHandle) {
        if let Some(key) = self.registration.take()
            && let Err(e) = reactor.deregister(key)
        {
            tracing::warn!(fd = self.raw(), "failed to deregister listen socket: {e}");
        }
    }

    /// Surrender the descriptor. The handle must be unregistered first.
    pub(crate) fn into_fd(self) -> OwnedFd {
        debug_assert!(self.registration.get().is_none());
        self.fd
    }
}

impl AsFd for SocketHandle {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
