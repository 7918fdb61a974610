//! Echo protocol handler.
//!
//! Each worker reactor owns the connections dispatched to it: an accepted
//! descriptor is registered for readable events on the reactor that invoked
//! `connection_accepted`, and bytes are echoed straight back.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use listener::{AcceptCallback, AcceptInfo};
use reactor::{IoHandler, LocalHandle, SourceKey};
use slab::Slab;
use socket2::SockAddr;

use crate::metrics::CONNECTIONS_ACTIVE;

const READ_BUFFER_SIZE: usize = 16 * 1024;

thread_local! {
    /// Connections owned by this worker thread, keyed by slab slot.
    static CONNECTIONS: RefCell<Slab<Rc<EchoConn>>> = RefCell::new(Slab::new());
}

/// Accept callback that turns each connection into an [`EchoConn`] on the
/// reactor it was delivered to.
pub struct EchoCallback;

impl AcceptCallback for EchoCallback {
    fn accept_started(&self) {
        tracing::debug!("echo consumer started");
    }

    fn accept_stopped(&self) {
        tracing::debug!("echo consumer stopped");
    }

    fn connection_accepted(&self, conn: OwnedFd, peer: SockAddr, _info: AcceptInfo) {
        let Some(local) = reactor::current() else {
            tracing::error!("connection delivered outside a reactor; closing");
            return;
        };
        tracing::debug!(peer = ?peer.as_socket(), "connection accepted");
        if let Err(e) = EchoConn::spawn(local, conn) {
            tracing::warn!("failed to register connection: {e}");
        }
    }

    fn accept_error(&self, error: io::Error) {
        tracing::warn!("accept error: {error}");
    }
}

struct EchoConn {
    local: LocalHandle,
    fd: OwnedFd,
    key: Cell<Option<SourceKey>>,
    slot: Cell<usize>,
    /// Bytes read but not yet written back.
    pending: RefCell<Vec<u8>>,
}

impl EchoConn {
    fn spawn(local: LocalHandle, fd: OwnedFd) -> io::Result<()> {
        let conn = Rc::new(EchoConn {
            local: local.clone(),
            fd,
            key: Cell::new(None),
            slot: Cell::new(usize::MAX),
            pending: RefCell::new(Vec::new()),
        });
        let conn_dyn: Rc<dyn IoHandler> = conn.clone();
        let weak: std::rc::Weak<dyn IoHandler> = Rc::downgrade(&conn_dyn);
        let key = local.register_readable(conn.fd.as_raw_fd(), weak)?;
        conn.key.set(Some(key));
        let slot = CONNECTIONS.with(|c| c.borrow_mut().insert(conn.clone()));
        conn.slot.set(slot);
        CONNECTIONS_ACTIVE.increment();
        Ok(())
    }

    fn close(&self) {
        if let Some(key) = self.key.take() {
            let _ = self.local.deregister(key);
            CONNECTIONS_ACTIVE.decrement();
        }
        let slot = self.slot.replace(usize::MAX);
        if slot != usize::MAX {
            CONNECTIONS.with(|c| {
                c.borrow_mut().try_remove(slot);
            });
        }
    }

    /// Write as much pending data as the socket takes; reschedule a flush
    /// when it would block.
    fn flush(self: &Rc<Self>) -> io::Result<()> {
        loop {
            let mut pending = self.pending.borrow_mut();
            if pending.is_empty() {
                return Ok(());
            }
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    pending.as_ptr() as *const libc::c_void,
                    pending.len(),
                )
            };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    drop(pending);
                    let conn = self.clone();
                    self.local.post(move || {
                        if conn.key.get().is_some()
                            && let Err(e) = conn.flush()
                        {
                            tracing::debug!("connection error on flush: {e}");
                            conn.close();
                        }
                    });
                    return Ok(());
                }
                return Err(e);
            }
            pending.drain(..n as usize);
        }
    }
}

impl IoHandler for EchoConn {
    fn on_readable(&self, _fd: RawFd) {
        let this = CONNECTIONS.with(|c| {
            c.borrow()
                .get(self.slot.get())
                .cloned()
        });
        let Some(this) = this else {
            return;
        };

        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = unsafe {
                libc::read(
                    this.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            match n {
                0 => {
                    this.close();
                    return;
                }
                n if n < 0 => {
                    let e = io::Error::last_os_error();
                    if e.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                    tracing::debug!("connection error on read: {e}");
                    this.close();
                    return;
                }
                n => {
                    this.pending.borrow_mut().extend_from_slice(&buf[..n as usize]);
                    if let Err(e) = this.flush() {
                        tracing::debug!("connection error on write: {e}");
                        this.close();
                        return;
                    }
                }
            }
        }
    }
}
