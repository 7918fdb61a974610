//! Listening-socket creation and option setup.
//!
//! Options are applied before `bind` so that kernel behaviors tied to the
//! bind (reuse, fast open, freebind) take effect.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use socket2::{Domain, SockAddr, SockRef, Socket, Type};

use crate::error::{Error, Result};

// Not exposed by every libc version; values are stable Linux ABI.
#[cfg(target_os = "linux")]
pub(crate) const TCP_SAVE_SYN: libc::c_int = 27;
#[cfg(target_os = "linux")]
const TCP_SAVED_SYN: libc::c_int = 28;
#[cfg(target_os = "linux")]
const SO_INCOMING_NAPI_ID: libc::c_int = 56;

/// Option state applied to every socket the listener creates or adopts.
#[derive(Debug, Clone)]
pub(crate) struct SocketOptions {
    pub reuse_addr: bool,
    pub reuse_port: bool,
    pub keep_alive: bool,
    pub close_on_exec: bool,
    pub fast_open_queue: Option<u32>,
    pub zero_copy: bool,
    pub ip_freebind: bool,
    pub tos_reflect: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            reuse_port: false,
            keep_alive: true,
            close_on_exec: true,
            fast_open_queue: None,
            zero_copy: false,
            ip_freebind: false,
            tos_reflect: false,
        }
    }
}

pub(crate) fn set_opt_raw(
    fd: RawFd,
    level: libc::c_int,
    opt: libc::c_int,
    val: libc::c_int,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a stream socket for `domain` with listener options applied.
pub(crate) fn create_socket(domain: Domain, opts: &SocketOptions) -> Result<OwnedFd> {
    let socket = Socket::new(domain, Type::STREAM, None)
        .map_err(|e| Error::system("error creating server socket", e))?;
    let fd: OwnedFd = socket.into();
    setup_socket(fd.as_raw_fd(), domain, opts)?;
    Ok(fd)
}

/// Apply pre-bind options to a descriptor.
///
/// Failures on reuseaddr, keepalive, cloexec, nodelay, fast open, zerocopy,
/// and freebind are logged and ignored; failures on non-blocking mode,
/// SO_REUSEPORT, and SYN saving are fatal to the bind.
pub(crate) fn setup_socket(fd: RawFd, domain: Domain, opts: &SocketOptions) -> Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = SockRef::from(&borrowed);

    sock.set_nonblocking(true)
        .map_err(|e| Error::system("failed to put socket in non-blocking mode", e))?;

    // Avoid the 2MSL delay on restart. AF_UNIX does not support it.
    if domain != Domain::UNIX
        && opts.reuse_addr
        && let Err(e) = sock.set_reuse_address(true)
    {
        tracing::error!("failed to set SO_REUSEADDR on server socket: {e}");
    }

    if opts.reuse_port
        && let Err(e) = set_opt_raw(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
    {
        tracing::error!("failed to set SO_REUSEPORT on server socket: {e}");
        return Err(Error::system("failed to set SO_REUSEPORT on server socket", e));
    }

    if let Err(e) = set_opt_raw(
        fd,
        libc::SOL_SOCKET,
        libc::SO_KEEPALIVE,
        opts.keep_alive as libc::c_int,
    ) {
        tracing::error!("failed to set SO_KEEPALIVE on server socket: {e}");
    }

    if let Err(e) = set_close_on_exec(fd, opts.close_on_exec) {
        tracing::error!("failed to set FD_CLOEXEC on server socket: {e}");
    }

    if domain != Domain::UNIX
        && !is_vsock(domain)
        && let Err(e) = sock.set_nodelay(true)
    {
        tracing::error!("failed to set TCP_NODELAY on server socket: {e}");
    }

    if let Some(qlen) = opts.fast_open_queue
        && let Err(e) = set_opt_raw(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            qlen as libc::c_int,
        )
    {
        tracing::warn!("failed to set TCP_FASTOPEN on server socket: {e}");
    }

    #[cfg(target_os = "linux")]
    if opts.zero_copy
        && let Err(e) = set_opt_raw(fd, libc::SOL_SOCKET, libc::SO_ZEROCOPY, 1)
    {
        tracing::warn!("failed to set SO_ZEROCOPY on server socket: {e}");
    }

    #[cfg(target_os = "linux")]
    if opts.ip_freebind
        && let Err(e) = set_opt_raw(fd, libc::IPPROTO_IP, libc::IP_FREEBIND, 1)
    {
        tracing::error!("failed to set IP_FREEBIND on server socket: {e}");
    }

    #[cfg(target_os = "linux")]
    if opts.tos_reflect && domain != Domain::UNIX {
        set_opt_raw(fd, libc::IPPROTO_TCP, TCP_SAVE_SYN, 1)
            .map_err(|e| Error::system("failed to enable SYN save for TOS reflection", e))?;
    }

    Ok(())
}

pub(crate) fn set_close_on_exec(fd: RawFd, enable: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if enable {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if libc::fcntl(fd, libc::F_SETFD, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn bind_to_device(fd: RawFd, if_name: &str) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                if_name.as_ptr() as *const libc::c_void,
                if_name.len() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (fd, if_name);
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// Accept one connection, non-blocking and close-on-exec, returning the
/// descriptor and the kernel-reported peer address.
pub(crate) fn accept(fd: RawFd, domain: Domain) -> io::Result<(OwnedFd, SockAddr)> {
    use std::os::fd::FromRawFd;

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // accept() does not always fill these for unnamed unix peers.
    storage.ss_family = domain_family(domain) as libc::sa_family_t;
    if domain == Domain::UNIX {
        len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    }

    let conn = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if conn < 0 {
        return Err(io::Error::last_os_error());
    }
    let conn = unsafe { OwnedFd::from_raw_fd(conn) };
    let peer = unsafe { SockAddr::new(storage, len) };
    Ok((conn, peer))
}

/// NIC receive-queue identity of an accepted socket, if the kernel reports
/// one.
pub(crate) fn incoming_napi_id(fd: RawFd) -> Option<u32> {
    #[cfg(target_os = "linux")]
    {
        let mut id: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                SO_INCOMING_NAPI_ID,
                &mut id as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret == 0 && id > 0 {
            return Some(id as u32);
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = fd;
        None
    }
}

/// Copy the DSCP bits of the client's saved SYN onto the accepted socket,
/// so responses carry the class of service the client requested.
#[cfg(target_os = "linux")]
pub(crate) fn reflect_tos(conn: RawFd, domain: Domain) {
    let mut syn = [0u32; 64];
    let mut len = mem::size_of_val(&syn) as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            conn,
            libc::IPPROTO_TCP,
            TCP_SAVED_SYN,
            syn.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        tracing::error!(fd = conn, "unable to read saved SYN for accepted socket");
        return;
    }

    let word = u32::from_be(syn[0]);
    let result = if domain == Domain::IPV6 {
        let tclass = (word & 0x0FC0_0000) >> 20;
        if tclass != 0 {
            set_opt_raw(conn, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tclass as _)
        } else {
            Ok(())
        }
    } else {
        let tos = (word & 0x00FC_0000) >> 16;
        if tos != 0 {
            set_opt_raw(conn, libc::IPPROTO_IP, libc::IP_TOS, tos as _)
        } else {
            Ok(())
        }
    };
    if let Err(e) = result {
        tracing::error!(fd = conn, "unable to set TOS for accepted socket: {e}");
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn reflect_tos(_conn: RawFd, _domain: Domain) {}

pub(crate) fn domain_family(domain: Domain) -> libc::c_int {
    if domain == Domain::IPV4 {
        libc::AF_INET
    } else if domain == Domain::IPV6 {
        libc::AF_INET6
    } else if domain == Domain::UNIX {
        libc::AF_UNIX
    } else {
        libc::AF_UNSPEC
    }
}

fn is_vsock(domain: Domain) -> bool {
    #[cfg(target_os = "linux")]
    {
        domain == Domain::VSOCK
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = domain;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_socket_is_nonblocking() {
        let fd = create_socket(Domain::IPV4, &SocketOptions::default()).unwrap();
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
        let fdflags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        assert!(fdflags & libc::FD_CLOEXEC != 0);
    }

    #[test]
    fn close_on_exec_can_be_disabled() {
        let opts = SocketOptions {
            close_on_exec: false,
            ..SocketOptions::default()
        };
        let fd = create_socket(Domain::IPV4, &opts).unwrap();
        let fdflags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(fdflags & libc::FD_CLOEXEC, 0);
    }
}
