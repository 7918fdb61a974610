//! Bounded notification queue between the accept thread and a consumer.
//!
//! The channel itself is unbounded; the capacity check happens at put time
//! against the listener's current queue limit, so the limit can be retuned
//! without rebuilding consumer queues. Producer and consumer share a length
//! counter: the producer is the only incrementer, the consumer the only
//! decrementer.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use socket2::SockAddr;

/// An accepted connection travelling to a consumer reactor.
///
/// Owns its descriptor: a message dropped undelivered (queue teardown,
/// deadline expiry) closes the connection.
#[derive(Debug)]
pub(crate) struct NewConn {
    pub fd: OwnedFd,
    pub peer: SockAddr,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
}

/// An accept failure routed to a consumer's error callback.
#[derive(Debug)]
pub(crate) struct AcceptErrorMessage {
    pub msg: &'static str,
    pub errno: i32,
}

#[derive(Debug)]
pub(crate) enum Message {
    NewConn(NewConn),
    Error(AcceptErrorMessage),
}

pub(crate) fn channel() -> (NotificationQueue, QueueReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let len = Arc::new(AtomicUsize::new(0));
    (
        NotificationQueue {
            tx,
            len: len.clone(),
        },
        QueueReceiver { rx, len },
    )
}

/// Producer half, held by the listener.
#[derive(Clone)]
pub(crate) struct NotificationQueue {
    tx: Sender<Message>,
    len: Arc<AtomicUsize>,
}

impl NotificationQueue {
    /// Non-blocking put. Returns the message back when the queue holds
    /// `cap` or more messages, or when the consumer is gone.
    pub(crate) fn try_put(&self, msg: Message, cap: usize) -> Result<(), Message> {
        if self.len.load(Ordering::Acquire) >= cap {
            return Err(msg);
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        match self.tx.send(msg) {
            Ok(()) => Ok(()),
            Err(send) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                Err(send.0)
            }
        }
    }
}

/// Consumer half, drained on the consumer's reactor.
pub(crate) struct QueueReceiver {
    rx: Receiver<Message>,
    len: Arc<AtomicUsize>,
}

impl QueueReceiver {
    pub(crate) fn try_recv(&self) -> Option<Message> {
        let msg = self.rx.try_recv().ok()?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(msg)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd, RawFd};

    fn pipe_fd() -> OwnedFd {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            libc::close(fds[1]);
            OwnedFd::from_raw_fd(fds[0])
        }
    }

    fn conn_message(fd: OwnedFd) -> Message {
        Message::NewConn(NewConn {
            fd,
            peer: SockAddr::from("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap()),
            enqueued_at: Instant::now(),
            deadline: None,
        })
    }

    #[test]
    fn put_respects_capacity() {
        let (q, rx) = channel();
        assert!(q.try_put(conn_message(pipe_fd()), 1).is_ok());
        assert!(q.try_put(conn_message(pipe_fd()), 1).is_err());
        assert!(rx.try_recv().is_some());
        assert!(q.try_put(conn_message(pipe_fd()), 1).is_ok());
    }

    #[test]
    fn dropped_message_closes_descriptor() {
        let fd = pipe_fd();
        let raw = fd.as_raw_fd();
        let (q, rx) = channel();
        q.try_put(conn_message(fd), 8).unwrap();
        drop(rx.try_recv());
        assert_eq!(unsafe { libc::fcntl(raw, libc::F_GETFD) }, -1);
    }

    #[test]
    fn put_fails_when_consumer_is_gone() {
        let (q, rx) = channel();
        drop(rx);
        assert!(q.try_put(conn_message(pipe_fd()), 8).is_err());
    }
}
