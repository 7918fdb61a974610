//! Per-consumer agent draining a notification queue on the consumer's
//! reactor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use reactor::Handle;

use crate::callback::{AcceptCallback, AcceptInfo, ConnectionEventCallback, accept_error};
use crate::queue::{Message, NewConn, NotificationQueue, QueueReceiver};

/// Listener-side handle to a remote consumer.
///
/// Owns the producer half of the queue; the consumer half lives in an
/// [`AcceptorCore`] shared with drain tasks posted to the consumer reactor.
/// All callback invocations happen on that reactor, serialized by its task
/// queue: messages enqueued before `stop` are drained (or expired) before
/// `accept_stopped` fires.
#[derive(Clone)]
pub(crate) struct RemoteAcceptor {
    core: Arc<AcceptorCore>,
    queue: NotificationQueue,
}

impl RemoteAcceptor {
    pub(crate) fn new(
        callback: Arc<dyn AcceptCallback>,
        observer: Option<Arc<dyn ConnectionEventCallback>>,
        target: Handle,
        queue: NotificationQueue,
        rx: QueueReceiver,
    ) -> Self {
        Self {
            core: Arc::new(AcceptorCore {
                rx,
                callback,
                observer,
                target,
                max_read_at_once: AtomicU32::new(crate::DEFAULT_CALLBACK_ACCEPT_AT_ONCE),
                stopped: AtomicBool::new(false),
            }),
            queue,
        }
    }

    /// Post `accept_started` to the consumer reactor and begin draining.
    pub(crate) fn start(&self, max_at_once: u32) {
        let core = self.core.clone();
        core.max_read_at_once
            .store(max_at_once.max(1), Ordering::Relaxed);
        self.core.target.post(move || {
            core.callback.accept_started();
            core.drain();
        });
    }

    /// Post a final drain plus `accept_stopped` to the consumer reactor.
    ///
    /// The listener removes this consumer from its dispatch tables before
    /// calling stop, so no new messages can arrive afterwards.
    pub(crate) fn stop(self) {
        let core = self.core;
        let target = core.target.clone();
        target.post(move || {
            while let Some(msg) = core.rx.try_recv() {
                core.deliver(msg);
            }
            core.stopped.store(true, Ordering::Release);
            core.callback.accept_stopped();
        });
    }

    /// Non-blocking enqueue; posts a drain task on success.
    pub(crate) fn try_put(&self, msg: Message, cap: usize) -> Result<(), Message> {
        self.queue.try_put(msg, cap)?;
        let core = self.core.clone();
        self.core.target.post(move || core.drain());
        Ok(())
    }
}

pub(crate) struct AcceptorCore {
    rx: QueueReceiver,
    callback: Arc<dyn AcceptCallback>,
    observer: Option<Arc<dyn ConnectionEventCallback>>,
    target: Handle,
    max_read_at_once: AtomicU32,
    stopped: AtomicBool,
}

impl AcceptorCore {
    /// Deliver up to `max_read_at_once` messages, then yield to the rest of
    /// the reactor; a follow-up task continues if the queue is not dry.
    fn drain(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let budget = self.max_read_at_once.load(Ordering::Relaxed);
        for _ in 0..budget {
            match self.rx.try_recv() {
                Some(msg) => self.deliver(msg),
                None => return,
            }
        }
        if !self.rx.is_empty() {
            let core = self.clone();
            self.target.post(move || core.drain());
        }
    }

    fn deliver(&self, msg: Message) {
        match msg {
            Message::NewConn(conn) => self.deliver_connection(conn),
            Message::Error(e) => self.callback.accept_error(accept_error(e.msg, e.errno)),
        }
    }

    fn deliver_connection(&self, conn: NewConn) {
        use std::os::fd::AsRawFd;

        if let Some(deadline) = conn.deadline {
            let now = Instant::now();
            if now > deadline {
                let queued_ms = now.saturating_duration_since(conn.enqueued_at).as_millis();
                if let Some(observer) = &self.observer {
                    observer.on_connection_dropped(
                        conn.fd.as_raw_fd(),
                        &conn.peer,
                        &format!(
                            "exceeded deadline for accepting connection socket \
                             (queued {queued_ms} ms)"
                        ),
                    );
                }
                // Dropping the message closes the descriptor.
                return;
            }
        }
        if let Some(observer) = &self.observer {
            observer.on_connection_dequeued_by_acceptor_callback(conn.fd.as_raw_fd(), &conn.peer);
        }
        self.callback.connection_accepted(
            conn.fd,
            conn.peer,
            AcceptInfo {
                accept_time: conn.enqueued_at,
            },
        );
    }
}
