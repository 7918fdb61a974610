//! The event loop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::handle::{Handle, Shared, Task};
use crate::timer::{TimerId, TimerWheel};

/// Token reserved for the cross-thread waker.
const WAKE_TOKEN: Token = Token(usize::MAX);

static NEXT_REACTOR_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT: RefCell<Option<LocalHandle>> = const { RefCell::new(None) };
}

/// The reactor currently running on this thread, if any.
///
/// Set for the duration of [`Reactor::run`]. Callbacks invoked by the loop
/// can use this to register descriptors or schedule timers on the reactor
/// that invoked them.
pub fn current() -> Option<LocalHandle> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Callback invoked on the loop thread when a registered descriptor
/// becomes readable.
pub trait IoHandler {
    fn on_readable(&self, fd: RawFd);
}

/// Identifies a readable-event registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceKey(usize);

struct Source {
    fd: RawFd,
    handler: Weak<dyn IoHandler>,
}

type LocalTask = Box<dyn FnOnce()>;

struct Inner {
    poll: RefCell<Poll>,
    sources: RefCell<Slab<Source>>,
    timers: RefCell<TimerWheel>,
    local_tasks: RefCell<VecDeque<LocalTask>>,
    tasks: Receiver<Task>,
    shared: Arc<Shared>,
}

/// A single-threaded event loop.
///
/// All registration and timer APIs are exposed through [`LocalHandle`] and
/// must be used on the thread that owns the reactor. Other threads interact
/// through [`Handle`].
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Self::with_napi_id(None)
    }

    /// Create a reactor pinned to a NIC receive queue. The id is advertised
    /// through [`Handle::napi_id`] so accept dispatchers can steer
    /// RSS-aligned connections here.
    pub fn with_napi_id(napi_id: Option<u32>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            id: NEXT_REACTOR_ID.fetch_add(1, Ordering::Relaxed),
            napi_id,
            tasks: tasks_tx,
            waker,
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
        });
        Ok(Self {
            inner: Rc::new(Inner {
                poll: RefCell::new(poll),
                sources: RefCell::new(Slab::new()),
                timers: RefCell::new(TimerWheel::new()),
                local_tasks: RefCell::new(VecDeque::new()),
                tasks: tasks_rx,
                shared,
            }),
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.inner.shared.clone(),
        }
    }

    pub fn local(&self) -> LocalHandle {
        LocalHandle {
            inner: self.inner.clone(),
        }
    }

    /// Run the loop until [`Handle::shutdown`] is called.
    pub fn run(&self) -> io::Result<()> {
        *self.inner.shared.thread.lock() = Some(std::thread::current().id());
        CURRENT.with(|c| *c.borrow_mut() = Some(self.local()));

        let result = self.run_loop();

        CURRENT.with(|c| *c.borrow_mut() = None);
        *self.inner.shared.thread.lock() = None;
        self.inner.shared.stop.store(false, Ordering::Release);
        result
    }

    fn run_loop(&self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            if self.inner.shared.stop.load(Ordering::Acquire) {
                return Ok(());
            }

            let timeout = self.poll_timeout();
            {
                let mut poll = self.inner.poll.borrow_mut();
                match poll.poll(&mut events, timeout) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            // Collect ready tokens first; handlers may mutate the source
            // table while they run.
            let ready: Vec<Token> = events
                .iter()
                .filter(|e| e.token() != WAKE_TOKEN)
                .map(|e| e.token())
                .collect();
            for token in ready {
                self.dispatch_readable(token);
            }

            while let Ok(task) = self.inner.tasks.try_recv() {
                task();
            }

            let local: Vec<LocalTask> = self.inner.local_tasks.borrow_mut().drain(..).collect();
            for task in local {
                task();
            }

            let due = self.inner.timers.borrow_mut().take_due(Instant::now());
            for cb in due {
                cb();
            }
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.inner.local_tasks.borrow().is_empty() {
            return Some(Duration::ZERO);
        }
        self.inner
            .timers
            .borrow_mut()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn dispatch_readable(&self, token: Token) {
        let entry = self
            .inner
            .sources
            .borrow()
            .get(token.0)
            .map(|s| (s.fd, s.handler.clone()));
        let Some((fd, handler)) = entry else {
            return;
        };
        match handler.upgrade() {
            Some(handler) => handler.on_readable(fd),
            None => {
                // Owner dropped without deregistering; reap the entry.
                tracing::debug!(fd, "readable event for a dropped handler");
                let _ = self.local().deregister(SourceKey(token.0));
            }
        }
    }
}

/// Same-thread handle to a reactor.
///
/// Cheap to clone; not sendable. Obtained from [`Reactor::local`] or
/// [`current`].
#[derive(Clone)]
pub struct LocalHandle {
    inner: Rc<Inner>,
}

impl LocalHandle {
    /// Subscribe a descriptor for readable events.
    ///
    /// The handler is held weakly; the owner must either deregister before
    /// dropping it or tolerate one stale dispatch being reaped.
    pub fn register_readable(
        &self,
        fd: RawFd,
        handler: Weak<dyn IoHandler>,
    ) -> io::Result<SourceKey> {
        let mut sources = self.inner.sources.borrow_mut();
        let entry = sources.vacant_entry();
        let token = Token(entry.key());
        self.inner
            .poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        entry.insert(Source { fd, handler });
        Ok(SourceKey(token.0))
    }

    /// Remove a readable-event subscription.
    pub fn deregister(&self, key: SourceKey) -> io::Result<()> {
        let source = self.inner.sources.borrow_mut().try_remove(key.0);
        let Some(source) = source else {
            return Ok(());
        };
        self.inner
            .poll
            .borrow()
            .registry()
            .deregister(&mut SourceFd(&source.fd))
    }

    /// Schedule a one-shot timer on this reactor.
    pub fn schedule_timer<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnOnce() + 'static,
    {
        self.inner
            .timers
            .borrow_mut()
            .schedule(Instant::now() + delay, Box::new(cb))
    }

    /// Cancel a pending timer. Returns false if it already fired or was
    /// cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.timers.borrow_mut().cancel(id)
    }

    /// Queue a closure to run on the loop thread after the current batch of
    /// callbacks. Unlike [`Handle::post`] the closure need not be sendable.
    pub fn post(&self, f: impl FnOnce() + 'static) {
        self.inner.local_tasks.borrow_mut().push_back(Box::new(f));
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.inner.shared.clone(),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.shared.id
    }

    pub fn is_current(&self) -> bool {
        self.handle().is_current()
    }
}
