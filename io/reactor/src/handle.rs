//! Cross-thread handle to a running reactor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

use crossbeam_channel::Sender;
use mio::Waker;
use parking_lot::Mutex;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// State shared between a reactor and every handle cloned from it.
pub(crate) struct Shared {
    pub(crate) id: usize,
    pub(crate) napi_id: Option<u32>,
    pub(crate) tasks: Sender<Task>,
    pub(crate) waker: Waker,
    pub(crate) stop: AtomicBool,
    /// Thread the loop is currently running on. `None` while the loop is
    /// not running, in which case thread checks pass by definition.
    pub(crate) thread: Mutex<Option<ThreadId>>,
}

/// A sendable, cloneable reference to a reactor.
///
/// Handles outlive the reactor itself; tasks posted after the reactor is
/// dropped are themselves dropped (any resources they captured are released
/// by their destructors).
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

impl Handle {
    /// Run a closure on the reactor thread.
    ///
    /// Tasks from a single posting thread execute in post order.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.tasks.send(Box::new(f)).is_err() {
            tracing::debug!("task posted to a dropped reactor; discarding");
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            tracing::warn!("failed to wake reactor: {e}");
        }
    }

    /// Unique identity of the reactor this handle refers to.
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// NIC receive-queue identity this reactor is pinned to, if any.
    pub fn napi_id(&self) -> Option<u32> {
        self.shared.napi_id
    }

    /// Whether the caller is on the reactor's loop thread.
    ///
    /// Returns true when the loop is not running, so setup done before
    /// `run()` on any thread passes thread-affinity checks.
    pub fn is_current(&self) -> bool {
        self.shared
            .thread
            .lock()
            .is_none_or(|t| t == std::thread::current().id())
    }

    /// Ask the reactor loop to exit after the current iteration.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Handle {}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.shared.id)
            .field("napi_id", &self.shared.napi_id)
            .finish()
    }
}
