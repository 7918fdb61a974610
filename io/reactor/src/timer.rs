//! One-shot timers for the reactor loop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use ahash::AHashMap;

/// Identifies a scheduled timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type TimerCallback = Box<dyn FnOnce()>;

/// Deadline-ordered set of pending one-shot timers.
///
/// Cancellation removes the callback but leaves the heap entry behind;
/// expired entries with no callback are skipped when they surface.
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: AHashMap<u64, TimerCallback>,
    next_id: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            callbacks: AHashMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn schedule(&mut self, deadline: Instant, cb: TimerCallback) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.callbacks.insert(id, cb);
        TimerId(id)
    }

    /// Returns true if the timer was still pending.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.callbacks.remove(&id.0).is_some()
    }

    /// Earliest deadline among live timers, skipping cancelled entries.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.callbacks.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns every callback whose deadline has passed.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(cb) = self.callbacks.remove(&id) {
                due.push(cb);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule(now + Duration::from_millis(20), Box::new(|| {}));
        wheel.schedule(now + Duration::from_millis(10), Box::new(|| {}));
        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_millis(10)));
        let due = wheel.take_due(now + Duration::from_millis(15));
        assert_eq!(due.len(), 1);
        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_millis(20)));
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let id = wheel.schedule(now, Box::new(|| {}));
        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id));
        assert!(wheel.take_due(now + Duration::from_millis(1)).is_empty());
        assert_eq!(wheel.next_deadline(), None);
    }
}
