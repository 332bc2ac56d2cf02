//! Shared work queue with attribute-aware claiming.
//!
//! The [`WorkQueue`] holds every test that has not yet been handed to a
//! worker. Workers take tests out with [`claim`](WorkQueue::claim), which is
//! the only way an item leaves the queue during a run, so a test can never be
//! owned by two workers at once.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::item::{AttributeSet, TestItem};

/// A FIFO queue of tests shared by all workers of a run.
///
/// All state lives behind a single mutex. A claim scans, removes and
/// returns under one lock acquisition, so no other worker ever observes a
/// half-finished claim.
///
/// # Example
///
/// ```
/// use fleetrun::item::{AttributeSet, TestItem};
/// use fleetrun::orchestrator::WorkQueue;
///
/// let queue = WorkQueue::new([
///     TestItem::new("a").with_include(["wifi"]),
///     TestItem::new("b"),
/// ]);
///
/// // A machine without wifi skips "a" and takes "b".
/// let claimed = queue.claim(&AttributeSet::new()).unwrap();
/// assert_eq!(claimed.name, "b");
/// assert_eq!(queue.len(), 1);
///
/// // Nothing left it can run; "a" stays queued.
/// assert!(queue.claim(&AttributeSet::new()).is_none());
/// assert_eq!(queue.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<TestItem>,
    shut_down: bool,
}

impl WorkQueue {
    /// Creates a queue holding `items` in iteration order.
    pub fn new(items: impl IntoIterator<Item = TestItem>) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                items: items.into_iter().collect(),
                shut_down: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // The critical sections below never panic, so a poisoned lock still
        // guards a consistent queue.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a test to the back of the queue.
    pub fn push(&self, item: TestItem) {
        self.state().items.push_back(item);
    }

    /// Claims the first queued test that is valid for `attributes`.
    ///
    /// Tests ahead of the claimed one that are not valid for this machine
    /// keep their positions, so they stay ahead of everything queued after
    /// them. Returns `None` when the queue holds nothing this machine can
    /// run, or after [`shutdown`](Self::shutdown).
    pub fn claim(&self, attributes: &AttributeSet) -> Option<TestItem> {
        let mut state = self.state();
        if state.shut_down {
            return None;
        }
        let pos = state.items.iter().position(|t| t.validate(attributes))?;
        state.items.remove(pos)
    }

    /// Stops handing out work. Every later claim returns `None`.
    ///
    /// Tests still queued stay in place and can be recovered with
    /// [`drain`](Self::drain).
    pub fn shutdown(&self) {
        self.state().shut_down = true;
    }

    /// Returns whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    /// Removes and returns every queued test, in queue order.
    pub fn drain(&self) -> Vec<TestItem> {
        self.state().items.drain(..).collect()
    }

    /// Returns the names of the queued tests, in queue order.
    pub fn names(&self) -> Vec<String> {
        self.state().items.iter().map(|t| t.name.clone()).collect()
    }

    /// Returns the number of queued tests.
    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    /// Returns true if no tests are queued.
    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }
}

impl FromIterator<TestItem> for WorkQueue {
    fn from_iter<I: IntoIterator<Item = TestItem>>(iter: I) -> Self {
        Self::new(iter)
    }
}
