//! Bounded call queue with admission control
//!
//! The queue keeps admitted calls in FIFO order and enforces two policies
//! on [`TaskQueue::push`]:
//!
//! - **Overload**: a call arriving at a full queue is rejected with
//!   [`CallStatus::Overloaded`] and never enqueued.
//! - **Duplicate collapse**: a call from a number that is already waiting
//!   evicts the older entry, which is resolved with
//!   [`CallStatus::Duplication`]. The newest attempt keeps its place at the
//!   tail.
//!
//! Any call removed by a path other than `pop` has its CDR written and its
//! future resolved before the removal completes.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cdr::{CallId, CallStatus};
use crate::recorder::RecorderSet;
use crate::task::Task;

/// A queued call and the id it was admitted under
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Arc<Task>,
    pub call_id: CallId,
}

impl QueuedTask {
    pub fn new(task: Arc<Task>, call_id: CallId) -> Self {
        Self { task, call_id }
    }
}

/// Queue of pending calls
///
/// Implementations are not internally synchronized; callers wrap them in a
/// [`SharedQueue`].
pub trait TaskQueue: Send {
    /// Admit a call; `false` when it was rejected as overload
    fn push(&mut self, entry: QueuedTask) -> bool;

    /// Remove and return the head of the queue
    fn pop(&mut self) -> Option<QueuedTask>;

    /// Next call to be serviced
    fn front(&self) -> Option<&QueuedTask>;

    /// Most recently admitted call
    fn back(&self) -> Option<&QueuedTask>;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    /// Current capacity bound
    fn capacity(&self) -> usize;

    /// Change the capacity bound for future pushes
    fn update(&mut self, capacity: usize);

    /// Install the sinks used for rejected calls
    fn set_recorders(&mut self, recorders: Arc<RecorderSet>);
}

/// Queue shared between a pool and its successor during hot-swaps
pub type SharedQueue = Arc<Mutex<dyn TaskQueue>>;

/// Wrap a queue for sharing
pub fn shared_queue<Q: TaskQueue + 'static>(queue: Q) -> SharedQueue {
    Arc::new(Mutex::new(queue))
}

/// Default [`TaskQueue`] implementation
pub struct CallQueue {
    calls: VecDeque<QueuedTask>,
    capacity: usize,
    recorders: Arc<RecorderSet>,
}

impl CallQueue {
    /// Create a queue holding at most `capacity` calls
    pub fn new(capacity: usize) -> Self {
        Self::with_recorders(capacity, Arc::new(RecorderSet::empty()))
    }

    /// Create a queue writing rejection CDRs to `recorders`
    pub fn with_recorders(capacity: usize, recorders: Arc<RecorderSet>) -> Self {
        info!("📋 Creating call queue (capacity: {})", capacity);
        Self {
            calls: VecDeque::with_capacity(capacity),
            capacity,
            recorders,
        }
    }

    fn reject(&self, entry: &QueuedTask, status: CallStatus) {
        if let Err(e) = entry.task.reject(status, &self.recorders) {
            warn!(call_id = entry.call_id, error = %e, "Rejected call was already resolved");
        }
    }

    fn evict_duplicate(&mut self, number: &str) {
        let Some(index) = self
            .calls
            .iter()
            .position(|queued| queued.task.number() == number)
        else {
            return;
        };

        if let Some(older) = self.calls.remove(index) {
            self.reject(&older, CallStatus::Duplication);
            warn!(
                "📞 Duplicate call from {}: call {} removed from the queue",
                number, older.call_id
            );
        }
    }
}

impl TaskQueue for CallQueue {
    fn push(&mut self, entry: QueuedTask) -> bool {
        if self.calls.len() >= self.capacity {
            warn!(
                "🚫 Queue overloaded ({} of {}): call {} rejected",
                self.calls.len(),
                self.capacity,
                entry.call_id
            );
            self.reject(&entry, CallStatus::Overloaded);
            return false;
        }

        self.evict_duplicate(entry.task.number());

        info!("📞 Call {} added to the queue", entry.call_id);
        self.calls.push_back(entry);
        debug!("📊 Queue size: {} calls", self.calls.len());
        true
    }

    fn pop(&mut self) -> Option<QueuedTask> {
        let head = self.calls.pop_front();
        if let Some(entry) = &head {
            debug!("📤 Dequeued call {} (remaining: {})", entry.call_id, self.calls.len());
        }
        head
    }

    fn front(&self) -> Option<&QueuedTask> {
        self.calls.front()
    }

    fn back(&self) -> Option<&QueuedTask> {
        self.calls.back()
    }

    fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn len(&self) -> usize {
        self.calls.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn update(&mut self, capacity: usize) {
        info!("📋 Queue capacity updated: {} -> {}", self.capacity, capacity);
        self.capacity = capacity;
    }

    fn set_recorders(&mut self, recorders: Arc<RecorderSet>) {
        self.recorders = recorders;
    }
}

impl Drop for CallQueue {
    fn drop(&mut self) {
        if self.calls.is_empty() {
            return;
        }
        warn!("🧹 Queue torn down with {} waiting calls", self.calls.len());
        while let Some(entry) = self.calls.pop_front() {
            self.reject(&entry, CallStatus::Rejected);
        }
    }
}
