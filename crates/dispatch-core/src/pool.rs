//! Operator pool
//!
//! A [`WorkerPool`] owns a fixed set of operator threads pulling calls from a
//! shared [`TaskQueue`](crate::queue::TaskQueue). Operators release the pool
//! lock before servicing a call, so a call that holds an operator for many
//! seconds never blocks admission or a pool hand-off.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──► Stopped ──start()──► Running ──stop()──► Stopped (draining) ──drop──► joined
//!              ▲                                        │
//!              └──────────────── start() ◄──────────────┘
//! ```
//!
//! A freshly built pool is stopped: its operators are parked until
//! [`CallPool::start`]. [`CallPool::stop`] parks the pool again and arms
//! drain mode, in which an operator that finishes a call and finds the
//! queue empty leaves its loop. It marks its slot as exited before it
//! releases the pool lock, and the next `start()` respawns every marked
//! slot. Dropping the pool wakes every operator and joins them; an
//! operator in the middle of a call finishes it first.
//!
//! ## Hand-off
//!
//! Reconfiguration builds a new pool and calls
//! [`CallPool::transfer_objects`] on it. The queue, the recorder set and the
//! call-id generator move by reference, so waiting calls survive the swap
//! untouched.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::cdr::CallId;
use crate::error::{DispatchError, Result};
use crate::queue::{shared_queue, CallQueue, QueuedTask, SharedQueue};
use crate::recorder::RecorderSet;
use crate::task::{CallFuture, Task};

/// Monotonic call-id source
///
/// Shared between a pool and its successors so ids stay unique across
/// hot-swaps.
#[derive(Debug)]
pub struct CallIdGenerator {
    next: AtomicU64,
}

impl CallIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: CallId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Next unused id
    pub fn next_id(&self) -> CallId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for CallIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Objects a pool hands to its successor
#[derive(Clone)]
pub struct PoolObjects {
    pub queue: Option<SharedQueue>,
    pub recorders: Arc<RecorderSet>,
    pub ids: Arc<CallIdGenerator>,
}

/// Operator pool interface
///
/// The seam the dispatcher works through; tests substitute their own
/// implementations.
pub trait CallPool: Send + Sync {
    /// Admit a call, returning its id and the future of its result
    fn add_task(&self, task: Task) -> Result<(CallId, CallFuture)>;

    /// Let operators pick up calls
    fn start(&self);

    /// Park operators and arm drain mode
    fn stop(&self);

    /// Take over the queue, recorders and id source of `old`
    fn transfer_objects(&self, old: &dyn CallPool);

    /// Snapshot of the objects a successor takes over
    fn hand_over(&self) -> PoolObjects;

    fn set_task_queue(&self, queue: SharedQueue);

    fn set_recorders(&self, recorders: Arc<RecorderSet>);

    fn task_queue(&self) -> Option<SharedQueue>;

    /// Number of operator threads
    fn size(&self) -> usize;

    /// Number of calls waiting in the queue
    fn queued(&self) -> usize {
        self.task_queue().map(|q| q.lock().len()).unwrap_or(0)
    }
}

/// State guarded by the pool's task-queue lock
struct PoolState {
    queue: Option<SharedQueue>,
    recorders: Arc<RecorderSet>,
    ids: Arc<CallIdGenerator>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Signalled when a call is admitted or the pool is started/stopped
    tasks_available: Condvar,
    /// Signalled after each serviced call and when an operator exits
    waiters: Condvar,
    stopped: AtomicBool,
    paused: AtomicBool,
    wait_for_completion: AtomicBool,
}

impl PoolShared {
    fn run_allowed(&self, state: &PoolState) -> bool {
        !self.paused.load(Ordering::Acquire)
            && state
                .queue
                .as_ref()
                .map(|q| !q.lock().is_empty())
                .unwrap_or(false)
    }

    fn queue_empty(state: &PoolState) -> bool {
        state.queue.as_ref().map(|q| q.lock().is_empty()).unwrap_or(true)
    }
}

/// One operator thread
struct Operator {
    index: usize,
    handle: Option<JoinHandle<()>>,
    busy: Arc<AtomicBool>,
    /// Set under the pool lock when the thread leaves its loop
    exited: Arc<AtomicBool>,
}

/// Fixed-size pool of operator threads
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    operators: Mutex<Vec<Operator>>,
    size: usize,
}

impl WorkerPool {
    /// Build a stopped pool with `threads` operators and a fresh queue of
    /// `queue_capacity` calls
    pub fn new(threads: usize, queue_capacity: usize) -> Result<Self> {
        let recorders = Arc::new(RecorderSet::empty());
        let queue = shared_queue(CallQueue::with_recorders(queue_capacity, recorders.clone()));
        Self::with_objects(
            threads,
            PoolObjects {
                queue: Some(queue),
                recorders,
                ids: Arc::new(CallIdGenerator::new()),
            },
        )
    }

    /// Build a stopped pool around existing objects
    pub fn with_objects(threads: usize, objects: PoolObjects) -> Result<Self> {
        info!("👥 Creating operator pool with {} operators", threads);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: objects.queue,
                recorders: objects.recorders,
                ids: objects.ids,
            }),
            tasks_available: Condvar::new(),
            waiters: Condvar::new(),
            stopped: AtomicBool::new(false),
            paused: AtomicBool::new(true),
            wait_for_completion: AtomicBool::new(false),
        });

        let pool = Self {
            shared,
            operators: Mutex::new(Vec::with_capacity(threads)),
            size: threads,
        };

        {
            let mut operators = pool.operators.lock();
            for index in 0..threads {
                operators.push(pool.spawn_operator(index)?);
            }
        }
        Ok(pool)
    }

    fn spawn_operator(&self, index: usize) -> Result<Operator> {
        let shared = self.shared.clone();
        let busy = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        let flags = OperatorFlags {
            busy: busy.clone(),
            exited: exited.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("operator-{}", index))
            .spawn(move || run(shared, flags))?;
        Ok(Operator {
            index,
            handle: Some(handle),
            busy,
            exited,
        })
    }

    /// Number of operators currently servicing a call
    pub fn busy_operators(&self) -> usize {
        self.operators
            .lock()
            .iter()
            .filter(|op| op.busy.load(Ordering::Acquire))
            .count()
    }

    /// No operator is servicing a call
    pub fn is_idle(&self) -> bool {
        self.busy_operators() == 0
    }

    pub fn is_running(&self) -> bool {
        !self.shared.paused.load(Ordering::Acquire) && !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Block until the queue is empty and no operator is busy, or `timeout`
    /// elapses; `true` when drained
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if PoolShared::queue_empty(&state) && self.is_idle() {
                return true;
            }
            if self
                .shared
                .waiters
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return PoolShared::queue_empty(&state) && self.is_idle();
            }
        }
    }

    /// Number of operator threads still in their loop
    pub fn live_operators(&self) -> usize {
        self.operators
            .lock()
            .iter()
            .filter(|op| op.handle.is_some() && !op.exited.load(Ordering::Acquire))
            .count()
    }

    /// Replace operators whose threads left the loop in drain mode
    fn revive_operators(&self) {
        let mut operators = self.operators.lock();
        for slot in operators.iter_mut() {
            if slot.handle.is_some() && !slot.exited.load(Ordering::Acquire) {
                continue;
            }
            if let Some(handle) = slot.handle.take() {
                let _ = handle.join();
            }
            match self.spawn_operator(slot.index) {
                Ok(op) => *slot = op,
                Err(e) => error!(operator = slot.index, error = %e, "Failed to restart operator"),
            }
        }
    }
}

impl CallPool for WorkerPool {
    fn add_task(&self, task: Task) -> Result<(CallId, CallFuture)> {
        let task = Arc::new(task);
        let state = self.shared.state.lock();

        let Some(queue) = state.queue.clone() else {
            error!(number = task.number(), "❌ Call refused: no task queue installed");
            return Err(DispatchError::QueueNotInstalled);
        };

        let call_id = state.ids.next_id();
        task.assign_call_id(call_id);
        task.bind_recorders(state.recorders.clone());
        let future = task
            .take_future()
            .ok_or_else(|| DispatchError::queue(format!("result future of call {} already taken", call_id)))?;

        let admitted = queue.lock().push(QueuedTask::new(task, call_id));
        if admitted {
            self.shared.tasks_available.notify_one();
        }
        Ok((call_id, future))
    }

    fn start(&self) {
        {
            let _state = self.shared.state.lock();
            self.shared.wait_for_completion.store(false, Ordering::Release);
            if !self.shared.paused.swap(false, Ordering::AcqRel) {
                return;
            }
        }
        self.revive_operators();
        info!("▶️ Operator pool started ({} operators)", self.size);
        let _state = self.shared.state.lock();
        self.shared.tasks_available.notify_all();
    }

    fn stop(&self) {
        let _state = self.shared.state.lock();
        self.shared.paused.store(true, Ordering::Release);
        self.shared.wait_for_completion.store(true, Ordering::Release);
        info!("⏸️ Operator pool stopped, draining");
    }

    fn transfer_objects(&self, old: &dyn CallPool) {
        let mut state = self.shared.state.lock();
        let objects = old.hand_over();
        if let Some(queue) = &objects.queue {
            queue.lock().set_recorders(objects.recorders.clone());
        }
        state.queue = objects.queue;
        state.recorders = objects.recorders;
        state.ids = objects.ids;
        info!(
            "🔀 Took over task queue ({} waiting calls)",
            state.queue.as_ref().map(|q| q.lock().len()).unwrap_or(0)
        );
    }

    fn hand_over(&self) -> PoolObjects {
        let state = self.shared.state.lock();
        PoolObjects {
            queue: state.queue.clone(),
            recorders: state.recorders.clone(),
            ids: state.ids.clone(),
        }
    }

    fn set_task_queue(&self, queue: SharedQueue) {
        let mut state = self.shared.state.lock();
        queue.lock().set_recorders(state.recorders.clone());
        state.queue = Some(queue);
        self.shared.tasks_available.notify_all();
    }

    fn set_recorders(&self, recorders: Arc<RecorderSet>) {
        let mut state = self.shared.state.lock();
        if let Some(queue) = &state.queue {
            queue.lock().set_recorders(recorders.clone());
        }
        state.recorders = recorders;
    }

    fn task_queue(&self) -> Option<SharedQueue> {
        self.shared.state.lock().queue.clone()
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let _state = self.shared.state.lock();
            self.shared.stopped.store(true, Ordering::Release);
            self.shared.tasks_available.notify_all();
        }
        let mut operators = self.operators.lock();
        for op in operators.iter_mut() {
            if let Some(handle) = op.handle.take() {
                if handle.join().is_err() {
                    warn!(operator = op.index, "Operator thread panicked");
                }
            }
        }
        debug!("👋 Operator pool with {} operators joined", self.size);
    }
}

/// Identifier recorded in CDRs for the current operator thread
fn operator_id() -> usize {
    let mut hasher = DefaultHasher::new();
    thread::current().id().hash(&mut hasher);
    hasher.finish() as usize
}

struct OperatorFlags {
    busy: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
}

/// Operator loop
fn run(shared: Arc<PoolShared>, flags: OperatorFlags) {
    let OperatorFlags { busy, exited } = flags;
    let operator = operator_id();
    debug!(operator, "Operator ready");

    let mut state = shared.state.lock();
    loop {
        busy.store(false, Ordering::Release);
        while !shared.stopped.load(Ordering::Acquire) && !shared.run_allowed(&state) {
            shared.tasks_available.wait(&mut state);
        }
        if shared.stopped.load(Ordering::Acquire) {
            exited.store(true, Ordering::Release);
            break;
        }
        busy.store(true, Ordering::Release);

        let next = state.queue.as_ref().and_then(|q| q.lock().pop());
        let recorders = state.recorders.clone();

        if let Some(entry) = next {
            MutexGuard::unlocked(&mut state, || service(entry, operator, &recorders));
        }
        shared.waiters.notify_all();

        if shared.wait_for_completion.load(Ordering::Acquire) && PoolShared::queue_empty(&state) {
            debug!(operator, "Queue drained, operator leaving");
            exited.store(true, Ordering::Release);
            break;
        }
    }
    busy.store(false, Ordering::Release);
    shared.waiters.notify_all();
}

/// Service one call and publish its result
fn service(entry: QueuedTask, operator: usize, recorders: &RecorderSet) {
    let QueuedTask { task, call_id } = entry;
    task.assign_operator_id(operator);

    match panic::catch_unwind(AssertUnwindSafe(|| task.execute(recorders))) {
        Ok(Ok(result)) => {
            if let Err(e) = task.resolve(Ok(result)) {
                warn!(call_id, error = %e, "Result already delivered");
            }
        }
        Ok(Err(e)) => {
            warn!(call_id, error = %e, "Call failed");
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "operator panicked".to_string());
            error!(call_id, reason = %reason, "💥 Call panicked during service");
            if panic::catch_unwind(AssertUnwindSafe(|| task.record_failure(recorders))).is_err() {
                error!(call_id, "Recorder panicked while writing failure CDR");
            }
            if let Err(e) = task.resolve(Err(DispatchError::task_failed(call_id, reason))) {
                warn!(call_id, error = %e, "Result already delivered");
            }
        }
    }
}
