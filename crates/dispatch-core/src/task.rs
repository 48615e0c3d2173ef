//! Simulated calls
//!
//! A [`Task`] is one call attempt. It owns the call's [`CallDetailRecord`]
//! and the sending half of a single-use result channel; the receiving half
//! is a [`CallFuture`] handed back to whoever submitted the call.
//!
//! Every task is resolved exactly once: by the queue when it is rejected
//! (overload, duplicate, teardown), by the operator that serviced it, or,
//! as a last resort, by its own `Drop` with an [`DispatchError::Abandoned`]
//! error.
//!
//! Its CDR is written at most once. A call that fails in service, or is
//! dropped after admission without a record, is written as `Rejected`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cdr::{CallDetailRecord, CallId, CallResult, CallStatus};
use crate::error::{DispatchError, Result};
use crate::recorder::RecorderSet;

/// Value carried by a task's result channel
pub type CallOutcome = Result<CallResult>;

/// Bounds of the simulated service time
///
/// `r_min` and `r_max` are counted in `unit`s; a unit is one second unless
/// configured otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceBounds {
    pub r_min: u32,
    pub r_max: u32,
    pub unit: Duration,
}

impl ServiceBounds {
    /// Bounds in seconds
    pub fn new(r_min: u32, r_max: u32) -> Self {
        Self {
            r_min,
            r_max,
            unit: Duration::from_secs(1),
        }
    }

    /// Same bounds counted in a different unit
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// Longest a call may wait before it is considered timed out
    pub fn max_wait(&self) -> Duration {
        self.unit * self.r_max
    }

    /// Draw a hold time uniformly from `[r_min, r_max]` units
    pub fn sample(&self) -> Result<Duration> {
        if self.r_min > self.r_max {
            return Err(DispatchError::InvalidBounds {
                r_min: self.r_min,
                r_max: self.r_max,
            });
        }
        let units = rand::thread_rng().gen_range(self.r_min..=self.r_max);
        Ok(self.unit * units)
    }
}

/// Single-use promise for a call's outcome
///
/// Holds the sending half of the result channel and, until it is extracted
/// with [`ResultPromise::get_future`], the receiving half.
#[derive(Debug)]
pub struct ResultPromise {
    sender: oneshot::Sender<CallOutcome>,
    receiver: Option<oneshot::Receiver<CallOutcome>>,
}

impl ResultPromise {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }

    /// Extract the future; `None` once it has been taken
    pub fn get_future(&mut self) -> Option<CallFuture> {
        self.receiver.take().map(|receiver| CallFuture { receiver })
    }
}

impl Default for ResultPromise {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a task's result channel
///
/// Await it from async code, or call [`CallFuture::wait`] from a plain
/// thread.
#[derive(Debug)]
pub struct CallFuture {
    receiver: oneshot::Receiver<CallOutcome>,
}

fn channel_closed() -> DispatchError {
    DispatchError::internal("result channel closed without a value")
}

impl CallFuture {
    /// Block the current thread until the call is resolved
    ///
    /// Must not be called from inside an async runtime; `.await` the future
    /// there instead.
    pub fn wait(self) -> CallOutcome {
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| Err(channel_closed()))
    }

    /// The outcome if the call has already been resolved
    pub fn try_result(&mut self) -> Option<CallOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(channel_closed())),
        }
    }
}

impl Future for CallFuture {
    type Output = CallOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(channel_closed())))
    }
}

/// Mutable part of a task
#[derive(Debug)]
struct TaskState {
    call_id: CallId,
    cdr: CallDetailRecord,
    promise: Option<ResultPromise>,
    promise_replaced: bool,
    admitted: bool,
    /// The CDR has been handed to a recorder set
    recorded: bool,
    /// Where an abandoned call's CDR goes
    recorders: Option<Arc<RecorderSet>>,
}

impl TaskState {
    /// Mark the CDR as written and return it; `None` if it already was
    fn claim_record(&mut self) -> Option<CallDetailRecord> {
        if self.recorded {
            return None;
        }
        self.recorded = true;
        Some(self.cdr.clone())
    }

    fn claim_failure_record(&mut self) -> Option<CallDetailRecord> {
        if self.recorded {
            return None;
        }
        self.cdr.finish_failed();
        self.claim_record()
    }
}

/// One call attempt
#[derive(Debug)]
pub struct Task {
    bounds: ServiceBounds,
    number: Arc<str>,
    state: Mutex<TaskState>,
}

impl Task {
    /// Create a task for `number`, admitted at `admitted_at`
    ///
    /// The caller is responsible for passing normalized bounds
    /// (`r_min <= r_max`); unsampleable bounds fail the call at execution.
    pub fn new(bounds: ServiceBounds, number: Arc<str>, admitted_at: DateTime<Local>) -> Self {
        debug!(
            number = %number,
            r_min = bounds.r_min,
            r_max = bounds.r_max,
            "Creating task"
        );
        Self {
            bounds,
            state: Mutex::new(TaskState {
                call_id: 0,
                cdr: CallDetailRecord::new(number.clone(), admitted_at),
                promise: Some(ResultPromise::new()),
                promise_replaced: false,
                admitted: false,
                recorded: false,
                recorders: None,
            }),
            number,
        }
    }

    /// Caller number, used as the duplicate-detection key
    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn bounds(&self) -> ServiceBounds {
        self.bounds
    }

    pub fn call_id(&self) -> CallId {
        self.state.lock().call_id
    }

    /// Snapshot of the call detail record
    pub fn cdr(&self) -> CallDetailRecord {
        self.state.lock().cdr.clone()
    }

    /// Replace the default promise with an externally created one
    ///
    /// Allowed once, and only before the task is admitted. The default
    /// promise and its future are discarded.
    pub fn attach_promise(&self, promise: ResultPromise) -> Result<()> {
        let mut state = self.state.lock();
        if state.promise_replaced || state.admitted || state.promise.is_none() {
            return Err(DispatchError::PromiseLocked(self.number.to_string()));
        }
        state.promise = Some(promise);
        state.promise_replaced = true;
        debug!(number = %self.number, "Attached external promise");
        Ok(())
    }

    /// Extract the future of the current promise
    ///
    /// Returns `None` once taken, or once the task has been resolved.
    pub fn take_future(&self) -> Option<CallFuture> {
        self.state
            .lock()
            .promise
            .as_mut()
            .and_then(ResultPromise::get_future)
    }

    /// Record the id assigned at admission
    pub fn assign_call_id(&self, id: CallId) {
        let mut state = self.state.lock();
        state.call_id = id;
        state.cdr.call_id = id;
        state.admitted = true;
        debug!(number = %self.number, call_id = id, "Assigned call id");
    }

    /// Recorder set that receives the CDR if the task is dropped before
    /// one was written
    pub fn bind_recorders(&self, recorders: Arc<RecorderSet>) {
        self.state.lock().recorders = Some(recorders);
    }

    /// Whether the CDR has been written
    pub fn is_recorded(&self) -> bool {
        self.state.lock().recorded
    }

    /// Record the operator that took the call
    pub fn assign_operator_id(&self, id: usize) {
        self.state.lock().cdr.operator_id = id;
        debug!(number = %self.number, operator_id = id, "Assigned operator");
    }

    /// Whether the result has already been delivered
    pub fn is_resolved(&self) -> bool {
        self.state.lock().promise.is_none()
    }

    /// Deliver the outcome through the task's promise
    ///
    /// Fails with [`DispatchError::AlreadyResolved`] on a second call. A
    /// caller that stopped listening is not an error.
    pub fn resolve(&self, outcome: CallOutcome) -> Result<()> {
        let (promise, call_id) = {
            let mut state = self.state.lock();
            (state.promise.take(), state.call_id)
        };
        let promise = promise.ok_or(DispatchError::AlreadyResolved(call_id))?;
        if promise.sender.send(outcome).is_err() {
            debug!(call_id, "Caller dropped the result future");
        }
        Ok(())
    }

    /// Resolve a call that never reached an operator
    ///
    /// Closes the CDR with `status`, flushes it to `recorders` and resolves
    /// the promise with a zero-duration result.
    pub fn reject(&self, status: CallStatus, recorders: &RecorderSet) -> Result<()> {
        let (cdr, call_id) = {
            let mut state = self.state.lock();
            if !state.recorded {
                state.cdr.finish_unserviced(status);
            }
            (state.claim_record(), state.call_id)
        };
        if let Some(cdr) = cdr {
            recorders.write(&cdr);
        }
        self.resolve(Ok(CallResult::unserviced(status, call_id)))
    }

    /// Close the CDR of a call that failed in service and write it
    ///
    /// Does nothing when a record was already written for this call.
    pub fn record_failure(&self, recorders: &RecorderSet) {
        let cdr = self.state.lock().claim_failure_record();
        if let Some(cdr) = cdr {
            recorders.write(&cdr);
        }
    }

    /// Service the call on the current thread
    ///
    /// If the call has waited less than the upper bound since admission, a
    /// hold time is drawn from the bounds and the thread sleeps for it;
    /// otherwise the call times out with zero duration. Either way the CDR
    /// is finalized and written to `recorders`.
    ///
    /// On failure a `Rejected` CDR is written and the promise is resolved
    /// with the error, which is also returned. On success the promise is
    /// left for the caller to resolve.
    pub fn execute(&self, recorders: &RecorderSet) -> Result<CallResult> {
        match self.service() {
            Ok(result) => {
                let cdr = self.state.lock().claim_record();
                if let Some(cdr) = cdr {
                    recorders.write(&cdr);
                }
                Ok(result)
            }
            Err(e) => {
                warn!(number = %self.number, error = %e, "Call failed during service");
                self.record_failure(recorders);
                if let Err(resolve_err) = self.resolve(Err(e.clone())) {
                    warn!(error = %resolve_err, "Could not deliver failure");
                }
                Err(e)
            }
        }
    }

    fn service(&self) -> Result<CallResult> {
        let picked_up = Local::now();
        let (status, hold, call_id) = {
            let mut state = self.state.lock();
            let waited = (picked_up - state.cdr.start_time)
                .to_std()
                .unwrap_or_default();

            let (status, hold) = if waited < self.bounds.max_wait() {
                (CallStatus::Completed, self.bounds.sample()?)
            } else {
                (CallStatus::Timeout, Duration::ZERO)
            };

            state.cdr.operator_call_time = Some(picked_up);
            state.cdr.status = status;
            state.cdr.call_duration = hold;
            (status, hold, state.call_id)
        };

        if status == CallStatus::Completed {
            info!(call_id, number = %self.number, hold_ms = hold.as_millis() as u64, "📞 Operator on the line");
            std::thread::sleep(hold);
        } else {
            info!(call_id, number = %self.number, "⏰ Call timed out before pickup");
        }

        self.state.lock().cdr.end_time = Some(Local::now());
        debug!(call_id, status = %status, "Call finished");
        Ok(CallResult {
            status,
            call_duration: hold,
            call_id,
        })
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(recorders) = state.recorders.take() {
            if let Some(cdr) = state.claim_failure_record() {
                warn!(call_id = state.call_id, "Writing CDR of abandoned call");
                recorders.write(&cdr);
            }
        }
        if let Some(promise) = state.promise.take() {
            warn!(call_id = state.call_id, number = %self.number, "Task dropped unresolved");
            let _ = promise.sender.send(Err(DispatchError::Abandoned(state.call_id)));
        }
    }
}
