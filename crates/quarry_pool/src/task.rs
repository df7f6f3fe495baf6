//! Tasks and the handle they use to observe cancellation.

use crate::worker::{WorkerCore, WorkerKey};
use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// The error type produced by failing tasks.
pub type TaskError = anyhow::Error;

/// A unit of deferrable work executable on a worker thread.
///
/// The pool never takes exclusive ownership of a task: submissions are
/// [`TaskRef`]s, and the submitter keeps its own reference for as long as it
/// likes. A task may be re-submitted after it has completed, but must not be
/// queued twice concurrently; the pool does not detect this.
///
/// Returning an `Err` ends that execution only: the error is logged and the
/// worker moves on to its next task. The same goes for panics, with one
/// exception: a task that catches unwinds internally must propagate payloads
/// it does not recognize, since forced worker cancellation is delivered as an
/// unwind.
pub trait Task: Send + Sync {
    /// Executes the task. The supplied context is bound to the worker the
    /// task landed on and is the task's view of stop and cancel requests.
    fn execute(&self, ctx: &TaskContext) -> Result<(), TaskError>;
}

/// A shared reference to a task.
pub type TaskRef = Arc<dyn Task>;

impl<F> Task for F
where
    F: Fn(&TaskContext) -> Result<(), TaskError> + Send + Sync,
{
    fn execute(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        self(ctx)
    }
}

/// Granularity at which [`TaskContext::sleep`] re-checks for a posted
/// cancellation.
const SLEEP_CANCEL_RESOLUTION: Duration = Duration::from_millis(10);

/// A read-only handle bound to the executing worker, through which a running
/// task observes stop requests and yields to cancellation.
pub struct TaskContext {
    worker: Arc<WorkerCore>,
}

impl TaskContext {
    pub(crate) fn new(worker: Arc<WorkerCore>) -> Self {
        Self { worker }
    }

    /// Whether the executing worker has been asked to stop. Long-running
    /// tasks should poll this at convenient points and return early when it
    /// turns true.
    ///
    /// With `safe_cancel_point = true` the call is additionally a deferred
    /// cancellation point: if a forced cancel has been posted to the worker,
    /// control does not return and the task is unwound. With `false` the
    /// call only yields to cancellation when the worker has been switched to
    /// asynchronous cancel mode.
    pub fn should_stop(&self, safe_cancel_point: bool) -> bool {
        if safe_cancel_point {
            self.worker.cancel.test();
        } else {
            self.worker.cancel.test_if_asynchronous();
        }
        self.worker.is_stopping()
    }

    /// Sleeps for the given duration. This is a cancellation point: a forced
    /// cancel posted to the worker interrupts the sleep and unwinds the
    /// task, so aggressive pool shutdown can reclaim workers stuck in long
    /// waits.
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            self.worker.cancel.test();
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(SLEEP_CANCEL_RESOLUTION));
        }
    }

    /// The key of the worker executing the task.
    pub fn worker_key(&self) -> WorkerKey {
        self.worker.assigned_key()
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("worker", &self.worker.assigned_key())
            .finish()
    }
}
