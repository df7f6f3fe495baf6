//! A cancellable worker-thread pool runtime.
//!
//! The pool owns a registry of long-lived [`WorkerThread`]s, each with its
//! own FIFO mailbox. Submissions are routed to a worker by a pluggable
//! [`DispatchPolicy`] and executed in submission order on whichever worker
//! they landed on; tasks never migrate. Shutdown is staged: workers are
//! first asked to stop (optionally draining their mailboxes), then cancelled
//! at deferred cancellation points, then (only on request) cancelled
//! asynchronously, and [`ThreadPool::stop`] reports which tier was needed.
//!
//! Cancellation is delivered as an unwind at designated cancellation points
//! ([`TaskContext::should_stop`] with `safe_cancel_point = true`,
//! [`TaskContext::sleep`], and the worker's idle wait), so drop glue runs
//! and locks are released on the way out. Tasks that never reach a
//! cancellation point can only be stopped cooperatively, by polling
//! [`TaskContext::should_stop`].
//!
//! # Examples
//! ```no_run
//! # use quarry_pool::{
//! #     RoundRobinDispatch, StopMethod, StopOptions, TaskContext, TaskError, TaskRef,
//! #     ThreadPool, WorkerThread,
//! # };
//! # use std::sync::Arc;
//! #
//! let pool = ThreadPool::with_policy(RoundRobinDispatch::new());
//!
//! // The caller owns the workers; the pool only borrows them.
//! let workers: Vec<WorkerThread> = (0..4).map(|_| WorkerThread::new()).collect();
//! for worker in &workers {
//!     pool.add(worker).expect("freshly created pool accepts workers");
//! }
//!
//! let task: TaskRef = Arc::new(|ctx: &TaskContext| -> Result<(), TaskError> {
//!     // Long-running work should poll ctx.should_stop at convenient
//!     // points and return early when the worker is stopping.
//!     Ok(())
//! });
//! assert!(pool.submit(Arc::clone(&task)));
//!
//! // Drain all queued work, escalating to cancellation only if a worker
//! // fails to finish within the timeouts.
//! let method = pool.stop(StopOptions::default());
//! assert!(method.stopped_all());
//! ```

mod cancel;
mod dispatch;
mod pool;
mod task;
mod worker;

pub use dispatch::{DiscardDispatch, DispatchPolicy, RoundRobinDispatch};
pub use pool::{
    StopMethod, StopOptions, ThreadPool, WorkerRegistry, default_worker_count,
};
pub use task::{Task, TaskContext, TaskError, TaskRef};
pub use worker::{WorkerKey, WorkerThread};
