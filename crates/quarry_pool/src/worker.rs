//! Long-lived worker threads with per-worker mailboxes.

use crate::{
    cancel::{CancelState, CancelUnwind},
    pool::PoolCore,
    task::{Task, TaskContext, TaskError, TaskRef},
};
use log::{error, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    any::Any,
    collections::VecDeque,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

/// The worker has been asked to stop.
const STOPPING: u8 = 1 << 0;
/// The worker should drain its mailbox before stopping.
const STOP_AFTER_TASKS: u8 = 1 << 1;

/// Source of worker keys. Key 0 is never handed out, so it can stand for
/// "not yet started".
static NEXT_WORKER_KEY: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a started worker, stable for the worker's lifetime and
/// unique within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerKey(u64);

impl WorkerKey {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<WorkerKey> for u64 {
    fn from(key: WorkerKey) -> Self {
        key.0
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A mailbox entry: a task to execute, or the `None` sentinel that only
/// serves to wake the worker so it re-evaluates its stop condition.
type MailboxEntry = Option<TaskRef>;

type InitHook = Box<dyn FnOnce() -> Result<(), TaskError> + Send>;
type TaskRunner = Box<dyn Fn(&TaskContext, &dyn Task) -> Result<(), TaskError> + Send>;

/// Configuration callbacks moved onto the worker thread at start.
#[derive(Default)]
struct WorkerHooks {
    init: Option<InitHook>,
    runner: Option<TaskRunner>,
}

/// A long-lived thread that executes queued tasks in submission order.
///
/// A worker is a cheaply cloneable handle; all clones refer to the same
/// underlying thread. Workers are single-use: once terminated they cannot be
/// started again. Construct the worker, optionally attach hooks, then hand
/// it to [`ThreadPool::add`](crate::ThreadPool::add), which binds and starts
/// it.
///
/// Tasks are drained from the mailbox in batches under a single lock
/// acquisition, and executed with the lock released, so a slow task never
/// blocks enqueues and a task may itself enqueue into the same or another
/// worker.
pub struct WorkerThread {
    core: Arc<WorkerCore>,
}

impl Clone for WorkerThread {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

pub(crate) struct WorkerCore {
    /// FIFO of pending work. Only mutated with the mutex held.
    mailbox: Mutex<VecDeque<MailboxEntry>>,
    /// Signalled on every enqueue and on stop/cancel.
    task_available: Condvar,
    /// Set-only stop bits, readable without the mailbox lock.
    flags: AtomicU8,
    pub(crate) cancel: CancelState,
    running: AtomicBool,
    /// Raw worker key, 0 until started.
    key: AtomicU64,
    /// Non-owning back-reference to the pool, set exactly once before start.
    pool: OnceLock<Weak<PoolCore>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    hooks: Mutex<WorkerHooks>,
}

impl WorkerThread {
    pub fn new() -> Self {
        Self {
            core: Arc::new(WorkerCore {
                mailbox: Mutex::new(VecDeque::new()),
                task_available: Condvar::new(),
                flags: AtomicU8::new(0),
                cancel: CancelState::new(),
                running: AtomicBool::new(false),
                key: AtomicU64::new(0),
                pool: OnceLock::new(),
                handle: Mutex::new(None),
                hooks: Mutex::new(WorkerHooks::default()),
            }),
        }
    }

    /// Attaches a closure run once on the worker thread before any task. A
    /// failing init ends the worker without processing its mailbox.
    ///
    /// Must be called before the worker is started.
    pub fn with_init<F>(self, init: F) -> Self
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        debug_assert!(!self.is_running(), "cannot attach hooks to a running worker");
        self.core.hooks.lock().init = Some(Box::new(init));
        self
    }

    /// Replaces the default task invocation (`task.execute(ctx)`) with the
    /// given closure, e.g. to wrap every execution in timing or scoped
    /// state.
    ///
    /// Must be called before the worker is started.
    pub fn with_task_runner<F>(self, runner: F) -> Self
    where
        F: Fn(&TaskContext, &dyn Task) -> Result<(), TaskError> + Send + 'static,
    {
        debug_assert!(!self.is_running(), "cannot attach hooks to a running worker");
        self.core.hooks.lock().runner = Some(Box::new(runner));
        self
    }

    /// Enqueues a task and wakes the worker. Thread-safe; never blocks
    /// beyond the brief mailbox lock hold.
    pub fn queue(&self, task: TaskRef) {
        self.push(Some(task));
    }

    /// Enqueues a wake sentinel: the worker wakes, re-evaluates its stop
    /// condition, and discards the sentinel without executing anything.
    pub fn wake(&self) {
        self.push(None);
    }

    fn push(&self, entry: MailboxEntry) {
        let mut mailbox = self.core.mailbox.lock();
        mailbox.push_back(entry);
        self.core.task_available.notify_one();
    }

    /// Idempotently asks the worker to stop. With `finish_tasks` the worker
    /// first drains every task already in its mailbox; without it the worker
    /// stops as soon as it finishes the batch it is currently executing.
    pub fn stop(&self, finish_tasks: bool) {
        let mut mailbox = self.core.mailbox.lock();
        let mut bits = STOPPING;
        if finish_tasks {
            bits |= STOP_AFTER_TASKS;
        }
        self.core.flags.fetch_or(bits, Ordering::AcqRel);
        // The sentinel guarantees a wakeup even from an empty mailbox.
        mailbox.push_back(None);
        self.core.task_available.notify_one();
    }

    /// Posts a forced cancel to the worker. The worker unwinds at its next
    /// cancellation point; a worker idling in its condition-variable wait is
    /// reclaimed immediately.
    pub fn cancel(&self) {
        // Taking the mailbox lock orders the post against the wait loop's
        // cancellation test, so the notify cannot be lost.
        let _mailbox = self.core.mailbox.lock();
        self.core.cancel.post();
        self.core.task_available.notify_all();
    }

    /// Switches the worker to asynchronous cancel mode, in which every
    /// library call made by the running task is a cancellation point. Code
    /// that never calls back into the library remains unkillable.
    pub fn set_cancel_mode_asynchronous(&self) {
        self.core.cancel.set_asynchronous();
    }

    /// Whether the worker thread has been started and has not yet
    /// terminated. Observable from any thread.
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// The key assigned when the worker was started, or `None` if it has
    /// not been started yet.
    pub fn key(&self) -> Option<WorkerKey> {
        match self.core.key.load(Ordering::Acquire) {
            0 => None,
            raw => Some(WorkerKey(raw)),
        }
    }

    /// Binds the worker to its pool. Returns false if the worker is already
    /// bound to a different pool; re-binding to the same pool is a no-op, so
    /// an `add` that failed at the spawn can be retried.
    pub(crate) fn bind(&self, pool: &Arc<PoolCore>) -> bool {
        let pool = Arc::downgrade(pool);
        if self.core.pool.set(Weak::clone(&pool)).is_ok() {
            return true;
        }
        self.core
            .pool
            .get()
            .is_some_and(|existing| existing.ptr_eq(&pool))
    }

    /// Spawns the worker thread and assigns the worker its key. A failed
    /// spawn rolls the worker back to its unstarted state (no key, hooks
    /// intact) so the caller can retry.
    pub(crate) fn start(&self) -> io::Result<WorkerKey> {
        debug_assert!(!self.is_running(), "worker is already running");
        debug_assert!(self.key().is_none(), "terminated workers cannot be restarted");

        let key = WorkerKey(NEXT_WORKER_KEY.fetch_add(1, Ordering::Relaxed));
        self.core.key.store(key.0, Ordering::Release);
        let core = Arc::clone(&self.core);

        // Marked running before the spawn so is_running() is already true
        // when start returns.
        self.core.running.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name(format!("quarry-worker-{key}"))
            .spawn(move || run_worker(core));

        match spawned {
            Ok(handle) => {
                *self.core.handle.lock() = Some(handle);
                Ok(key)
            }
            Err(error) => {
                self.core.running.store(false, Ordering::Release);
                self.core.key.store(0, Ordering::Release);
                Err(error)
            }
        }
    }

    /// Joins the worker thread if it has one, distinguishing a cancellation
    /// unwind from a genuine crash.
    pub(crate) fn join_thread(&self) {
        let handle = self.core.handle.lock().take();
        if let Some(handle) = handle {
            let key = self.core.assigned_key();
            if let Err(payload) = handle.join() {
                if payload.downcast_ref::<CancelUnwind>().is_some() {
                    trace!("Worker {key} exited through cancellation");
                } else {
                    error!(
                        "Worker {key} thread failed to join: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
    }

    pub(crate) fn shares_core(&self, core: &Arc<WorkerCore>) -> bool {
        Arc::ptr_eq(&self.core, core)
    }

    #[cfg(test)]
    pub(crate) fn mailbox_len(&self) -> usize {
        self.core.mailbox.lock().len()
    }
}

impl fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("key", &self.key())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl WorkerCore {
    pub(crate) fn is_stopping(&self) -> bool {
        self.flags.load(Ordering::Acquire) & STOPPING != 0
    }

    pub(crate) fn assigned_key(&self) -> WorkerKey {
        WorkerKey(self.key.load(Ordering::Acquire))
    }

    /// The run loop's stop condition. In drain mode the worker keeps going
    /// until the mailbox is empty; in abrupt mode it stops at the next
    /// check. Falls through to the deferred cancellation test, so a
    /// cancelled worker unwinds here even if it was never asked to stop.
    fn should_stop(&self, mailbox: &VecDeque<MailboxEntry>) -> bool {
        let flags = self.flags.load(Ordering::Acquire);
        if flags & STOPPING != 0 {
            if flags & STOP_AFTER_TASKS != 0 {
                if mailbox.is_empty() {
                    return true;
                }
            } else {
                return true;
            }
        }
        self.cancel.test();
        false
    }
}

/// Deregisters the worker on every exit path, including cancellation
/// unwinds and panics escaping the init hook.
struct DeregisterOnExit {
    core: Arc<WorkerCore>,
}

impl Drop for DeregisterOnExit {
    fn drop(&mut self) {
        self.core.running.store(false, Ordering::Release);
        let key = self.core.assigned_key();
        if let Some(pool) = self.core.pool.get().and_then(Weak::upgrade) {
            pool.worker_ended(key, &self.core);
        }
        trace!("Worker {key} ended");
    }
}

fn run_worker(core: Arc<WorkerCore>) {
    let key = core.assigned_key();
    trace!("Worker {key} spawned");

    let _deregister = DeregisterOnExit {
        core: Arc::clone(&core),
    };

    let hooks = std::mem::take(&mut *core.hooks.lock());

    if let Some(init) = hooks.init {
        match panic::catch_unwind(AssertUnwindSafe(init)) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                error!("Worker {key} init hook failed: {error:#}");
                return;
            }
            Err(payload) => {
                if payload.downcast_ref::<CancelUnwind>().is_none() {
                    error!(
                        "Worker {key} init hook panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
                return;
            }
        }
    }

    let ctx = TaskContext::new(Arc::clone(&core));
    let runner = hooks.runner;

    let mut mailbox = core.mailbox.lock();
    while !core.should_stop(&mailbox) {
        while mailbox.is_empty() {
            core.cancel.test();
            core.task_available.wait(&mut mailbox);
        }

        if core.should_stop(&mailbox) {
            break;
        }

        if mailbox.len() == 1 && matches!(mailbox.front(), Some(None)) {
            // Wake-for-stop fast path: nothing to execute.
            mailbox.clear();
        } else {
            let batch: Vec<MailboxEntry> = mailbox.drain(..).collect();
            // Tasks run with the mailbox unlocked so they can enqueue into
            // this worker without deadlocking.
            MutexGuard::unlocked(&mut mailbox, || {
                for task in batch.into_iter().flatten() {
                    execute_task(&ctx, runner.as_ref(), &task);
                }
            });
        }
    }
}

/// Executes one task, confining failures to that task. A cancellation
/// unwind is re-raised so it terminates the whole worker.
fn execute_task(ctx: &TaskContext, runner: Option<&TaskRunner>, task: &TaskRef) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match runner {
        Some(run) => run(ctx, task.as_ref()),
        None => task.execute(ctx),
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            error!("Task on worker {} failed: {error:#}", ctx.worker_key());
        }
        Err(payload) => {
            if payload.downcast_ref::<CancelUnwind>().is_some() {
                panic::resume_unwind(payload);
            }
            error!(
                "Task on worker {} panicked: {}",
                ctx.worker_key(),
                panic_message(payload.as_ref())
            );
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::time::{Duration, Instant};

    fn task<F>(f: F) -> TaskRef
    where
        F: Fn(&TaskContext) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn started_worker() -> WorkerThread {
        let worker = WorkerThread::new();
        worker.start().unwrap();
        worker
    }

    fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn new_worker_is_not_running_and_has_no_key() {
        let worker = WorkerThread::new();
        assert!(!worker.is_running());
        assert_eq!(worker.key(), None);
    }

    #[test]
    fn started_worker_is_running_and_has_key() {
        let worker = started_worker();
        assert!(worker.is_running());
        assert!(worker.key().is_some());

        worker.stop(true);
        worker.join_thread();
        assert!(!worker.is_running());
    }

    #[test]
    fn tasks_execute_in_submission_order() {
        let worker = started_worker();
        let executed = Arc::new(Mutex::new(Vec::new()));

        for number in 0..5 {
            let executed = Arc::clone(&executed);
            worker.queue(task(move |_| {
                executed.lock().push(number);
                Ok(())
            }));
        }

        worker.stop(true);
        worker.join_thread();

        assert_eq!(*executed.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn tasks_queued_before_start_execute_after_start() {
        let worker = WorkerThread::new();
        let executed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&executed);
        worker.queue(task(move |_| {
            flag.store(true, Ordering::Release);
            Ok(())
        }));

        worker.start().unwrap();
        worker.stop(true);
        worker.join_thread();

        assert!(executed.load(Ordering::Acquire));
    }

    #[test]
    fn wake_sentinels_leave_mailbox_empty() {
        let worker = started_worker();
        worker.wake();
        worker.wake();
        worker.wake();

        assert!(wait_until(|| worker.mailbox_len() == 0, Duration::from_secs(2)));
        assert!(worker.is_running());

        worker.stop(true);
        worker.join_thread();
    }

    #[test]
    fn stop_without_finish_abandons_pending_tasks() {
        let worker = started_worker();
        let executed = Arc::new(Mutex::new(Vec::new()));

        {
            let executed = Arc::clone(&executed);
            worker.queue(task(move |_| {
                thread::sleep(Duration::from_millis(150));
                executed.lock().push(0);
                Ok(())
            }));
        }
        // Let the worker snapshot the first task into a batch, then pile up
        // tasks that should be abandoned.
        assert!(wait_until(|| worker.mailbox_len() == 0, Duration::from_secs(2)));
        for number in 1..5 {
            let executed = Arc::clone(&executed);
            worker.queue(task(move |_| {
                executed.lock().push(number);
                Ok(())
            }));
        }

        worker.stop(false);
        worker.join_thread();

        assert_eq!(*executed.lock(), vec![0]);
    }

    #[test]
    fn failing_task_does_not_end_worker() {
        let worker = started_worker();
        let executed = Arc::new(AtomicBool::new(false));

        worker.queue(task(|_| Err(anyhow!("intentional failure for testing"))));
        let flag = Arc::clone(&executed);
        worker.queue(task(move |_| {
            flag.store(true, Ordering::Release);
            Ok(())
        }));

        worker.stop(true);
        worker.join_thread();

        assert!(executed.load(Ordering::Acquire));
    }

    #[test]
    fn panicking_task_does_not_end_worker() {
        let worker = started_worker();
        let executed = Arc::new(AtomicBool::new(false));

        worker.queue(task(|_| panic!("intentional panic for testing")));
        let flag = Arc::clone(&executed);
        worker.queue(task(move |_| {
            flag.store(true, Ordering::Release);
            Ok(())
        }));

        worker.stop(true);
        worker.join_thread();

        assert!(executed.load(Ordering::Acquire));
    }

    #[test]
    fn init_hook_runs_before_tasks() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let init_order = Arc::clone(&order);
        let worker = WorkerThread::new().with_init(move || {
            init_order.lock().push("init");
            Ok(())
        });

        let task_order = Arc::clone(&order);
        worker.queue(task(move |_| {
            task_order.lock().push("task");
            Ok(())
        }));

        worker.start().unwrap();
        worker.stop(true);
        worker.join_thread();

        assert_eq!(*order.lock(), vec!["init", "task"]);
    }

    #[test]
    fn failing_init_hook_ends_worker_without_processing_mailbox() {
        let executed = Arc::new(AtomicBool::new(false));

        let worker =
            WorkerThread::new().with_init(|| Err(anyhow!("intentional failure for testing")));
        let flag = Arc::clone(&executed);
        worker.queue(task(move |_| {
            flag.store(true, Ordering::Release);
            Ok(())
        }));

        worker.start().unwrap();
        worker.join_thread();

        assert!(!worker.is_running());
        assert!(!executed.load(Ordering::Acquire));
    }

    #[test]
    fn task_runner_hook_replaces_default_invocation() {
        let invocations = Arc::new(Mutex::new(Vec::new()));

        let runner_invocations = Arc::clone(&invocations);
        let worker = WorkerThread::new().with_task_runner(move |ctx, task| {
            runner_invocations.lock().push("before");
            let result = task.execute(ctx);
            runner_invocations.lock().push("after");
            result
        });
        worker.start().unwrap();

        let task_invocations = Arc::clone(&invocations);
        worker.queue(task(move |_| {
            task_invocations.lock().push("task");
            Ok(())
        }));

        worker.stop(true);
        worker.join_thread();

        assert_eq!(*invocations.lock(), vec!["before", "task", "after"]);
    }

    #[test]
    fn cancel_reclaims_idle_worker() {
        let worker = started_worker();
        worker.cancel();

        assert!(wait_until(|| !worker.is_running(), Duration::from_secs(2)));
        worker.join_thread();
    }

    #[test]
    fn cancel_interrupts_sleeping_task() {
        let worker = started_worker();
        let completed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&completed);
        worker.queue(task(move |ctx| {
            ctx.sleep(Duration::from_secs(30));
            flag.store(true, Ordering::Release);
            Ok(())
        }));

        thread::sleep(Duration::from_millis(50));
        worker.cancel();

        assert!(wait_until(|| !worker.is_running(), Duration::from_secs(2)));
        worker.join_thread();
        assert!(!completed.load(Ordering::Acquire));
    }

    #[test]
    fn task_can_enqueue_into_its_own_worker() {
        let worker = started_worker();
        let executed = Arc::new(AtomicBool::new(false));

        let resubmit_target = worker.clone();
        let flag = Arc::clone(&executed);
        worker.queue(task(move |_| {
            let flag = Arc::clone(&flag);
            resubmit_target.queue(task(move |_| {
                flag.store(true, Ordering::Release);
                Ok(())
            }));
            Ok(())
        }));

        assert!(wait_until(
            || executed.load(Ordering::Acquire),
            Duration::from_secs(2)
        ));

        worker.stop(true);
        worker.join_thread();
    }

    #[test]
    fn context_reports_stop_request() {
        let worker = started_worker();
        let observed_stop = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&observed_stop);
        let stoppable = worker.clone();
        worker.queue(task(move |ctx| {
            stoppable.stop(false);
            flag.store(ctx.should_stop(false), Ordering::Release);
            Ok(())
        }));

        worker.join_thread();
        assert!(observed_stop.load(Ordering::Acquire));
    }
}
