//! The worker registry and the staged pool shutdown.

use crate::{
    dispatch::{DiscardDispatch, DispatchPolicy},
    task::TaskRef,
    worker::{WorkerCore, WorkerKey, WorkerThread},
};
use indexmap::IndexMap;
use log::{debug, error};
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use std::{
    fmt, mem,
    num::NonZeroUsize,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// The pool's registry of live workers, in registration order. Registration
/// order is what makes round-robin dispatch deterministic.
pub type WorkerRegistry = IndexMap<WorkerKey, WorkerThread, FxBuildHasher>;

/// Interval between `is_running` sweeps while waiting for workers to
/// terminate.
const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long the fatal shutdown phase waits for asynchronous cancellation to
/// take effect before writing the remaining workers off as unkillable.
const FATAL_GRACE: Duration = Duration::from_millis(250);

/// Parameters of a staged pool shutdown.
///
/// The escalation budget is split between the tiers: the polite phase gets
/// `polite_timeout`, the aggressive phase gets whatever remains of
/// `overall_timeout` (which is clamped to at least `polite_timeout`). A
/// phase with a zero budget is skipped entirely. The fatal phase runs only
/// when `fatal` is set.
#[derive(Clone, Copy, Debug)]
pub struct StopOptions {
    /// Let workers drain their mailboxes instead of stopping after the
    /// batch they are currently executing.
    pub finish_tasks: bool,
    pub polite_timeout: Duration,
    pub overall_timeout: Duration,
    /// Escalate to asynchronous cancellation if the aggressive phase leaves
    /// workers running. Tasks interrupted this way may leak resources held
    /// outside their own frames.
    pub fatal: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            finish_tasks: true,
            polite_timeout: Duration::from_secs(3),
            overall_timeout: Duration::from_secs(33),
            fatal: false,
        }
    }
}

/// How a [`stop`](ThreadPool::stop) call got the workers to terminate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopMethod {
    /// At least one worker could not be terminated. The survivors remain
    /// registered and the pool is usable again; the caller may retry.
    Failed,
    /// Every worker stopped on request, without cancellation.
    Polite,
    /// Termination required cancelling workers at deferred cancellation
    /// points.
    Aggressive,
    /// Termination required asynchronous cancellation; tasks may have been
    /// interrupted at arbitrary library calls.
    Fatal,
}

impl StopMethod {
    /// Whether every worker that was in the pool has terminated.
    pub fn stopped_all(&self) -> bool {
        *self != Self::Failed
    }
}

/// A registry of worker threads with policy-driven task dispatch and a
/// staged, bounded shutdown.
///
/// The pool borrows workers rather than owning them: [`add`](Self::add)
/// registers and starts a caller-constructed [`WorkerThread`], and the
/// caller keeps its own handle. Submissions are routed to a worker by a
/// [`DispatchPolicy`]; the built-in default declines everything, so pools
/// meant to execute work are constructed with
/// [`with_policy`](Self::with_policy).
pub struct ThreadPool {
    core: Arc<PoolCore>,
    default_policy: Mutex<Box<dyn DispatchPolicy>>,
}

pub(crate) struct PoolCore {
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    workers: WorkerRegistry,
    /// While set, no workers may be added and no submissions reach workers.
    /// Cleared only when a failed stop reinstates survivors.
    stopping: bool,
}

impl ThreadPool {
    /// Creates a pool whose default policy discards submissions.
    pub fn new() -> Self {
        Self::with_policy(DiscardDispatch)
    }

    /// Creates a pool with the given default dispatch policy.
    pub fn with_policy(policy: impl DispatchPolicy + 'static) -> Self {
        Self {
            core: Arc::new(PoolCore {
                registry: Mutex::new(Registry::default()),
            }),
            default_policy: Mutex::new(Box::new(policy)),
        }
    }

    /// Binds the given worker to this pool, starts it, and registers it
    /// under its freshly assigned key.
    ///
    /// Returns `None` when the pool is stopping, when the worker is running
    /// or was started before, when the worker is bound to a different pool
    /// (programmer errors, caught by debug assertions), or when spawning the
    /// thread fails. A spawn failure leaves the worker unstarted, so the
    /// `add` can be retried.
    pub fn add(&self, worker: &WorkerThread) -> Option<WorkerKey> {
        if worker.is_running() || worker.key().is_some() {
            debug_assert!(!worker.is_running(), "cannot add a running worker");
            debug_assert!(worker.key().is_none(), "workers are single-use");
            return None;
        }

        // Holding the registry lock across bind + start + insert keeps a
        // concurrent stop() from slipping between the stopping check and
        // the registration.
        let mut registry = self.core.registry.lock();
        if registry.stopping {
            return None;
        }

        if !worker.bind(&self.core) {
            debug_assert!(false, "worker is already bound to another pool");
            return None;
        }

        match worker.start() {
            Ok(key) => {
                registry.workers.insert(key, worker.clone());
                Some(key)
            }
            Err(error) => {
                error!("Failed to spawn worker thread: {error}");
                None
            }
        }
    }

    /// The number of currently registered workers.
    pub fn worker_count(&self) -> usize {
        self.core.registry.lock().workers.len()
    }

    /// Routes the task through the pool's default dispatch policy. Returns
    /// the policy's verdict: true iff some worker accepted the task.
    pub fn submit(&self, task: TaskRef) -> bool {
        let registry = self.core.registry.lock();
        let mut policy = self.default_policy.lock();
        policy.dispatch(&registry.workers, &task)
    }

    /// Routes the task through the given policy instead of the default.
    pub fn submit_with(&self, task: TaskRef, policy: &mut dyn DispatchPolicy) -> bool {
        let registry = self.core.registry.lock();
        policy.dispatch(&registry.workers, &task)
    }

    /// Stops every registered worker, escalating from a polite stop request
    /// through forced cancellation as permitted by `options`, and joins all
    /// workers that terminated.
    ///
    /// The registry is emptied up front, so workers being torn down can no
    /// longer receive submissions and no new workers can be added while the
    /// shutdown runs. On [`StopMethod::Failed`] the workers that are still
    /// running are reinstated and the pool accepts work again; everything
    /// else means the pool ended up empty. Calling `stop` again after a
    /// successful stop is a no-op returning [`StopMethod::Polite`].
    ///
    /// This never panics; all failure information is in the return value.
    pub fn stop(&self, options: StopOptions) -> StopMethod {
        let overall_timeout = options.overall_timeout.max(options.polite_timeout);
        let aggressive_timeout = overall_timeout - options.polite_timeout;

        let mut alive = {
            let mut registry = self.core.registry.lock();
            registry.stopping = true;
            mem::take(&mut registry.workers)
        };
        let mut all = alive.clone();

        let method = escalate(&mut alive, &options, aggressive_timeout);

        if method == StopMethod::Failed {
            // Survivors go back into the registry so the caller may retry;
            // workers that died after the last sweep stay in the join set.
            let mut registry = self.core.registry.lock();
            for (key, worker) in alive {
                if worker.is_running() {
                    all.swap_remove(&key);
                    registry.workers.insert(key, worker);
                }
            }
            registry.stopping = false;
        }

        for worker in all.values() {
            worker.join_thread();
        }

        method
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.worker_count())
            .finish_non_exhaustive()
    }
}

impl PoolCore {
    /// Self-deregistration callback invoked by workers as they exit. During
    /// a shutdown the registry has been swapped out, so this is a no-op
    /// lookup against an empty map.
    pub(crate) fn worker_ended(&self, key: WorkerKey, core: &Arc<WorkerCore>) {
        let mut registry = self.registry.lock();
        if registry
            .workers
            .get(&key)
            .is_some_and(|worker| worker.shares_core(core))
        {
            registry.workers.shift_remove(&key);
        }
    }
}

/// Runs the escalation phases against the set of live workers, removing
/// workers from the set as they terminate.
fn escalate(
    alive: &mut WorkerRegistry,
    options: &StopOptions,
    aggressive_timeout: Duration,
) -> StopMethod {
    if !options.polite_timeout.is_zero() {
        debug!(
            "Stopping pool: asking {} workers to stop (finish tasks: {})",
            alive.len(),
            options.finish_tasks
        );
        for worker in alive.values() {
            worker.stop(options.finish_tasks);
        }
        wait_for_termination(alive, options.polite_timeout);
    }
    if alive.is_empty() {
        return StopMethod::Polite;
    }

    if !aggressive_timeout.is_zero() {
        debug!("Stopping pool: cancelling {} remaining workers", alive.len());
        for worker in alive.values() {
            worker.cancel();
        }
        wait_for_termination(alive, aggressive_timeout);
    }
    if alive.is_empty() {
        return StopMethod::Aggressive;
    }

    if options.fatal {
        debug!(
            "Stopping pool: switching {} remaining workers to asynchronous cancellation",
            alive.len()
        );
        for worker in alive.values() {
            worker.set_cancel_mode_asynchronous();
            worker.cancel();
        }
        wait_for_termination(alive, FATAL_GRACE);
        if alive.is_empty() {
            return StopMethod::Fatal;
        }
    }

    debug!("Stopping pool failed: {} workers unresponsive", alive.len());
    StopMethod::Failed
}

/// Sweeps the set for terminated workers every
/// [`TERMINATION_POLL_INTERVAL`] until it empties or the deadline elapses.
fn wait_for_termination(workers: &mut WorkerRegistry, timeout: Duration) {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        workers.retain(|_, worker| worker.is_running());
        if workers.is_empty() {
            return;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return;
            }
        }
        thread::sleep(TERMINATION_POLL_INTERVAL);
    }
}

/// A reasonable worker count for pools sized to the machine: the available
/// parallelism, or one worker when that cannot be determined.
pub fn default_worker_count() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}
