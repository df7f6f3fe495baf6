//! Pluggable policies for routing submissions to workers.

use crate::{pool::WorkerRegistry, task::TaskRef};
use std::sync::Arc;

/// A strategy selecting which worker receives a submitted task.
///
/// [`dispatch`](Self::dispatch) is invoked with the pool's registry lock
/// held. A policy must pick at most one worker, [`queue`] the task on it,
/// and report whether the task was accepted. The registry reference must not
/// be retained beyond the call.
///
/// [`queue`]: crate::WorkerThread::queue
pub trait DispatchPolicy: Send {
    fn dispatch(&mut self, workers: &WorkerRegistry, task: &TaskRef) -> bool;
}

/// The default policy: declines every submission. Useful as the inert
/// default and for exercising submission plumbing in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardDispatch;

impl DispatchPolicy for DiscardDispatch {
    fn dispatch(&mut self, _workers: &WorkerRegistry, _task: &TaskRef) -> bool {
        false
    }
}

/// Distributes tasks across workers in registration order, one per
/// submission.
///
/// The policy keeps a cursor into the registry and detects registry churn by
/// comparing the registry's size and the XOR of its keys against cached
/// values; the cursor resets to the first worker on any drift, and wraps
/// when it runs off the end. This keeps dispatch O(n) only on churn while
/// staying oblivious to registry change events.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundRobinDispatch {
    cursor: usize,
    cached_len: usize,
    cached_key_hash: u64,
}

impl RoundRobinDispatch {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DispatchPolicy for RoundRobinDispatch {
    fn dispatch(&mut self, workers: &WorkerRegistry, task: &TaskRef) -> bool {
        if workers.is_empty() {
            return false;
        }

        let key_hash = workers
            .keys()
            .fold(0, |hash, &key| hash ^ u64::from(key));

        if workers.len() != self.cached_len
            || key_hash != self.cached_key_hash
            || self.cursor >= workers.len()
        {
            self.cursor = 0;
            self.cached_len = workers.len();
            self.cached_key_hash = key_hash;
        }

        let Some((_, worker)) = workers.get_index(self.cursor) else {
            return false;
        };
        worker.queue(Arc::clone(task));
        self.cursor += 1;

        true
    }
}
