use crate::runtime::pool::ThreadPool;
use crate::runtime::RuntimeConfig;
use crate::submission::Submission;
use crate::task::list::TaskList;
use crate::task::pool::TaskPool;
use crate::task::TaskRef;
use anyhow::Result;
use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use tracing::debug;

/// State shared between the executor handle and every worker thread.
#[derive(Debug)]
pub(crate) struct ExecutorShared {
    pub(crate) cfg: RuntimeConfig,

    /// One inbound queue per worker. Pushing here (then unparking) is the
    /// only cross-worker publication point for ready tasks.
    pub(crate) inboxes: Vec<Injector<TaskRef>>,

    /// Unpark handles, registered once the pool has spawned.
    threads: OnceLock<Vec<thread::Thread>>,

    pub(crate) shutdown: AtomicBool,

    /// Pool that dispatch issue draws slice/shard tasks from.
    pub(crate) transient_pool: Arc<TaskPool>,
}

impl ExecutorShared {
    pub(crate) fn worker_count(&self) -> usize {
        self.cfg.worker_threads
    }

    /// Publishes a staged submission: every partition drains into its
    /// worker's inbox, and touched workers are unparked.
    pub(crate) fn post(&self, submission: &mut Submission) {
        debug_assert_eq!(
            submission.worker_count(),
            self.worker_count(),
            "submission was staged for a different worker pool"
        );

        let mut touched = 0u64;
        submission.drain_into(|worker_index, task| {
            self.inboxes[worker_index].push(task);
            touched |= 1 << worker_index;
        });

        if touched == 0 {
            return;
        }
        for worker_index in 0..self.worker_count() {
            if touched & (1 << worker_index) != 0 {
                self.unpark(worker_index);
            }
        }
    }

    pub(crate) fn register_threads(&self, threads: Vec<thread::Thread>) {
        let registered = self.threads.set(threads).is_ok();
        debug_assert!(registered, "worker threads registered twice");
    }

    fn unpark(&self, worker_index: usize) {
        if let Some(threads) = self.threads.get() {
            threads[worker_index].unpark();
        }
    }

    pub(crate) fn unpark_all(&self) {
        if let Some(threads) = self.threads.get() {
            for thread in threads {
                thread.unpark();
            }
        }
    }
}

/// Handle to a running worker pool.
///
/// Producers wire a task graph, stage the roots in a [`Submission`], and
/// [`Executor::submit`] it; completion is observed per scope via
/// [`crate::Scope::wait_idle`]. Dropping the executor shuts the pool down.
#[derive(Debug)]
pub struct Executor {
    shared: Arc<ExecutorShared>,
    pool: Mutex<Option<ThreadPool>>,
}

impl Executor {
    pub(crate) fn new(cfg: RuntimeConfig) -> Executor {
        let worker_count = cfg.worker_threads;
        let transient_pool = TaskPool::new(cfg.transient_task_capacity);
        let shared = Arc::new(ExecutorShared {
            cfg,
            inboxes: (0..worker_count).map(|_| Injector::new()).collect(),
            threads: OnceLock::new(),
            shutdown: AtomicBool::new(false),
            transient_pool,
        });

        let pool = ThreadPool::new(&shared);
        debug!(workers = worker_count, "executor started");

        Executor {
            shared,
            pool: Mutex::new(Some(pool)),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count()
    }

    /// Creates a submission sized for this executor's worker pool.
    pub fn submission(&self) -> Submission {
        Submission::new(self.worker_count())
    }

    /// Atomically flushes the staged ready tasks onto the worker queues.
    pub fn submit(&self, mut submission: Submission) {
        self.shared.post(&mut submission);
    }

    /// Stops the worker pool. Queued tasks that never executed are discarded
    /// (cleanup runs as aborted, fences close their scopes). Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            debug!("executor shutting down");
            self.shared.unpark_all();
            if let Some(pool) = self.pool.lock().take() {
                pool.join_all()?;
            }
            // Workers drain their own queues on the way out, but a batch
            // flushed by one worker can land in the inbox of a worker that
            // already exited. Sweep the inboxes once everyone is gone.
            let mut abandoned = TaskList::new();
            for inbox in &self.shared.inboxes {
                loop {
                    match inbox.steal() {
                        Steal::Success(task) => abandoned.push_back(task),
                        Steal::Empty => break,
                        Steal::Retry => {}
                    }
                }
            }
            abandoned.discard_all();
        }
        Ok(())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Executor: Send, Sync);
    assert_impl_all!(ExecutorShared: Send, Sync);
}
