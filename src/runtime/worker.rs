use crate::dispatch::{self, shard, slice};
use crate::runtime::executor::ExecutorShared;
use crate::submission::Submission;
use crate::task::list::TaskList;
use crate::task::{lifecycle, TaskFlags, TaskKind, TaskRef};
use crossbeam_deque::{Steal, Worker as WorkQueue};
use std::iter;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tracing::trace;

/// One worker thread of the pool.
///
/// Each worker owns a FIFO ready queue fed from its inbox, a scratch buffer
/// for dispatch tiles, and a pending submission that newly readied tasks are
/// staged into while it executes. The pending batch is flushed after every
/// task, which is the worker-side publication point.
pub(crate) struct Worker {
    index: usize,

    shared: Arc<ExecutorShared>,

    /// Local ready queue, drained FIFO.
    local: WorkQueue<TaskRef>,

    /// Per-worker scratch handed to dispatch tiles as local memory.
    local_memory: Vec<u8>,

    /// Tasks readied by the task currently executing.
    pending: Submission,
}

impl Worker {
    pub(crate) fn new(index: usize, shared: Arc<ExecutorShared>) -> Worker {
        let worker_count = shared.worker_count();
        Worker {
            index,
            local: WorkQueue::new_fifo(),
            local_memory: vec![0; shared.cfg.worker_local_memory_size],
            pending: Submission::new(worker_count),
            shared,
        }
    }

    pub(crate) fn run(mut self) {
        trace!(worker = self.index, "worker started");
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Some(task) = self.find_task() {
                self.run_task(task);
            } else {
                // Unpark tokens are sticky: a post racing with this park just
                // makes the park return immediately.
                thread::park();
            }
        }
        self.drain_on_shutdown();
        trace!(worker = self.index, "worker stopped");
    }

    fn find_task(&self) -> Option<TaskRef> {
        self.local.pop().or_else(|| {
            // Refill the local queue from the inbox in batches; the inbox is
            // FIFO so posted order is preserved.
            let inbox = &self.shared.inboxes[self.index];
            iter::repeat_with(|| inbox.steal_batch_and_pop(&self.local))
                .find(|steal| !steal.is_retry())
                .and_then(Steal::success)
        })
    }

    fn run_task(&mut self, task: TaskRef) {
        self.execute(task);
        // Flush point: publish whatever the task readied.
        if !self.pending.is_empty() {
            self.shared.post(&mut self.pending);
        }
    }

    fn execute(&mut self, task: TaskRef) {
        let kind = task.kind();
        trace!(worker = self.index, ?kind, "executing task");

        // Aborted tasks, and tasks whose scope already failed, are torn down
        // without running their closures. Exceptions: fences always retire so
        // scope.end runs through the normal path; issued slices and shards
        // still execute, since a failure elsewhere does not halt an in-flight
        // grid and the parent dispatch aggregates; a dispatch in its retire
        // phase still merges its statistics and captured status into the
        // scope.
        let exempt = matches!(
            kind,
            TaskKind::Fence | TaskKind::DispatchSlice | TaskKind::DispatchShard
        ) || (kind == TaskKind::Dispatch && task.has_flag(TaskFlags::DISPATCH_RETIRE));
        if !exempt && (task.has_flag(TaskFlags::ABORTED) || task.scope().has_failed()) {
            let mut discard_worklist = TaskList::new();
            lifecycle::discard(&task, &mut discard_worklist);
            discard_worklist.discard_all();
            return;
        }

        match kind {
            TaskKind::Nop => lifecycle::retire(&task, &mut self.pending, Ok(())),
            TaskKind::Call => lifecycle::execute_call(&task, &mut self.pending),
            TaskKind::Barrier => lifecycle::retire_barrier(&task, &mut self.pending),
            TaskKind::Fence => lifecycle::retire_fence(&task, &mut self.pending),
            TaskKind::Wait => lifecycle::execute_wait(&task, &mut self.pending),
            TaskKind::Dispatch => {
                if task.has_flag(TaskFlags::DISPATCH_RETIRE) {
                    // All slices/shards are done.
                    dispatch::retire_dispatch(&task, &mut self.pending);
                } else {
                    dispatch::issue(
                        &task,
                        &self.shared.cfg,
                        &self.shared.transient_pool,
                        &mut self.pending,
                    );
                }
            }
            TaskKind::DispatchSlice => {
                slice::execute_slice(&task, &mut self.local_memory, &mut self.pending);
            }
            TaskKind::DispatchShard => {
                shard::execute_shard(&task, &mut self.local_memory, &mut self.pending);
            }
        }
    }

    /// Tears down everything still queued on this worker so cleanups run and
    /// fences close their scopes even when the executor stops early.
    fn drain_on_shutdown(&mut self) {
        let mut abandoned = TaskList::new();
        while let Some(task) = self.find_task() {
            abandoned.push_back(task);
        }
        abandoned.discard_all();
        self.pending.discard_all();
    }
}
